use anyhow::{anyhow, Result};
use arena_core::{run_argv_checked, ARENA_DEFAULT_KUBECTL};
use arena_oracle::{parse_pod_list, ContainerStatus, LiveState};
use serde_json::Value;
use tracing::debug;

/// Reads container state with `kubectl get pods -o json`.
///
/// The kubectl command may carry a prefix, e.g. `microk8s kubectl`.
#[derive(Debug, Clone)]
pub struct KubectlProbe {
    kubectl: Vec<String>,
}

impl KubectlProbe {
    pub fn new(kubectl: &str) -> Self {
        let mut argv: Vec<String> = kubectl.split_whitespace().map(|s| s.to_string()).collect();
        if argv.is_empty() {
            argv.push(ARENA_DEFAULT_KUBECTL.to_string());
        }
        Self { kubectl: argv }
    }

    pub fn command(&self) -> &[String] {
        &self.kubectl
    }

    fn pods_argv(&self, namespace: &str) -> Vec<String> {
        let mut argv = self.kubectl.clone();
        argv.extend(
            ["get", "pods", "-n", namespace, "-o", "json"]
                .iter()
                .map(|s| s.to_string()),
        );
        argv
    }
}

impl LiveState for KubectlProbe {
    fn container_statuses(&self, namespace: &str) -> Result<Vec<ContainerStatus>> {
        let output = run_argv_checked(&self.pods_argv(namespace), "kubectl get pods")?;
        let doc: Value = serde_json::from_str(&output.stdout)
            .map_err(|e| anyhow!("kubectl returned invalid pod json: {}", e))?;
        let statuses = parse_pod_list(&doc)?;
        debug!(namespace, containers = statuses.len(), "probed pod status");
        Ok(statuses)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use arena_oracle::ContainerState;
    use chrono::Utc;
    use std::fs;
    use std::path::PathBuf;

    struct FakeKubectl {
        dir: PathBuf,
        script: PathBuf,
    }

    impl FakeKubectl {
        fn new(label: &str, body: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "arena_kubectl_{}_{}_{}",
                label,
                std::process::id(),
                Utc::now().timestamp_micros()
            ));
            fs::create_dir_all(&dir).expect("temp dir");
            let script = dir.join("kubectl");
            fs::write(&script, format!("{}\n", body)).expect("write script");
            Self { dir, script }
        }

        fn probe(&self) -> KubectlProbe {
            KubectlProbe::new(&format!("sh {}", self.script.display()))
        }
    }

    impl Drop for FakeKubectl {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    #[test]
    fn parses_pod_status_from_kubectl() {
        let fake = FakeKubectl::new(
            "status",
            r#"[ "$4" = "hotel" ] || exit 9
cat <<'EOF'
{"items":[{"metadata":{"name":"geo-1"},"status":{"containerStatuses":[{"name":"geo","ready":true,"state":{"running":{}}}]}}]}
EOF"#,
        );
        let statuses = fake.probe().container_statuses("hotel").expect("probe");
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].pod, "geo-1");
        assert_eq!(statuses[0].state, ContainerState::Running);
    }

    #[test]
    fn command_prefix_is_split() {
        let probe = KubectlProbe::new("microk8s kubectl");
        assert_eq!(probe.command(), ["microk8s", "kubectl"]);
        assert_eq!(KubectlProbe::new("  ").command(), ["kubectl"]);
        assert_eq!(probe.pods_argv("hotel")[2..5], ["get", "pods", "-n"]);
    }

    #[test]
    fn kubectl_failure_is_an_error() {
        let fake = FakeKubectl::new("missing", "echo 'namespaces \"x\" not found' >&2; exit 1");
        let err = fake.probe().container_statuses("x").expect_err("fails");
        assert!(err.to_string().contains("kubectl get pods failed"));
    }

    #[test]
    fn garbage_output_is_an_error() {
        let fake = FakeKubectl::new("garbage", "echo not-json");
        assert!(fake.probe().container_statuses("hotel").is_err());
    }
}
