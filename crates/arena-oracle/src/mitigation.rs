use crate::{ContainerState, ContainerStatus, EvalContext, Oracle};
use anyhow::{anyhow, Result};
use arena_core::Verdict;
use serde_json::{json, Value};
use tracing::{info, warn};

const CRASH_LOOP_REASON: &str = "CrashLoopBackOff";
const COMPLETED_REASON: &str = "Completed";

/// Passes only when every container in the namespace is healthy. No partial credit.
#[derive(Debug, Clone)]
pub struct MitigationOracle {
    namespace: String,
}

impl MitigationOracle {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

fn container_issue(status: &ContainerStatus) -> Option<String> {
    match &status.state {
        ContainerState::Waiting { reason } if reason.as_deref() == Some(CRASH_LOOP_REASON) => {
            Some(CRASH_LOOP_REASON.to_string())
        }
        ContainerState::Terminated { reason, .. } if reason.as_deref() != Some(COMPLETED_REASON) => {
            Some(format!(
                "terminated: {}",
                reason.as_deref().unwrap_or("unknown")
            ))
        }
        _ if !status.ready => Some("not ready".to_string()),
        _ => None,
    }
}

impl Oracle for MitigationOracle {
    fn kind(&self) -> &'static str {
        "mitigation"
    }

    fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<Verdict> {
        let statuses = ctx.require_live()?.container_statuses(&self.namespace)?;
        let unhealthy: Vec<Value> = statuses
            .iter()
            .filter_map(|status| {
                container_issue(status).map(|issue| {
                    warn!(
                        pod = %status.pod,
                        container = %status.container,
                        issue = %issue,
                        "container is unhealthy"
                    );
                    json!({"pod": status.pod, "container": status.container, "issue": issue})
                })
            })
            .collect();
        let success = unhealthy.is_empty();
        info!(
            namespace = %self.namespace,
            containers = statuses.len(),
            success,
            "mitigation evaluated"
        );
        let mut verdict = Verdict::new(success).with_detail("containers_checked", json!(statuses.len()));
        if !success {
            verdict = verdict.with_detail("unhealthy", Value::Array(unhealthy));
        }
        Ok(verdict)
    }
}

/// Extracts container statuses from a `kubectl get pods -o json` document.
pub fn parse_pod_list(doc: &Value) -> Result<Vec<ContainerStatus>> {
    let items = doc
        .get("items")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("pod list is missing 'items'"))?;
    let mut out = Vec::new();
    for item in items {
        let pod = item
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let Some(statuses) = item
            .pointer("/status/containerStatuses")
            .and_then(|v| v.as_array())
        else {
            continue;
        };
        for status in statuses {
            let state = status.get("state");
            let reason_at = |key: &str| {
                state
                    .and_then(|s| s.get(key))
                    .and_then(|s| s.get("reason"))
                    .and_then(|r| r.as_str())
                    .map(|r| r.to_string())
            };
            let parsed_state = if state.and_then(|s| s.get("waiting")).is_some() {
                ContainerState::Waiting {
                    reason: reason_at("waiting"),
                }
            } else if let Some(terminated) = state.and_then(|s| s.get("terminated")) {
                ContainerState::Terminated {
                    reason: reason_at("terminated"),
                    exit_code: terminated.get("exitCode").and_then(|c| c.as_i64()),
                }
            } else if state.and_then(|s| s.get("running")).is_some() {
                ContainerState::Running
            } else {
                ContainerState::Unknown
            };
            out.push(ContainerStatus {
                pod: pod.clone(),
                container: status
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                ready: status.get("ready").and_then(|v| v.as_bool()).unwrap_or(false),
                state: parsed_state,
            });
        }
    }
    Ok(out)
}
