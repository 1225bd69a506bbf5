use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

mod process;
mod verdict;

pub use process::{run_argv, run_argv_checked, truncate_tail, CommandOutput};
pub use verdict::{Judgment, Verdict, INVALID_FORMAT_REASON};

pub const ARENA_DEFAULT_HOME_DIR: &str = ".arena";
pub const ARENA_SESSIONS_DIR: &str = "sessions";
pub const ARENA_DEFAULT_CATALOG_FILE: &str = "problems.yaml";
pub const ARENA_DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
pub const ARENA_DEFAULT_KUBECTL: &str = "kubectl";
pub const ARENA_DEFAULT_MAX_STEPS: usize = 50;

pub const ARENA_ENV_HOME: &str = "ARENA_HOME";
pub const ARENA_ENV_PROBLEM_CATALOG: &str = "ARENA_PROBLEM_CATALOG";
pub const ARENA_ENV_KUBECTL: &str = "ARENA_KUBECTL";
pub const ARENA_ENV_BIND: &str = "ARENA_BIND";
pub const ARENA_ENV_MAX_STEPS: &str = "ARENA_MAX_STEPS";
pub const ARENA_ENV_LOG: &str = "ARENA_LOG";
pub const ARENA_ENV_JUDGE_URL: &str = "ARENA_JUDGE_URL";
pub const ARENA_ENV_JUDGE_MODEL: &str = "ARENA_JUDGE_MODEL";
pub const ARENA_ENV_JUDGE_API_KEY: &str = "ARENA_JUDGE_API_KEY";
pub const ARENA_ENV_JUDGE_TIMEOUT_MS: &str = "ARENA_JUDGE_TIMEOUT_MS";

#[derive(Debug, Clone)]
pub struct SessionHostPaths {
    pub session_dir: PathBuf,
    pub events: PathBuf,
    pub report: PathBuf,
}

pub fn session_host_paths(session_dir: &Path) -> SessionHostPaths {
    SessionHostPaths {
        session_dir: session_dir.to_path_buf(),
        events: session_dir.join("events.jsonl"),
        report: session_dir.join("report.json"),
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s)),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let parts: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| {
                    let ks = serde_json::to_string(k).unwrap_or_else(|_| format!("\"{}\"", k));
                    format!("{}:{}", ks, canonical_json(v))
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Resolves the arena home directory: explicit value, then `ARENA_HOME`, then `.arena`.
pub fn resolve_home_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(ARENA_ENV_HOME) {
        Ok(raw) if !raw.trim().is_empty() => PathBuf::from(raw.trim()),
        _ => PathBuf::from(ARENA_DEFAULT_HOME_DIR),
    }
}
