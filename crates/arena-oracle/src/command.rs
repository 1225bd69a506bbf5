use crate::{EvalContext, Oracle};
use anyhow::{anyhow, Result};
use arena_core::{run_argv, truncate_tail, Verdict};
use serde_json::json;
use tracing::info;

/// Passes when a probe command exits 0.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    argv: Vec<String>,
}

impl CommandOracle {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(anyhow!("command oracle needs a non-empty argv"));
        }
        Ok(Self { argv })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

impl Oracle for CommandOracle {
    fn kind(&self) -> &'static str {
        "command"
    }

    fn evaluate(&self, _ctx: &EvalContext<'_>) -> Result<Verdict> {
        let output = run_argv(&self.argv)?;
        let success = output.success();
        info!(argv = ?self.argv, exit_code = ?output.status_code, success, "command oracle evaluated");
        let mut verdict = Verdict::new(success).with_detail("exit_code", json!(output.status_code));
        if !success && !output.stderr.trim().is_empty() {
            verdict = verdict.with_detail("stderr", json!(truncate_tail(output.stderr.trim(), 400)));
        }
        Ok(verdict)
    }
}
