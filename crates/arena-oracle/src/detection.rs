use crate::{EvalContext, Oracle};
use anyhow::Result;
use arena_core::Verdict;
use serde_json::Value;
use tracing::{info, warn};

/// Yes/No check against whether a fault is currently injected.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionOracle;

impl Oracle for DetectionOracle {
    fn kind(&self) -> &'static str {
        "detection"
    }

    fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<Verdict> {
        let expected = if ctx.fault_injected { "yes" } else { "no" };
        match ctx.submission {
            Some(Value::String(answer)) => {
                let correct = answer.trim().to_lowercase() == expected;
                info!(expected, answer = %answer, correct, "detection evaluated");
                Ok(Verdict::new(correct).with_accuracy(if correct { 100.0 } else { 0.0 }))
            }
            other => {
                warn!(expected, submission = ?other, "detection answer has invalid format");
                Ok(Verdict::invalid_format())
            }
        }
    }
}
