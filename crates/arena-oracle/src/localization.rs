use crate::{EvalContext, Oracle};
use anyhow::Result;
use arena_core::Verdict;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Scores a submitted set of resource identifiers against the expected set.
#[derive(Debug, Clone)]
pub struct LocalizationOracle {
    expected: BTreeSet<String>,
}

impl LocalizationOracle {
    pub fn new<I, S>(expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            expected: expected
                .into_iter()
                .map(|s| {
                    let s: String = s.into();
                    s.trim().to_string()
                })
                .collect(),
        }
    }

    pub fn expected(&self) -> &BTreeSet<String> {
        &self.expected
    }

    fn submitted_set(submission: Option<&Value>) -> Option<BTreeSet<String>> {
        let items = submission?.as_array()?;
        items
            .iter()
            .map(|item| item.as_str().map(|s| s.trim().to_string()))
            .collect()
    }
}

impl Oracle for LocalizationOracle {
    fn kind(&self) -> &'static str {
        "localization"
    }

    fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<Verdict> {
        let Some(submitted) = Self::submitted_set(ctx.submission) else {
            warn!(submission = ?ctx.submission, "localization answer must be a list of identifiers");
            return Ok(Verdict::invalid_format().with_subset(false));
        };

        let is_exact = submitted == self.expected;
        let is_subset = submitted.is_subset(&self.expected);
        let accuracy = if is_exact {
            100.0
        } else if is_subset && !self.expected.is_empty() {
            submitted.len() as f64 / self.expected.len() as f64 * 100.0
        } else {
            0.0
        };
        let success = is_exact || (is_subset && submitted.len() == self.expected.len());
        info!(
            submitted = ?submitted,
            expected = ?self.expected,
            is_exact,
            is_subset,
            accuracy,
            "localization evaluated"
        );

        Ok(Verdict::new(success)
            .with_accuracy(accuracy)
            .with_subset(is_subset)
            .with_detail("expected", json!(self.expected)))
    }
}
