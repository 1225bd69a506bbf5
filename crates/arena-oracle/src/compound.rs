use crate::{EvalContext, Oracle};
use anyhow::{anyhow, Result};
use arena_core::Verdict;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{info, warn};

/// Evaluates several oracles against one context and ANDs their outcomes.
///
/// A failing or panicking sub-oracle is recorded as `{name, success: false}`
/// and never stops the remaining oracles from running.
#[derive(Default)]
pub struct CompoundedOracle {
    oracles: Vec<(String, Box<dyn Oracle>)>,
    parallel: bool,
}

impl CompoundedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `oracle` under an explicit key. Keys must be unique.
    pub fn with(mut self, key: impl Into<String>, oracle: Box<dyn Oracle>) -> Result<Self> {
        let key = key.into();
        if self.oracles.iter().any(|(existing, _)| *existing == key) {
            return Err(anyhow!("duplicate oracle key '{}' in compound oracle", key));
        }
        self.oracles.push((key, oracle));
        Ok(self)
    }

    /// Registers `oracle` under its positional key `"{index}-{kind}"`.
    pub fn push(self, oracle: Box<dyn Oracle>) -> Result<Self> {
        let key = format!("{}-{}", self.oracles.len(), oracle.kind());
        self.with(key, oracle)
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn len(&self) -> usize {
        self.oracles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oracles.is_empty()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.oracles.iter().map(|(key, _)| key.as_str()).collect()
    }

    fn run_sequential(&self, ctx: &EvalContext<'_>) -> Vec<Verdict> {
        self.oracles
            .iter()
            .map(|(key, oracle)| {
                let outcome = catch_unwind(AssertUnwindSafe(|| oracle.evaluate(ctx)));
                settle(key, outcome)
            })
            .collect()
    }

    fn run_parallel(&self, ctx: &EvalContext<'_>) -> Vec<Verdict> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .oracles
                .iter()
                .map(|(key, oracle)| (key, scope.spawn(move || oracle.evaluate(ctx))))
                .collect();
            handles
                .into_iter()
                .map(|(key, handle)| settle(key, handle.join()))
                .collect()
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "oracle panicked".to_string()
    }
}

fn settle(key: &str, outcome: std::thread::Result<Result<Verdict>>) -> Verdict {
    let error = match outcome {
        Ok(Ok(verdict)) => return verdict.named(key),
        Ok(Err(err)) => err.to_string(),
        Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
    };
    warn!(oracle = key, error = %error, "sub-oracle failed");
    Verdict::fail().named(key)
}

impl Oracle for CompoundedOracle {
    fn kind(&self) -> &'static str {
        "compound"
    }

    fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<Verdict> {
        let results = if self.parallel {
            self.run_parallel(ctx)
        } else {
            self.run_sequential(ctx)
        };
        let success = results.iter().all(|v| v.success);
        info!(
            oracles = results.len(),
            passed = results.iter().filter(|v| v.success).count(),
            success,
            "compound oracle evaluated"
        );
        let mut verdict = Verdict::new(success);
        verdict.oracles = Some(results);
        Ok(verdict)
    }
}
