//! Oracle protocol: every grading unit exposes a single `evaluate` capability
//! over an [`EvalContext`] and returns a [`Verdict`].

use anyhow::Result;

mod command;
mod compound;
mod context;
mod detection;
mod judge;
mod localization;
mod mitigation;

pub use arena_core::{Judgment, Verdict, INVALID_FORMAT_REASON};
pub use command::CommandOracle;
pub use compound::CompoundedOracle;
pub use context::{ContainerState, ContainerStatus, EvalContext, LiveState};
pub use detection::DetectionOracle;
pub use judge::{parse_judgment, HttpJudge, Judge, JudgeConfig, LlmJudgeOracle};
pub use localization::LocalizationOracle;
pub use mitigation::{parse_pod_list, MitigationOracle};

pub trait Oracle: Send + Sync {
    /// Short variant name, used to key positional entries of a compound oracle.
    fn kind(&self) -> &'static str;

    fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<Verdict>;
}
