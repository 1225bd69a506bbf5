//! Problem sessions: registry, staged grading engine, fault-safety guard and
//! the submission parser agents talk through.

mod catalog;
mod cluster;
mod config;
mod driver;
mod engine;
mod guard;
mod parser;
mod problem;
mod registry;
mod report;
mod sink;

pub use catalog::{
    AppSpec, CatalogContext, CommandApplication, CommandProblem, FaultSpec, ProblemCatalog,
    ProblemSpec, PROBLEM_CATALOG_SCHEMA_VERSION,
};
pub use cluster::KubectlProbe;
pub use config::SessionConfig;
pub use driver::{run_agent_session, Agent, ScriptedAgent};
pub use engine::{
    Session, SessionEngine, SessionError, StartAck, StatusView, SubmitOutcome, SubmitStatus,
};
pub use guard::{
    install_interrupt_handler, CleanupRegistry, CriticalSection, FaultGuard, InterruptDisposition,
    InterruptGate, RecoveryHandle, CLEANUPS, INTERRUPT_EXIT_CODE, INTERRUPT_GATE,
};
pub use parser::{ParseError, ParsedAction, SubmissionParser};
pub use problem::{Application, OracleSet, Problem};
pub use registry::{ProblemFactory, ProblemRegistry, RegistryError};
pub use report::{
    framework_overhead, results_digest, ResultValue, SessionOutcome, SessionReport, Stage,
    StageResults, SESSION_REPORT_SCHEMA_VERSION,
};
pub use sink::{JsonlSessionSink, SessionEventRecord, SessionSink};
