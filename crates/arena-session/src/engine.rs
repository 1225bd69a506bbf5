//! Problem session engine: the staged grading protocol.
//!
//! `start_problem` deploys the application and enters the hidden `noop`
//! stage. The first valid `submit` grades "no fault yet" and injects the
//! fault under a [`FaultGuard`]; every later submission grades exactly one
//! stage and moves forward. Reaching `done`, aborting, or dropping the
//! engine recovers the fault through the guard.

use crate::guard::{CleanupRegistry, FaultGuard, InterruptGate, CLEANUPS, INTERRUPT_GATE};
use crate::parser::SubmissionParser;
use crate::problem::Problem;
use crate::registry::{ProblemRegistry, RegistryError};
use crate::report::{
    framework_overhead, results_digest, SessionOutcome, SessionReport, Stage, StageResults,
    SESSION_REPORT_SCHEMA_VERSION,
};
use crate::sink::{JsonlSessionSink, SessionEventRecord, SessionSink};
use arena_oracle::{DetectionOracle, EvalContext, Oracle, Verdict};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

static DEFAULT_DETECTION: DetectionOracle = DetectionOracle;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{0}' is still in progress")]
    SessionInProgress(String),
    #[error("no session has been started")]
    NoActiveSession,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("results are only available once the session is done")]
    ResultsNotReady,
    #[error("session was aborted: {0}")]
    Aborted(String),
    #[error("{context}: {error:#}")]
    Collaborator {
        context: String,
        error: anyhow::Error,
    },
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionInProgress(_) => "session_in_progress",
            Self::NoActiveSession => "no_active_session",
            Self::Registry(err) => err.code(),
            Self::ResultsNotReady => "results_not_ready",
            Self::Aborted(_) => "session_aborted",
            Self::Collaborator { .. } => "collaborator_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartAck {
    pub session_id: String,
    pub problem_id: String,
    pub stage: Stage,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Accepted,
    InvalidFormat,
    Rejected,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitOutcome {
    pub status: SubmitStatus,
    pub detail: String,
    pub stage: Stage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub session_id: Option<String>,
    pub problem_id: Option<String>,
    pub stage: Option<Stage>,
    pub active: bool,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

pub struct Session {
    id: String,
    problem: Arc<dyn Problem>,
    stage: Stage,
    started: Instant,
    started_at: DateTime<Utc>,
    results: StageResults,
    noop_detection: Option<Verdict>,
    fault_injected: bool,
    guard: Option<FaultGuard>,
    abort_reason: Option<String>,
    report: Option<SessionReport>,
    sink: Option<Box<dyn SessionSink>>,
    next_seq: u64,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn problem_id(&self) -> &str {
        self.problem.id()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn results(&self) -> &StageResults {
        &self.results
    }

    pub fn fault_injected(&self) -> bool {
        self.fault_injected
    }

    pub fn is_active(&self) -> bool {
        self.report.is_none()
    }

    fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn record_event(&mut self, event_type: &str, payload: Value) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        self.next_seq += 1;
        let event = SessionEventRecord {
            seq: self.next_seq,
            ts: Utc::now().to_rfc3339(),
            session_id: self.id.clone(),
            event_type: event_type.to_string(),
            stage: self.stage.as_str().to_string(),
            payload,
        };
        if let Err(err) = sink.append_event(&event).and_then(|_| sink.flush()) {
            warn!(session_id = %self.id, error = %err, "failed to record session event");
        }
    }

    fn next_stage_after(&self, stage: Stage) -> Stage {
        let oracles = self.problem.oracles();
        match stage {
            Stage::Noop => Stage::Detection,
            Stage::Detection if oracles.localization.is_some() => Stage::Localization,
            Stage::Detection | Stage::Localization if oracles.mitigation.is_some() => {
                Stage::Mitigation
            }
            _ => Stage::Done,
        }
    }
}

/// Drives at most one session at a time.
pub struct SessionEngine {
    registry: Arc<ProblemRegistry>,
    parser: SubmissionParser,
    sessions_root: Option<PathBuf>,
    gate: &'static InterruptGate,
    cleanups: &'static CleanupRegistry,
    session: Option<Session>,
}

impl SessionEngine {
    pub fn new(registry: Arc<ProblemRegistry>) -> Self {
        Self {
            registry,
            parser: SubmissionParser::new(),
            sessions_root: None,
            gate: &INTERRUPT_GATE,
            cleanups: &CLEANUPS,
            session: None,
        }
    }

    /// Persist each session under `<root>/<session_id>/`.
    pub fn with_sessions_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sessions_root = Some(root.into());
        self
    }

    pub fn with_guard_scope(
        mut self,
        gate: &'static InterruptGate,
        cleanups: &'static CleanupRegistry,
    ) -> Self {
        self.gate = gate;
        self.cleanups = cleanups;
        self
    }

    pub fn registry(&self) -> &ProblemRegistry {
        &self.registry
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn start_problem(&mut self, problem_id: &str) -> Result<StartAck, SessionError> {
        if let Some(current) = self.session.as_ref().filter(|s| s.is_active()) {
            return Err(SessionError::SessionInProgress(current.id.clone()));
        }
        let problem = self.registry.get_instance(problem_id)?;
        let session_id = format!("session_{}", Utc::now().format("%Y%m%d_%H%M%S_%6f"));
        let sink = self.open_sink(&session_id);
        info!(session_id = %session_id, problem_id, "starting problem session");

        self.session = Some(Session {
            id: session_id.clone(),
            problem: problem.clone(),
            stage: Stage::Noop,
            started: Instant::now(),
            started_at: Utc::now(),
            results: StageResults::default(),
            noop_detection: None,
            fault_injected: false,
            guard: None,
            abort_reason: None,
            report: None,
            sink,
            next_seq: 0,
        });

        let deployed = {
            let _section = self.gate.enter();
            let app = problem.app();
            if let Err(err) = app.delete() {
                warn!(app = app.name(), error = %err, "pre-deploy delete failed; continuing");
            }
            app.deploy().and_then(|_| app.start_workload())
        };
        if let Err(err) = deployed {
            return Err(self.fail_session("application deployment failed", err));
        }

        if let Some(session) = self.session.as_mut() {
            session.record_event(
                "session_started",
                json!({"problem_id": problem_id, "app": problem.app().name()}),
            );
        }
        Ok(StartAck {
            session_id,
            problem_id: problem_id.to_string(),
            stage: Stage::Noop.public(),
            message: "Environment ready. Submit your detection answer.".to_string(),
        })
    }

    /// Parses a free-text action and grades it when it is a `submit(...)`.
    pub fn submit(&mut self, action: &str) -> Result<SubmitOutcome, SessionError> {
        let stage = self.submittable_stage()?;
        let parsed = match self.parser.parse(action) {
            Ok(parsed) => parsed,
            Err(err) => {
                return Ok(SubmitOutcome {
                    status: SubmitStatus::Rejected,
                    detail: format!("could not parse action: {}", err),
                    stage: stage.public(),
                })
            }
        };
        if !parsed.is_submit() {
            return Ok(SubmitOutcome {
                status: SubmitStatus::Rejected,
                detail: format!(
                    "only submit(...) is supported, got {}(...)",
                    parsed.api_name
                ),
                stage: stage.public(),
            });
        }
        self.submit_solution(parsed.solution().cloned())
    }

    /// Grades an already-structured submission for the current stage.
    pub fn submit_solution(
        &mut self,
        solution: Option<Value>,
    ) -> Result<SubmitOutcome, SessionError> {
        let stage = self.submittable_stage()?;
        let gate = self.gate;
        let cleanups = self.cleanups;
        let Some(session) = self.session.as_mut() else {
            return Err(SessionError::NoActiveSession);
        };

        match stage {
            Stage::Done => Ok(SubmitOutcome {
                status: SubmitStatus::Completed,
                detail: "All stages already completed.".to_string(),
                stage: Stage::Done,
            }),
            Stage::Noop => {
                let verdict = evaluate_stage(session, Stage::Noop, solution.as_ref());
                if verdict.is_invalid_format() {
                    return Ok(SubmitOutcome {
                        status: SubmitStatus::InvalidFormat,
                        detail: "Invalid detection answer format; expected \"Yes\" or \"No\"."
                            .to_string(),
                        stage: Stage::Noop.public(),
                    });
                }
                session.record_event("noop_evaluated", json!(verdict));
                session.noop_detection = Some(verdict);
                match FaultGuard::inject_with(gate, cleanups, session.problem.clone()) {
                    Ok(guard) => {
                        session.guard = Some(guard);
                        session.fault_injected = true;
                        session.stage = Stage::Detection;
                        session.record_event("fault_injected", json!({}));
                        Ok(SubmitOutcome {
                            status: SubmitStatus::Accepted,
                            detail: "Fault injected. Submit your detection answer.".to_string(),
                            stage: Stage::Detection,
                        })
                    }
                    Err(err) => Err(self.fail_session("fault injection failed", err)),
                }
            }
            graded => {
                let verdict = evaluate_stage(session, graded, solution.as_ref());
                let success = verdict.success;
                let elapsed = session.elapsed_seconds();
                if let Some(key) = graded.result_key() {
                    session.results.insert_verdict(key, verdict.clone());
                }
                if let Some(key) = graded.mark_key() {
                    session.results.mark(key, elapsed);
                }
                let next = session.next_stage_after(graded);
                session.record_event(
                    "stage_evaluated",
                    json!({"verdict": verdict, "elapsed_seconds": elapsed, "next": next}),
                );
                session.stage = next;
                info!(
                    session_id = %session.id,
                    stage = graded.as_str(),
                    success,
                    next = next.as_str(),
                    "stage graded"
                );
                let label = graded.result_key().unwrap_or("Stage");
                let detail = format!(
                    "{} {}.",
                    label,
                    if success { "successful" } else { "failed" }
                );
                if next == Stage::Done {
                    self.complete()?;
                }
                Ok(SubmitOutcome {
                    status: SubmitStatus::Accepted,
                    detail,
                    stage: next,
                })
            }
        }
    }

    pub fn status(&self) -> StatusView {
        match self.session.as_ref() {
            None => StatusView {
                session_id: None,
                problem_id: None,
                stage: None,
                active: false,
                aborted: false,
                abort_reason: None,
            },
            Some(session) => StatusView {
                session_id: Some(session.id.clone()),
                problem_id: Some(session.problem_id().to_string()),
                stage: Some(session.stage.public()),
                active: session.is_active(),
                aborted: session.abort_reason.is_some(),
                abort_reason: session.abort_reason.clone(),
            },
        }
    }

    pub fn results(&self) -> Result<StageResults, SessionError> {
        let session = self.session.as_ref().ok_or(SessionError::NoActiveSession)?;
        if session.stage != Stage::Done {
            return Err(SessionError::ResultsNotReady);
        }
        Ok(session.results.clone())
    }

    pub fn report(&self) -> Result<SessionReport, SessionError> {
        let session = self.session.as_ref().ok_or(SessionError::NoActiveSession)?;
        session.report.clone().ok_or(SessionError::ResultsNotReady)
    }

    /// Ends the current session early. Aborting a finished session returns its report.
    pub fn abort(&mut self, reason: &str) -> Result<SessionReport, SessionError> {
        let session = self.session.as_mut().ok_or(SessionError::NoActiveSession)?;
        if let Some(report) = session.report.clone() {
            return Ok(report);
        }
        warn!(session_id = %session.id, reason, "aborting session");
        let (report, _) = finish(session, Some(reason.to_string()));
        Ok(report)
    }

    fn submittable_stage(&self) -> Result<Stage, SessionError> {
        let session = self.session.as_ref().ok_or(SessionError::NoActiveSession)?;
        match (&session.abort_reason, session.is_active()) {
            (Some(reason), _) => Err(SessionError::Aborted(reason.clone())),
            (None, false) => Ok(Stage::Done),
            (None, true) => Ok(session.stage),
        }
    }

    fn open_sink(&self, session_id: &str) -> Option<Box<dyn SessionSink>> {
        let root = self.sessions_root.as_ref()?;
        match JsonlSessionSink::new(&root.join(session_id)) {
            Ok(sink) => Some(Box::new(sink)),
            Err(err) => {
                warn!(session_id, error = %err, "session persistence disabled");
                None
            }
        }
    }

    fn complete(&mut self) -> Result<(), SessionError> {
        let Some(session) = self.session.as_mut() else {
            return Err(SessionError::NoActiveSession);
        };
        let (report, failure) = finish(session, None);
        match failure {
            None => {
                info!(
                    session_id = %report.session_id,
                    elapsed_seconds = report.elapsed_seconds,
                    framework_overhead = report.framework_overhead,
                    "session completed"
                );
                Ok(())
            }
            Some(err) => Err(SessionError::Collaborator {
                context: "session teardown failed".to_string(),
                error: err,
            }),
        }
    }

    fn fail_session(&mut self, context: &str, err: anyhow::Error) -> SessionError {
        error!(error = %err, "{}", context);
        if let Some(session) = self.session.as_mut() {
            finish(session, Some(format!("{}: {}", context, err)));
        }
        SessionError::Collaborator {
            context: context.to_string(),
            error: err,
        }
    }
}

fn evaluate_stage(session: &Session, stage: Stage, solution: Option<&Value>) -> Verdict {
    let oracles = session.problem.oracles();
    let (oracle, ctx): (Option<&dyn Oracle>, EvalContext<'_>) = match stage {
        Stage::Noop => (
            Some(oracles.detection.as_deref().unwrap_or(&DEFAULT_DETECTION)),
            EvalContext::new(false).with_submission(solution),
        ),
        Stage::Detection => (
            Some(oracles.detection.as_deref().unwrap_or(&DEFAULT_DETECTION)),
            EvalContext::new(true).with_submission(solution),
        ),
        Stage::Localization => (
            oracles.localization.as_deref(),
            EvalContext::new(true).with_submission(solution),
        ),
        Stage::Mitigation => (
            oracles.mitigation.as_deref(),
            EvalContext::new(true).with_live(session.problem.live_state()),
        ),
        Stage::Done => (None, EvalContext::new(session.fault_injected)),
    };
    let Some(oracle) = oracle else {
        return Verdict::fail().with_detail("error", json!("no oracle configured for stage"));
    };
    match oracle.evaluate(&ctx) {
        Ok(verdict) => verdict,
        Err(err) => {
            warn!(stage = stage.as_str(), error = %err, "oracle failed; recording a failing verdict");
            Verdict::fail().with_detail("error", json!(err.to_string()))
        }
    }
}

/// Recovers the fault, tears the application down and seals the report.
/// Returns the report and the first teardown failure, if any.
fn finish(session: &mut Session, abort_reason: Option<String>) -> (SessionReport, Option<anyhow::Error>) {
    let mut failures: Vec<anyhow::Error> = Vec::new();
    if let Some(guard) = session.guard.take() {
        match guard.release() {
            Ok(()) => session.record_event("fault_recovered", json!({})),
            Err(err) => {
                error!(session_id = %session.id, error = %err, "fault recovery failed");
                failures.push(err.context("fault recovery failed"));
            }
        }
        session.fault_injected = false;
    }
    if let Err(err) = session.problem.app().cleanup() {
        error!(session_id = %session.id, error = %err, "application cleanup failed");
        failures.push(err.context("application cleanup failed"));
    }

    let reason = match (abort_reason, failures.is_empty()) {
        (Some(reason), _) => Some(reason),
        (None, true) => None,
        (None, false) => Some(
            failures
                .iter()
                .map(|e| format!("{:#}", e))
                .collect::<Vec<_>>()
                .join("; "),
        ),
    };
    session.abort_reason = reason.clone();
    let outcome = if reason.is_some() {
        SessionOutcome::Aborted
    } else {
        SessionOutcome::Done
    };
    let elapsed = session.elapsed_seconds();
    let report = SessionReport {
        schema_version: SESSION_REPORT_SCHEMA_VERSION.to_string(),
        session_id: session.id.clone(),
        problem_id: session.problem_id().to_string(),
        outcome,
        abort_reason: reason,
        started_at: session.started_at.to_rfc3339(),
        finished_at: Utc::now().to_rfc3339(),
        noop_detection: session.noop_detection.clone(),
        results: session.results.clone(),
        elapsed_seconds: elapsed,
        framework_overhead: framework_overhead(elapsed, &session.results),
        results_digest: results_digest(&session.results),
    };
    session.record_event(
        "session_finished",
        json!({"outcome": outcome, "abort_reason": report.abort_reason}),
    );
    if let Some(sink) = session.sink.as_mut() {
        if let Err(err) = sink.write_report(&report) {
            warn!(session_id = %session.id, error = %err, "failed to write session report");
        }
    }
    session.report = Some(report.clone());
    (report, failures.into_iter().next())
}
