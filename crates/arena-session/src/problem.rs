use anyhow::Result;
use arena_oracle::{DetectionOracle, LiveState, Oracle};

/// Handle on the target application a problem runs against.
pub trait Application: Send + Sync {
    fn name(&self) -> &str;
    fn deploy(&self) -> Result<()>;
    fn delete(&self) -> Result<()>;
    fn start_workload(&self) -> Result<()>;
    fn cleanup(&self) -> Result<()>;
}

/// Oracles attached to a problem, one slot per grading stage.
pub struct OracleSet {
    pub detection: Option<Box<dyn Oracle>>,
    pub localization: Option<Box<dyn Oracle>>,
    pub mitigation: Option<Box<dyn Oracle>>,
}

impl Default for OracleSet {
    fn default() -> Self {
        Self {
            detection: Some(Box::new(DetectionOracle)),
            localization: None,
            mitigation: None,
        }
    }
}

impl OracleSet {
    pub fn with_localization(mut self, oracle: Box<dyn Oracle>) -> Self {
        self.localization = Some(oracle);
        self
    }

    pub fn with_mitigation(mut self, oracle: Box<dyn Oracle>) -> Self {
        self.mitigation = Some(oracle);
        self
    }
}

/// One benchmark problem: an application, a fault, and the oracles that grade it.
///
/// `recover_fault` must tolerate being called when nothing is injected.
pub trait Problem: Send + Sync {
    fn id(&self) -> &str;
    fn app(&self) -> &dyn Application;
    fn faulty_service(&self) -> &[String];
    fn oracles(&self) -> &OracleSet;
    fn inject_fault(&self) -> Result<()>;
    fn recover_fault(&self) -> Result<()>;

    fn live_state(&self) -> Option<&dyn LiveState> {
        None
    }
}
