use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ContainerState {
    Running,
    Waiting {
        reason: Option<String>,
    },
    Terminated {
        reason: Option<String>,
        exit_code: Option<i64>,
    },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub pod: String,
    pub container: String,
    pub ready: bool,
    pub state: ContainerState,
}

/// Read-only view of the live target system.
pub trait LiveState: Send + Sync {
    fn container_statuses(&self, namespace: &str) -> Result<Vec<ContainerStatus>>;
}

/// Everything an oracle may look at. Variants only read the fields they need.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub submission: Option<&'a Value>,
    pub fault_injected: bool,
    pub live: Option<&'a dyn LiveState>,
}

impl<'a> EvalContext<'a> {
    pub fn new(fault_injected: bool) -> Self {
        Self {
            submission: None,
            fault_injected,
            live: None,
        }
    }

    pub fn with_submission(mut self, submission: Option<&'a Value>) -> Self {
        self.submission = submission;
        self
    }

    pub fn with_live(mut self, live: Option<&'a dyn LiveState>) -> Self {
        self.live = live;
        self
    }

    pub fn require_live(&self) -> Result<&'a dyn LiveState> {
        self.live
            .ok_or_else(|| anyhow!("oracle requires live system state but none is attached"))
    }
}
