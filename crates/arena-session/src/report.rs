use arena_core::{canonical_json_digest, Verdict};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

pub const SESSION_REPORT_SCHEMA_VERSION: &str = "session_report_v1";

/// Grading stages in protocol order. Stages only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Noop,
    Detection,
    Localization,
    Mitigation,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Detection => "detection",
            Self::Localization => "localization",
            Self::Mitigation => "mitigation",
            Self::Done => "done",
        }
    }

    /// Stage as shown to agents: the pre-fault stage is reported as detection.
    pub fn public(self) -> Stage {
        match self {
            Self::Noop => Self::Detection,
            other => other,
        }
    }

    pub fn result_key(self) -> Option<&'static str> {
        match self {
            Self::Detection => Some("Detection"),
            Self::Localization => Some("Localization"),
            Self::Mitigation => Some("Mitigation"),
            Self::Noop | Self::Done => None,
        }
    }

    pub fn mark_key(self) -> Option<&'static str> {
        match self {
            Self::Detection => Some("TTD"),
            Self::Localization => Some("TTL"),
            Self::Mitigation => Some("TTM"),
            Self::Noop | Self::Done => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultValue {
    Seconds(f64),
    Verdict(Verdict),
}

/// Stage verdicts and timing marks in the order they were recorded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageResults {
    entries: Vec<(String, ResultValue)>,
}

impl StageResults {
    fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Records a verdict once; a second write for the same key is ignored.
    pub fn insert_verdict(&mut self, key: &str, verdict: Verdict) -> bool {
        if self.contains(key) {
            return false;
        }
        self.entries
            .push((key.to_string(), ResultValue::Verdict(verdict)));
        true
    }

    pub fn mark(&mut self, key: &str, seconds: f64) -> bool {
        if self.contains(key) {
            return false;
        }
        self.entries
            .push((key.to_string(), ResultValue::Seconds(seconds.max(0.0))));
        true
    }

    pub fn verdict(&self, key: &str) -> Option<&Verdict> {
        self.entries.iter().find_map(|(k, v)| match v {
            ResultValue::Verdict(verdict) if k == key => Some(verdict),
            _ => None,
        })
    }

    pub fn seconds(&self, key: &str) -> Option<f64> {
        self.entries.iter().find_map(|(k, v)| match v {
            ResultValue::Seconds(secs) if k == key => Some(*secs),
            _ => None,
        })
    }

    pub fn last_mark(&self) -> Option<f64> {
        self.entries.iter().rev().find_map(|(_, v)| match v {
            ResultValue::Seconds(secs) => Some(*secs),
            ResultValue::Verdict(_) => None,
        })
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Serialize for StageResults {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Done,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub schema_version: String,
    pub session_id: String,
    pub problem_id: String,
    pub outcome: SessionOutcome,
    pub abort_reason: Option<String>,
    pub started_at: String,
    pub finished_at: String,
    pub noop_detection: Option<Verdict>,
    pub results: StageResults,
    pub elapsed_seconds: f64,
    pub framework_overhead: f64,
    pub results_digest: String,
}

/// Time not attributable to the agent: elapsed minus the last recorded mark.
pub fn framework_overhead(elapsed_seconds: f64, results: &StageResults) -> f64 {
    elapsed_seconds - results.last_mark().unwrap_or(0.0)
}

pub fn results_digest(results: &StageResults) -> String {
    canonical_json_digest(&results.to_value())
}
