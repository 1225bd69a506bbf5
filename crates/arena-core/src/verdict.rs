use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const INVALID_FORMAT_REASON: &str = "Invalid Format";

/// Normalised outcome of a semantic (LLM) judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Judgment {
    #[serde(rename = "True")]
    Correct,
    #[serde(rename = "False")]
    Incorrect,
    #[serde(rename = "FalsePositive")]
    FalsePositive,
    #[serde(rename = "FalseNegative")]
    FalseNegative,
}

impl Judgment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Correct => "True",
            Self::Incorrect => "False",
            Self::FalsePositive => "FalsePositive",
            Self::FalseNegative => "FalseNegative",
        }
    }
}

/// Structured result of one oracle evaluation.
///
/// `success` is always present; the remaining fields are filled by the
/// oracle variant that produced the verdict. Compound oracles put their
/// per-oracle breakdown under `oracles`, each entry carrying its key in `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(
        rename = "isSubset",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub is_subset: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judgment: Option<Judgment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracles: Option<Vec<Verdict>>,
    #[serde(flatten)]
    pub details: BTreeMap<String, Value>,
}

impl Verdict {
    pub fn new(success: bool) -> Self {
        Self {
            name: None,
            success,
            accuracy: None,
            reason: None,
            is_subset: None,
            judgment: None,
            oracles: None,
            details: BTreeMap::new(),
        }
    }

    pub fn pass() -> Self {
        Self::new(true)
    }

    pub fn fail() -> Self {
        Self::new(false)
    }

    pub fn invalid_format() -> Self {
        Self::fail()
            .with_accuracy(0.0)
            .with_reason(INVALID_FORMAT_REASON)
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy.clamp(0.0, 100.0));
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_subset(mut self, is_subset: bool) -> Self {
        self.is_subset = Some(is_subset);
        self
    }

    pub fn with_judgment(mut self, judgment: Judgment) -> Self {
        self.judgment = Some(judgment);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn is_invalid_format(&self) -> bool {
        self.reason.as_deref() == Some(INVALID_FORMAT_REASON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_only_populated_fields() {
        let verdict = Verdict::pass().with_accuracy(100.0);
        assert_eq!(
            serde_json::to_value(&verdict).expect("serialize"),
            json!({"success": true, "accuracy": 100.0})
        );
    }

    #[test]
    fn subset_flag_uses_camel_case_key() {
        let verdict = Verdict::fail().with_accuracy(50.0).with_subset(true);
        let value = serde_json::to_value(&verdict).expect("serialize");
        assert_eq!(value["isSubset"], json!(true));
        assert!(value.get("is_subset").is_none());
    }

    #[test]
    fn details_flatten_into_the_verdict_object() {
        let verdict = Verdict::fail().with_detail("unhealthy", json!(["pod-a/app"]));
        let value = serde_json::to_value(&verdict).expect("serialize");
        assert_eq!(value, json!({"success": false, "unhealthy": ["pod-a/app"]}));
        let back: Verdict = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, verdict);
    }

    #[test]
    fn invalid_format_is_recognised() {
        let verdict = Verdict::invalid_format();
        assert!(verdict.is_invalid_format());
        assert!(!verdict.success);
        assert_eq!(verdict.accuracy, Some(0.0));
    }

    #[test]
    fn judgment_uses_judge_vocabulary() {
        assert_eq!(
            serde_json::to_value(Judgment::FalseNegative).expect("serialize"),
            json!("FalseNegative")
        );
        assert_eq!(Judgment::Correct.as_str(), "True");
    }
}
