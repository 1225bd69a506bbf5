use crate::{EvalContext, Oracle};
use anyhow::{anyhow, Result};
use arena_core::{
    Judgment, Verdict, ARENA_ENV_JUDGE_API_KEY, ARENA_ENV_JUDGE_MODEL, ARENA_ENV_JUDGE_TIMEOUT_MS,
    ARENA_ENV_JUDGE_URL,
};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_JUDGE_TIMEOUT_MS: u64 = 60_000;

const JUDGE_SYSTEM_PROMPT: &str = "You are an expert judge evaluating whether an agent's diagnosis of a system issue matches the expected root cause.

Compare the agent's answer with the expected root cause and decide whether they are semantically equivalent.

Classification criteria:
- True: the agent identified the root cause, even if worded differently.
- False: the agent identified a different problem or misdiagnosed the root cause.
- FalsePositive: the expected root cause is empty (no fault exists) but the agent reported a problem.
- FalseNegative: the expected root cause describes a real fault but the agent reported no issue.

Respond with JSON only:
{\"judgment\": \"True|False|FalsePositive|FalseNegative\", \"reasoning\": \"...\"}";

/// Backend that compares a free-text solution with an expectation and
/// returns the judge's raw reply.
pub trait Judge: Send + Sync {
    fn judge(&self, solution: &str, expectation: &str) -> Result<String>;
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Normalises a judge reply into one of the four judgment categories.
pub fn parse_judgment(raw: &str) -> Result<Judgment> {
    let label = match serde_json::from_str::<Value>(strip_code_fence(raw)) {
        Ok(Value::Object(map)) => map
            .get("judgment")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        _ => raw.to_string(),
    };
    match label.trim().to_lowercase().as_str() {
        "true" => Ok(Judgment::Correct),
        "false" => Ok(Judgment::Incorrect),
        "falsepositive" | "false positive" => Ok(Judgment::FalsePositive),
        "falsenegative" | "false negative" => Ok(Judgment::FalseNegative),
        _ => Err(anyhow!("could not parse judgment from response: {}", raw.trim())),
    }
}

/// Grades a free-text diagnosis through a [`Judge`].
pub struct LlmJudgeOracle {
    expectation: String,
    judge: Arc<dyn Judge>,
}

impl LlmJudgeOracle {
    pub fn new(expectation: impl Into<String>, judge: Arc<dyn Judge>) -> Self {
        Self {
            expectation: expectation.into(),
            judge,
        }
    }
}

impl Oracle for LlmJudgeOracle {
    fn kind(&self) -> &'static str {
        "llm_judge"
    }

    fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<Verdict> {
        let solution = match ctx.submission {
            Some(Value::String(text)) => text.clone(),
            Some(other) => serde_json::to_string(other)?,
            None => {
                warn!("llm judge received no submission");
                return Ok(Verdict::invalid_format());
            }
        };
        let raw = self.judge.judge(&solution, &self.expectation)?;
        let judgment = parse_judgment(&raw)?;
        let success = judgment == Judgment::Correct;
        info!(judgment = judgment.as_str(), success, "llm judgment evaluated");
        Ok(Verdict::new(success)
            .with_accuracy(if success { 100.0 } else { 0.0 })
            .with_judgment(judgment))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

impl JudgeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let url = non_empty(ARENA_ENV_JUDGE_URL)
            .ok_or_else(|| anyhow!("{} must be set to use the llm judge", ARENA_ENV_JUDGE_URL))?;
        let model = non_empty(ARENA_ENV_JUDGE_MODEL)
            .ok_or_else(|| anyhow!("{} must be set to use the llm judge", ARENA_ENV_JUDGE_MODEL))?;
        let timeout_ms = match non_empty(ARENA_ENV_JUDGE_TIMEOUT_MS) {
            Some(raw) => match raw.parse::<u64>() {
                Ok(v) if v > 0 => v,
                _ => {
                    return Err(anyhow!(
                        "{} must be a positive integer, got '{}'",
                        ARENA_ENV_JUDGE_TIMEOUT_MS,
                        raw
                    ))
                }
            },
            None => DEFAULT_JUDGE_TIMEOUT_MS,
        };
        Ok(Self {
            url,
            model,
            api_key: non_empty(ARENA_ENV_JUDGE_API_KEY),
            timeout_ms,
        })
    }
}

/// OpenAI-compatible `chat/completions` judge.
pub struct HttpJudge {
    config: JudgeConfig,
    client: HttpClient,
}

impl HttpJudge {
    pub fn new(config: JudgeConfig) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { config, client })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.url.trim_end_matches('/'))
    }

    fn request_body(&self, solution: &str, expectation: &str) -> Value {
        let expectation = if expectation.trim().is_empty() {
            "(No fault - system is operating normally)"
        } else {
            expectation
        };
        let user_prompt = format!(
            "Expected Root Cause:\n{}\n\nAgent's Answer:\n{}\n\nEvaluate whether the agent's answer identifies the root cause. Respond in JSON.",
            expectation, solution
        );
        json!({
            "model": self.config.model,
            "temperature": 0.0,
            "messages": [
                {"role": "system", "content": JUDGE_SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt},
            ],
        })
    }
}

impl Judge for HttpJudge {
    fn judge(&self, solution: &str, expectation: &str) -> Result<String> {
        let url = self.completions_url();
        let mut builder = self
            .client
            .post(&url)
            .json(&self.request_body(solution, expectation));
        if let Some(key) = self.config.api_key.as_ref() {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .map_err(|err| anyhow!("judge http POST {} transport error: {}", url, err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!(
                "judge http POST {} returned {}: {}",
                url,
                status.as_u16(),
                arena_core::truncate_tail(&body, 512)
            ));
        }
        let payload: Value = response.json()?;
        payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| anyhow!("judge response has no choices[0].message.content"))
    }
}
