use anyhow::{anyhow, Result};
use arena_core::{
    resolve_home_dir, ARENA_DEFAULT_BIND_ADDR, ARENA_DEFAULT_CATALOG_FILE, ARENA_DEFAULT_KUBECTL,
    ARENA_DEFAULT_MAX_STEPS, ARENA_ENV_BIND, ARENA_ENV_KUBECTL, ARENA_ENV_MAX_STEPS,
    ARENA_ENV_PROBLEM_CATALOG, ARENA_SESSIONS_DIR,
};
use std::env;
use std::path::{Path, PathBuf};

/// Runtime settings resolved from the environment. CLI flags override them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub home: PathBuf,
    pub catalog: PathBuf,
    pub kubectl: String,
    pub bind: String,
    pub max_steps: usize,
}

impl SessionConfig {
    pub fn from_env() -> Result<Self> {
        Self::resolve(None, |key| env::var(key).ok())
    }

    pub fn with_home(home: &Path) -> Result<Self> {
        Self::resolve(Some(home), |key| env::var(key).ok())
    }

    fn resolve(home: Option<&Path>, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let home = resolve_home_dir(home);
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let catalog = non_empty(ARENA_ENV_PROBLEM_CATALOG)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(ARENA_DEFAULT_CATALOG_FILE));
        let max_steps = parse_optional_positive_usize(
            ARENA_ENV_MAX_STEPS,
            non_empty(ARENA_ENV_MAX_STEPS).as_deref(),
        )?
        .unwrap_or(ARENA_DEFAULT_MAX_STEPS);
        Ok(Self {
            catalog,
            kubectl: non_empty(ARENA_ENV_KUBECTL)
                .unwrap_or_else(|| ARENA_DEFAULT_KUBECTL.to_string()),
            bind: non_empty(ARENA_ENV_BIND).unwrap_or_else(|| ARENA_DEFAULT_BIND_ADDR.to_string()),
            max_steps,
            home,
        })
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.home.join(ARENA_SESSIONS_DIR)
    }
}

fn parse_optional_positive_usize(name: &str, raw: Option<&str>) -> Result<Option<usize>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let parsed = raw.parse::<usize>().map_err(|_| {
        anyhow!(
            "{} must be a positive integer when set (got: {})",
            name,
            raw
        )
    })?;
    if parsed == 0 {
        return Err(anyhow!("{} must be > 0 when set", name));
    }
    Ok(Some(parsed))
}
