use crate::problem::Problem;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

pub type ProblemFactory = Box<dyn Fn() -> anyhow::Result<Arc<dyn Problem>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("problem '{0}' not found")]
    NotFound(String),
    #[error("problem '{0}' is already registered")]
    Duplicate(String),
    #[error("failed to construct problem '{id}': {error}")]
    Construct { id: String, error: anyhow::Error },
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "problem_not_found",
            Self::Duplicate(_) => "duplicate_problem",
            Self::Construct { .. } => "problem_construct_failed",
        }
    }
}

/// Table of problem factories. Every lookup builds a fresh problem instance.
#[derive(Default)]
pub struct ProblemRegistry {
    factories: BTreeMap<String, ProblemFactory>,
}

impl ProblemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: impl Into<String>,
        factory: ProblemFactory,
    ) -> Result<(), RegistryError> {
        let id = id.into();
        if self.factories.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.factories.insert(id, factory);
        Ok(())
    }

    pub fn get_instance(&self, id: &str) -> Result<Arc<dyn Problem>, RegistryError> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        factory().map_err(|error| RegistryError::Construct {
            id: id.to_string(),
            error,
        })
    }

    /// Sorted ids, optionally restricted to those containing `filter`.
    pub fn ids(&self, filter: Option<&str>) -> Vec<String> {
        self.factories
            .keys()
            .filter(|id| filter.map_or(true, |f| id.contains(f)))
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
