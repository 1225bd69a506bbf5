//! Command-backed problems loaded from a YAML catalog.
//!
//! Each catalog entry describes how to deploy an application, inject and
//! recover a fault, and which oracles grade it. Every action is an argv list
//! run to completion; `{namespace}`, `{faulty_service}` and `{problem_id}`
//! are substituted when the problem is built.

use crate::cluster::KubectlProbe;
use crate::problem::{Application, OracleSet, Problem};
use crate::registry::{ProblemFactory, ProblemRegistry};
use anyhow::{anyhow, Context, Result};
use arena_core::{run_argv_checked, ARENA_DEFAULT_KUBECTL};
use arena_oracle::{
    CommandOracle, CompoundedOracle, Judge, LiveState, LlmJudgeOracle, LocalizationOracle,
    MitigationOracle, Oracle,
};
use arena_schemas::{validate_value, PROBLEM_CATALOG_SCHEMA};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub const PROBLEM_CATALOG_SCHEMA_VERSION: &str = "problem_catalog_v1";

#[derive(Debug, Clone, Deserialize)]
pub struct ProblemCatalog {
    pub schema_version: String,
    #[serde(default)]
    pub defaults: CatalogDefaults,
    pub problems: Vec<ProblemSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogDefaults {
    pub kubectl: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProblemSpec {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub namespace: String,
    pub faulty_service: Vec<String>,
    pub app: AppSpec,
    pub fault: FaultSpec,
    #[serde(default)]
    pub oracles: OracleSpecs,
    #[serde(default)]
    pub variants: Vec<VariantSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSpec {
    pub name: String,
    pub deploy: Vec<String>,
    #[serde(default)]
    pub delete: Option<Vec<String>>,
    #[serde(default)]
    pub start_workload: Option<Vec<String>>,
    #[serde(default)]
    pub cleanup: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FaultSpec {
    pub inject: Vec<String>,
    pub recover: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OracleSpecs {
    #[serde(default)]
    pub localization: Option<LocalizationSpec>,
    #[serde(default)]
    pub mitigation: Option<MitigationSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalizationSpec {
    /// Defaults to the problem's faulty services when `expected` is omitted.
    ExactSet {
        #[serde(default)]
        expected: Option<Vec<String>>,
    },
    LlmJudge { expectation: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MitigationSpec {
    #[serde(default = "default_true")]
    pub pods_healthy: bool,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckSpec {
    pub name: String,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariantSpec {
    pub suffix: String,
    #[serde(default)]
    pub faulty_service: Option<Vec<String>>,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl ProblemCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read problem catalog {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid problem catalog {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let raw: Value = serde_yaml::from_str(text)?;
        validate_value(PROBLEM_CATALOG_SCHEMA, &raw)?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Concrete problem specs: entries with variants expand to `{id}-{suffix}`.
    pub fn expanded(&self) -> Vec<ProblemSpec> {
        let mut out = Vec::new();
        for spec in &self.problems {
            if spec.variants.is_empty() {
                out.push(spec.clone());
                continue;
            }
            for variant in &spec.variants {
                let mut concrete = spec.clone();
                concrete.id = format!("{}-{}", spec.id, variant.suffix);
                if let Some(services) = &variant.faulty_service {
                    concrete.faulty_service = services.clone();
                }
                if let Some(namespace) = &variant.namespace {
                    concrete.namespace = namespace.clone();
                }
                concrete.variants.clear();
                out.push(concrete);
            }
        }
        out
    }
}

/// Shared collaborators handed to every catalog-built problem.
#[derive(Clone, Default)]
pub struct CatalogContext {
    pub kubectl: Option<String>,
    pub judge: Option<Arc<dyn Judge>>,
}

impl CatalogContext {
    pub fn new(kubectl: impl Into<String>) -> Self {
        Self {
            kubectl: Some(kubectl.into()),
            judge: None,
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }
}

struct Placeholders<'a> {
    problem_id: &'a str,
    namespace: &'a str,
    faulty_service: String,
}

impl Placeholders<'_> {
    fn apply(&self, argv: &[String]) -> Vec<String> {
        argv.iter()
            .map(|arg| {
                arg.replace("{namespace}", self.namespace)
                    .replace("{faulty_service}", &self.faulty_service)
                    .replace("{problem_id}", self.problem_id)
            })
            .collect()
    }

    fn apply_opt(&self, argv: &Option<Vec<String>>) -> Option<Vec<String>> {
        argv.as_ref().map(|a| self.apply(a))
    }
}

pub struct CommandApplication {
    name: String,
    deploy: Vec<String>,
    delete: Option<Vec<String>>,
    start_workload: Option<Vec<String>>,
    cleanup: Option<Vec<String>>,
}

impl CommandApplication {
    fn run_optional(&self, argv: &Option<Vec<String>>, action: &str) -> Result<()> {
        match argv {
            Some(argv) => {
                run_argv_checked(argv, &format!("{} {}", self.name, action))?;
                Ok(())
            }
            None => {
                debug!(app = %self.name, action, "no command configured; skipping");
                Ok(())
            }
        }
    }
}

impl Application for CommandApplication {
    fn name(&self) -> &str {
        &self.name
    }

    fn deploy(&self) -> Result<()> {
        info!(app = %self.name, "deploying application");
        run_argv_checked(&self.deploy, &format!("{} deploy", self.name))?;
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        self.run_optional(&self.delete, "delete")
    }

    fn start_workload(&self) -> Result<()> {
        self.run_optional(&self.start_workload, "start_workload")
    }

    fn cleanup(&self) -> Result<()> {
        self.run_optional(&self.cleanup, "cleanup")
    }
}

pub struct CommandProblem {
    id: String,
    namespace: String,
    faulty_service: Vec<String>,
    app: CommandApplication,
    inject: Vec<String>,
    recover: Vec<String>,
    oracles: OracleSet,
    probe: KubectlProbe,
    injected: AtomicBool,
}

impl CommandProblem {
    pub fn build(spec: &ProblemSpec, ctx: &CatalogContext) -> Result<Self> {
        let vars = Placeholders {
            problem_id: &spec.id,
            namespace: &spec.namespace,
            faulty_service: spec.faulty_service.join(","),
        };
        let app = CommandApplication {
            name: spec.app.name.clone(),
            deploy: vars.apply(&spec.app.deploy),
            delete: vars.apply_opt(&spec.app.delete),
            start_workload: vars.apply_opt(&spec.app.start_workload),
            cleanup: vars.apply_opt(&spec.app.cleanup),
        };

        let mut oracles = OracleSet::default();
        if let Some(localization) = &spec.oracles.localization {
            oracles = oracles.with_localization(localization_oracle(spec, localization, ctx)?);
        }
        if let Some(mitigation) = &spec.oracles.mitigation {
            if let Some(oracle) = mitigation_oracle(&spec.namespace, mitigation, &vars)? {
                oracles = oracles.with_mitigation(oracle);
            }
        }

        Ok(Self {
            id: spec.id.clone(),
            namespace: spec.namespace.clone(),
            faulty_service: spec.faulty_service.clone(),
            app,
            inject: vars.apply(&spec.fault.inject),
            recover: vars.apply(&spec.fault.recover),
            oracles,
            probe: KubectlProbe::new(ctx.kubectl.as_deref().unwrap_or(ARENA_DEFAULT_KUBECTL)),
            injected: AtomicBool::new(false),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_injected(&self) -> bool {
        self.injected.load(Ordering::SeqCst)
    }
}

fn localization_oracle(
    spec: &ProblemSpec,
    localization: &LocalizationSpec,
    ctx: &CatalogContext,
) -> Result<Box<dyn Oracle>> {
    match localization {
        LocalizationSpec::ExactSet { expected } => {
            let expected = expected.as_ref().unwrap_or(&spec.faulty_service);
            Ok(Box::new(LocalizationOracle::new(expected.iter().cloned())))
        }
        LocalizationSpec::LlmJudge { expectation } => {
            let judge = ctx.judge.clone().ok_or_else(|| {
                anyhow!(
                    "problem '{}' uses an llm_judge oracle but no judge is configured",
                    spec.id
                )
            })?;
            Ok(Box::new(LlmJudgeOracle::new(expectation.clone(), judge)))
        }
    }
}

fn mitigation_oracle(
    namespace: &str,
    mitigation: &MitigationSpec,
    vars: &Placeholders<'_>,
) -> Result<Option<Box<dyn Oracle>>> {
    if mitigation.checks.is_empty() {
        return Ok(mitigation
            .pods_healthy
            .then(|| Box::new(MitigationOracle::new(namespace)) as Box<dyn Oracle>));
    }
    let mut compound = CompoundedOracle::new().parallel(mitigation.parallel);
    if mitigation.pods_healthy {
        compound = compound.with("pods_healthy", Box::new(MitigationOracle::new(namespace)))?;
    }
    for check in &mitigation.checks {
        let oracle = CommandOracle::new(vars.apply(&check.command))?;
        compound = compound.with(check.name.clone(), Box::new(oracle))?;
    }
    Ok(Some(Box::new(compound)))
}

impl Problem for CommandProblem {
    fn id(&self) -> &str {
        &self.id
    }

    fn app(&self) -> &dyn Application {
        &self.app
    }

    fn faulty_service(&self) -> &[String] {
        &self.faulty_service
    }

    fn oracles(&self) -> &OracleSet {
        &self.oracles
    }

    fn inject_fault(&self) -> Result<()> {
        // Marked before running so a partial injection is still recovered.
        self.injected.store(true, Ordering::SeqCst);
        run_argv_checked(&self.inject, &format!("{} fault injection", self.id))?;
        Ok(())
    }

    fn recover_fault(&self) -> Result<()> {
        if !self.injected.load(Ordering::SeqCst) {
            debug!(problem_id = %self.id, "no fault injected; nothing to recover");
            return Ok(());
        }
        run_argv_checked(&self.recover, &format!("{} fault recovery", self.id))?;
        self.injected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn live_state(&self) -> Option<&dyn LiveState> {
        Some(&self.probe)
    }
}

impl ProblemRegistry {
    /// Registers every concrete problem in `catalog`. Specs are validated
    /// eagerly so a broken entry fails at load time, not at session start.
    pub fn from_catalog(catalog: &ProblemCatalog, ctx: CatalogContext) -> Result<Self> {
        let mut registry = ProblemRegistry::new();
        let mut ctx = ctx;
        if ctx.kubectl.is_none() {
            ctx.kubectl = catalog.defaults.kubectl.clone();
        }
        for spec in catalog.expanded() {
            CommandProblem::build(&spec, &ctx)
                .with_context(|| format!("problem '{}' is misconfigured", spec.id))?;
            let id = spec.id.clone();
            let ctx = ctx.clone();
            let factory: ProblemFactory = Box::new(move || {
                Ok(Arc::new(CommandProblem::build(&spec, &ctx)?) as Arc<dyn Problem>)
            });
            registry.register(id, factory)?;
        }
        info!(problems = registry.len(), "problem catalog loaded");
        Ok(registry)
    }
}
