use anyhow::{anyhow, Result};
use arena_core::{ARENA_ENV_KUBECTL, ARENA_ENV_LOG};
use arena_oracle::{EvalContext, HttpJudge, JudgeConfig};
use arena_server::DriverServer;
use arena_session::{
    install_interrupt_handler, run_agent_session, Agent, CatalogContext, ProblemCatalog,
    ProblemRegistry, ScriptedAgent, SessionConfig, SessionEngine, SessionOutcome, SessionReport,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arena", version, about = "Staged fault-injection benchmark sessions")]
struct Cli {
    /// State directory; defaults to ARENA_HOME or .arena
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    /// Problem catalog; defaults to ARENA_PROBLEM_CATALOG or <home>/problems.yaml
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    /// kubectl command, may include a prefix such as `microk8s kubectl`
    #[arg(long, global = true)]
    kubectl: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List registered problem ids")]
    Problems {
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        json: bool,
    },
    #[command(about = "Run one problem session with a scripted or interactive agent")]
    Run {
        problem_id: String,
        /// YAML list of actions; reads actions from stdin when omitted
        #[arg(long)]
        actions: Option<PathBuf>,
        #[arg(long)]
        max_steps: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    #[command(about = "Serve the session protocol over HTTP")]
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        json: bool,
    },
    #[command(about = "Run a problem's mitigation oracle against the live cluster")]
    Oracle {
        problem_id: String,
        #[arg(long)]
        json: bool,
    },
    SchemaValidate {
        #[arg(long)]
        schema: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    install_interrupt_handler()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env(ARENA_ENV_LOG).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let Cli {
        home,
        catalog,
        kubectl,
        command,
    } = cli;
    let config = match home.as_deref() {
        Some(home) => SessionConfig::with_home(home)?,
        None => SessionConfig::from_env()?,
    };
    let catalog_path = catalog.unwrap_or_else(|| config.catalog.clone());
    let kubectl = kubectl.or_else(|| {
        std::env::var(ARENA_ENV_KUBECTL)
            .ok()
            .filter(|v| !v.trim().is_empty())
    });

    match command {
        Commands::Problems { filter, json } => {
            let catalog = ProblemCatalog::load(&catalog_path)?;
            let registry = load_registry(&catalog, kubectl)?;
            let descriptions: BTreeMap<String, Option<String>> = catalog
                .expanded()
                .into_iter()
                .map(|spec| (spec.id, spec.description))
                .collect();
            let ids = registry.ids(filter.as_deref());
            if json {
                let problems: Vec<Value> = ids
                    .iter()
                    .map(|id| {
                        json!({
                            "id": id,
                            "description": descriptions.get(id).cloned().flatten()
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "problems",
                    "catalog": catalog_path.display().to_string(),
                    "problems": problems
                })));
            }
            for id in ids {
                match descriptions.get(&id).cloned().flatten() {
                    Some(description) => println!("{}\t{}", id, description),
                    None => println!("{}", id),
                }
            }
        }
        Commands::Run {
            problem_id,
            actions,
            max_steps,
            json,
        } => {
            let catalog = ProblemCatalog::load(&catalog_path)?;
            let registry = load_registry(&catalog, kubectl)?;
            let mut engine =
                SessionEngine::new(Arc::new(registry)).with_sessions_root(config.sessions_root());
            let mut agent: Box<dyn Agent> = match actions {
                Some(path) => Box::new(ScriptedAgent::load(&path)?),
                None => Box::new(StdinAgent::new()),
            };
            let max_steps = max_steps.unwrap_or(config.max_steps);
            if max_steps == 0 {
                return Err(anyhow!("--max-steps must be > 0"));
            }
            let report = run_agent_session(&mut engine, agent.as_mut(), &problem_id, max_steps)?;
            let session_dir = config.sessions_root().join(&report.session_id);
            if json {
                emit_json(&json!({
                    "ok": report.outcome == SessionOutcome::Done,
                    "command": "run",
                    "session_dir": session_dir.display().to_string(),
                    "report": report
                }));
            } else {
                print_report(&report, &session_dir);
            }
            if report.outcome != SessionOutcome::Done {
                std::process::exit(1);
            }
        }
        Commands::Serve { bind, json } => {
            let catalog = ProblemCatalog::load(&catalog_path)?;
            let registry = load_registry(&catalog, kubectl)?;
            let engine =
                SessionEngine::new(Arc::new(registry)).with_sessions_root(config.sessions_root());
            let bind = bind.unwrap_or_else(|| config.bind.clone());
            let server = DriverServer::start(&bind, Arc::new(Mutex::new(engine)))?;
            if json {
                emit_json(&json!({
                    "ok": true,
                    "command": "serve",
                    "endpoint": server.endpoint
                }));
            } else {
                println!("listening: {}", server.endpoint);
            }
            let _ = std::io::stdout().flush();
            server.wait()?;
        }
        Commands::Oracle { problem_id, json } => {
            let catalog = ProblemCatalog::load(&catalog_path)?;
            let registry = load_registry(&catalog, kubectl)?;
            let problem = registry.get_instance(&problem_id)?;
            let oracle = problem
                .oracles()
                .mitigation
                .as_deref()
                .ok_or_else(|| anyhow!("problem '{}' has no mitigation oracle", problem_id))?;
            let ctx = EvalContext::new(true).with_live(problem.live_state());
            let verdict = oracle.evaluate(&ctx)?;
            if json {
                emit_json(&json!({
                    "ok": verdict.success,
                    "command": "oracle",
                    "problem_id": problem_id,
                    "verdict": verdict
                }));
            } else {
                println!(
                    "{}: {}",
                    problem_id,
                    if verdict.success { "healthy" } else { "unhealthy" }
                );
                println!("{}", serde_json::to_string_pretty(&verdict)?);
            }
            if !verdict.success {
                std::process::exit(1);
            }
        }
        Commands::SchemaValidate { schema, file, json } => {
            let compiled = arena_schemas::compile_schema(&schema)?;
            let value = read_document(&file)?;
            if let Err(errors) = compiled.validate(&value) {
                for e in errors {
                    eprintln!("schema error: {} at '{}'", e, e.instance_path);
                }
                std::process::exit(1);
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "schema-validate",
                    "valid": true,
                    "schema": schema
                })));
            }
            println!("ok");
        }
    }
    Ok(None)
}

fn load_registry(catalog: &ProblemCatalog, kubectl: Option<String>) -> Result<ProblemRegistry> {
    let mut ctx = CatalogContext {
        kubectl,
        judge: None,
    };
    match JudgeConfig::from_env() {
        Ok(config) => {
            info!(url = %config.url, model = %config.model, "llm judge configured");
            ctx = ctx.with_judge(Arc::new(HttpJudge::new(config)?));
        }
        Err(err) => debug!(reason = %err, "llm judge not configured"),
    }
    ProblemRegistry::from_catalog(catalog, ctx)
}

/// Catalogs are YAML; reports are JSON. Both parse as YAML.
fn read_document(path: &Path) -> Result<Value> {
    let data = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        return Ok(serde_json::from_str(&data)?);
    }
    Ok(serde_yaml::from_str(&data)?)
}

/// Interactive agent: prints each observation to stderr and reads the next
/// action from stdin. A line opening a ``` fence continues until the fence closes.
struct StdinAgent {
    stdin: std::io::Stdin,
}

impl StdinAgent {
    fn new() -> Self {
        Self {
            stdin: std::io::stdin(),
        }
    }

    fn read_line(&self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self.stdin.lock().read_line(&mut line)?;
        Ok((n > 0).then_some(line))
    }
}

impl Agent for StdinAgent {
    fn name(&self) -> &str {
        "stdin"
    }

    fn next_action(&mut self, observation: &str) -> Result<String> {
        eprintln!("{}", observation);
        eprint!("action> ");
        let _ = std::io::stderr().flush();
        let first = self
            .read_line()?
            .ok_or_else(|| anyhow!("stdin closed before an action was given"))?;
        if !first.trim_start().starts_with("```") || first.matches("```").count() > 1 {
            return Ok(first.trim().to_string());
        }
        let mut action = first;
        while let Some(line) = self.read_line()? {
            let closes = line.trim_start().starts_with("```");
            action.push_str(&line);
            if closes {
                break;
            }
        }
        Ok(action)
    }
}

fn print_report(report: &SessionReport, session_dir: &Path) {
    println!("session_id: {}", report.session_id);
    println!("problem: {}", report.problem_id);
    println!(
        "outcome: {}",
        match report.outcome {
            SessionOutcome::Done => "done",
            SessionOutcome::Aborted => "aborted",
        }
    );
    if let Some(reason) = &report.abort_reason {
        println!("abort_reason: {}", reason);
    }
    if let Some(noop) = &report.noop_detection {
        println!("noop_detection: {}", if noop.success { "pass" } else { "fail" });
    }
    for key in report.results.keys() {
        if let Some(verdict) = report.results.verdict(key) {
            println!("{}: {}", key, if verdict.success { "pass" } else { "fail" });
        } else if let Some(secs) = report.results.seconds(key) {
            println!("{}: {:.2}s", key, secs);
        }
    }
    println!("elapsed: {:.2}s", report.elapsed_seconds);
    println!("framework_overhead: {:.2}s", report.framework_overhead);
    if session_dir.exists() {
        println!("session_dir: {}", session_dir.display());
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Problems { json, .. }
        | Commands::Run { json, .. }
        | Commands::Serve { json, .. }
        | Commands::Oracle { json, .. }
        | Commands::SchemaValidate { json, .. } => *json,
    }
}
