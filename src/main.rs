//! Keelson CLI entrypoint.
//!
//! This is the main entrypoint for the keelson command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use keelson::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use keelson::config::{ConfigParser, ConfigValidator, DeploySpec, StateBackend, find_config_file};
use keelson::error::{KeelsonError, Result};
use keelson::graph::GraphBuilder;
use keelson::planner::{ExecutionOptions, Plan};
use keelson::provider::ProviderRegistry;
use keelson::reconciler::{Reconciler, RunOutcome};
use keelson::state::{LocalStateStore, StateStore};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for runs where some changes did not complete.
const EXIT_PARTIAL: u8 = 1;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point. Returns the process exit code.
async fn run(cli: Cli) -> Result<u8> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force, &formatter).map(|()| 0),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter).map(|()| 0),
        Commands::Plan { destroy } => cmd_plan(config, destroy, &formatter).await.map(|()| 0),
        Commands::Apply { yes, concurrency } => {
            cmd_apply(config, yes, concurrency, &formatter).await
        }
        Commands::Destroy { yes, concurrency } => {
            cmd_destroy(config, yes, concurrency, &formatter).await
        }
        Commands::State { command } => cmd_state(config, command, &formatter).await.map(|()| 0),
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool, formatter: &OutputFormatter) -> Result<()> {
    info!("Initializing new Keelson project in: {}", path.display());

    let config_path = path.join("keelson.deploy.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        emit(
            formatter,
            &formatter.format_message(
                "warning",
                &format!(
                    "{} already exists; use --force to overwrite",
                    config_path.display()
                ),
            ),
        );
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/keelson.deploy.yaml"))?;
    debug!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    debug!("Created: {}", env_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", ".keelson/"]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Keelson")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            debug!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.keelson/\n")?;
        debug!("Created: {}", gitignore_path.display());
    }

    emit(
        formatter,
        &formatter.format_message(
            "success",
            &format!(
                "Project initialized. Edit {} then run 'keelson plan'.",
                config_path.display()
            ),
        ),
    );
    Ok(())
}

/// Validate the deploy spec and check that it forms a graph.
fn cmd_validate(
    config_path: Option<&Path>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (spec, root) = load_spec(config_path)?;
    let result = ConfigValidator::new().validate(&spec)?;

    let registry = ProviderRegistry::with_builtins(&root);
    let graph = GraphBuilder::new(&registry).build(&spec.resources)?;
    debug!("Resource graph has {} nodes", graph.len());

    emit(
        formatter,
        &formatter.format_validation(&spec, &result, show_warnings),
    );
    Ok(())
}

/// Show the plan without side effects.
async fn cmd_plan(
    config_path: Option<&Path>,
    destroy: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = Context::load(config_path)?;
    let reconciler = Reconciler::new(&ctx.spec, &ctx.store, &ctx.registry);

    let plan = if destroy {
        reconciler.plan_destroy().await?
    } else {
        reconciler.plan().await?
    };

    emit(formatter, &formatter.format_plan(&plan));
    Ok(())
}

/// Apply the deploy spec.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let ctx = Context::load(config_path)?;
    let cancel = cancel_on_ctrl_c();
    let reconciler = Reconciler::new(&ctx.spec, &ctx.store, &ctx.registry)
        .with_options(ctx.options(concurrency))
        .with_cancel(cancel);

    let preview = reconciler.plan().await?;
    if !confirm(&preview, auto_approve, "yes", formatter)? {
        return Ok(0);
    }

    let outcome = reconciler.apply().await?;
    Ok(finish(&outcome, formatter))
}

/// Destroy every tracked resource.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let ctx = Context::load(config_path)?;
    let cancel = cancel_on_ctrl_c();
    let reconciler = Reconciler::new(&ctx.spec, &ctx.store, &ctx.registry)
        .with_options(ctx.options(concurrency))
        .with_cancel(cancel);

    let preview = reconciler.plan_destroy().await?;
    if !confirm(&preview, auto_approve, "destroy", formatter)? {
        return Ok(0);
    }

    let outcome = reconciler.destroy().await?;
    Ok(finish(&outcome, formatter))
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = Context::load(config_path)?;

    match command {
        StateCommands::Show => {
            let lease = ctx.store.lease_info().await?;
            match ctx.store.load().await? {
                Some(state) => emit(formatter, &formatter.format_state(&state, lease.as_ref())),
                None => emit(formatter, &formatter.format_message("warning", "No state found.")),
            }
        }
        StateCommands::Unlock { lease_id, force } => {
            let message = if force {
                warn!("Breaking state lease");
                ctx.store.break_lease().await?;
                "State lease removed."
            } else if let Some(id) = lease_id {
                match ctx.store.lease_info().await? {
                    Some(lease) if lease.lease_id == id => {
                        ctx.store.release_lease(&lease).await?;
                        "State unlocked."
                    }
                    Some(_) => "Lease ID does not match the current lease.",
                    None => "State is not locked.",
                }
            } else {
                "Please provide --lease-id or use --force"
            };
            emit(formatter, &formatter.format_message("success", message));
        }
        StateCommands::Forget { name } => {
            Reconciler::new(&ctx.spec, &ctx.store, &ctx.registry)
                .forget(&name)
                .await?;
            emit(
                formatter,
                &formatter.format_message("success", &format!("'{name}' is no longer tracked.")),
            );
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Everything a command needs to talk to state and providers.
struct Context {
    spec: DeploySpec,
    store: LocalStateStore,
    registry: ProviderRegistry,
}

impl Context {
    fn load(config_path: Option<&Path>) -> Result<Self> {
        let (spec, root) = load_spec(config_path)?;
        ConfigValidator::new().validate(&spec)?;

        let store = match spec.state.backend {
            StateBackend::Local => LocalStateStore::from_config(&spec.state, &root),
        };
        debug!("Using {} state at {}", store.backend_type(), store.state_path().display());

        Ok(Self {
            registry: ProviderRegistry::with_builtins(&root),
            spec,
            store,
        })
    }

    fn options(&self, concurrency: Option<usize>) -> ExecutionOptions {
        let options = ExecutionOptions::from_config(&self.spec.execution);
        match concurrency {
            Some(n) => options.with_concurrency(n),
            None => options,
        }
    }
}

/// Loads the deploy spec and returns it with the project root directory.
fn load_spec(config_path: Option<&Path>) -> Result<(DeploySpec, PathBuf)> {
    let config_file = match config_path {
        Some(path) => path.to_path_buf(),
        None => find_config_file(std::env::current_dir()?)?,
    };
    debug!("Loading configuration from: {}", config_file.display());

    let root = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let parser = ConfigParser::new().with_base_path(&root);
    parser.load_dotenv()?;
    let spec = parser.load_with_env(&config_file)?;

    Ok((spec, root))
}

/// Cancels the returned token on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight changes");
            token.cancel();
        }
    });
    cancel
}

/// Shows the plan and asks for confirmation. Returns false to stop.
fn confirm(
    plan: &Plan,
    auto_approve: bool,
    answer: &str,
    formatter: &OutputFormatter,
) -> Result<bool> {
    emit(formatter, &formatter.format_plan(plan));

    if plan.is_empty() {
        return Ok(false);
    }
    if !plan.passes_guardrails() {
        return Err(KeelsonError::Reconcile(
            keelson::error::ReconcileError::Aborted {
                reason: plan.guardrail_violations.join("; "),
            },
        ));
    }
    if auto_approve {
        return Ok(true);
    }
    if formatter.is_json() {
        return Err(KeelsonError::internal(
            "refusing to prompt with --output json; pass --yes",
        ));
    }

    eprint!("Type '{answer}' to apply this plan: ");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    if input.trim() == answer {
        Ok(true)
    } else {
        eprintln!("Cancelled.");
        Ok(false)
    }
}

/// Prints the outcome and returns the exit code.
fn finish(outcome: &RunOutcome, formatter: &OutputFormatter) -> u8 {
    emit(formatter, &formatter.format_outcome(outcome));
    if outcome.is_success() { 0 } else { EXIT_PARTIAL }
}

/// Writes command output: JSON to stdout, text to stderr.
fn emit(formatter: &OutputFormatter, output: &str) {
    if formatter.is_json() {
        println!("{output}");
    } else {
        eprint!("{output}");
    }
}
