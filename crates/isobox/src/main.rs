use std::env;
use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::LevelFilter;
use tracing::{debug, info};

use isobox::config::{self, APP_NAME, AppConfig, AppPaths};
use isobox::container::ExecOutput;
use isobox::lifecycle::{
    BatchReport, DeleteOutcome, KillOutcome, LaunchRequest, LifecycleController, PersistOutcome,
    RunRequest, ShutdownOutcome, StopOutcome, StopReport,
};
use isobox::network::NetworkMode;

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            let _ = writeln!(io::stderr(), "Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
        command => async_main(ctx, command),
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<ExitCode> {
    let controller = config::build_controller(&ctx.config, &ctx.paths)?;

    match command {
        Command::Direct(cmd) | Command::Container { command: cmd } => {
            handle_container(&controller, cmd).await
        }
        Command::Run(cmd) => handle_run(&controller, cmd).await,
        Command::Persist(cmd) => handle_persist(&ctx, &controller, cmd).await,
        Command::Shutdown(cmd) => handle_shutdown(&controller, cmd).await,
        Command::Kill(cmd) => handle_kill(&ctx, &controller, cmd).await,
        Command::List => handle_list(&ctx, &controller).await,
        Command::Clean => handle_clean(&controller).await,
        Command::Init(_) | Command::Config { .. } | Command::Completions { .. } => {
            unreachable!("handled before the runtime starts")
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Isobox - isolated development container sessions.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not write configuration files or create directories
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(flatten)]
    Direct(ContainerCommand),
    /// Low-level container operations
    Container {
        #[command(subcommand)]
        command: ContainerCommand,
    },
    /// Run a command in a workspace session container
    Run(RunCommand),
    /// Keep containers across stop and shutdown
    Persist(PersistCommand),
    /// Stop gracefully, force-killing after a timeout
    Shutdown(ShutdownCommand),
    /// Force-stop containers immediately
    Kill(KillCommand),
    /// List sessions and their container state
    List,
    /// Remove session records whose container no longer exists
    Clean,
    /// Create a config file with defaults
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum ContainerCommand {
    /// Launch a session container, resuming it if stopped
    Launch(LaunchCommand),
    /// Stop a container; non-persistent sessions are removed
    Stop(NameArg),
    /// Delete a container and its session
    Delete(DeleteCommand),
    /// Exit 0 if the container exists
    Exists(NameArg),
    /// Exit 0 if the container is running
    Running(NameArg),
    /// Execute a command inside a container
    Exec(ExecCommand),
}

#[derive(Debug, Clone, Args)]
struct NameArg {
    /// Container name
    name: String,
}

#[derive(Debug, Clone, Args)]
struct LaunchCommand {
    /// Image to launch
    image: String,
    /// Container name (derived from workspace and slot when omitted)
    name: Option<String>,
    /// Workspace directory shared into the container
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,
    /// Slot within the workspace
    #[arg(short, long)]
    slot: Option<u32>,
    /// Network isolation mode
    #[arg(long, value_enum)]
    network: Option<NetworkMode>,
}

#[derive(Debug, Clone, Args)]
struct DeleteCommand {
    /// Container name
    name: String,
    /// Delete even if running
    #[arg(short, long)]
    force: bool,
}

#[derive(Debug, Clone, Args)]
struct ExecCommand {
    /// Container name
    name: String,
    /// Command and arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct RunCommand {
    /// Workspace directory shared into the container
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,
    /// Slot within the workspace (first free slot when omitted)
    #[arg(short, long)]
    slot: Option<u32>,
    /// Keep the container after the command exits
    #[arg(long)]
    persistent: bool,
    /// Image to launch (configured default when omitted)
    #[arg(long)]
    image: Option<String>,
    /// Network isolation mode
    #[arg(long, value_enum)]
    network: Option<NetworkMode>,
    /// Command and arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct PersistCommand {
    /// Container name
    #[arg(conflicts_with = "all")]
    name: Option<String>,
    /// Persist every session container
    #[arg(long)]
    all: bool,
    /// Skip the confirmation prompt
    #[arg(short, long)]
    force: bool,
}

#[derive(Debug, Clone, Args)]
struct ShutdownCommand {
    /// Container name
    name: String,
    /// Seconds to wait for a graceful stop before force-killing
    #[arg(short, long, value_name = "SECONDS")]
    timeout: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct KillCommand {
    /// Container name
    #[arg(conflicts_with = "all")]
    name: Option<String>,
    /// Kill every session container
    #[arg(long)]
    all: bool,
    /// Skip the confirmation prompt
    #[arg(short, long)]
    force: bool,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = config::load_or_init_config(&paths, common.dry_run)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Picks up `log` records if the tracing bridge could not be installed.
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(level),
        );
        builder.filter_module(APP_NAME, self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    /// Command-line flags win; otherwise `logging.level` from the config.
    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Warn),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {} and state dir {}",
                self.paths.data_dir.display(),
                self.paths.state_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })?;
        fs::create_dir_all(&self.paths.sessions_dir).with_context(|| {
            format!(
                "creating sessions directory {}",
                self.paths.sessions_dir.display()
            )
        })?;
        Ok(())
    }

    /// Ask before a bulk operation. Refuses when stdin is not a terminal.
    fn confirm(&self, force: bool, prompt: &str) -> Result<bool> {
        if force || self.common.assume_yes {
            return Ok(true);
        }
        if !io::stdin().is_terminal() {
            bail!("{prompt}: confirmation required, pass --force");
        }

        eprint!("{prompt}? [y/N] ");
        io::stderr().flush().ok();
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

async fn handle_container(
    controller: &LifecycleController,
    command: ContainerCommand,
) -> Result<ExitCode> {
    match command {
        ContainerCommand::Launch(cmd) => {
            let outcome = controller
                .launch(LaunchRequest {
                    workspace: resolve_workspace(&cmd.workspace)?,
                    name: cmd.name,
                    slot: cmd.slot,
                    image: Some(cmd.image),
                    network: cmd.network,
                })
                .await?;
            if outcome.resumed {
                println!("Resumed {}", outcome.name);
            } else {
                println!("Launched {}", outcome.name);
            }
            Ok(ExitCode::SUCCESS)
        }
        ContainerCommand::Stop(cmd) => {
            let report = controller.stop(&cmd.name).await?;
            let status = match report.outcome {
                StopOutcome::Stopped => format!("Stopped {}", cmd.name),
                StopOutcome::AlreadyStopped => format!("Container {} was already stopped", cmd.name),
                StopOutcome::Absent => format!("Container {} no longer exists", cmd.name),
            };
            println!("{}{}", status, removal_suffix(&report));
            Ok(ExitCode::SUCCESS)
        }
        ContainerCommand::Delete(cmd) => {
            match controller.delete(&cmd.name, cmd.force).await? {
                DeleteOutcome::Deleted => println!("Deleted {}", cmd.name),
                DeleteOutcome::Absent => {
                    println!("Container {} was already gone, removed its session", cmd.name)
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        ContainerCommand::Exists(cmd) => Ok(exit_flag(controller.exists(&cmd.name).await?)),
        ContainerCommand::Running(cmd) => Ok(exit_flag(controller.running(&cmd.name).await?)),
        ContainerCommand::Exec(cmd) => {
            let output = controller.exec(&cmd.name, &cmd.command).await?;
            forward_output(&output)?;
            debug!("exec in {} exited with {}", cmd.name, output.exit_code);
            Ok(exit_code(&output))
        }
    }
}

async fn handle_run(controller: &LifecycleController, cmd: RunCommand) -> Result<ExitCode> {
    let report = controller
        .run(RunRequest {
            workspace: resolve_workspace(&cmd.workspace)?,
            slot: cmd.slot,
            image: cmd.image,
            network: cmd.network,
            persistent: cmd.persistent,
            command: cmd.command,
        })
        .await?;

    forward_output(&report.output)?;
    match report.stop {
        Some(stop) if stop.torn_down => info!("removed session {}", report.name),
        Some(_) => info!("stopped {}, kept as persistent", report.name),
        None => info!("left shared container {} running", report.name),
    }
    Ok(exit_code(&report.output))
}

async fn handle_persist(
    ctx: &RuntimeContext,
    controller: &LifecycleController,
    cmd: PersistCommand,
) -> Result<ExitCode> {
    if cmd.all {
        if !ctx.confirm(cmd.force, "Persist all session containers")? {
            println!("Aborted");
            return Ok(ExitCode::FAILURE);
        }
        let report = controller.persist_all().await?;
        println!("Persisted {} container(s)", report.succeeded.len());
        return finish_batch(report, "persist");
    }

    let name = cmd
        .name
        .ok_or_else(|| anyhow!("no container specified (pass a name or --all)"))?;
    match controller.persist(&name).await? {
        PersistOutcome::Persisted => println!("Persisted {}", name),
        PersistOutcome::AlreadyPersistent => println!("Persisted {} (already persistent)", name),
    }
    Ok(ExitCode::SUCCESS)
}

async fn handle_shutdown(controller: &LifecycleController, cmd: ShutdownCommand) -> Result<ExitCode> {
    let timeout = cmd.timeout.map(Duration::from_secs);
    let report = controller.shutdown(&cmd.name, timeout).await?;
    let status = match report.outcome {
        ShutdownOutcome::Graceful => format!("Container {} stopped gracefully", cmd.name),
        ShutdownOutcome::Forced => format!(
            "Container {} did not stop within {}s, force-killed",
            cmd.name,
            timeout
                .unwrap_or(controller.config().shutdown_timeout)
                .as_secs()
        ),
        ShutdownOutcome::AlreadyStopped => format!("Container {} was already stopped", cmd.name),
        ShutdownOutcome::Absent => format!("Container {} no longer exists", cmd.name),
    };
    println!("{}{}", status, removal_suffix(&report));
    Ok(ExitCode::SUCCESS)
}

async fn handle_kill(
    ctx: &RuntimeContext,
    controller: &LifecycleController,
    cmd: KillCommand,
) -> Result<ExitCode> {
    if cmd.all {
        if !ctx.confirm(cmd.force, "Kill all session containers")? {
            println!("Aborted");
            return Ok(ExitCode::FAILURE);
        }
        let report = controller.kill_all().await?;
        println!("Killed {} container(s)", report.succeeded.len());
        return finish_batch(report, "kill");
    }

    let name = cmd
        .name
        .ok_or_else(|| anyhow!("no container specified (pass a name or --all)"))?;
    let report = controller.kill(&name).await?;
    let status = match report.outcome {
        KillOutcome::Killed => format!("Killed {}", name),
        KillOutcome::AlreadyStopped => format!("Container {} was already stopped", name),
        KillOutcome::Absent => format!("Container {} no longer exists", name),
    };
    println!("{}{}", status, removal_suffix(&report));
    Ok(ExitCode::SUCCESS)
}

async fn handle_list(ctx: &RuntimeContext, controller: &LifecycleController) -> Result<ExitCode> {
    let views = controller.list().await?;

    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&views).context("serializing sessions to JSON")?
        );
    } else if ctx.common.yaml {
        println!(
            "{}",
            serde_yaml::to_string(&views).context("serializing sessions to YAML")?
        );
    } else if views.is_empty() {
        println!("No sessions");
    } else {
        println!(
            "{:<32} {:<10} {:<10} {:<11} WORKSPACE",
            "NAME", "STATUS", "PERSISTENT", "NETWORK"
        );
        for view in views {
            let status = view
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "missing".to_string());
            println!(
                "{:<32} {:<10} {:<10} {:<11} {}",
                view.session.container_name,
                status,
                if view.session.persistent { "yes" } else { "no" },
                view.session.network_mode,
                view.session.workspace_path.display()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn handle_clean(controller: &LifecycleController) -> Result<ExitCode> {
    let removed = controller.clean().await?;
    for name in &removed {
        println!("Removed {}", name);
    }
    println!("Removed {} orphaned session record(s)", removed.len());
    Ok(ExitCode::SUCCESS)
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<ExitCode> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(ExitCode::SUCCESS);
    }

    config::write_default_config(&ctx.paths.config_file)?;
    println!("Wrote {}", ctx.paths.config_file.display());
    Ok(ExitCode::SUCCESS)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<ExitCode> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(ExitCode::SUCCESS);
            }
            config::write_default_config(&ctx.paths.config_file)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_completions(shell: Shell) -> Result<ExitCode> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(ExitCode::SUCCESS)
}

fn resolve_workspace(path: &Path) -> Result<PathBuf> {
    let expanded = match path.to_str() {
        Some(text) => config::expand_str_path(text)?,
        None => path.to_path_buf(),
    };
    fs::canonicalize(&expanded)
        .with_context(|| format!("resolving workspace {}", expanded.display()))
}

fn forward_output(output: &ExecOutput) -> Result<()> {
    io::stdout().write_all(output.stdout.as_bytes())?;
    io::stdout().flush()?;
    io::stderr().write_all(output.stderr.as_bytes())?;
    Ok(())
}

fn exit_code(output: &ExecOutput) -> ExitCode {
    ExitCode::from(exit_status(output.exit_code))
}

/// Statuses outside `0..=255` (e.g. signal deaths reported as -1) become 1.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

fn exit_flag(value: bool) -> ExitCode {
    if value {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn removal_suffix<O>(report: &StopReport<O>) -> &'static str {
    if report.torn_down {
        " and removed its session"
    } else {
        ""
    }
}

fn finish_batch(report: BatchReport, action: &str) -> Result<ExitCode> {
    if report.failed.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    for (name, err) in &report.failed {
        eprintln!("failed to {action} {name}: {err}");
    }
    bail!(
        "{} container(s) could not be {}",
        report.failed.len(),
        if action == "kill" { "killed" } else { "persisted" }
    )
}
