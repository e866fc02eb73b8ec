//! Plan runner with self-healing retries.
//!
//! Executes a JSON plan of file and command steps in a working directory.
//! Failed steps are classified; environment failures stop immediately while
//! logic failures are sent to the fixer service for a corrected step.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use stepwise::core::classifier::{classify, matched_pattern};
use stepwise::core::types::{ErrorClass, PlanSummary};
use stepwise::executor::{ExecutorSettings, PlanExecutor, ProgressEvent, ProgressSink};
use stepwise::exit_codes;
use stepwise::heal::SelfHealer;
use stepwise::io::config::{
    AgentConfig, TerminalKind, default_config_path, load_config, write_config,
};
use stepwise::io::confirm::{AutoConfirm, Confirmer, TerminalConfirm};
use stepwise::io::detached::{
    self, DetachedProcessManager, LaunchResult, ProcessControl, ProcessHandle,
};
use stepwise::io::files::LocalFiles;
use stepwise::io::fixer::HttpFixer;
use stepwise::io::monitor::{MonitorHandle, OutputMonitor};
use stepwise::io::registry::{
    ProcessRegistry, SweepOnDrop, discard_files, install_shutdown_hooks,
};
use stepwise::io::run_log::{RunReport, write_report};
use stepwise::io::shell::SystemShell;
use stepwise::logging;
use stepwise::plan::load_plan;
use tracing::debug;

#[derive(Parser)]
#[command(
    name = "stepwise",
    version,
    about = "Run file and command plans with self-healing retries"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a JSON plan.
    Run(RunArgs),
    /// Start a long-running command in its own terminal session.
    Launch(LaunchArgs),
    /// Stop a detached command started by `launch` or `run`.
    Stop {
        /// Pid file printed at launch.
        pid_file: PathBuf,
        /// Config file (defaults to `.stepwise/config.toml` in the current dir).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Keep the output log and pid file.
        #[arg(long)]
        keep_files: bool,
    },
    /// Print whether an error message would be retried.
    Classify { message: String },
    /// Write a config file with default values.
    InitConfig {
        /// Config path (defaults to `.stepwise/config.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Plan file: an array of steps or `{explanation, plan}`.
    plan: PathBuf,
    /// Directory the plan runs in.
    #[arg(long, default_value = ".")]
    workdir: PathBuf,
    /// Config file (defaults to `<workdir>/.stepwise/config.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Retries per step after the first attempt.
    #[arg(long)]
    max_retries: Option<u32>,
    /// Never ask the fixer for repairs.
    #[arg(long)]
    no_auto_retry: bool,
    /// Approve every command and continue after failures without asking.
    #[arg(short, long)]
    yes: bool,
    /// Run detached commands without opening terminal windows.
    #[arg(long)]
    headless: bool,
    /// Exit once the plan finishes instead of following detached output.
    #[arg(long)]
    no_follow: bool,
    /// Write a JSON execution report here.
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args)]
struct LaunchArgs {
    command: String,
    #[arg(long, default_value = ".")]
    cwd: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    headless: bool,
    /// Follow output and wait up to SECS for the command to finish.
    #[arg(long, value_name = "SECS")]
    wait: Option<u64>,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::Launch(args) => cmd_launch(args),
        Command::Stop {
            pid_file,
            config,
            keep_files,
        } => cmd_stop(&pid_file, config.as_deref(), keep_files),
        Command::Classify { message } => cmd_classify(&message),
        Command::InitConfig { config, force } => cmd_init_config(config, force),
    }
}

fn load_agent_config(explicit: Option<&Path>, workdir: &Path) -> Result<AgentConfig> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_config_path(workdir));
    load_config(&path).with_context(|| format!("load config {}", path.display()))
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let workdir = args
        .workdir
        .canonicalize()
        .with_context(|| format!("resolve workdir {}", args.workdir.display()))?;
    let mut config = load_agent_config(args.config.as_deref(), &workdir)?;
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if args.no_auto_retry {
        config.auto_retry = false;
    }
    if args.headless {
        config.process.terminal = TerminalKind::Headless;
    }
    config.validate()?;

    let plan = load_plan(&args.plan)?;
    if let Some(explanation) = plan.explanation.as_deref() {
        println!("{explanation}\n");
    }

    let control = ProcessControl::from_config(&config.process);
    let registry = ProcessRegistry::new(control);
    install_shutdown_hooks(&registry)?;
    let _sweep = (!args.no_follow).then(|| SweepOnDrop(registry.clone()));

    let fixer = HttpFixer::new(
        &config.fixer.url,
        Duration::from_secs(config.fixer.timeout_secs),
    )?;
    let confirmer: Box<dyn Confirmer> = if args.yes {
        Box::new(AutoConfirm::yes())
    } else {
        Box::new(TerminalConfirm)
    };
    let executor = PlanExecutor::new(
        LocalFiles::new(&workdir),
        SystemShell,
        SelfHealer::new(fixer, &workdir, &config),
        confirmer,
        ExecutorSettings::from_config(&config, &workdir)?,
    )
    .with_detached(DetachedProcessManager::new(&config.process), registry.clone())
    .with_progress(Box::new(TerminalProgress));

    let started_at = Local::now();
    let summary = executor.execute_plan(Some(&plan.plan));
    let finished_at = Local::now();
    print_summary(&summary);

    if let Some(report_path) = args.report.as_deref() {
        write_report(
            report_path,
            &RunReport {
                plan: args.plan.clone(),
                workdir: workdir.clone(),
                started_at,
                finished_at,
                summary: &summary,
                detached: registry.handles(),
            },
        )?;
    }

    if args.no_follow {
        for handle in registry.running() {
            println!(
                "still running: pid {} ({}), stop with `stepwise stop {}`",
                handle.pid,
                handle.command,
                handle.pid_file.display()
            );
        }
    } else {
        follow_detached(&registry, control)?;
    }

    Ok(if summary.stopped_early {
        exit_codes::STOPPED
    } else if summary.is_success() {
        exit_codes::OK
    } else {
        exit_codes::PLAN_FAILED
    })
}

fn print_summary(summary: &PlanSummary) {
    println!();
    println!(
        "Completed {}/{} steps ({} failed, {} pending)",
        summary.completed,
        summary.total,
        summary.failed(),
        summary.pending
    );
}

/// Stream output of still-running detached processes until each finishes.
fn follow_detached(registry: &ProcessRegistry, control: ProcessControl) -> Result<()> {
    let running = registry.running();
    if running.is_empty() {
        return Ok(());
    }
    println!(
        "\n{} detached process(es) running; press Ctrl-C to stop",
        running.len()
    );
    let mut monitors = running
        .iter()
        .map(|handle| watch_output(handle, control))
        .collect::<Result<Vec<_>>>()?;
    for handle in &running {
        let completion = control.wait_for_completion(handle, None)?;
        registry.unregister(handle.pid);
        match completion.code {
            Some(code) => println!("{} exited with code {code}", handle.command),
            None => println!("{} stopped", handle.command),
        }
        discard_files(handle);
    }
    for monitor in &mut monitors {
        monitor.close();
    }
    Ok(())
}

fn watch_output(handle: &ProcessHandle, control: ProcessControl) -> Result<MonitorHandle> {
    let mut broken = false;
    OutputMonitor::watch(&handle.output_log, control.poll_interval, move |chunk| {
        echo_chunk(&mut std::io::stdout().lock(), chunk, &mut broken);
    })
}

/// Copy a chunk of process output to `out`. After the first write error
/// (usually a closed pipe) further chunks are dropped.
fn echo_chunk(out: &mut impl Write, chunk: &[u8], broken: &mut bool) {
    if *broken {
        return;
    }
    if let Err(err) = out.write_all(chunk).and_then(|()| out.flush()) {
        debug!(err = %err, "no longer echoing detached output");
        *broken = true;
    }
}

fn cmd_launch(args: LaunchArgs) -> Result<i32> {
    let cwd = args
        .cwd
        .canonicalize()
        .with_context(|| format!("resolve cwd {}", args.cwd.display()))?;
    let mut config = load_agent_config(args.config.as_deref(), &cwd)?;
    if args.headless {
        config.process.terminal = TerminalKind::Headless;
    }
    config.validate()?;

    let manager = DetachedProcessManager::new(&config.process);
    let handle = match manager.launch(&args.command, &cwd) {
        LaunchResult::Launched(handle) => handle,
        LaunchResult::Failed { error } => bail!("launch failed: {error}"),
    };
    println!("pid: {}", handle.pid);
    println!("output: {}", handle.output_log.display());
    println!("pid file: {}", handle.pid_file.display());

    let Some(wait_secs) = args.wait else {
        return Ok(exit_codes::OK);
    };
    let control = manager.control();
    let registry = ProcessRegistry::new(control);
    registry.register(handle.clone());
    install_shutdown_hooks(&registry)?;
    let _sweep = SweepOnDrop(registry.clone());

    let mut monitor = watch_output(&handle, control)?;
    let completion = control.wait_for_completion(&handle, Some(Duration::from_secs(wait_secs)));
    monitor.close();
    let completion = completion?;
    registry.unregister(handle.pid);
    Ok(if completion.success {
        exit_codes::OK
    } else {
        exit_codes::PROCESS_FAILED
    })
}

fn cmd_stop(pid_file: &Path, config: Option<&Path>, keep_files: bool) -> Result<i32> {
    let handle = ProcessHandle::from_pid_file(pid_file)?;
    let cwd = std::env::current_dir().context("read current dir")?;
    let config = load_agent_config(config, &cwd)?;
    config.validate()?;
    let control = ProcessControl::from_config(&config.process);
    if control.stop(&handle) {
        println!("stopped pid {}", handle.pid);
    } else {
        println!("pid {} is not running", handle.pid);
    }
    if !keep_files {
        detached::cleanup(&handle)?;
    }
    Ok(exit_codes::OK)
}

fn cmd_classify(message: &str) -> Result<i32> {
    match classify(message) {
        ErrorClass::Retryable => println!("retryable"),
        ErrorClass::NonRetryable => {
            let pattern = matched_pattern(message).unwrap_or("unknown");
            println!("non-retryable ({pattern})");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_init_config(config: Option<PathBuf>, force: bool) -> Result<i32> {
    let path = match config {
        Some(path) => path,
        None => default_config_path(&std::env::current_dir().context("read current dir")?),
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(&path, &AgentConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

/// Prints step progress to stdout.
struct TerminalProgress;

impl ProgressSink for TerminalProgress {
    fn report(&self, event: ProgressEvent<'_>) {
        match event {
            ProgressEvent::StepStarted {
                index,
                total,
                description,
            } => println!("[{index}/{total}] {description}"),
            ProgressEvent::Output { text, .. } => {
                for line in text.lines() {
                    println!("    {line}");
                }
            }
            ProgressEvent::AttemptFailed {
                attempt,
                class,
                error,
                ..
            } => {
                let kind = match class {
                    ErrorClass::Retryable => "retryable",
                    ErrorClass::NonRetryable => "non-retryable",
                };
                println!("  attempt {} failed ({kind}): {error}", attempt + 1);
            }
            ProgressEvent::Healed {
                explanation, step, ..
            } => {
                if let Some(explanation) = explanation {
                    println!("  fix: {explanation}");
                }
                println!("  retrying as: {}", step.describe());
            }
            ProgressEvent::HealFailed { reason, .. } => println!("  self-heal failed: {reason}"),
            ProgressEvent::Detached { handle, .. } => println!(
                "  running in background (pid {}), output in {}",
                handle.pid,
                handle.output_log.display()
            ),
            ProgressEvent::StepFinished { record } => println!("{}", record.log_line()),
        }
    }
}
