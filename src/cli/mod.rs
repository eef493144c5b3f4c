#![forbid(unsafe_code)]

use std::process::ExitCode;
use std::time::Duration;

use clap::{CommandFactory as _, Parser, Subcommand};

use crate::error::NightshiftError;
use crate::executor::{self, ExecutorConfig};
use crate::notify::render_terminal;
use crate::ops::{NightShift, SubmitOptions};
use crate::output::table::Table;
use crate::task::model::TaskStatus;

#[derive(Debug, Parser)]
#[command(
    name = "nightshift",
    version,
    about = "Staged-approval orchestrator for headless AI research tasks"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Submit a task description and plan it
    Submit(SubmitArgs),
    /// Plan or re-plan a staged task
    #[command(alias = "revise")]
    Plan(PlanArgs),
    /// Approve a staged task for execution
    Approve(ApproveArgs),
    /// Cancel a task that has not started
    Cancel(TaskIdArg),
    /// Suspend a running task
    Pause(TaskIdArg),
    /// Resume a paused task
    Resume(TaskIdArg),
    /// Kill a running or paused task
    Kill(TaskIdArg),
    /// List tasks
    List(ListArgs),
    /// Show one task with logs and summary
    Get(GetArgs),
    /// Delete every task and log entry
    Clear(ClearArgs),
    /// Executor control
    Executor(ExecutorArgs),
    Completion(CompletionArgs),
}

#[derive(Debug, Parser)]
pub struct SubmitArgs {
    /// Task description
    pub description: String,
    /// Execution timeout in seconds
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,
    /// Create the task without invoking the planner
    #[arg(long = "no-plan")]
    pub no_plan: bool,
}

#[derive(Debug, Parser)]
pub struct PlanArgs {
    pub task_id: String,
    /// Revision feedback; re-plans from scratch when omitted
    #[arg(short = 'f', long = "feedback")]
    pub feedback: Option<String>,
}

#[derive(Debug, Parser)]
pub struct ApproveArgs {
    pub task_id: String,
    /// Do not drain the queue even when no executor is running
    #[arg(long = "no-run")]
    pub no_run: bool,
}

#[derive(Debug, Parser)]
pub struct TaskIdArg {
    pub task_id: String,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Filter by status (staged, committed, running, paused, completed,
    /// failed, cancelled)
    #[arg(short = 's', long = "status")]
    pub status: Option<String>,
    #[arg(long = "json")]
    pub json: bool,
    #[arg(long = "csv")]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct GetArgs {
    pub task_id: String,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ClearArgs {
    /// Confirm deletion
    #[arg(long = "yes")]
    pub yes: bool,
}

#[derive(Debug, Parser)]
pub struct ExecutorArgs {
    #[command(subcommand)]
    pub cmd: ExecutorCmd,
}

#[derive(Debug, Subcommand)]
pub enum ExecutorCmd {
    /// Run the executor in the foreground
    Start(ExecutorStartArgs),
    /// Stop a running executor
    Stop(ExecutorStopArgs),
    /// Report executor and queue state
    Status(ExecutorStatusArgs),
}

#[derive(Debug, Parser)]
pub struct ExecutorStartArgs {
    #[arg(long = "workers", default_value_t = 0)]
    pub workers: usize,
    /// Poll interval in seconds
    #[arg(long = "poll-interval", default_value_t = 0.0)]
    pub poll_interval: f64,
    /// Exit once the queue is idle instead of polling forever
    #[arg(long = "drain")]
    pub drain: bool,
}

#[derive(Debug, Parser)]
pub struct ExecutorStopArgs {
    /// Seconds to wait for a graceful stop
    #[arg(long = "timeout", default_value_t = 30)]
    pub timeout: u64,
}

#[derive(Debug, Parser)]
pub struct ExecutorStatusArgs {
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct CompletionArgs {
    pub shell: clap_complete::Shell,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    if let Commands::Completion(args) = &cli.cmd {
        let mut cmd = Cli::command();
        clap_complete::generate(args.shell, &mut cmd, "nightshift", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let ns = NightShift::init(None)?;
    let _log_guard = crate::logging::init(&ns.paths.logs_dir(), false)?;

    match cli.cmd {
        Commands::Completion(_) => unreachable!("handled above"),
        Commands::Submit(args) => {
            let task = ns.submit(
                &args.description,
                SubmitOptions {
                    timeout_seconds: args.timeout,
                },
            )?;
            println!("{} staged", task.task_id);
            if !args.no_plan {
                let plan = ns.plan(&task.task_id, None).await?;
                println!("plan: tools [{}]", plan.allowed_tools.join(", "));
                println!("      dirs  [{}]", plan.allowed_directories.join(", "));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plan(args) => {
            let plan = ns.plan(&args.task_id, args.feedback.as_deref()).await?;
            println!("plan: tools [{}]", plan.allowed_tools.join(", "));
            println!("      dirs  [{}]", plan.allowed_directories.join(", "));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Approve(args) => {
            ns.approve(&args.task_id)?;
            println!("{} committed", args.task_id);
            if !args.no_run && ns.settings.auto_start {
                let running = executor::load_lock(&ns.paths)?
                    .map(|l| crate::agent::process::pid_alive(l.pid))
                    .unwrap_or(false);
                if !running {
                    let work_dir = std::env::current_dir()?;
                    ns.executor(work_dir)
                        .drain(ExecutorConfig::from_settings(&ns.settings))
                        .await?;
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cancel(args) => {
            ns.cancel(&args.task_id)?;
            println!("{} cancelled", args.task_id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Pause(args) => {
            ns.pause(&args.task_id)?;
            println!("{} pause signalled", args.task_id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Resume(args) => {
            ns.resume(&args.task_id)?;
            println!("{} resume signalled", args.task_id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Kill(args) => {
            ns.kill(&args.task_id)?;
            println!("{} kill signalled", args.task_id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::List(args) => {
            let status = match args.status.as_deref() {
                None | Some("") => None,
                Some(s) => Some(TaskStatus::parse(s).ok_or_else(|| {
                    NightshiftError::Config(format!("unknown status filter '{s}'"))
                })?),
            };
            let tasks = ns.list(status)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
                return Ok(ExitCode::SUCCESS);
            }
            let mut table = Table::new(["ID", "STATUS", "CREATED", "DESCRIPTION"]);
            for task in &tasks {
                let mut desc = task.description.clone();
                if desc.chars().count() > 60 {
                    desc = desc.chars().take(59).collect::<String>() + "…";
                }
                table.row([
                    task.task_id.clone(),
                    task.status.as_str().to_owned(),
                    task.created_at.clone(),
                    desc,
                ]);
            }
            if args.csv {
                table.write_csv()?;
            } else {
                table.print()?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Get(args) => {
            let details = ns.get(&args.task_id)?;
            if args.json {
                let payload = serde_json::json!({
                    "task": details.task,
                    "logs": details.logs,
                    "summary": details.summary,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
                return Ok(ExitCode::SUCCESS);
            }
            let task = &details.task;
            println!("{} [{}]", task.task_id, task.status);
            println!("  {}", task.description);
            if !task.allowed_tools.is_empty() {
                println!("  tools: {}", task.allowed_tools.join(", "));
            }
            if !task.allowed_directories.is_empty() {
                println!("  dirs:  {}", task.allowed_directories.join(", "));
            }
            if let Some(err) = &task.error_message {
                println!("  error: {err}");
            }
            for log in &details.logs {
                println!("  {} [{}] {}", log.timestamp, log.level, log.message);
            }
            if let Some(summary) = &details.summary {
                println!("{}", render_terminal(summary));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Clear(args) => {
            if !args.yes {
                anyhow::bail!("refusing to clear without --yes");
            }
            ns.clear()?;
            println!("all tasks cleared");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Executor(args) => match args.cmd {
            ExecutorCmd::Start(start) => {
                let mut cfg = ExecutorConfig::from_settings(&ns.settings);
                if start.workers > 0 {
                    cfg.max_workers = start.workers;
                }
                if start.poll_interval > 0.0 {
                    cfg.poll_interval = Duration::from_secs_f64(start.poll_interval);
                }
                cfg.wait = !start.drain;
                let work_dir = std::env::current_dir()?;
                ns.executor(work_dir).run(cfg).await?;
                Ok(ExitCode::SUCCESS)
            }
            ExecutorCmd::Stop(stop) => {
                let stopped = ns
                    .executor_stop(Duration::from_secs(stop.timeout))
                    .await?;
                if stopped {
                    println!("executor stopped");
                    Ok(ExitCode::SUCCESS)
                } else {
                    eprintln!("executor did not stop (not running, or timeout elapsed)");
                    Ok(ExitCode::from(1))
                }
            }
            ExecutorCmd::Status(status_args) => {
                let report = executor::status(&ns.paths, &ns.store)?;
                if status_args.json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    println!("running: {}", report.running);
                    if let Some(pid) = report.pid {
                        println!("pid:     {pid}");
                    }
                    println!("workers: {}", report.worker_count);
                    if !report.active_tasks.is_empty() {
                        println!("active:  {}", report.active_tasks.join(", "));
                    }
                    for (status, count) in &report.counts {
                        if *count > 0 {
                            println!("  {status}: {count}");
                        }
                    }
                }
                Ok(ExitCode::SUCCESS)
            }
        },
    }
}
