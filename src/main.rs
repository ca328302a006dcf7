mod agents;
mod analyzer;
mod breaker;
mod cli;
mod config;
mod git;
mod graph;
mod logs;
mod parallel_log;
mod pool;
mod prompt;
mod rate_limit;
mod rollback;
mod run_state;
mod scheduler;
mod sequential;
mod state;
mod tasks;

use anyhow::{Context, Result};
use clap::parser::ValueSource;
use clap::{CommandFactory, Parser};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cli::{Cli, Commands};
use config::Config;
use state::HermesDirs;
use tasks::{TaskStatus, TaskStore};

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<std::ffi::OsString> = std::env::args_os().collect();
    let cli = Cli::parse_from(argv.clone());
    let matches = Cli::command().get_matches_from(argv);

    match cli.command {
        Commands::Init(args) => {
            init_project(args).await?;
        }
        Commands::Run(mut args) => {
            let workdir = resolve_workdir(args.workdir.as_deref())?;
            let config = config::load_config(&workdir)?;
            if let Some(run_matches) = matches.subcommand_matches("run") {
                apply_run_config(&mut args, &config, run_matches);
            }
            let code = run(args, config, workdir).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Status(args) => {
            show_status(args).await?;
        }
        Commands::Reset(args) => {
            reset_breaker(args)?;
        }
        Commands::Logs(args) => {
            logs::show_logs(args).await?;
        }
    }

    Ok(())
}

fn resolve_workdir(workdir: Option<&Path>) -> Result<PathBuf> {
    workdir
        .unwrap_or_else(|| Path::new("."))
        .canonicalize()
        .context("Cannot resolve workdir — does it exist?")
}

/// Config values apply wherever the flag was not given on the command line.
fn apply_run_config(args: &mut cli::RunArgs, config: &Config, matches: &clap::ArgMatches) {
    let from_cli = |id: &str| matches.value_source(id) == Some(ValueSource::CommandLine);

    if !from_cli("auto_branch") {
        args.auto_branch = config.task_mode.auto_branch;
    }
    if !from_cli("auto_commit") {
        args.auto_commit = config.task_mode.auto_commit;
    }
    if !from_cli("autonomous") {
        args.autonomous = config.task_mode.autonomous;
    }
    if !from_cli("timeout") {
        args.timeout = config.ai.timeout;
    }
    if !from_cli("ai") {
        args.ai = config.ai.coding.clone();
    }
    if !from_cli("parallel") {
        args.parallel = config.parallel.enabled;
    }
    if !from_cli("workers") {
        args.workers = config.parallel.max_workers;
    }
}

fn dirs_for(workdir: &Path, config: &Config) -> HermesDirs {
    HermesDirs::with_layout(
        workdir,
        &config.paths.hermes_dir,
        &config.paths.tasks_dir,
        &config.paths.logs_dir,
        &config.paths.docs_dir,
    )
}

/// Install a SIGINT handler that flips the shared cancel flag; every
/// suspension point in the core honors it.
fn install_ctrl_c(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n🛑  SIGINT — finishing up and saving state…");
            cancel.store(true, Ordering::Relaxed);
        }
    });
}

// ── init ──────────────────────────────────────────────────────────────────────

async fn init_project(args: cli::InitArgs) -> Result<()> {
    let workdir = resolve_workdir(args.workdir.as_deref())?;
    let config = config::load_config(&workdir)?;
    let dirs = dirs_for(&workdir, &config);
    dirs.ensure()?;

    if !dirs.config_file.exists() {
        let default = serde_json::json!({
            "ai": { "planning": "claude", "coding": "claude" },
            "taskMode": { "autoBranch": true, "autoCommit": true, "autonomous": true },
            "parallel": { "enabled": false, "maxWorkers": 3 }
        });
        std::fs::write(
            &dirs.config_file,
            serde_json::to_string_pretty(&default).expect("static json"),
        )
        .with_context(|| format!("Failed to write {}", dirs.config_file.display()))?;
        println!("Created {}", dirs.config_file.display());
    }

    let injector = prompt::PromptInjector::new(&dirs.prompt_file, &dirs.backups_dir);
    injector.ensure_default()?;
    println!("Created {}", dirs.prompt_file.display());
    println!(
        "Hermes is ready. Put feature files under {} and run `hermes run`.",
        dirs.tasks_dir.display()
    );
    Ok(())
}

// ── run ───────────────────────────────────────────────────────────────────────

async fn run(args: cli::RunArgs, config: Config, workdir: PathBuf) -> Result<i32> {
    let dirs = dirs_for(&workdir, &config);
    dirs.ensure()?;

    // Dry run never touches the agent.
    if args.dry_run {
        return dry_run(&dirs, &args);
    }

    let cancel = Arc::new(AtomicBool::new(false));
    install_ctrl_c(cancel.clone());

    let agent: Arc<dyn agents::Agent> = Arc::from(agents::resolve_provider(&args.ai)?);
    if !agent.is_available() {
        anyhow::bail!(
            "Agent '{}' not found on PATH. Install it and try again.",
            agent.name()
        );
    }

    println!("🚀  Hermes — starting agent loop");
    println!("    Workdir:   {}", workdir.display());
    println!("    Agent:     {}", agent.name());
    println!("    Mode:      {}", if args.parallel { "parallel" } else { "sequential" });
    println!("    Timeout:   {}s per task", args.timeout);

    if args.parallel {
        run_parallel(&dirs, &args, &config, agent, cancel).await
    } else {
        let opts = sequential::LoopOptions {
            agent,
            auto_branch: args.auto_branch,
            auto_commit: args.auto_commit,
            autonomous: args.autonomous,
            task_timeout: Duration::from_secs(args.timeout),
            error_delay: Duration::from_secs(config.loop_cfg.error_delay),
            max_consecutive_errors: config.task_mode.max_consecutive_errors,
            max_calls_per_hour: config.loop_cfg.max_calls_per_hour,
            run_deadline: match config.loop_cfg.timeout_minutes {
                0 => None,
                minutes => Some(Duration::from_secs(minutes * 60)),
            },
            breaker_config: breaker::BreakerConfig::default(),
            stream_output: config.ai.stream_output,
            cancel,
        };
        let outcome = sequential::run_loop(&dirs, &opts).await?;
        Ok(outcome.exit_code())
    }
}

fn dry_run(dirs: &HermesDirs, args: &cli::RunArgs) -> Result<i32> {
    let store = TaskStore::load(&dirs.tasks_dir)?;
    if !store.has_tasks() {
        println!("📭  No task files in {}.", dirs.tasks_dir.display());
        return Ok(1);
    }

    let tasks: Vec<tasks::Task> = store.all_tasks().into_iter().cloned().collect();
    let plan = scheduler::execution_plan(&tasks)?;

    println!("📋  Execution plan: {} tasks in {} batches", plan.total_tasks, plan.batches.len());
    for (i, batch) in plan.batches.iter().enumerate() {
        let ids: Vec<String> = batch.iter().map(|id| id.to_string()).collect();
        println!("    batch {}: {}", i + 1, ids.join(", "));
    }
    println!(
        "    estimated wall-clock with {} worker(s): {}",
        args.workers,
        scheduler::estimate_parallel_time(&plan, args.workers, Duration::from_secs(args.timeout))
    );

    if args.debug {
        let graph = graph::DependencyGraph::new(tasks.iter())?;
        let order: Vec<String> = graph
            .topological_sort()?
            .iter()
            .map(|id| id.to_string())
            .collect();
        println!("    topological order: {}", order.join(" → "));
    }
    Ok(0)
}

async fn run_parallel(
    dirs: &HermesDirs,
    args: &cli::RunArgs,
    config: &Config,
    agent: Arc<dyn agents::Agent>,
    cancel: Arc<AtomicBool>,
) -> Result<i32> {
    let mut store = TaskStore::load(&dirs.tasks_dir)?;
    if !store.has_tasks() {
        println!("📭  No task files in {}.", dirs.tasks_dir.display());
        return Ok(1);
    }

    state::acquire_lock(dirs, &state::RunLock::starting("parallel"))?;
    let _lock_guard = state::RunLockGuard::new(dirs);

    let git = git::GitManager::new(&dirs.workdir);
    let is_repo = git.is_repository().await;
    let mut use_isolation = config.parallel.isolated_workspaces;
    if use_isolation && !is_repo {
        eprintln!("⚠️   Not a git repository — isolated workspaces disabled.");
        use_isolation = false;
    }

    let mut rollback_plan = if is_repo {
        Some(rollback::RollbackPlan::capture(&git).await?)
    } else {
        None
    };

    let logger = Arc::new(parallel_log::ParallelLogger::new(&dirs.parallel_logs_dir)?);
    let monitor_limits = rate_limit::ResourceLimits {
        max_calls_per_min: None,
        max_cost_per_hour: (config.parallel.max_cost_per_hour > 0.0)
            .then_some(config.parallel.max_cost_per_hour),
        max_rss_bytes: None,
    };
    let env = scheduler::SchedulerEnv {
        agent,
        workdir: dirs.workdir.clone(),
        worktrees_dir: dirs.worktrees_dir.clone(),
        prompt_file: dirs.prompt_file.clone(),
        logger,
        limiter: Some(Arc::new(rate_limit::RateLimiter::new(
            config.loop_cfg.max_calls_per_hour,
        ))),
        monitor: Some(Arc::new(rate_limit::ResourceMonitor::new(monitor_limits))),
        cancel,
    };

    let sched = scheduler::Scheduler::new(scheduler::SchedulerConfig {
        max_workers: args.workers,
        failure_strategy: config.parallel.failure_strategy.parse()?,
        use_isolation,
        task_timeout: Duration::from_secs(args.timeout),
        retry: agents::RetryPolicy {
            max_retries: config.ai.max_retries,
            delay: Duration::from_secs(config.loop_cfg.error_delay),
        },
    });

    let report = sched.execute(&mut store, &env).await;

    // Cleanup always runs, success or not.
    if let Some(ref mut plan) = rollback_plan {
        if let Ok(ref report) = report {
            for record in &report.task_branches {
                plan.record_branch(record.task_id, &record.branch);
            }
        }
        plan.cleanup(&git, &dirs.worktrees_dir).await;
    }
    let report = report?;

    println!(
        "\n📋  Parallel run: {} ok, {} failed, {} skipped in {}s",
        report.successful,
        report.failed,
        report.skipped.len(),
        report.total_time.as_secs()
    );
    for result in &report.results {
        let icon = if result.success { "✅" } else { "❌" };
        println!(
            "    {icon} {} {} ({}s, worker {})",
            result.task_id,
            result.task_name,
            result.duration.as_secs(),
            result.worker_id
        );
    }
    if let Some(reason) = &report.halted {
        println!("    halted: {reason}");
    }
    for id in &report.skipped {
        println!("    skipped {id} (dependency failed)");
    }
    if let Some(ref monitor) = env.monitor {
        if config.parallel.max_cost_per_hour > 0.0 {
            println!(
                "    cost: ${:.2} this hour (${:.2} total), {} call(s) in the last minute",
                monitor.hourly_cost(),
                monitor.total_cost(),
                monitor.recent_minute_calls()
            );
        }
    }

    if report.failed > 0 {
        if let Some(plan) = rollback_plan {
            if !plan.recorded_branches().is_empty()
                && !args.autonomous
                && confirm("Roll back partial work to the pre-run snapshot?").await
            {
                plan.rollback(&git, &dirs.worktrees_dir).await?;
                println!("↩️   Rolled back to {}", plan.initial_commit);
            } else if !plan.recorded_branches().is_empty() {
                println!(
                    "    Task branches kept for inspection: {}",
                    plan.recorded_branches().join(", ")
                );
            }
        }
        return Ok(1);
    }
    Ok(0)
}

/// Ask the operator a yes/no question; defaults to no.
async fn confirm(question: &str) -> bool {
    use tokio::io::AsyncBufReadExt as _;
    println!("{question} [y/N]");
    let mut line = String::new();
    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
    match reader.read_line(&mut line).await {
        Ok(_) => matches!(line.trim(), "y" | "Y" | "yes"),
        Err(_) => false,
    }
}

// ── status ────────────────────────────────────────────────────────────────────

async fn show_status(args: cli::StatusArgs) -> Result<()> {
    let workdir = resolve_workdir(args.workdir.as_deref())?;
    let config = config::load_config(&workdir)?;
    let dirs = dirs_for(&workdir, &config);

    let store = TaskStore::load(&dirs.tasks_dir)?;
    if !store.has_tasks() {
        println!("📭  No task plan in {}", dirs.tasks_dir.display());
    } else {
        let progress = store.progress();
        println!(
            "📊  {} tasks — {:.0}% complete",
            progress.total, progress.percent_complete
        );
        println!("    ✅ completed   : {}", progress.completed);
        println!("    🔄 in progress : {}", progress.in_progress);
        println!("    ⏳ not started : {}", progress.not_started);
        println!("    🚧 blocked     : {}", progress.blocked);
        println!();
        for feature in store.all_features() {
            let tasks = store.tasks_by_feature(feature.id);
            let done = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .count();
            let priority = feature
                .priority
                .map(|p| format!(" [{p}]"))
                .unwrap_or_default();
            let duration = feature
                .estimated_duration
                .as_ref()
                .map(|d| format!(" (~{d})"))
                .unwrap_or_default();
            println!(
                "    {} {}{} — {}/{} tasks{}",
                feature.id,
                feature.name,
                priority,
                done,
                tasks.len(),
                duration
            );
        }

        let blocked = store.tasks_by_status(TaskStatus::Blocked);
        if !blocked.is_empty() {
            println!();
            for task in blocked {
                println!("    🚧 {} {} is blocked", task.id, task.name);
            }
        }

        let (next_feature, next_task) = store.next_ids();
        println!("\n    next free ids: {next_feature} / {next_task}");
    }

    let cb = breaker::CircuitBreaker::load(
        &dirs.breaker_state_file,
        &dirs.breaker_history_file,
        breaker::BreakerConfig::default(),
    )?;
    println!("\n🔌  Circuit breaker: {}", cb.state());
    if cb.state() != breaker::CircuitState::Closed {
        println!(
            "    {} loop(s) without progress — `hermes reset` rearms it",
            cb.consecutive_no_progress()
        );
    }
    if cb.consecutive_same_error() > 0 {
        println!("    {} consecutive error loop(s)", cb.consecutive_same_error());
    }

    match state::read_lock(&dirs)? {
        Some(lock) => {
            let alive = state::is_pid_alive(lock.pid);
            let icon = if alive { "🟢" } else { "💀" };
            let elapsed = chrono::Utc::now()
                .signed_duration_since(lock.started_at)
                .num_seconds()
                .max(0);
            println!("\n{icon}  Run ({}) PID {}", lock.mode, lock.pid);
            println!("    Task:     {}", lock.current_task);
            println!("    Progress: {}", lock.progress);
            println!("    Running:  {}m {}s", elapsed / 60, elapsed % 60);
            if !alive {
                println!("    (process appears dead — stale lock)");
            }
        }
        None => println!("\n💤  No hermes run active."),
    }
    Ok(())
}

// ── reset ─────────────────────────────────────────────────────────────────────

fn reset_breaker(args: cli::ResetArgs) -> Result<()> {
    let workdir = resolve_workdir(args.workdir.as_deref())?;
    let config = config::load_config(&workdir)?;
    let dirs = dirs_for(&workdir, &config);

    let mut cb = breaker::CircuitBreaker::load(
        &dirs.breaker_state_file,
        &dirs.breaker_history_file,
        breaker::BreakerConfig::default(),
    )?;
    let was = cb.state();
    cb.reset(&args.reason)?;
    println!("🔁  Circuit breaker: {was} → {}", cb.state());
    Ok(())
}
