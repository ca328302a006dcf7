use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::agents::{self, Agent, AgentEvent, ExecOptions};
use crate::analyzer::{analyze, AnalyzeContext, ExitReason, ExitSignalWindow};
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::git::GitManager;
use crate::prompt::PromptInjector;
use crate::rate_limit::RateLimiter;
use crate::run_state::{self, RunState, RunStatus};
use crate::state::{self, HermesDirs, RunLock, RunLockGuard};
use crate::tasks::{TaskId, TaskStatus, TaskStore};

// ── Options & outcome ─────────────────────────────────────────────────────────

pub struct LoopOptions {
    pub agent: Arc<dyn Agent>,
    pub auto_branch: bool,
    pub auto_commit: bool,
    /// When false, the loop waits for operator input after each completed
    /// task before moving on.
    pub autonomous: bool,
    pub task_timeout: Duration,
    pub error_delay: Duration,
    pub max_consecutive_errors: u32,
    pub max_calls_per_hour: u32,
    /// Whole-run wall-clock ceiling; the loop halts cleanly at the next
    /// iteration boundary once it elapses. `None` = unlimited.
    pub run_deadline: Option<Duration>,
    pub breaker_config: BreakerConfig,
    pub stream_output: bool,
    pub cancel: Arc<AtomicBool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Every task in the plan is COMPLETED.
    PlanComplete,
    /// The exit-signal window asked for a graceful stop.
    GracefulExit(ExitReason),
    /// The circuit breaker is OPEN; `hermes reset` rearms it.
    BreakerOpen,
    /// The tasks directory holds no plan.
    NoTasks,
    /// Pending tasks remain but none is actionable (blocked dependencies).
    NoActionableTasks,
    /// Too many consecutive agent errors.
    ErrorsExhausted,
    /// The run deadline elapsed.
    TimedOut,
    Cancelled,
}

impl LoopOutcome {
    /// Exit code the CLI maps this outcome to.
    pub fn exit_code(&self) -> i32 {
        match self {
            LoopOutcome::PlanComplete | LoopOutcome::GracefulExit(_) | LoopOutcome::Cancelled => 0,
            _ => 1,
        }
    }
}

// ── The loop ──────────────────────────────────────────────────────────────────

/// Single-worker execution: inject the next ready task into the prompt, drive
/// the agent, analyze the response, adjust the circuit breaker, and commit
/// completed work. Resumes from `run-state.md` after an interruption.
pub async fn run_loop(dirs: &HermesDirs, opts: &LoopOptions) -> Result<LoopOutcome> {
    dirs.ensure()?;
    let mut store = TaskStore::load(&dirs.tasks_dir)?;
    if !store.has_tasks() {
        println!(
            "📭  No task files in {}. Generate a plan first (e.g. `hermes prd <file>`).",
            dirs.tasks_dir.display()
        );
        return Ok(LoopOutcome::NoTasks);
    }

    let mut run_lock = RunLock::starting("sequential");
    state::acquire_lock(dirs, &run_lock)?;
    let _lock_guard = RunLockGuard::new(dirs);

    let git = GitManager::new(&dirs.workdir);
    let injector = PromptInjector::new(&dirs.prompt_file, &dirs.backups_dir);
    injector.ensure_default()?;
    if let Err(e) = injector.backup() {
        eprintln!("⚠️   Prompt backup failed: {e:#}");
    }
    let limiter = RateLimiter::new(opts.max_calls_per_hour);
    let mut breaker = CircuitBreaker::load(
        &dirs.breaker_state_file,
        &dirs.breaker_history_file,
        opts.breaker_config,
    )?;
    let mut exit_window = ExitSignalWindow::default();
    let is_repo = git.is_repository().await;

    // Resume from the checkpoint when the previous run was interrupted; a
    // leftover prompt block is the fallback witness of the interrupted task.
    let mut active_task: Option<TaskId> = run_state::resume_task(&dirs.run_state_file)
        .or_else(|| injector.current_task_id().ok().flatten())
        .filter(|id| {
            store
                .task_by_id(*id)
                .is_some_and(|t| t.status != TaskStatus::Completed)
        });
    if let Some(id) = active_task {
        println!("🔁  Resuming from {id} (run-state.md)");
        dirs.log_line(&format!("resuming from {id}"))?;
    }

    let started = Instant::now();
    let mut loop_number: u32 = 0;
    let mut consecutive_errors: u32 = 0;
    let mut prev_output_length: usize = 0;
    let mut current_branch: Option<String> = None;

    loop {
        if opts.cancel.load(Ordering::Relaxed) {
            println!("\n🛑  Cancellation requested — state saved, stopping.");
            return Ok(LoopOutcome::Cancelled);
        }
        if let Some(deadline) = opts.run_deadline {
            if started.elapsed() >= deadline {
                println!(
                    "\n⏱️   Run deadline of {}m reached. Stopping cleanly.",
                    deadline.as_secs() / 60
                );
                return Ok(LoopOutcome::TimedOut);
            }
        }
        loop_number += 1;

        if breaker.should_halt() {
            println!(
                "\n⛔  Circuit breaker is OPEN (no progress across several loops). \
                 Run `hermes reset` to resume."
            );
            return Ok(LoopOutcome::BreakerOpen);
        }

        // Pick (or keep) the task being worked.
        let task = match active_task.and_then(|id| store.task_by_id(id)) {
            Some(task) => task.clone(),
            None => match store.next_task() {
                Some(task) => task.clone(),
                None => {
                    let progress = store.progress();
                    if progress.completed == progress.total {
                        println!("\n✅  All {} tasks complete.", progress.total);
                        run_state::write_run_state(&dirs.run_state_file, &RunState::completed())?;
                        return Ok(LoopOutcome::PlanComplete);
                    }
                    println!(
                        "\n⚠️   No actionable task remains ({} of {} completed). \
                         Check blocked tasks and dependencies.",
                        progress.completed, progress.total
                    );
                    return Ok(LoopOutcome::NoActionableTasks);
                }
            },
        };
        active_task = Some(task.id);

        println!(
            "\n━━━ Loop {} ━━━  {} — {}",
            loop_number, task.id, task.name
        );
        dirs.log_line(&format!("loop {} starting {}", loop_number, task.id))?;

        // Keep `hermes status` honest while the run is active.
        let plan_progress = store.progress();
        run_lock.current_task = format!("{} — {}", task.id, task.name);
        run_lock.progress = format!("{}/{} done", plan_progress.completed, plan_progress.total);
        if let Err(e) = state::write_lock(dirs, &run_lock) {
            eprintln!("⚠️   Lock file update failed: {e:#}");
        }

        store.update_task_status(task.id, TaskStatus::InProgress)?;
        if store
            .feature_by_id(task.feature)
            .is_some_and(|f| f.status == TaskStatus::NotStarted)
        {
            store.update_feature_status(task.feature, TaskStatus::InProgress)?;
        }

        if opts.auto_branch && is_repo {
            let feature_name = store
                .feature_by_id(task.feature)
                .map(|f| f.name.clone())
                .unwrap_or_default();
            match git.create_feature_branch(task.feature, &feature_name).await {
                Ok(branch) => current_branch = Some(branch),
                Err(e) => eprintln!("⚠️   Git branch warning: {e:#}"),
            }
        }

        // Checkpoint before the agent runs, so a crash resumes right here.
        run_state::write_run_state(
            &dirs.run_state_file,
            &RunState {
                status: RunStatus::InProgress,
                current_feature: Some(task.feature),
                current_branch: current_branch.clone(),
                current_task: Some(task.id),
                next_task: Some(task.id),
            },
        )?;

        // AddTask replaces any previous block, so re-injection is idempotent.
        injector.add_task(&task)?;

        match limiter.acquire(Some(opts.cancel.clone())).await {
            Ok(()) => {}
            Err(e) if agents::is_cancelled(&e) => return Ok(LoopOutcome::Cancelled),
            Err(e) => return Err(e),
        }

        let prompt = std::fs::read_to_string(&dirs.prompt_file)
            .with_context(|| format!("Cannot read {}", dirs.prompt_file.display()))?;
        let exec = ExecOptions {
            prompt,
            workdir: dirs.workdir.clone(),
            timeout: opts.task_timeout,
        };

        let result = run_agent_once(opts, &exec).await;
        let (output, agent_duration) = match result {
            Err(e) if agents::is_cancelled(&e) => return Ok(LoopOutcome::Cancelled),
            Err(e) => {
                consecutive_errors += 1;
                eprintln!(
                    "❌  Agent error ({}/{}): {e:#}",
                    consecutive_errors, opts.max_consecutive_errors
                );
                dirs.log_line(&format!("agent error: {e:#}"))?;
                breaker.add_loop_result(false, true, loop_number)?;
                if consecutive_errors >= opts.max_consecutive_errors {
                    println!("\n❌  {} consecutive agent errors. Halting.", consecutive_errors);
                    return Ok(LoopOutcome::ErrorsExhausted);
                }
                tokio::time::sleep(opts.error_delay).await;
                continue;
            }
            Ok((success, stdout, duration)) => {
                if !success {
                    consecutive_errors += 1;
                    eprintln!(
                        "❌  Agent exited non-zero ({}/{})",
                        consecutive_errors, opts.max_consecutive_errors
                    );
                    dirs.log_line("agent exited non-zero")?;
                    breaker.add_loop_result(false, true, loop_number)?;
                    if consecutive_errors >= opts.max_consecutive_errors {
                        println!(
                            "\n❌  {} consecutive agent errors. Halting.",
                            consecutive_errors
                        );
                        return Ok(LoopOutcome::ErrorsExhausted);
                    }
                    tokio::time::sleep(opts.error_delay).await;
                    continue;
                }
                consecutive_errors = 0;
                (stdout, duration)
            }
        };

        // Full agent output is kept per iteration for later inspection.
        let iter_log = dirs
            .logs_dir
            .join(format!("iteration-{loop_number}-{}.log", task.id));
        if let Err(e) = std::fs::write(&iter_log, &output) {
            eprintln!("⚠️   Could not write {}: {e}", iter_log.display());
        }

        // Classify the response against the git delta since last loop.
        let git_has_changes = if is_repo {
            git.has_uncommitted_changes().await.unwrap_or(false)
        } else {
            false
        };
        let analysis = analyze(
            &output,
            AnalyzeContext {
                git_has_changes,
                prev_output_length,
            },
        );
        prev_output_length = analysis.output_length;

        breaker.add_loop_result(analysis.has_progress, analysis.has_errors, loop_number)?;
        if analysis.is_stuck {
            eprintln!("⚠️   Agent appears stuck (repeated errors in its output)");
        }

        let mut completed_a_task = false;
        if analysis.is_blocked {
            println!("🚧  {} reported BLOCKED — skipping it.", task.id);
            store.update_task_status(task.id, TaskStatus::Blocked)?;
            injector.remove_task()?;
            active_task = None;
        } else if analysis.is_complete {
            completed_a_task = true;
            println!(
                "✅  {} — complete in {}s (confidence {})",
                task.id,
                agent_duration.as_secs(),
                analysis.confidence
            );
            if let Some(ref rec) = analysis.recommendation {
                println!("    💡 {rec}");
            }
            injector.remove_task()?;
            store.update_task_status(task.id, TaskStatus::Completed)?;
            active_task = None;

            if opts.auto_commit && is_repo {
                match git.has_uncommitted_changes().await {
                    Ok(true) => {
                        let completed = store
                            .task_by_id(task.id)
                            .cloned()
                            .unwrap_or_else(|| task.clone());
                        match git.commit_task(&completed).await {
                            Ok(_) => println!("📦  Committed {}", task.id),
                            Err(e) => {
                                // Plan state stays consistent; the operator
                                // inspects the tree.
                                eprintln!("⚠️   Git commit failed: {e:#}");
                                dirs.log_line(&format!("commit failed: {e:#}"))?;
                                return Err(e.context("git commit failed; resolve and re-run"));
                            }
                        }
                    }
                    Ok(false) => {}
                    Err(e) => eprintln!("⚠️   Git status check failed: {e:#}"),
                }
            }

            if store.is_feature_complete(task.feature) {
                store.update_feature_status(task.feature, TaskStatus::Completed)?;
                let feature = store.feature_by_id(task.feature).cloned();
                if let Some(feature) = feature {
                    println!("🎉  Feature {} complete", feature.id);
                    if let (true, Some(version)) = (is_repo, feature.target_version.as_ref()) {
                        if let Err(e) = git
                            .create_feature_tag(feature.id, &feature.name, version)
                            .await
                        {
                            eprintln!("⚠️   Tag warning: {e:#}");
                        }
                    }
                }
            }
        } else {
            println!(
                "🔄  {} not finished this loop (progress: {})",
                task.id, analysis.has_progress
            );
        }

        // Completion chatter only matters for the exit window when it did not
        // correspond to an actual task completing.
        let mut window_view = analysis.clone();
        window_view.is_complete = analysis.is_complete && !completed_a_task;
        if let Some(reason) = exit_window.record(loop_number, &window_view) {
            println!("\n🏁  Graceful exit: {}", reason.as_str());
            dirs.log_line(&format!("graceful exit: {}", reason.as_str()))?;
            return Ok(LoopOutcome::GracefulExit(reason));
        }

        if completed_a_task && !opts.autonomous {
            println!("⏸   Press Enter to continue with the next task…");
            if !wait_for_operator(&opts.cancel).await {
                return Ok(LoopOutcome::Cancelled);
            }
        }
    }
}

/// Run the agent once, optionally streaming its stdout to the console.
/// Returns `(exit_success, stdout, duration)`.
async fn run_agent_once(
    opts: &LoopOptions,
    exec: &ExecOptions,
) -> Result<(bool, String, Duration)> {
    if !opts.stream_output {
        let result = agents::execute(opts.agent.as_ref(), exec, Some(opts.cancel.clone())).await?;
        return Ok((result.success, result.stdout, result.duration));
    }

    let started = Instant::now();
    let mut rx =
        agents::execute_stream(opts.agent.as_ref(), exec.clone(), Some(opts.cancel.clone()))?;
    let mut collected = String::new();
    let mut success = false;
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::Text(line) => {
                println!("{line}");
                collected.push_str(&line);
                collected.push('\n');
            }
            AgentEvent::ErrorLine(line) => {
                eprintln!("{line}");
            }
            AgentEvent::Done { success: ok } => success = ok,
        }
    }
    if opts.cancel.load(Ordering::Relaxed) {
        return Err(anyhow::Error::new(agents::Cancelled));
    }
    Ok((success, collected, started.elapsed()))
}

/// Block until the operator presses Enter; false when cancellation fires
/// first.
async fn wait_for_operator(cancel: &Arc<AtomicBool>) -> bool {
    use tokio::io::AsyncBufReadExt as _;
    let mut line = String::new();
    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
    loop {
        tokio::select! {
            read = reader.read_line(&mut line) => {
                return read.is_ok();
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                if cancel.load(Ordering::Relaxed) {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentProcess;
    use crate::breaker::CircuitState;
    use crate::tasks::FeatureId;
    use std::path::Path;
    use std::process::Stdio;
    use tempfile::tempdir;
    use tokio::process::Command;

    struct ShellAgent {
        script: String,
    }

    impl Agent for ShellAgent {
        fn name(&self) -> &'static str {
            "shell"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn spawn(&self, prompt: &str, workdir: &Path) -> Result<AgentProcess> {
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(&self.script)
                .env("AGENT_PROMPT", prompt)
                .current_dir(workdir)
                .process_group(0)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            let child = cmd.spawn().context("spawn shell agent")?;
            Ok(AgentProcess { child })
        }
    }

    fn run_git(workdir: &Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(workdir)
            .output()
            .expect("git runs");
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn init_repo(workdir: &Path) {
        run_git(workdir, &["init", "-b", "main"]);
        run_git(workdir, &["config", "user.name", "Loop Test"]);
        run_git(workdir, &["config", "user.email", "loop-test@example.com"]);
        std::fs::write(workdir.join("README.md"), "# demo\n").expect("write readme");
        run_git(workdir, &["add", "-A"]);
        run_git(workdir, &["commit", "-m", "initial"]);
    }

    /// A chain plan: T001 ← T002 ← T003 under one feature.
    fn write_chain_plan(dirs: &HermesDirs) {
        dirs.ensure().expect("ensure dirs");
        let content = r#"# Feature 1: Chain

**Feature ID:** F001
**Target Version:** v0.1.0
**Status:** NOT_STARTED

## Tasks

### T001: First

**Status:** NOT_STARTED
**Priority:** P1

#### Dependencies
- None
---

### T002: Second

**Status:** NOT_STARTED
**Priority:** P1

#### Dependencies
- T001
---

### T003: Third

**Status:** NOT_STARTED
**Priority:** P1

#### Dependencies
- T002
---
"#;
        std::fs::write(dirs.tasks_dir.join("001-chain.md"), content).expect("write plan");
    }

    fn options(script: &str) -> LoopOptions {
        LoopOptions {
            agent: Arc::new(ShellAgent {
                script: script.to_string(),
            }),
            auto_branch: true,
            auto_commit: true,
            autonomous: true,
            task_timeout: Duration::from_secs(10),
            error_delay: Duration::from_millis(10),
            max_consecutive_errors: 3,
            max_calls_per_hour: 1_000_000,
            run_deadline: None,
            breaker_config: BreakerConfig::default(),
            stream_output: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    const COMPLETE_SCRIPT: &str = r#"echo "implemented" >> work.txt
echo "---HERMES_STATUS---"
echo "STATUS: COMPLETE"
echo "EXIT_SIGNAL: false"
echo "---END_HERMES_STATUS---"
"#;

    #[tokio::test]
    async fn linear_plan_completes_with_commits_and_closed_breaker() {
        let dir = tempdir().expect("create tempdir");
        init_repo(dir.path());
        let dirs = HermesDirs::new(dir.path());
        write_chain_plan(&dirs);

        let outcome = run_loop(&dirs, &options(COMPLETE_SCRIPT))
            .await
            .expect("run loop");
        assert_eq!(outcome, LoopOutcome::PlanComplete);
        assert_eq!(outcome.exit_code(), 0);

        let store = TaskStore::load(&dirs.tasks_dir).expect("reload");
        for task in store.all_tasks() {
            assert_eq!(task.status, TaskStatus::Completed);
        }
        assert!(store.is_feature_complete(FeatureId(1)));

        // Three task commits landed on the feature branch.
        let branch = run_git(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"]);
        assert_eq!(branch, "feature/F001-chain");
        let subjects = run_git(dir.path(), &["log", "--format=%s"]);
        for id in ["T001", "T002", "T003"] {
            assert!(
                subjects.lines().any(|l| l.starts_with(&format!("feat({id})"))),
                "missing commit for {id}: {subjects}"
            );
        }

        // Feature completion tagged the target version.
        let tags = run_git(dir.path(), &["tag"]);
        assert!(tags.contains("v0.1.0"));

        // Breaker saw progress every loop.
        let breaker = CircuitBreaker::load(
            &dirs.breaker_state_file,
            &dirs.breaker_history_file,
            BreakerConfig::default(),
        )
        .expect("load breaker");
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Run state records completion; the prompt block is gone.
        let rs = run_state::read_run_state(&dirs.run_state_file)
            .expect("read run state")
            .expect("exists");
        assert_eq!(rs.status, RunStatus::Completed);
        let prompt = std::fs::read_to_string(&dirs.prompt_file).expect("read prompt");
        assert!(!prompt.contains("HERMES_TASK_START"));

        // One captured output file per loop iteration.
        let iteration_logs = std::fs::read_dir(&dirs.logs_dir)
            .expect("read logs dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("iteration-"))
            .count();
        assert_eq!(iteration_logs, 3, "one output log per loop iteration");
    }

    #[tokio::test]
    async fn stagnating_agent_walks_the_breaker_to_open() {
        let dir = tempdir().expect("create tempdir");
        init_repo(dir.path());
        let dirs = HermesDirs::new(dir.path());
        write_chain_plan(&dirs);

        // Same short output, no file changes, never complete.
        let outcome = run_loop(&dirs, &options("echo still thinking"))
            .await
            .expect("run loop");
        assert_eq!(outcome, LoopOutcome::BreakerOpen);
        assert_eq!(outcome.exit_code(), 1);

        let mut breaker = CircuitBreaker::load(
            &dirs.breaker_state_file,
            &dirs.breaker_history_file,
            BreakerConfig::default(),
        )
        .expect("load breaker");
        assert_eq!(breaker.state(), CircuitState::Open);

        // `reset` restores CLOSED and the loop may run again.
        breaker.reset("operator reset").expect("reset");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn failing_agent_exhausts_error_budget() {
        let dir = tempdir().expect("create tempdir");
        init_repo(dir.path());
        let dirs = HermesDirs::new(dir.path());
        write_chain_plan(&dirs);

        let outcome = run_loop(&dirs, &options("echo boom >&2; exit 1"))
            .await
            .expect("run loop");
        assert_eq!(outcome, LoopOutcome::ErrorsExhausted);

        // The task under work stays IN_PROGRESS for inspection.
        let store = TaskStore::load(&dirs.tasks_dir).expect("reload");
        assert_eq!(
            store.task_by_id(TaskId(1)).expect("T001").status,
            TaskStatus::InProgress
        );
    }

    #[tokio::test]
    async fn resume_starts_from_the_recorded_next_task() {
        let dir = tempdir().expect("create tempdir");
        init_repo(dir.path());
        let dirs = HermesDirs::new(dir.path());
        write_chain_plan(&dirs);

        // Simulate an interrupted run: T001 done, T002 was in flight.
        let mut store = TaskStore::load(&dirs.tasks_dir).expect("load");
        store
            .update_task_status(TaskId(1), TaskStatus::Completed)
            .expect("complete T001");
        store
            .update_task_status(TaskId(2), TaskStatus::InProgress)
            .expect("start T002");
        run_state::write_run_state(
            &dirs.run_state_file,
            &RunState {
                status: RunStatus::InProgress,
                current_feature: Some(FeatureId(1)),
                current_branch: None,
                current_task: Some(TaskId(2)),
                next_task: Some(TaskId(2)),
            },
        )
        .expect("write run state");

        // The agent records which tasks it was asked to do.
        let script = r#"echo "$AGENT_PROMPT" | grep -o 'Task ID:\*\* T[0-9]*' >> seen.txt || true
echo "---HERMES_STATUS---"
echo "STATUS: COMPLETE"
echo "---END_HERMES_STATUS---"
"#;
        let outcome = run_loop(&dirs, &options(script)).await.expect("run loop");
        assert_eq!(outcome, LoopOutcome::PlanComplete);

        let seen = std::fs::read_to_string(dir.path().join("seen.txt")).expect("seen file");
        let first = seen.lines().next().expect("at least one entry");
        assert!(
            first.ends_with("T002"),
            "run must resume at T002, not T003 or T001: {seen}"
        );
        assert!(!seen.contains("T001"), "completed work is not redone: {seen}");
    }

    #[tokio::test]
    async fn blocked_status_marks_task_and_moves_on() {
        let dir = tempdir().expect("create tempdir");
        init_repo(dir.path());
        let dirs = HermesDirs::new(dir.path());
        write_chain_plan(&dirs);

        let script = r#"echo "---HERMES_STATUS---"
echo "STATUS: BLOCKED"
echo "---END_HERMES_STATUS---"
"#;
        let outcome = run_loop(&dirs, &options(script)).await.expect("run loop");
        // T001 blocked strands the whole chain.
        assert_eq!(outcome, LoopOutcome::NoActionableTasks);

        let store = TaskStore::load(&dirs.tasks_dir).expect("reload");
        assert_eq!(
            store.task_by_id(TaskId(1)).expect("T001").status,
            TaskStatus::Blocked
        );
        assert_eq!(
            store.task_by_id(TaskId(2)).expect("T002").status,
            TaskStatus::NotStarted
        );
    }

    #[tokio::test]
    async fn empty_tasks_directory_is_not_an_error() {
        let dir = tempdir().expect("create tempdir");
        let dirs = HermesDirs::new(dir.path());
        dirs.ensure().expect("ensure dirs");

        let outcome = run_loop(&dirs, &options("echo hi"))
            .await
            .expect("run loop");
        assert_eq!(outcome, LoopOutcome::NoTasks);
    }

    #[tokio::test]
    async fn cancellation_preserves_resumable_state() {
        let dir = tempdir().expect("create tempdir");
        init_repo(dir.path());
        let dirs = HermesDirs::new(dir.path());
        write_chain_plan(&dirs);

        let opts = options("sleep 30; echo never");
        let cancel = opts.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.store(true, Ordering::Relaxed);
        });

        let outcome = run_loop(&dirs, &opts).await.expect("run loop");
        assert_eq!(outcome, LoopOutcome::Cancelled);
        assert_eq!(outcome.exit_code(), 0);

        // run-state points at the interrupted task; a fresh run resumes it.
        assert_eq!(run_state::resume_task(&dirs.run_state_file), Some(TaskId(1)));
        assert!(!dirs.lock_file.exists(), "lock released on cancellation");
    }

    #[tokio::test]
    async fn run_deadline_stops_the_loop_cleanly() {
        let dir = tempdir().expect("create tempdir");
        init_repo(dir.path());
        let dirs = HermesDirs::new(dir.path());
        write_chain_plan(&dirs);

        let mut opts = options("echo still thinking");
        opts.run_deadline = Some(Duration::from_millis(1));
        let outcome = run_loop(&dirs, &opts).await.expect("run loop");
        assert_eq!(outcome, LoopOutcome::TimedOut);
    }
}
