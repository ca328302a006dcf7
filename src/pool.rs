use anyhow::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::agents::{self, Agent, ExecOptions, RetryPolicy};
use crate::git::GitManager;
use crate::parallel_log::ParallelLogger;
use crate::prompt::render_task_block;
use crate::rate_limit::{RateLimiter, ResourceMonitor};
use crate::tasks::{Task, TaskId};

// ── Results ───────────────────────────────────────────────────────────────────

/// Outcome of one task execution inside the pool.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub task_name: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    /// Branch the work landed on (task branch in isolation, else the current
    /// branch of the shared workspace).
    pub branch: Option<String>,
    pub duration: Duration,
    pub worker_id: usize,
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Everything a worker needs to execute tasks. Shared read-only across the
/// pool.
pub struct WorkerContext {
    pub agent: Arc<dyn Agent>,
    pub workdir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub prompt_file: PathBuf,
    pub use_isolation: bool,
    pub task_timeout: Duration,
    pub retry: RetryPolicy,
    pub logger: Arc<ParallelLogger>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub monitor: Option<Arc<ResourceMonitor>>,
    pub cancel: Arc<AtomicBool>,
}

// ── Pool ──────────────────────────────────────────────────────────────────────

/// Bounded concurrency over a task queue: N background workers drain the
/// intake channel and push `TaskResult`s back. Channel capacity is
/// `2 × workers` in both directions.
pub struct WorkerPool {
    task_tx: Option<mpsc::Sender<Task>>,
    results_rx: mpsc::Receiver<TaskResult>,
    handles: Vec<JoinHandle<()>>,
    running: Arc<AtomicUsize>,
    ctx: Arc<WorkerContext>,
}

impl WorkerPool {
    /// Spawn `workers` background workers immediately.
    pub fn start(workers: usize, ctx: WorkerContext) -> Self {
        let workers = workers.max(1);
        let (task_tx, task_rx) = mpsc::channel::<Task>(workers * 2);
        let (result_tx, results_rx) = mpsc::channel::<TaskResult>(workers * 2);

        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let running = Arc::new(AtomicUsize::new(0));
        let ctx = Arc::new(ctx);

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 1..=workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let running = running.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, ctx, task_rx, result_tx, running).await;
            }));
        }

        Self {
            task_tx: Some(task_tx),
            results_rx,
            handles,
            running,
            ctx,
        }
    }

    #[allow(dead_code)]
    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    #[allow(dead_code)]
    pub fn is_running(&self) -> bool {
        self.running_count() > 0
    }

    pub async fn submit(&self, task: Task) -> Result<()> {
        let tx = self
            .task_tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("worker pool intake already closed"))?;
        tx.send(task)
            .await
            .map_err(|_| anyhow::anyhow!("worker pool is stopped"))?;
        Ok(())
    }

    pub async fn submit_batch(&self, tasks: Vec<Task>) -> Result<()> {
        for task in tasks {
            self.submit(task).await?;
        }
        Ok(())
    }

    /// Collect exactly `n` results (or fewer if every worker exits early).
    pub async fn wait_for_batch(&mut self, n: usize) -> Vec<TaskResult> {
        let mut results = Vec::with_capacity(n);
        while results.len() < n {
            match self.results_rx.recv().await {
                Some(result) => results.push(result),
                None => break,
            }
        }
        results
    }

    /// Close the intake, let the workers drain, and return every remaining
    /// result.
    pub async fn wait(mut self) -> Vec<TaskResult> {
        self.task_tx.take(); // close intake; workers exit on channel close
        let mut results = Vec::new();
        while let Some(result) = self.results_rx.recv().await {
            results.push(result);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        results
    }

    /// Cancel in-flight work and shut the pool down.
    pub async fn stop(mut self) {
        self.ctx.cancel.store(true, Ordering::Relaxed);
        self.task_tx.take();
        // Drain whatever results are already buffered so workers never block
        // on a full results channel while exiting.
        while let Ok(result) = self.results_rx.try_recv() {
            drop(result);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

// ── Worker loop ───────────────────────────────────────────────────────────────

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
    task_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    result_tx: mpsc::Sender<TaskResult>,
    running: Arc<AtomicUsize>,
) {
    loop {
        if ctx.cancel.load(Ordering::Relaxed) {
            break;
        }

        // Hold the receiver lock only while waiting for the next task.
        let task = {
            let mut rx = task_rx.lock().await;
            rx.recv().await
        };
        let Some(task) = task else {
            break; // intake closed and drained
        };

        // The memory ceiling gates admission, not in-flight work.
        if let Some(ref monitor) = ctx.monitor {
            while !monitor.can_start_worker() {
                if ctx.cancel.load(Ordering::Relaxed) {
                    return;
                }
                ctx.logger
                    .log_worker(worker_id, "memory ceiling reached; waiting");
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }

        running.fetch_add(1, Ordering::Relaxed);
        let result = execute_task(worker_id, &ctx, &task).await;
        running.fetch_sub(1, Ordering::Relaxed);

        if result_tx.send(result).await.is_err() {
            break; // pool dropped
        }
    }
}

/// One task, one workspace:
///
/// 1. With isolation, create a worktree on a `task/<id>` branch (fall back to
///    the shared workspace if that fails).
/// 2. Compose the prompt file with the task block.
/// 3. Drive the agent with the per-task timeout.
/// 4. Commit any uncommitted changes as `Complete task <id>: <name>`.
async fn execute_task(worker_id: usize, ctx: &WorkerContext, task: &Task) -> TaskResult {
    let started = Instant::now();
    let git = GitManager::new(&ctx.workdir);
    let logger = &ctx.logger;
    logger.log_worker(worker_id, &format!("starting {} — {}", task.id, task.name));

    let mut branch = None;
    let mut exec_dir = ctx.workdir.clone();
    let mut worktree = None;

    if ctx.use_isolation {
        match git.create_worktree(&ctx.worktrees_dir, task.id).await {
            Ok(wt) => {
                logger.log_worker(
                    worker_id,
                    &format!("isolated workspace {} on {}", wt.path.display(), wt.branch),
                );
                exec_dir = wt.path.clone();
                branch = Some(wt.branch.clone());
                worktree = Some(wt);
            }
            Err(e) => {
                logger.log_worker(
                    worker_id,
                    &format!("worktree failed ({e:#}); falling back to shared workspace"),
                );
            }
        }
    }

    let prompt = compose_prompt(&ctx.prompt_file, task);
    if let Some(ref wt) = worktree {
        // Give the isolated workspace its own prompt copy for the agent to
        // read. The directory ignores itself so it never enters a commit.
        let hermes_dir = wt.path.join(".hermes");
        if std::fs::create_dir_all(&hermes_dir).is_ok() {
            let _ = std::fs::write(hermes_dir.join(".gitignore"), "*\n");
            let _ = std::fs::write(hermes_dir.join("PROMPT.md"), &prompt);
        }
    }

    let outcome = run_agent(ctx, &prompt, &exec_dir).await;

    let (success, output, error) = match outcome {
        Ok(result) => {
            let err = (!result.success).then(|| {
                let stderr = result.stderr.trim();
                if stderr.is_empty() {
                    "agent exited with a non-zero status".to_string()
                } else {
                    stderr.to_string()
                }
            });
            (result.success, result.stdout, err)
        }
        Err(e) => (false, String::new(), Some(format!("{e:#}"))),
    };

    if let Err(e) = logger.write_task_output(task.id, &output) {
        logger.log_worker(worker_id, &format!("could not persist output: {e:#}"));
    }

    // Commit whatever the agent left behind, even on reported failure: the
    // task branch is the record of what happened.
    let mut success = success;
    let mut error = error;
    match git.has_uncommitted_changes_in(&exec_dir).await {
        Ok(true) => {
            let message = format!("Complete task {}: {}", task.id, task.name);
            if let Err(e) = git.commit_all_in(&exec_dir, &message).await {
                logger.log_worker(worker_id, &format!("commit failed: {e:#}"));
                success = false;
                error.get_or_insert_with(|| format!("commit failed: {e:#}"));
            } else {
                logger.log_worker(worker_id, &format!("committed: {message}"));
            }
        }
        Ok(false) => {}
        Err(e) => {
            logger.log_worker(worker_id, &format!("status check failed: {e:#}"));
        }
    }

    if branch.is_none() {
        branch = git.current_branch().await.ok();
    }

    logger.log_worker(
        worker_id,
        &format!(
            "finished {} — success={} in {}s",
            task.id,
            success,
            started.elapsed().as_secs()
        ),
    );

    TaskResult {
        task_id: task.id,
        task_name: task.name.clone(),
        success,
        output,
        error,
        branch,
        duration: started.elapsed(),
        worker_id,
    }
}

async fn run_agent(
    ctx: &WorkerContext,
    prompt: &str,
    exec_dir: &std::path::Path,
) -> Result<agents::ExecResult> {
    if let Some(ref limiter) = ctx.limiter {
        limiter.acquire(Some(ctx.cancel.clone())).await?;
    }
    if let Some(ref monitor) = ctx.monitor {
        // Per-minute call and hourly cost ceilings; rate limits wait, they
        // never fail the task.
        while !monitor.can_make_api_call() {
            if ctx.cancel.load(Ordering::Relaxed) {
                return Err(anyhow::Error::new(crate::agents::Cancelled));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        monitor.record_api_call(None);
    }
    agents::execute_with_retry(
        ctx.agent.as_ref(),
        &ExecOptions {
            prompt: prompt.to_string(),
            workdir: exec_dir.to_path_buf(),
            timeout: ctx.task_timeout,
        },
        ctx.retry,
        Some(ctx.cancel.clone()),
    )
    .await
}

fn compose_prompt(prompt_file: &std::path::Path, task: &Task) -> String {
    let base = std::fs::read_to_string(prompt_file).unwrap_or_default();
    format!("{base}\n{}\n", render_task_block(task))
}
