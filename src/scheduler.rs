use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::agents::{Agent, RetryPolicy};
use crate::git::GitManager;
use crate::graph::{DependencyGraph, NodeState};
use crate::parallel_log::ParallelLogger;
use crate::pool::{TaskResult, WorkerContext, WorkerPool};
use crate::rate_limit::{RateLimiter, ResourceMonitor};
use crate::tasks::{Task, TaskId, TaskStatus, TaskStore};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStrategy {
    /// Abort once the currently dispatched results are drained.
    FailFast,
    /// Keep peeling batches; tasks stranded behind failures are skipped.
    Continue,
}

impl std::str::FromStr for FailureStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-fast" | "failfast" => Ok(FailureStrategy::FailFast),
            "continue" => Ok(FailureStrategy::Continue),
            other => anyhow::bail!("unknown failure strategy '{}' (fail-fast | continue)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub failure_strategy: FailureStrategy,
    pub use_isolation: bool,
    pub task_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Shared handles the scheduler threads workers through.
pub struct SchedulerEnv {
    pub agent: Arc<dyn Agent>,
    pub workdir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub prompt_file: PathBuf,
    pub logger: Arc<ParallelLogger>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub monitor: Option<Arc<ResourceMonitor>>,
    pub cancel: Arc<AtomicBool>,
}

// ── Plan ──────────────────────────────────────────────────────────────────────

/// Pure description of how a run would execute; used by `--dry-run`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub batches: Vec<Vec<TaskId>>,
    pub total_tasks: usize,
}

/// Build the batch plan without side effects.
pub fn execution_plan(tasks: &[Task]) -> Result<ExecutionPlan> {
    let graph = DependencyGraph::new(tasks.iter())?;
    let batches = graph.batches();
    Ok(ExecutionPlan {
        total_tasks: tasks.len(),
        batches,
    })
}

/// Rough wall-clock estimate for a plan: each batch runs its tasks in waves
/// of `workers`, one `per_task` slot per wave. Plain integer formatting.
pub fn estimate_parallel_time(plan: &ExecutionPlan, workers: usize, per_task: Duration) -> String {
    let workers = workers.max(1);
    let total_secs: u64 = plan
        .batches
        .iter()
        .map(|batch| {
            let waves = batch.len().div_ceil(workers) as u64;
            waves * per_task.as_secs()
        })
        .sum();

    let minutes = total_secs / 60;
    let seconds = total_secs % 60;
    if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

// ── File conflicts ────────────────────────────────────────────────────────────

/// Files claimed by more than one task (`filesToTouch ∪ exclusiveFiles`),
/// mapped to the claiming task ids.
pub fn detect_file_conflicts(tasks: &[&Task]) -> HashMap<String, Vec<TaskId>> {
    let mut by_file: HashMap<String, Vec<TaskId>> = HashMap::new();
    for task in tasks {
        for file in task.claimed_files() {
            by_file.entry(file.to_string()).or_default().push(task.id);
        }
    }
    by_file.retain(|_, ids| ids.len() > 1);
    for ids in by_file.values_mut() {
        ids.sort();
    }
    by_file
}

/// Greedy-color the conflict graph, most-conflicting tasks first: within each
/// returned group, no two tasks share a claimed file. Tasks flagged
/// non-parallelizable always get a group of their own.
pub fn group_by_conflicts(tasks: &[&Task]) -> Vec<Vec<TaskId>> {
    let conflicts = detect_file_conflicts(tasks);

    // Conflict degree per task (number of contested files it claims).
    let mut degree: HashMap<TaskId, usize> = tasks.iter().map(|t| (t.id, 0)).collect();
    for ids in conflicts.values() {
        for id in ids {
            *degree.get_mut(id).expect("task known") += 1;
        }
    }

    let mut ordered: Vec<&Task> = tasks.to_vec();
    ordered.sort_by_key(|t| (std::cmp::Reverse(degree[&t.id]), t.id));

    let files_of: HashMap<TaskId, Vec<&str>> =
        tasks.iter().map(|t| (t.id, t.claimed_files())).collect();
    let mut groups: Vec<Vec<TaskId>> = Vec::new();
    let mut exclusive: Vec<bool> = Vec::new();

    'tasks: for task in ordered {
        if !task.parallelizable {
            groups.push(vec![task.id]);
            exclusive.push(true);
            continue;
        }
        let mine = &files_of[&task.id];
        for (group, is_exclusive) in groups.iter_mut().zip(&exclusive) {
            if *is_exclusive {
                continue;
            }
            let clash = group.iter().any(|other| {
                files_of[other].iter().any(|f| mine.contains(f))
            });
            if !clash {
                group.push(task.id);
                continue 'tasks;
            }
        }
        groups.push(vec![task.id]);
        exclusive.push(false);
    }

    for group in &mut groups {
        group.sort();
    }
    groups
}

// ── Execution ─────────────────────────────────────────────────────────────────

/// A task branch created during the run, for rollback bookkeeping.
#[derive(Debug, Clone)]
pub struct TaskBranchRecord {
    pub task_id: TaskId,
    pub branch: String,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub results: Vec<TaskResult>,
    pub total_time: Duration,
    pub successful: usize,
    pub failed: usize,
    /// Tasks that never ran because a dependency failed.
    pub skipped: Vec<TaskId>,
    pub task_branches: Vec<TaskBranchRecord>,
    /// Set when the run stopped before finishing every batch.
    pub halted: Option<String>,
}

pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Execute the plan batch by batch. Inside a batch, conflict groups run
    /// one after another so no two concurrent tasks share a claimed file;
    /// within a group, a fresh pool of `min(max_workers, |group|)` workers
    /// drains the tasks. Successful task branches merge into the main branch
    /// between batches so later batches fork from up-to-date code.
    pub async fn execute(
        &self,
        store: &mut TaskStore,
        env: &SchedulerEnv,
    ) -> Result<ExecutionReport> {
        let started = Instant::now();
        let tasks: Vec<Task> = store.all_tasks().into_iter().cloned().collect();
        let mut graph = DependencyGraph::new(tasks.iter())?;
        let by_id: HashMap<TaskId, Task> = tasks.iter().map(|t| (t.id, t.clone())).collect();
        let git = GitManager::new(&env.workdir);

        let mut report = ExecutionReport::default();
        let batches = graph.batches();
        env.logger.log_main(&format!(
            "plan: {} tasks in {} batches, strategy {:?}, isolation {}",
            tasks.len(),
            batches.len(),
            self.config.failure_strategy,
            self.config.use_isolation
        ));

        'batches: for (batch_index, batch) in batches.iter().enumerate() {
            if env.cancel.load(Ordering::Relaxed) {
                report.halted = Some("cancelled".to_string());
                break;
            }

            // Only nodes the graph still considers READY run; everything else
            // in this structural batch is either done already or stranded.
            let runnable: Vec<Task> = batch
                .iter()
                .filter(|id| {
                    graph
                        .node(**id)
                        .is_some_and(|n| n.state == NodeState::Ready)
                })
                .map(|id| by_id[id].clone())
                .collect();
            if runnable.is_empty() {
                continue;
            }

            let refs: Vec<&Task> = runnable.iter().collect();
            let groups = group_by_conflicts(&refs);
            env.logger.log_main(&format!(
                "batch {}: {} runnable task(s) in {} conflict group(s)",
                batch_index + 1,
                runnable.len(),
                groups.len()
            ));

            for group in groups {
                if env.cancel.load(Ordering::Relaxed) {
                    report.halted = Some("cancelled".to_string());
                    break 'batches;
                }

                let workers = self.config.max_workers.min(group.len()).max(1);
                let mut pool = WorkerPool::start(workers, self.worker_context(env));

                for id in &group {
                    graph.mark_running(*id)?;
                    store.update_task_status(*id, TaskStatus::InProgress)?;
                    pool.submit(by_id[id].clone()).await?;
                }

                let results = pool.wait_for_batch(group.len()).await;
                pool.stop().await;

                let mut batch_failed = false;
                for result in results {
                    if result.success {
                        graph.mark_complete(result.task_id)?;
                        store.update_task_status(result.task_id, TaskStatus::Completed)?;
                        let feature = by_id[&result.task_id].feature;
                        if store.is_feature_complete(feature) {
                            store.update_feature_status(feature, TaskStatus::Completed)?;
                        }
                        report.successful += 1;
                    } else {
                        graph.mark_failed(result.task_id)?;
                        batch_failed = true;
                        report.failed += 1;
                        env.logger.log_main(&format!(
                            "task {} failed: {}",
                            result.task_id,
                            result.error.as_deref().unwrap_or("unknown error")
                        ));
                    }
                    if let Some(branch) = result
                        .branch
                        .clone()
                        .filter(|b| b.starts_with("task/"))
                    {
                        report.task_branches.push(TaskBranchRecord {
                            task_id: result.task_id,
                            branch,
                        });
                    }
                    report.results.push(result);
                }

                // Land this group's successful branches on main right away:
                // the next group may touch the same files and must fork from
                // the merged result.
                self.merge_batch(&git, env, &report).await?;

                if batch_failed && self.config.failure_strategy == FailureStrategy::FailFast {
                    report.halted = Some("fail-fast after task failure".to_string());
                    break 'batches;
                }
            }
        }

        report.skipped = graph.stranded();
        for id in &report.skipped {
            env.logger
                .log_main(&format!("task {id} skipped: dependency failed"));
        }

        report.total_time = started.elapsed();
        env.logger.log_main(&format!(
            "run finished: {} ok, {} failed, {} skipped in {}s",
            report.successful,
            report.failed,
            report.skipped.len(),
            report.total_time.as_secs()
        ));
        Ok(report)
    }

    fn worker_context(&self, env: &SchedulerEnv) -> WorkerContext {
        WorkerContext {
            agent: env.agent.clone(),
            workdir: env.workdir.clone(),
            worktrees_dir: env.worktrees_dir.clone(),
            prompt_file: env.prompt_file.clone(),
            use_isolation: self.config.use_isolation,
            task_timeout: self.config.task_timeout,
            retry: self.config.retry,
            logger: env.logger.clone(),
            limiter: env.limiter.clone(),
            monitor: env.monitor.clone(),
            cancel: env.cancel.clone(),
        }
    }

    /// Merge every not-yet-merged successful task branch into main, then
    /// remove its worktree. Merge conflicts fail loudly for the operator.
    async fn merge_batch(
        &self,
        git: &GitManager,
        env: &SchedulerEnv,
        report: &ExecutionReport,
    ) -> Result<()> {
        if !self.config.use_isolation {
            return Ok(());
        }

        let pending: Vec<(TaskId, String)> = report
            .results
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.branch.clone().map(|b| (r.task_id, b)))
            .filter(|(_, b)| b.starts_with("task/"))
            .collect();

        for (task_id, branch) in pending {
            let worktree_path = env.worktrees_dir.join(task_id.to_string());
            if !worktree_path.exists() {
                continue; // already merged and cleaned in an earlier batch
            }

            // Worktree removal first, so the branch is free to merge/delete.
            git.remove_worktree(&worktree_path)
                .await
                .with_context(|| format!("removing worktree for {task_id}"))?;

            let base = git.default_branch().await?;
            git.checkout(&base).await?;
            let message = format!("Merge {branch} into {base}");
            match git.merge_branch(&branch, &message).await {
                Ok(()) => {
                    env.logger.log_merge(&format!("merged {branch}"));
                    git.delete_branch(&branch).await.ok();
                }
                Err(e) => {
                    env.logger
                        .log_merge(&format!("merge conflict on {branch}: {e:#}"));
                    return Err(e.context(format!(
                        "merge of {branch} failed; resolve manually, then re-run"
                    )));
                }
            }
        }

        git.prune_worktrees().await.ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentProcess;
    use crate::tasks::{FeatureId, Priority};
    use anyhow::Context as _;
    use std::path::Path;
    use std::process::Stdio;
    use tempfile::tempdir;
    use tokio::process::Command;

    fn task_with_files(id: u16, deps: &[u16], files: &[&str]) -> Task {
        Task {
            id: TaskId(id),
            feature: FeatureId(1),
            name: format!("task {id}"),
            status: TaskStatus::NotStarted,
            priority: Priority::P2,
            estimated_effort: None,
            description: String::new(),
            technical_details: String::new(),
            files_to_touch: files
                .iter()
                .map(|f| crate::tasks::FileTouch {
                    path: f.to_string(),
                    kind: crate::tasks::FileTouchKind::Update,
                })
                .collect(),
            depends_on: deps.iter().map(|d| TaskId(*d)).collect(),
            success_criteria: vec![],
            parallelizable: true,
            exclusive_files: vec![],
        }
    }

    #[test]
    fn diamond_plan_peels_into_three_batches() {
        let tasks = vec![
            task_with_files(1, &[], &[]),
            task_with_files(2, &[1], &[]),
            task_with_files(3, &[1], &[]),
            task_with_files(4, &[2, 3], &[]),
        ];
        let plan = execution_plan(&tasks).expect("plan");
        assert_eq!(plan.total_tasks, 4);
        assert_eq!(
            plan.batches,
            vec![
                vec![TaskId(1)],
                vec![TaskId(2), TaskId(3)],
                vec![TaskId(4)]
            ]
        );
    }

    #[test]
    fn cycle_refuses_the_plan() {
        let tasks = vec![task_with_files(1, &[2], &[]), task_with_files(2, &[1], &[])];
        let err = execution_plan(&tasks).expect_err("cycle");
        assert!(err.to_string().contains("circular dependency detected"));
    }

    #[test]
    fn shared_files_are_reported_as_conflicts() {
        let t1 = task_with_files(1, &[], &["config.rs", "main.rs"]);
        let t2 = task_with_files(2, &[], &["config.rs"]);
        let t3 = task_with_files(3, &[], &["other.rs"]);
        let tasks = vec![&t1, &t2, &t3];

        let conflicts = detect_file_conflicts(&tasks);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(
            conflicts.get("config.rs"),
            Some(&vec![TaskId(1), TaskId(2)])
        );
    }

    #[test]
    fn conflict_groups_never_share_a_file() {
        let t1 = task_with_files(1, &[], &["a.rs", "b.rs"]);
        let t2 = task_with_files(2, &[], &["b.rs", "c.rs"]);
        let t3 = task_with_files(3, &[], &["c.rs"]);
        let t4 = task_with_files(4, &[], &["d.rs"]);
        let tasks = vec![&t1, &t2, &t3, &t4];

        let groups = group_by_conflicts(&tasks);
        let files: HashMap<TaskId, Vec<&str>> =
            tasks.iter().map(|t| (t.id, t.claimed_files())).collect();
        for group in &groups {
            for (i, a) in group.iter().enumerate() {
                for b in &group[i + 1..] {
                    assert!(
                        !files[a].iter().any(|f| files[b].contains(f)),
                        "{a} and {b} share a file inside one group"
                    );
                }
            }
        }
        // T1/T2 conflict and T2/T3 conflict, so at least two groups exist and
        // the conflict-free T4 joins an existing one.
        assert!(groups.len() >= 2);
        let total: usize = groups.iter().map(Vec::len).sum();
        assert_eq!(total, 4, "every task lands in exactly one group");
    }

    #[test]
    fn non_parallelizable_tasks_run_alone() {
        let mut t1 = task_with_files(1, &[], &[]);
        t1.parallelizable = false;
        let t2 = task_with_files(2, &[], &[]);
        let t3 = task_with_files(3, &[], &[]);
        let tasks = vec![&t1, &t2, &t3];

        let groups = group_by_conflicts(&tasks);
        let solo = groups
            .iter()
            .find(|g| g.contains(&TaskId(1)))
            .expect("T001 grouped");
        assert_eq!(solo, &vec![TaskId(1)], "exclusive task shares with nobody");
        assert!(groups.iter().any(|g| g.contains(&TaskId(2)) && g.contains(&TaskId(3))));
    }

    #[test]
    fn estimate_uses_plain_integer_formatting() {
        let plan = ExecutionPlan {
            batches: vec![
                vec![TaskId(1)],
                vec![TaskId(2), TaskId(3), TaskId(4)],
            ],
            total_tasks: 4,
        };
        // 2 workers: batch1 = 1 wave, batch2 = 2 waves → 3 × 300s = 15m.
        assert_eq!(
            estimate_parallel_time(&plan, 2, Duration::from_secs(300)),
            "15m 0s"
        );
        assert_eq!(
            estimate_parallel_time(&plan, 4, Duration::from_secs(20)),
            "40s"
        );
    }

    // ── End-to-end scheduler runs against a real repo + plan file ─────────────

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

        fn spawn(&self, prompt: &str, workdir: &Path) -> anyhow::Result<AgentProcess> {
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

    fn run_git(workdir: &Path, args: &[&str]) {
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
    }

    fn init_repo(workdir: &Path) {
        run_git(workdir, &["init", "-b", "main"]);
        run_git(workdir, &["config", "user.name", "Sched Test"]);
        run_git(workdir, &["config", "user.email", "sched-test@example.com"]);
        std::fs::write(workdir.join("README.md"), "# demo\n").expect("write readme");
        run_git(workdir, &["add", "-A"]);
        run_git(workdir, &["commit", "-m", "initial"]);
    }

    /// Plan file with a diamond: T001 ← {T002, T003} ← T004.
    fn write_diamond_plan(tasks_dir: &Path) {
        std::fs::create_dir_all(tasks_dir).expect("mkdir tasks");
        let content = r#"# Feature 1: Diamond

**Feature ID:** F001
**Status:** NOT_STARTED

## Tasks

### T001: Root

**Status:** NOT_STARTED
**Priority:** P1

#### Dependencies
- None
---

### T002: Left

**Status:** NOT_STARTED
**Priority:** P2

#### Dependencies
- T001
---

### T003: Right

**Status:** NOT_STARTED
**Priority:** P2

#### Dependencies
- T001
---

### T004: Join

**Status:** NOT_STARTED
**Priority:** P2

#### Dependencies
- T002
- T003
---
"#;
        std::fs::write(tasks_dir.join("001-diamond.md"), content).expect("write plan");
    }

    fn env_for(workdir: &Path, script: &str) -> SchedulerEnv {
        let prompt_file = workdir.join(".hermes/PROMPT.md");
        std::fs::create_dir_all(prompt_file.parent().expect("parent")).expect("mkdir");
        std::fs::write(&prompt_file, "# Instructions\n").expect("write prompt");
        SchedulerEnv {
            agent: Arc::new(ShellAgent {
                script: script.to_string(),
            }),
            workdir: workdir.to_path_buf(),
            worktrees_dir: workdir.join(".hermes/worktrees"),
            prompt_file,
            logger: Arc::new(
                ParallelLogger::new(&workdir.join(".hermes/logs/parallel")).expect("logger"),
            ),
            limiter: None,
            monitor: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn scheduler(strategy: FailureStrategy) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            max_workers: 3,
            failure_strategy: strategy,
            use_isolation: true,
            task_timeout: Duration::from_secs(10),
            retry: RetryPolicy {
                max_retries: 0,
                delay: Duration::from_millis(10),
            },
        })
    }

    #[tokio::test]
    async fn diamond_plan_completes_every_task_and_merges_to_main() {
        let dir = tempdir().expect("create tempdir");
        init_repo(dir.path());
        let tasks_dir = dir.path().join(".hermes/tasks");
        write_diamond_plan(&tasks_dir);
        let mut store = TaskStore::load(&tasks_dir).expect("load store");

        let env = env_for(
            dir.path(),
            // Unique file per run location so merges never conflict.
            "echo done > \"out-$(basename $PWD).txt\"; echo ok",
        );
        let report = scheduler(FailureStrategy::Continue)
            .execute(&mut store, &env)
            .await
            .expect("execute");

        assert_eq!(report.successful, 4);
        assert_eq!(report.failed, 0);
        assert!(report.skipped.is_empty());
        assert!(report.halted.is_none());

        // Store and disk agree: everything COMPLETED.
        let reloaded = TaskStore::load(&tasks_dir).expect("reload");
        for task in reloaded.all_tasks() {
            assert_eq!(task.status, TaskStatus::Completed, "{} not completed", task.id);
        }
        assert!(reloaded.is_feature_complete(FeatureId(1)));

        // One completion commit per task ended up on main.
        let log = std::process::Command::new("git")
            .args(["log", "--format=%s", "main"])
            .current_dir(dir.path())
            .output()
            .expect("git log");
        let subjects = String::from_utf8_lossy(&log.stdout).to_string();
        for id in 1..=4u16 {
            assert!(
                subjects.contains(&format!("Complete task T{id:03}")),
                "main is missing T{id:03}: {subjects}"
            );
        }

        // Worktrees are cleaned up afterwards.
        let worktrees = dir.path().join(".hermes/worktrees");
        let leftover = std::fs::read_dir(&worktrees)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftover, 0, "worktrees must be removed after merging");
    }

    #[tokio::test]
    async fn fail_fast_stops_after_the_failing_batch() {
        let dir = tempdir().expect("create tempdir");
        init_repo(dir.path());
        let tasks_dir = dir.path().join(".hermes/tasks");
        write_diamond_plan(&tasks_dir);
        let mut store = TaskStore::load(&tasks_dir).expect("load store");

        // The injected prompt names the current task; fail only T001.
        let env = env_for(
            dir.path(),
            "case \"$AGENT_PROMPT\" in *'Task ID:** T001'*) echo nope >&2; exit 1;; esac; echo ok",
        );
        let report = scheduler(FailureStrategy::FailFast)
            .execute(&mut store, &env)
            .await
            .expect("execute");

        assert_eq!(report.failed, 1);
        assert_eq!(report.successful, 0);
        assert!(report.halted.is_some());
        assert_eq!(
            report.skipped,
            vec![TaskId(2), TaskId(3), TaskId(4)],
            "everything behind the failure is stranded"
        );

        let reloaded = TaskStore::load(&tasks_dir).expect("reload");
        assert_eq!(
            reloaded.task_by_id(TaskId(1)).expect("T001").status,
            TaskStatus::InProgress,
            "failed task stays IN_PROGRESS for the operator"
        );
        assert_eq!(
            reloaded.task_by_id(TaskId(4)).expect("T004").status,
            TaskStatus::NotStarted
        );
    }

    #[tokio::test]
    async fn continue_strategy_reports_stranded_dependents_but_keeps_going() {
        let dir = tempdir().expect("create tempdir");
        init_repo(dir.path());
        let tasks_dir = dir.path().join(".hermes/tasks");

        // Two roots: T001 fails, T002 succeeds; T003 depends on the failure.
        let content = r#"# Feature 1: Mixed

**Feature ID:** F001
**Status:** NOT_STARTED

## Tasks

### T001: Doomed

**Status:** NOT_STARTED

#### Dependencies
- None
---

### T002: Fine

**Status:** NOT_STARTED

#### Dependencies
- None
---

### T003: Stranded

**Status:** NOT_STARTED

#### Dependencies
- T001
---
"#;
        std::fs::create_dir_all(&tasks_dir).expect("mkdir tasks");
        std::fs::write(tasks_dir.join("001-mixed.md"), content).expect("write plan");
        let mut store = TaskStore::load(&tasks_dir).expect("load store");

        let env = env_for(
            dir.path(),
            "case \"$AGENT_PROMPT\" in *'Task ID:** T001'*) exit 1;; esac; echo ok",
        );
        let report = scheduler(FailureStrategy::Continue)
            .execute(&mut store, &env)
            .await
            .expect("execute");

        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, vec![TaskId(3)]);
        assert!(report.halted.is_none(), "continue does not halt the run");

        let reloaded = TaskStore::load(&tasks_dir).expect("reload");
        assert_eq!(
            reloaded.task_by_id(TaskId(2)).expect("T002").status,
            TaskStatus::Completed
        );
        assert_eq!(
            reloaded.task_by_id(TaskId(3)).expect("T003").status,
            TaskStatus::NotStarted
        );
    }

    #[test]
    fn failure_strategy_parses_both_spellings() {
        assert_eq!(
            "fail-fast".parse::<FailureStrategy>().expect("parse"),
            FailureStrategy::FailFast
        );
        assert_eq!(
            "continue".parse::<FailureStrategy>().expect("parse"),
            FailureStrategy::Continue
        );
        assert!("explode".parse::<FailureStrategy>().is_err());
    }

    #[test]
    fn loading_a_plan_file_from_disk_feeds_the_planner() {
        let dir = tempdir().expect("create tempdir");
        write_diamond_plan(dir.path());
        let store = TaskStore::load(dir.path()).expect("load");
        let tasks: Vec<Task> = store.all_tasks().into_iter().cloned().collect();

        let plan = execution_plan(&tasks).expect("plan");
        assert_eq!(
            plan.batches,
            vec![
                vec![TaskId(1)],
                vec![TaskId(2), TaskId(3)],
                vec![TaskId(4)]
            ]
        );
    }
}
