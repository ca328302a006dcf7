use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

// ── Directory layout ──────────────────────────────────────────────────────────

/// All on-disk locations Hermes owns inside a project.
///
/// The default layout under the project root:
///
/// ```text
/// .hermes/
///   config.json
///   PROMPT.md
///   backups/
///   tasks/            one NNN-<kebab>.md file per feature + run-state.md
///   logs/
///     hermes.log
///     parallel/
///   worktrees/        isolated workspaces for parallel mode
///   lock
/// .circuit_breaker_state
/// .circuit_breaker_history
/// ```
#[derive(Debug, Clone)]
pub struct HermesDirs {
    pub workdir: PathBuf,
    pub hermes_dir: PathBuf,
    pub tasks_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub parallel_logs_dir: PathBuf,
    pub docs_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub prompt_file: PathBuf,
    pub config_file: PathBuf,
    pub lock_file: PathBuf,
    pub main_log_file: PathBuf,
    pub run_state_file: PathBuf,
    pub breaker_state_file: PathBuf,
    pub breaker_history_file: PathBuf,
}

impl HermesDirs {
    /// Resolve the default layout rooted at `workdir`. Does not touch the disk.
    pub fn new(workdir: &Path) -> Self {
        Self::with_layout(workdir, ".hermes", "tasks", "logs", "docs")
    }

    /// Resolve a layout with configurable directory names (the `paths` config
    /// section). `tasks`, `logs` and `docs` are relative to the hermes dir.
    pub fn with_layout(workdir: &Path, hermes: &str, tasks: &str, logs: &str, docs: &str) -> Self {
        let hermes_dir = workdir.join(hermes);
        let tasks_dir = hermes_dir.join(tasks);
        let logs_dir = hermes_dir.join(logs);
        Self {
            workdir: workdir.to_path_buf(),
            prompt_file: hermes_dir.join("PROMPT.md"),
            config_file: hermes_dir.join("config.json"),
            lock_file: hermes_dir.join("lock"),
            main_log_file: logs_dir.join("hermes.log"),
            run_state_file: tasks_dir.join("run-state.md"),
            parallel_logs_dir: logs_dir.join("parallel"),
            docs_dir: hermes_dir.join(docs),
            worktrees_dir: hermes_dir.join("worktrees"),
            backups_dir: hermes_dir.join("backups"),
            breaker_state_file: workdir.join(".circuit_breaker_state"),
            breaker_history_file: workdir.join(".circuit_breaker_history"),
            hermes_dir,
            tasks_dir,
            logs_dir,
        }
    }

    /// Create the directory tree. Idempotent.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.hermes_dir,
            &self.tasks_dir,
            &self.logs_dir,
            &self.parallel_logs_dir,
            &self.docs_dir,
            &self.backups_dir,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        // The state directory ignores itself so `git add -A` never stages it.
        let gitignore = self.hermes_dir.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, "*\n").context("Failed to write .hermes/.gitignore")?;
        }
        Ok(())
    }

    /// Append a timestamped line to the main log file.
    pub fn log_line(&self, message: &str) -> Result<()> {
        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let line = format!("[{stamp}] {message}\n");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.main_log_file)
            .context("Failed to open hermes.log")?;
        file.write_all(line.as_bytes())
            .context("Failed to write to hermes.log")?;
        Ok(())
    }
}

// ── Run lock ──────────────────────────────────────────────────────────────────

/// Written to `.hermes/lock` while a run is active. `hermes status` reads it;
/// a second `hermes run` refuses to start while the owning PID is alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLock {
    /// PID of the hermes process holding this lock.
    pub pid: u32,
    /// `sequential` or `parallel`.
    pub mode: String,
    /// Current task description (e.g. "T002 — Implement login handler").
    pub current_task: String,
    /// Human-readable progress string (e.g. "2/8 done").
    pub progress: String,
    /// Wall-clock start time of the run.
    pub started_at: DateTime<Utc>,
}

impl RunLock {
    pub fn starting(mode: &str) -> Self {
        Self {
            pid: std::process::id(),
            mode: mode.to_string(),
            current_task: "starting…".to_string(),
            progress: "0/? done".to_string(),
            started_at: Utc::now(),
        }
    }
}

/// Check if a process with the given PID is alive (signal 0 probe).
pub fn is_pid_alive(pid: u32) -> bool {
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;
    nix::sys::signal::kill(Pid::from_raw(pid as i32), Option::<Signal>::None).is_ok()
}

/// Acquire the run lock, refusing if another live hermes process holds it.
/// A lock owned by a dead PID is treated as stale and replaced.
pub fn acquire_lock(dirs: &HermesDirs, lock: &RunLock) -> Result<()> {
    if let Some(existing) = read_lock(dirs)? {
        if existing.pid != std::process::id() && is_pid_alive(existing.pid) {
            anyhow::bail!(
                "Another hermes run is active (pid {}, started {}). \
                 Wait for it to finish or remove {} if it is stuck.",
                existing.pid,
                existing.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                dirs.lock_file.display()
            );
        }
    }
    write_lock(dirs, lock)
}

/// Write (or overwrite) the lock file with current run metadata.
pub fn write_lock(dirs: &HermesDirs, lock: &RunLock) -> Result<()> {
    let content = serde_json::to_string_pretty(lock).context("Failed to serialise run lock")?;
    fs::write(&dirs.lock_file, content).context("Failed to write .hermes/lock")?;
    Ok(())
}

/// Read the lock file, if it exists.
pub fn read_lock(dirs: &HermesDirs) -> Result<Option<RunLock>> {
    if !dirs.lock_file.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&dirs.lock_file).context("Failed to read .hermes/lock")?;
    let lock: RunLock =
        serde_json::from_str(&content).context("Failed to parse .hermes/lock")?;
    Ok(Some(lock))
}

/// Remove the lock file (called on clean exit).
pub fn remove_lock(dirs: &HermesDirs) {
    let _ = fs::remove_file(&dirs.lock_file);
}

/// RAII guard that removes the run lock when dropped, so an early `?` return
/// still releases the lock.
pub struct RunLockGuard<'a> {
    dirs: &'a HermesDirs,
}

impl<'a> RunLockGuard<'a> {
    pub fn new(dirs: &'a HermesDirs) -> Self {
        Self { dirs }
    }
}

impl Drop for RunLockGuard<'_> {
    fn drop(&mut self) {
        remove_lock(self.dirs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_places_everything_under_the_hermes_dir() {
        let dir = tempdir().expect("create tempdir");
        let dirs = HermesDirs::new(dir.path());

        assert_eq!(dirs.hermes_dir, dir.path().join(".hermes"));
        assert_eq!(dirs.tasks_dir, dir.path().join(".hermes/tasks"));
        assert_eq!(dirs.run_state_file, dir.path().join(".hermes/tasks/run-state.md"));
        assert_eq!(dirs.parallel_logs_dir, dir.path().join(".hermes/logs/parallel"));
        assert_eq!(dirs.breaker_state_file, dir.path().join(".circuit_breaker_state"));
    }

    #[test]
    fn ensure_creates_the_directory_tree() {
        let dir = tempdir().expect("create tempdir");
        let dirs = HermesDirs::new(dir.path());
        dirs.ensure().expect("ensure layout");

        assert!(dirs.tasks_dir.is_dir());
        assert!(dirs.parallel_logs_dir.is_dir());
        assert!(dirs.backups_dir.is_dir());
    }

    #[test]
    fn lock_round_trips_and_is_removed_by_guard() {
        let dir = tempdir().expect("create tempdir");
        let dirs = HermesDirs::new(dir.path());
        dirs.ensure().expect("ensure layout");

        let lock = RunLock::starting("sequential");
        acquire_lock(&dirs, &lock).expect("acquire lock");

        let read = read_lock(&dirs)
            .expect("read lock")
            .expect("lock should exist");
        assert_eq!(read.pid, std::process::id());
        assert_eq!(read.mode, "sequential");

        {
            let _guard = RunLockGuard::new(&dirs);
        }
        assert!(!dirs.lock_file.exists(), "guard drop should remove the lock");
    }

    #[test]
    fn stale_lock_from_dead_pid_is_replaced() {
        let dir = tempdir().expect("create tempdir");
        let dirs = HermesDirs::new(dir.path());
        dirs.ensure().expect("ensure layout");

        // A spawned-and-reaped child gives a PID that is definitely dead.
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn child");
        let dead_pid = child.id();
        child.wait().expect("reap child");

        let mut stale = RunLock::starting("parallel");
        stale.pid = dead_pid;
        write_lock(&dirs, &stale).expect("seed stale lock");

        let fresh = RunLock::starting("sequential");
        acquire_lock(&dirs, &fresh).expect("stale lock should be replaceable");

        let read = read_lock(&dirs)
            .expect("read lock")
            .expect("lock should exist");
        assert_eq!(read.pid, std::process::id());
    }

    #[test]
    fn current_process_pid_reads_as_alive() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[test]
    fn log_line_appends_timestamped_entries() {
        let dir = tempdir().expect("create tempdir");
        let dirs = HermesDirs::new(dir.path());
        dirs.ensure().expect("ensure layout");

        dirs.log_line("first").expect("write first");
        dirs.log_line("second").expect("write second");

        let content = fs::read_to_string(&dirs.main_log_file).expect("read log");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] first"));
        assert!(lines[1].ends_with("] second"));
    }
}
