use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::tasks::TaskId;

/// Append-only log streams for a parallel run, under
/// `.hermes/logs/parallel/`: one main log, one log per worker, a merge trail,
/// and the full agent output per task. Writers are synchronized per file.
pub struct ParallelLogger {
    dir: PathBuf,
    files: Mutex<HashMap<String, Arc<Mutex<File>>>>,
}

impl ParallelLogger {
    pub fn new(dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn log_main(&self, message: &str) {
        self.append("hermes-parallel.log", "main", message);
    }

    pub fn log_worker(&self, worker_id: usize, message: &str) {
        self.append(
            &format!("worker-{worker_id}.log"),
            &format!("worker-{worker_id}"),
            message,
        );
    }

    pub fn log_merge(&self, message: &str) {
        self.append("merge.log", "merge", message);
    }

    /// Persist the full agent stdout for one task.
    pub fn write_task_output(&self, task_id: TaskId, output: &str) -> Result<()> {
        let path = self.dir.join(format!("output-{task_id}.log"));
        std::fs::write(&path, output)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn append(&self, file_name: &str, prefix: &str, message: &str) {
        let handle = {
            let mut files = self.files.lock().expect("logger registry poisoned");
            match files.get(file_name) {
                Some(handle) => handle.clone(),
                None => {
                    let opened = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(self.dir.join(file_name));
                    let Ok(file) = opened else {
                        eprintln!("⚠️  Cannot open log file {file_name}");
                        return;
                    };
                    let handle = Arc::new(Mutex::new(file));
                    files.insert(file_name.to_string(), handle.clone());
                    handle
                }
            }
        };

        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let mut file = handle.lock().expect("log file mutex poisoned");
        let _ = writeln!(file, "[{stamp}] [{prefix}] {message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn main_worker_and_merge_streams_go_to_their_own_files() {
        let dir = tempdir().expect("create tempdir");
        let logger = ParallelLogger::new(&dir.path().join("parallel")).expect("create logger");

        logger.log_main("batch 1 starting");
        logger.log_worker(1, "picked up T001");
        logger.log_worker(2, "picked up T002");
        logger.log_merge("merged task/T001");

        let read = |name: &str| {
            std::fs::read_to_string(dir.path().join("parallel").join(name)).expect("read log")
        };
        assert!(read("hermes-parallel.log").contains("[main] batch 1 starting"));
        assert!(read("worker-1.log").contains("[worker-1] picked up T001"));
        assert!(read("worker-2.log").contains("[worker-2] picked up T002"));
        assert!(read("merge.log").contains("[merge] merged task/T001"));
    }

    #[test]
    fn entries_are_timestamped_and_appended_in_order() {
        let dir = tempdir().expect("create tempdir");
        let logger = ParallelLogger::new(dir.path()).expect("create logger");

        logger.log_main("first");
        logger.log_main("second");

        let content =
            std::fs::read_to_string(dir.path().join("hermes-parallel.log")).expect("read log");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['), "entries carry a timestamp prefix");
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
    }

    #[test]
    fn concurrent_writers_do_not_interleave_lines() {
        let dir = tempdir().expect("create tempdir");
        let logger = Arc::new(ParallelLogger::new(dir.path()).expect("create logger"));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let logger = logger.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        logger.log_main(&format!("thread-{i} line-{j}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join writer thread");
        }

        let content =
            std::fs::read_to_string(dir.path().join("hermes-parallel.log")).expect("read log");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 8 * 25);
        for line in lines {
            assert!(
                line.contains("] [main] thread-") && line.contains("line-"),
                "malformed line: {line}"
            );
        }
    }

    #[test]
    fn task_output_is_persisted_whole() {
        let dir = tempdir().expect("create tempdir");
        let logger = ParallelLogger::new(dir.path()).expect("create logger");

        logger
            .write_task_output(TaskId(4), "full stdout\nwith lines\n")
            .expect("write output");

        let content =
            std::fs::read_to_string(dir.path().join("output-T004.log")).expect("read output");
        assert_eq!(content, "full stdout\nwith lines\n");
    }
}
