use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;

use crate::tasks::{FeatureId, TaskId};

/// Where the loop left off, persisted to `run-state.md` before every task so
/// an interrupted run resumes on the task it was executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    /// `IN_PROGRESS` while the loop runs, `COMPLETED` when the plan finished.
    pub status: RunStatus,
    pub current_feature: Option<FeatureId>,
    pub current_branch: Option<String>,
    pub current_task: Option<TaskId>,
    pub next_task: Option<TaskId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    InProgress,
    Completed,
}

impl RunStatus {
    fn as_str(self) -> &'static str {
        match self {
            RunStatus::InProgress => "IN_PROGRESS",
            RunStatus::Completed => "COMPLETED",
        }
    }
}

impl RunState {
    pub fn completed() -> Self {
        Self {
            status: RunStatus::Completed,
            current_feature: None,
            current_branch: None,
            current_task: None,
            next_task: None,
        }
    }
}

fn field_or_none<T: std::fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "None".to_string(),
    }
}

pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    let content = format!(
        "# Run State\n\n\
         **Status:** {}\n\
         **Current Feature:** {}\n\
         **Current Branch:** {}\n\
         **Current Task:** {}\n\
         **Next Task:** {}\n\
         **Updated:** {}\n",
        state.status.as_str(),
        field_or_none(&state.current_feature),
        field_or_none(&state.current_branch),
        field_or_none(&state.current_task),
        field_or_none(&state.next_task),
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
    );
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn read_run_state(path: &Path) -> Result<Option<RunState>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;

    let mut state = RunState {
        status: RunStatus::Completed,
        current_feature: None,
        current_branch: None,
        current_task: None,
        next_task: None,
    };
    let value = |line: &str, label: &str| -> Option<String> {
        line.trim_start()
            .strip_prefix(label)
            .map(str::trim)
            .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("none"))
            .map(str::to_string)
    };

    for line in content.lines() {
        if let Some(v) = value(line, "**Status:**") {
            if v.eq_ignore_ascii_case("IN_PROGRESS") {
                state.status = RunStatus::InProgress;
            }
        } else if let Some(v) = value(line, "**Current Feature:**") {
            state.current_feature = v.parse().ok();
        } else if let Some(v) = value(line, "**Current Branch:**") {
            state.current_branch = Some(v);
        } else if let Some(v) = value(line, "**Current Task:**") {
            state.current_task = v.parse().ok();
        } else if let Some(v) = value(line, "**Next Task:**") {
            state.next_task = v.parse().ok();
        }
    }
    Ok(Some(state))
}

/// The task to resume from: set only when an interrupted run recorded an
/// in-progress checkpoint with a known next task.
pub fn resume_task(path: &Path) -> Option<TaskId> {
    let state = read_run_state(path).ok().flatten()?;
    if state.status == RunStatus::InProgress {
        state.next_task
    } else {
        None
    }
}
