use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

use crate::tasks::{Task, TaskId};

pub const TASK_START: &str = "<!-- HERMES_TASK_START -->";
pub const TASK_END: &str = "<!-- HERMES_TASK_END -->";

const DEFAULT_PROMPT: &str = r#"# Project Instructions

You are an expert software engineer working inside this repository. Implement
the task injected below, keeping the existing code style and running the test
suite when one exists.

When you finish an iteration, end your output with this exact trailer:

```
---HERMES_STATUS---
STATUS: IN_PROGRESS | COMPLETE | BLOCKED
EXIT_SIGNAL: true | false
RECOMMENDATION: <one line>
---END_HERMES_STATUS---
```

Set STATUS to COMPLETE only when every success criterion of the current task
is genuinely met. Set EXIT_SIGNAL to true only when the whole plan needs no
further work.
"#;

/// Owns `PROMPT.md`: the prompt file piped to the agent on every iteration.
/// A single delimited task block is inserted, replaced, and removed here.
pub struct PromptInjector {
    prompt_file: PathBuf,
    backups_dir: PathBuf,
}

impl PromptInjector {
    pub fn new(prompt_file: &Path, backups_dir: &Path) -> Self {
        Self {
            prompt_file: prompt_file.to_path_buf(),
            backups_dir: backups_dir.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.prompt_file
    }

    /// Create the default prompt file if it does not exist yet.
    pub fn ensure_default(&self) -> Result<()> {
        if self.prompt_file.exists() {
            return Ok(());
        }
        if let Some(parent) = self.prompt_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.prompt_file, DEFAULT_PROMPT)
            .with_context(|| format!("Failed to write {}", self.prompt_file.display()))?;
        Ok(())
    }

    fn read(&self) -> Result<String> {
        fs::read_to_string(&self.prompt_file)
            .with_context(|| format!("Cannot read {}", self.prompt_file.display()))
    }

    fn write(&self, content: &str) -> Result<()> {
        fs::write(&self.prompt_file, content)
            .with_context(|| format!("Cannot write {}", self.prompt_file.display()))
    }

    /// Insert (or replace) the delimited task block. Idempotent: the file
    /// holds exactly one block at any time. The block goes immediately after
    /// the first top-level heading if one exists, else at the top.
    pub fn add_task(&self, task: &Task) -> Result<()> {
        self.ensure_default()?;
        let content = self.read()?;
        let without = strip_block(&content);
        let block = render_task_block(task);

        let mut lines: Vec<&str> = without.lines().collect();
        let insert_at = lines
            .iter()
            .position(|l| l.starts_with("# "))
            .map(|i| i + 1)
            .unwrap_or(0);

        let mut out = String::new();
        for (i, line) in lines.iter().enumerate() {
            if i == insert_at {
                if i > 0 {
                    out.push('\n');
                }
                out.push_str(&block);
                out.push('\n');
            }
            out.push_str(line);
            out.push('\n');
        }
        if insert_at >= lines.len() {
            // Empty file or heading on the last line.
            if !lines.is_empty() {
                out.push('\n');
            }
            out.push_str(&block);
            out.push('\n');
        }
        self.write(&collapse_blank_runs(&out))
    }

    /// Strip the task block and collapse consecutive blank lines left behind.
    pub fn remove_task(&self) -> Result<()> {
        if !self.prompt_file.exists() {
            return Ok(());
        }
        let content = self.read()?;
        self.write(&collapse_blank_runs(&strip_block(&content)))
    }

    /// The task id currently inside the block, if a block is present.
    pub fn current_task_id(&self) -> Result<Option<TaskId>> {
        if !self.prompt_file.exists() {
            return Ok(None);
        }
        let content = self.read()?;
        let Some(block) = extract_block(&content) else {
            return Ok(None);
        };
        Ok(block
            .lines()
            .find_map(|l| l.trim().strip_prefix("**Task ID:**"))
            .and_then(|v| v.trim().parse::<TaskId>().ok()))
    }

    /// Copy the prompt file to a timestamped backup under `.hermes/backups/`.
    pub fn backup(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.backups_dir)
            .with_context(|| format!("Failed to create {}", self.backups_dir.display()))?;
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let dest = self.backups_dir.join(format!("PROMPT-{stamp}.md"));
        fs::copy(&self.prompt_file, &dest)
            .with_context(|| format!("Failed to back up prompt to {}", dest.display()))?;
        Ok(dest)
    }

    /// Restore the newest backup over the prompt file.
    #[allow(dead_code)]
    pub fn restore_latest(&self) -> Result<()> {
        let mut backups: Vec<PathBuf> = fs::read_dir(&self.backups_dir)
            .with_context(|| format!("Cannot read {}", self.backups_dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("PROMPT-") && n.ends_with(".md"))
            })
            .collect();
        backups.sort();
        let latest = backups
            .pop()
            .context("No prompt backups found to restore")?;
        fs::copy(&latest, &self.prompt_file)
            .with_context(|| format!("Failed to restore {}", latest.display()))?;
        Ok(())
    }
}

// ── Block rendering & surgery ─────────────────────────────────────────────────

/// Render the delimited block for one task. Also used directly by the worker
/// pool, which composes prompts per isolated workspace instead of editing the
/// shared file.
pub fn render_task_block(task: &Task) -> String {
    let mut b = String::new();
    b.push_str(TASK_START);
    b.push('\n');
    b.push_str("## Current Task\n\n");
    b.push_str(&format!("**Task ID:** {}\n", task.id));
    b.push_str(&format!("**Name:** {}\n", task.name));
    b.push_str(&format!("**Feature:** {}\n", task.feature));
    b.push_str(&format!("**Priority:** {}\n", task.priority));
    if let Some(ref effort) = task.estimated_effort {
        b.push_str(&format!("**Estimated Effort:** {effort}\n"));
    }

    if !task.description.is_empty() {
        b.push_str("\n### Description\n\n");
        b.push_str(&task.description);
        b.push('\n');
    }
    if !task.technical_details.is_empty() {
        b.push_str("\n### Technical Details\n\n");
        b.push_str(&task.technical_details);
        b.push('\n');
    }
    if !task.files_to_touch.is_empty() {
        b.push_str("\n### Files to Touch\n\n");
        for file in &task.files_to_touch {
            let kind = match file.kind {
                crate::tasks::FileTouchKind::New => "new",
                crate::tasks::FileTouchKind::Update => "update",
            };
            b.push_str(&format!("- `{}` ({kind})\n", file.path));
        }
    }
    if !task.depends_on.is_empty() {
        b.push_str("\n### Dependencies\n\n");
        for dep in &task.depends_on {
            b.push_str(&format!("- {dep}\n"));
        }
    }
    if !task.success_criteria.is_empty() {
        b.push_str("\n### Success Criteria\n\n");
        for criterion in &task.success_criteria {
            let mark = if criterion.done { "x" } else { " " };
            b.push_str(&format!("- [{mark}] {}\n", criterion.text));
        }
    }

    b.push_str(
        "\n### Status Report\n\n\
         End your output with:\n\n\
         ```\n\
         ---HERMES_STATUS---\n\
         STATUS: IN_PROGRESS | COMPLETE | BLOCKED\n\
         EXIT_SIGNAL: true | false\n\
         RECOMMENDATION: <one line>\n\
         ---END_HERMES_STATUS---\n\
         ```\n",
    );
    b.push_str(TASK_END);
    b
}

fn extract_block(content: &str) -> Option<&str> {
    let start = content.find(TASK_START)?;
    let end = content[start..].find(TASK_END)? + start + TASK_END.len();
    Some(&content[start..end])
}

fn strip_block(content: &str) -> String {
    let Some(start) = content.find(TASK_START) else {
        return content.to_string();
    };
    let Some(end_rel) = content[start..].find(TASK_END) else {
        return content.to_string();
    };
    let end = start + end_rel + TASK_END.len();
    let mut out = String::with_capacity(content.len());
    out.push_str(&content[..start]);
    out.push_str(&content[end..]);
    out
}

/// Collapse runs of more than one blank line into a single blank line.
fn collapse_blank_runs(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut blank_run = 0usize;
    for line in content.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{Criterion, FileTouch, FileTouchKind, Priority, TaskStatus};
    use crate::tasks::{FeatureId, TaskId};
    use tempfile::tempdir;

    fn sample_task() -> Task {
        Task {
            id: TaskId(2),
            feature: FeatureId(1),
            name: "Login endpoint".to_string(),
            status: TaskStatus::NotStarted,
            priority: Priority::P2,
            estimated_effort: Some("3 hours".to_string()),
            description: "POST /login issuing a session cookie.".to_string(),
            technical_details: "Argon2 for password verification.".to_string(),
            files_to_touch: vec![FileTouch {
                path: "src/routes/login.rs".to_string(),
                kind: FileTouchKind::New,
            }],
            depends_on: vec![TaskId(1)],
            success_criteria: vec![Criterion {
                text: "Valid credentials create a session".to_string(),
                done: false,
            }],
            parallelizable: false,
            exclusive_files: vec![],
        }
    }

    fn injector(dir: &std::path::Path) -> PromptInjector {
        PromptInjector::new(&dir.join("PROMPT.md"), &dir.join("backups"))
    }

    #[test]
    fn ensure_default_writes_prompt_with_status_trailer_format() {
        let dir = tempdir().expect("create tempdir");
        let inj = injector(dir.path());

        inj.ensure_default().expect("ensure default");
        let content = std::fs::read_to_string(inj.path()).expect("read prompt");
        assert!(content.contains("---HERMES_STATUS---"));
        assert!(content.contains("---END_HERMES_STATUS---"));

        // A second call leaves the file alone.
        std::fs::write(inj.path(), "# Custom\n").expect("overwrite");
        inj.ensure_default().expect("ensure default again");
        let content = std::fs::read_to_string(inj.path()).expect("read prompt");
        assert_eq!(content, "# Custom\n");
    }

    #[test]
    fn add_task_inserts_block_after_first_heading() {
        let dir = tempdir().expect("create tempdir");
        let inj = injector(dir.path());
        std::fs::write(inj.path(), "# Project Instructions\n\nDo good work.\n")
            .expect("seed prompt");

        inj.add_task(&sample_task()).expect("add task");

        let content = std::fs::read_to_string(inj.path()).expect("read prompt");
        let heading_pos = content.find("# Project Instructions").expect("heading");
        let block_pos = content.find(TASK_START).expect("block start");
        let body_pos = content.find("Do good work.").expect("body");
        assert!(heading_pos < block_pos, "block goes after the heading");
        assert!(block_pos < body_pos, "block goes before the old body");
        assert!(content.contains("**Task ID:** T002"));
        assert!(content.contains("- `src/routes/login.rs` (new)"));
        assert!(content.contains("- [ ] Valid credentials create a session"));
    }

    #[test]
    fn add_task_without_heading_inserts_at_top() {
        let dir = tempdir().expect("create tempdir");
        let inj = injector(dir.path());
        std::fs::write(inj.path(), "just some prose\n").expect("seed prompt");

        inj.add_task(&sample_task()).expect("add task");

        let content = std::fs::read_to_string(inj.path()).expect("read prompt");
        let block_pos = content.find(TASK_START).expect("block start");
        let prose_pos = content.find("just some prose").expect("prose");
        assert!(block_pos < prose_pos);
    }

    #[test]
    fn add_task_replaces_existing_block() {
        let dir = tempdir().expect("create tempdir");
        let inj = injector(dir.path());
        inj.ensure_default().expect("ensure default");

        inj.add_task(&sample_task()).expect("add first");
        let mut other = sample_task();
        other.id = TaskId(3);
        other.name = "Password reset".to_string();
        inj.add_task(&other).expect("add second");

        let content = std::fs::read_to_string(inj.path()).expect("read prompt");
        assert_eq!(content.matches(TASK_START).count(), 1, "exactly one block");
        assert!(content.contains("**Task ID:** T003"));
        assert!(!content.contains("**Task ID:** T002"));
    }

    #[test]
    fn remove_task_strips_block_and_collapses_blanks() {
        let dir = tempdir().expect("create tempdir");
        let inj = injector(dir.path());
        std::fs::write(inj.path(), "# Project Instructions\n\nDo good work.\n")
            .expect("seed prompt");

        inj.add_task(&sample_task()).expect("add task");
        inj.remove_task().expect("remove task");

        let content = std::fs::read_to_string(inj.path()).expect("read prompt");
        assert!(!content.contains(TASK_START));
        assert!(!content.contains("**Task ID:**"));
        assert!(!content.contains("\n\n\n"), "no blank-line runs remain");
        assert!(content.contains("Do good work."));
    }

    #[test]
    fn current_task_id_reads_block_or_none() {
        let dir = tempdir().expect("create tempdir");
        let inj = injector(dir.path());
        inj.ensure_default().expect("ensure default");

        assert_eq!(inj.current_task_id().expect("query"), None);
        inj.add_task(&sample_task()).expect("add task");
        assert_eq!(inj.current_task_id().expect("query"), Some(TaskId(2)));
        inj.remove_task().expect("remove task");
        assert_eq!(inj.current_task_id().expect("query"), None);
    }

    #[test]
    fn backup_and_restore_latest_round_trip() {
        let dir = tempdir().expect("create tempdir");
        let inj = injector(dir.path());
        std::fs::write(inj.path(), "version one\n").expect("seed prompt");

        inj.backup().expect("backup");
        std::fs::write(inj.path(), "version two\n").expect("overwrite");

        inj.restore_latest().expect("restore");
        let content = std::fs::read_to_string(inj.path()).expect("read prompt");
        assert_eq!(content, "version one\n");
    }
}
