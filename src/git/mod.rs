use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;

use crate::tasks::{kebab, FeatureId, Task, TaskId};

/// Every git child process is bounded; a wedged git must not hang the loop.
const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// A worktree created for one task: exactly one worker, one branch.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
}

/// Thin async wrapper around the `git` binary for branch, commit, tag and
/// worktree management.
pub struct GitManager {
    workdir: PathBuf,
    default_branch: OnceLock<String>,
}

impl GitManager {
    pub fn new(workdir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            default_branch: OnceLock::new(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    // ── Internal helpers ──────────────────────────────────────────────────────

    async fn run_in(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = tokio::time::timeout(
            GIT_TIMEOUT,
            Command::new("git").args(args).current_dir(dir).output(),
        )
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                GIT_TIMEOUT.as_secs()
            )
        })?
        .with_context(|| format!("Failed to run: git {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git {} failed: {}", args[0], stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        self.run_in(&self.workdir, args).await
    }

    // ── Repo probes ───────────────────────────────────────────────────────────

    /// Return `true` if the workdir is inside a git repository.
    pub async fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .await
            .is_ok()
    }

    /// Return the name of the currently checked-out branch.
    pub async fn current_branch(&self) -> Result<String> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    /// Discover the main branch (`main`, falling back to `master`) once and
    /// cache it for the lifetime of this manager.
    pub async fn default_branch(&self) -> Result<String> {
        if let Some(branch) = self.default_branch.get() {
            return Ok(branch.clone());
        }
        let mut found = None;
        for candidate in ["main", "master"] {
            let rf = format!("refs/heads/{candidate}");
            if self.run(&["show-ref", "--verify", "--quiet", &rf]).await.is_ok() {
                found = Some(candidate.to_string());
                break;
            }
        }
        let branch = found.context("Neither 'main' nor 'master' exists in this repository")?;
        let _ = self.default_branch.set(branch.clone());
        Ok(branch)
    }

    /// Return `true` if the working tree has any uncommitted changes.
    pub async fn has_uncommitted_changes(&self) -> Result<bool> {
        let status = self.run(&["status", "--porcelain"]).await?;
        Ok(!status.trim().is_empty())
    }

    pub async fn head_commit(&self) -> Result<String> {
        self.run(&["rev-parse", "HEAD"]).await
    }

    // ── Branches & commits ────────────────────────────────────────────────────

    /// Branch name for a feature: `feature/F007-<kebab(name, ≤30)>`.
    pub fn feature_branch_name(feature_id: FeatureId, feature_name: &str) -> String {
        format!("feature/{feature_id}-{}", kebab(feature_name, 30))
    }

    /// Check out the feature branch, creating it from the main branch when it
    /// does not exist yet. Tolerates the branch already existing.
    pub async fn create_feature_branch(
        &self,
        feature_id: FeatureId,
        feature_name: &str,
    ) -> Result<String> {
        let branch = Self::feature_branch_name(feature_id, feature_name);
        let rf = format!("refs/heads/{branch}");
        if self.run(&["show-ref", "--verify", "--quiet", &rf]).await.is_ok() {
            self.run(&["checkout", &branch]).await?;
        } else {
            let base = self.default_branch().await?;
            self.run(&["checkout", "-b", &branch, &base]).await?;
        }
        Ok(branch)
    }

    /// Stage every change. Tolerates an empty working tree.
    pub async fn stage_all(&self) -> Result<()> {
        self.run(&["add", "-A"]).await?;
        Ok(())
    }

    /// Stage all changes and create a commit with `message`.
    pub async fn commit_all(&self, message: &str) -> Result<String> {
        self.stage_all().await?;
        self.run(&["commit", "-m", message]).await
    }

    /// Conventional task commit: `feat(T007): <Name> completed`, with a body
    /// listing completed criteria and touched files.
    pub async fn commit_task(&self, task: &Task) -> Result<String> {
        let mut message = format!("feat({}): {} completed", task.id, task.name);

        let done: Vec<&str> = task
            .success_criteria
            .iter()
            .filter(|c| c.done)
            .map(|c| c.text.as_str())
            .collect();
        if !done.is_empty() {
            message.push_str("\n\nCriteria met:\n");
            for criterion in done {
                message.push_str(&format!("- {criterion}\n"));
            }
        }
        if !task.files_to_touch.is_empty() {
            message.push_str("\nFiles:\n");
            for file in &task.files_to_touch {
                message.push_str(&format!("- {}\n", file.path));
            }
        }

        self.stage_all().await?;
        self.run(&["commit", "-m", &message]).await
    }

    /// Non-fast-forward merge of the feature branch into the main branch.
    /// Fails loudly on conflict; the operator resolves.
    pub async fn merge_feature_to_main(
        &self,
        feature_id: FeatureId,
        feature_name: &str,
    ) -> Result<()> {
        let branch = Self::feature_branch_name(feature_id, feature_name);
        let base = self.default_branch().await?;
        self.run(&["checkout", &base]).await?;
        let message = format!("Merge {branch} into {base}");
        self.run(&["merge", "--no-ff", &branch, "-m", &message])
            .await?;
        Ok(())
    }

    /// Non-fast-forward merge of an arbitrary branch into the current one.
    pub async fn merge_branch(&self, branch: &str, message: &str) -> Result<()> {
        self.run(&["merge", "--no-ff", branch, "-m", message]).await?;
        Ok(())
    }

    /// Annotated tag marking a completed feature at its target version.
    pub async fn create_feature_tag(
        &self,
        feature_id: FeatureId,
        feature_name: &str,
        version: &str,
    ) -> Result<()> {
        let message = format!("Feature {feature_id}: {feature_name}");
        self.run(&["tag", "-a", version, "-m", &message]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run(&["branch", "-D", branch]).await?;
        Ok(())
    }

    /// Hard-reset the currently checked-out branch to `commit`.
    pub async fn reset_hard(&self, commit: &str) -> Result<()> {
        self.run(&["reset", "--hard", commit]).await?;
        Ok(())
    }

    pub async fn checkout(&self, branch: &str) -> Result<()> {
        self.run(&["checkout", branch]).await?;
        Ok(())
    }

    // ── Worktrees ─────────────────────────────────────────────────────────────

    /// Create an isolated workspace for one task: a worktree under
    /// `worktrees_dir` on a fresh `task/<id>` branch forked from the main
    /// branch.
    pub async fn create_worktree(&self, worktrees_dir: &Path, task_id: TaskId) -> Result<Worktree> {
        std::fs::create_dir_all(worktrees_dir)
            .with_context(|| format!("Failed to create {}", worktrees_dir.display()))?;

        let branch = format!("task/{task_id}");
        let path = worktrees_dir.join(task_id.to_string());
        let path_str = path.to_string_lossy().to_string();
        let base = self.default_branch().await?;

        let created = self
            .run(&["worktree", "add", &path_str, "-b", &branch, &base])
            .await;
        if let Err(e) = created {
            // The task branch may survive a previous interrupted run; reattach.
            if e.to_string().contains("already exists") {
                self.run(&["worktree", "add", &path_str, &branch]).await?;
            } else {
                return Err(e);
            }
        }

        Ok(Worktree { path, branch })
    }

    /// Remove a worktree (forced: uncommitted leftovers do not block cleanup).
    pub async fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        self.run(&["worktree", "remove", "--force", &path_str])
            .await?;
        Ok(())
    }

    pub async fn prune_worktrees(&self) -> Result<()> {
        self.run(&["worktree", "prune"]).await?;
        Ok(())
    }

    /// `has_uncommitted_changes` for an arbitrary working tree (a worktree).
    pub async fn has_uncommitted_changes_in(&self, dir: &Path) -> Result<bool> {
        let status = self.run_in(dir, &["status", "--porcelain"]).await?;
        Ok(!status.trim().is_empty())
    }

    /// `commit_all` for an arbitrary working tree (a worktree).
    pub async fn commit_all_in(&self, dir: &Path, message: &str) -> Result<String> {
        self.run_in(dir, &["add", "-A"]).await?;
        self.run_in(dir, &["commit", "-m", message]).await
    }
}
