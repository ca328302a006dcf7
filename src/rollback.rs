use anyhow::{Context, Result};
use std::path::Path;

use crate::git::GitManager;
use crate::tasks::TaskId;

/// Pre-run snapshot plus the task branches created since, enough to restore
/// the repository after a partially failed parallel run.
#[derive(Debug, Clone)]
pub struct RollbackPlan {
    /// Name of the main branch at capture time.
    pub main_branch: String,
    /// HEAD of the main branch before execution began.
    pub initial_commit: String,
    records: Vec<BranchRecord>,
}

#[derive(Debug, Clone)]
struct BranchRecord {
    task_id: TaskId,
    branch: String,
}

impl RollbackPlan {
    /// Snapshot the main branch HEAD before any parallel work starts.
    pub async fn capture(git: &GitManager) -> Result<Self> {
        let main_branch = git.default_branch().await?;
        let initial_commit = git
            .head_commit()
            .await
            .context("Cannot snapshot HEAD for rollback")?;
        Ok(Self {
            main_branch,
            initial_commit,
            records: Vec::new(),
        })
    }

    /// Record a task branch created during the run.
    pub fn record_branch(&mut self, task_id: TaskId, branch: &str) {
        if !self.records.iter().any(|r| r.branch == branch) {
            self.records.push(BranchRecord {
                task_id,
                branch: branch.to_string(),
            });
        }
    }

    pub fn recorded_branches(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.branch.as_str()).collect()
    }

    /// Operator-approved rollback: remove worktrees first (forced, so no
    /// orphaned working trees survive), then delete the task branches, then
    /// hard-reset the main branch to the snapshot.
    pub async fn rollback(&self, git: &GitManager, worktrees_dir: &Path) -> Result<()> {
        for record in &self.records {
            let worktree = worktrees_dir.join(record.task_id.to_string());
            if worktree.exists() {
                git.remove_worktree(&worktree)
                    .await
                    .with_context(|| format!("removing worktree for {}", record.task_id))?;
            }
        }
        git.prune_worktrees().await.ok();

        for record in &self.records {
            if let Err(e) = git.delete_branch(&record.branch).await {
                // Already-merged or never-created branches are not fatal.
                eprintln!("⚠️  Could not delete {}: {e:#}", record.branch);
            }
        }

        git.checkout(&self.main_branch).await?;
        git.reset_hard(&self.initial_commit)
            .await
            .with_context(|| format!("resetting {} to {}", self.main_branch, self.initial_commit))?;
        Ok(())
    }

    /// Always-run exit path: clear leftover worktrees and prune, keeping
    /// branches and history intact for inspection.
    pub async fn cleanup(&self, git: &GitManager, worktrees_dir: &Path) {
        for record in &self.records {
            let worktree = worktrees_dir.join(record.task_id.to_string());
            if worktree.exists() {
                if let Err(e) = git.remove_worktree(&worktree).await {
                    eprintln!(
                        "⚠️  Could not remove worktree {}: {e:#}",
                        worktree.display()
                    );
                }
            }
        }
        let _ = git.prune_worktrees().await;
    }
}
