use anyhow::Result;
use std::path::Path;
use tokio::process::Command;

use super::{Agent, AgentProcess};

/// Claude Code backend. `-p -` makes the CLI read the prompt from stdin,
/// which the shared spawn path pipes in.
pub struct ClaudeAgent {
    model: Option<String>,
}

impl ClaudeAgent {
    pub fn new(model: Option<String>) -> Self {
        Self { model }
    }
}

impl Agent for ClaudeAgent {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn is_available(&self) -> bool {
        super::check_binary_available("claude")
    }

    fn spawn(&self, prompt: &str, workdir: &Path) -> Result<AgentProcess> {
        let mut cmd = Command::new("claude");
        cmd.args(["--dangerously-skip-permissions", "--print", "-p", "-"]);
        if let Some(ref model) = self.model {
            cmd.arg("--model").arg(model);
        }
        super::spawn_with_prompt(cmd, prompt, workdir, "claude")
    }
}
