use anyhow::Result;
use std::path::Path;
use tokio::process::Command;

use super::{Agent, AgentProcess};

/// Gemini CLI backend. With no positional prompt the CLI falls back to
/// stdin, so only the approval mode (and an optional model) goes on argv.
pub struct GeminiAgent {
    model: Option<String>,
}

impl GeminiAgent {
    pub fn new(model: Option<String>) -> Self {
        Self { model }
    }
}

impl Agent for GeminiAgent {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn is_available(&self) -> bool {
        super::check_binary_available("gemini")
    }

    fn spawn(&self, prompt: &str, workdir: &Path) -> Result<AgentProcess> {
        let mut cmd = Command::new("gemini");
        cmd.arg("--yolo");
        if let Some(ref model) = self.model {
            cmd.arg("--model").arg(model);
        }
        super::spawn_with_prompt(cmd, prompt, workdir, "gemini")
    }
}
