use anyhow::Result;
use std::path::Path;
use tokio::process::Command;

use super::{Agent, AgentProcess};

/// Factory Droid backend. The trailing `-` tells `droid exec` to take the
/// task from stdin.
pub struct DroidAgent {
    model: Option<String>,
}

impl DroidAgent {
    pub fn new(model: Option<String>) -> Self {
        Self { model }
    }
}

impl Agent for DroidAgent {
    fn name(&self) -> &'static str {
        "droid"
    }

    fn is_available(&self) -> bool {
        super::check_binary_available("droid")
    }

    fn spawn(&self, prompt: &str, workdir: &Path) -> Result<AgentProcess> {
        let mut cmd = Command::new("droid");
        cmd.args(["exec", "--auto"]);
        if let Some(ref model) = self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg("-");
        super::spawn_with_prompt(cmd, prompt, workdir, "droid")
    }
}
