use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Hermes — drives AI coding agents through a Markdown task plan
#[derive(Parser, Debug)]
#[command(name = "hermes", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the .hermes/ skeleton, default config and prompt file
    Init(InitArgs),
    /// Run the agent loop over the task plan
    Run(RunArgs),
    /// Show plan progress and any active run
    Status(StatusArgs),
    /// Reset the circuit breaker so a halted loop can resume
    Reset(ResetArgs),
    /// Print or follow the main log
    Logs(LogsArgs),
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Project directory (defaults to current directory)
    #[arg(long)]
    pub workdir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Create/check out a feature branch per feature (--auto-branch=false to disable)
    #[arg(long, num_args = 0..=1, default_missing_value = "true", default_value_t = true)]
    pub auto_branch: bool,

    /// Commit completed tasks automatically (--auto-commit=false to disable)
    #[arg(long, num_args = 0..=1, default_missing_value = "true", default_value_t = true)]
    pub auto_commit: bool,

    /// Keep looping without waiting for operator input between tasks
    #[arg(long, num_args = 0..=1, default_missing_value = "true", default_value_t = true)]
    pub autonomous: bool,

    /// Per-task agent timeout in seconds
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,

    /// Agent to use: claude, droid, gemini, or auto
    #[arg(long = "ai", default_value = "claude")]
    pub ai: String,

    /// Execute independent tasks in parallel workers
    #[arg(long)]
    pub parallel: bool,

    /// Number of parallel workers
    #[arg(long, default_value_t = 3)]
    pub workers: usize,

    /// Show the execution plan without invoking any agent
    #[arg(long)]
    pub dry_run: bool,

    /// Verbose diagnostics
    #[arg(long)]
    pub debug: bool,

    /// Project directory (defaults to current directory)
    #[arg(long)]
    pub workdir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Project directory (defaults to current directory)
    #[arg(long)]
    pub workdir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// Reason recorded in the breaker history
    #[arg(long, default_value = "operator reset")]
    pub reason: String,

    /// Project directory (defaults to current directory)
    #[arg(long)]
    pub workdir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Follow (tail) the log in real time
    #[arg(long, short)]
    pub follow: bool,

    /// Number of trailing lines to print
    #[arg(long, default_value_t = 50)]
    pub lines: usize,

    /// Project directory (defaults to current directory)
    #[arg(long)]
    pub workdir: Option<PathBuf>,
}
