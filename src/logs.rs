//! `hermes logs [--follow]` — print or tail the main log file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::time::{interval, Duration};

use crate::cli::LogsArgs;
use crate::state::HermesDirs;

pub async fn show_logs(args: LogsArgs) -> Result<()> {
    let workdir = resolve_workdir(args.workdir.as_deref())?;
    let dirs = HermesDirs::new(&workdir);

    if !dirs.main_log_file.exists() {
        anyhow::bail!(
            "No log file at {}. Has a hermes run happened here?",
            dirs.main_log_file.display()
        );
    }

    if args.follow {
        follow_log(&dirs.main_log_file).await
    } else {
        dump_tail(&dirs.main_log_file, args.lines).await
    }
}

fn resolve_workdir(workdir: Option<&Path>) -> Result<PathBuf> {
    workdir
        .unwrap_or_else(|| Path::new("."))
        .canonicalize()
        .context("Cannot resolve workdir — does it exist?")
}

/// Print the last `lines` lines of the log.
async fn dump_tail(path: &Path, lines: usize) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Cannot read {}", path.display()))?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    for line in &all[start..] {
        println!("{line}");
    }
    Ok(())
}

/// Tail the log, printing new content as it is appended.
async fn follow_log(path: &Path) -> Result<()> {
    println!("Following {} (Ctrl-C to stop)", path.display());

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Cannot open {}", path.display()))?;
    let mut buf = Vec::new();
    let mut ticker = interval(Duration::from_millis(200));

    // Print what exists, then poll for growth.
    loop {
        ticker.tick().await;
        buf.clear();
        let n = file.read_to_end(&mut buf).await.unwrap_or(0);
        if n > 0 {
            let chunk = String::from_utf8_lossy(&buf[..n]);
            print!("{chunk}");
            use std::io::Write as _;
            let _ = std::io::stdout().flush();
        }
    }
}
