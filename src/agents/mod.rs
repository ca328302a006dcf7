mod claude;
mod droid;
mod gemini;

pub use claude::ClaudeAgent;
pub use droid::DroidAgent;
pub use gemini::GeminiAgent;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

// ── Provider set ──────────────────────────────────────────────────────────────

/// The closed set of supported agent CLIs. `auto` is a selector, not a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Claude,
    Droid,
    Gemini,
}

impl ProviderKind {
    /// Declared order: `auto` picks the first of these found on PATH.
    pub const ALL: [ProviderKind; 3] =
        [ProviderKind::Claude, ProviderKind::Droid, ProviderKind::Gemini];

    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Droid => "droid",
            ProviderKind::Gemini => "gemini",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(ProviderKind::Claude),
            "droid" => Ok(ProviderKind::Droid),
            "gemini" => Ok(ProviderKind::Gemini),
            other => anyhow::bail!(
                "Unknown agent '{}'. Supported agents: claude, droid, gemini, auto",
                other
            ),
        }
    }
}

/// A spawned agent process with attached stdio handles. The child runs in its
/// own process group so cancellation can kill the whole tree.
pub struct AgentProcess {
    pub child: Child,
}

/// Capability interface implemented by every agent backend.
///
/// `spawn` is intentionally synchronous — tokio's `Command::spawn()` doesn't
/// need to be awaited. Only waiting for the child and reading its output are
/// async.
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;

    /// Return `true` if the agent binary is on PATH and appears runnable.
    fn is_available(&self) -> bool;

    /// Spawn the agent with the prompt piped on stdin, returning the live
    /// process handle.
    fn spawn(&self, prompt: &str, workdir: &Path) -> Result<AgentProcess>;
}

/// Check if an agent binary is reachable by trying to run it directly.
/// This avoids shelling out to `which` (which may not be on PATH itself,
/// or may see a different PATH than the current process).
pub fn check_binary_available(name: &str) -> bool {
    std::process::Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Common spawn path for every backend: run the prepared command in its own
/// process group with all stdio piped, then feed the prompt to stdin from a
/// background task and close the pipe. Prompts go over stdin instead of argv
/// so large task blocks never hit the OS ARG_MAX limit.
fn spawn_with_prompt(
    mut cmd: Command,
    prompt: &str,
    workdir: &Path,
    binary: &str,
) -> Result<AgentProcess> {
    cmd.current_dir(workdir)
        .process_group(0)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {binary} — is it installed and on PATH?"))?;

    let mut stdin = child
        .stdin
        .take()
        .with_context(|| format!("{binary} stdin pipe missing"))?;
    let prompt_bytes = prompt.as_bytes().to_vec();
    tokio::spawn(async move {
        let _ = stdin.write_all(&prompt_bytes).await;
        let _ = stdin.shutdown().await;
    });

    Ok(AgentProcess { child })
}

fn create_provider(kind: ProviderKind) -> Box<dyn Agent> {
    match kind {
        ProviderKind::Claude => Box::new(ClaudeAgent::new(None)),
        ProviderKind::Droid => Box::new(DroidAgent::new(None)),
        ProviderKind::Gemini => Box::new(GeminiAgent::new(None)),
    }
}

/// Resolve a provider name (`claude`/`droid`/`gemini`) or `auto`, which picks
/// the first available provider in declared order.
pub fn resolve_provider(name: &str) -> Result<Box<dyn Agent>> {
    if name.trim().eq_ignore_ascii_case("auto") {
        for kind in ProviderKind::ALL {
            let agent = create_provider(kind);
            if agent.is_available() {
                return Ok(agent);
            }
        }
        let names: Vec<&str> = ProviderKind::ALL.iter().map(|k| k.name()).collect();
        anyhow::bail!("No agent found on PATH. Install one of: {}.", names.join(", "));
    }
    let kind: ProviderKind = name.parse()?;
    Ok(create_provider(kind))
}

// ── Execution ─────────────────────────────────────────────────────────────────

/// Marker error for cooperative cancellation. Retry loops must not retry it.
#[derive(Debug)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.is::<Cancelled>()
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub prompt: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// How long a child gets to exit after SIGTERM before the hard kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Stop the agent's whole process group: SIGTERM first, a grace window for a
/// clean exit, then SIGKILL for whatever is still alive. The child is reaped
/// before returning.
async fn terminate_group(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already exited (or never had a pid); make sure it is reaped.
        let _ = child.start_kill();
        let _ = child.wait().await;
        return;
    };
    let group = Pid::from_raw(pid as i32);

    let _ = killpg(group, Signal::SIGTERM);
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = killpg(group, Signal::SIGKILL);
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

async fn wait_for_cancel(flag: Option<Arc<AtomicBool>>) {
    match flag {
        Some(flag) => {
            while !flag.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        // No flag: never resolves, the other select arms win.
        None => std::future::pending().await,
    }
}

/// Run the agent to completion, collecting stdout and stderr concurrently so
/// neither pipe fills its kernel buffer and deadlocks the child.
///
/// Enforces the soft deadline in `opts.timeout` and honors the cancel flag;
/// both paths SIGKILL the child's process group.
pub async fn execute(
    agent: &dyn Agent,
    opts: &ExecOptions,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<ExecResult> {
    let started = Instant::now();
    let mut proc = agent.spawn(&opts.prompt, &opts.workdir)?;

    let stdout_pipe = proc
        .child
        .stdout
        .take()
        .context("Agent stdout pipe missing")?;
    let stderr_pipe = proc
        .child
        .stderr
        .take()
        .context("Agent stderr pipe missing")?;

    let stdout_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stdout_pipe).lines();
        let mut collected = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push_str(&line);
            collected.push('\n');
        }
        collected
    });
    let stderr_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stderr_pipe).lines();
        let mut collected = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push_str(&line);
            collected.push('\n');
        }
        collected
    });

    let outcome: Result<std::process::ExitStatus> = tokio::select! {
        result = proc.child.wait() => {
            result.context("Error waiting for agent process")
        }
        _ = tokio::time::sleep(opts.timeout) => {
            terminate_group(&mut proc.child).await;
            Err(anyhow::anyhow!(
                "Agent '{}' timed out after {}s",
                agent.name(),
                opts.timeout.as_secs()
            ))
        }
        _ = wait_for_cancel(cancel.clone()) => {
            terminate_group(&mut proc.child).await;
            Err(anyhow::Error::new(Cancelled))
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let status = outcome?;

    Ok(ExecResult {
        success: status.success(),
        stdout,
        stderr,
        duration: started.elapsed(),
    })
}

// ── Streaming ─────────────────────────────────────────────────────────────────

/// One event in the agent's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A line of stdout.
    Text(String),
    /// A line of stderr.
    ErrorLine(String),
    /// Child exited; the stream ends after this event.
    Done { success: bool },
}

/// Spawn the agent and return a lazy stream of its output. The producer runs
/// on a background task and closes the channel when the child exits, times
/// out, or cancellation fires.
pub fn execute_stream(
    agent: &dyn Agent,
    opts: ExecOptions,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<mpsc::Receiver<AgentEvent>> {
    let (tx, rx) = mpsc::channel::<AgentEvent>(64);
    let mut proc = agent.spawn(&opts.prompt, &opts.workdir)?;

    let stdout_pipe = proc
        .child
        .stdout
        .take()
        .context("Agent stdout pipe missing")?;
    let stderr_pipe = proc
        .child
        .stderr
        .take()
        .context("Agent stderr pipe missing")?;

    let out_tx = tx.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stdout_pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if out_tx.send(AgentEvent::Text(line)).await.is_err() {
                break;
            }
        }
    });
    let err_tx = tx.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stderr_pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if err_tx.send(AgentEvent::ErrorLine(line)).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let success = tokio::select! {
            result = proc.child.wait() => {
                result.map(|s| s.success()).unwrap_or(false)
            }
            _ = tokio::time::sleep(opts.timeout) => {
                terminate_group(&mut proc.child).await;
                false
            }
            _ = wait_for_cancel(cancel) => {
                terminate_group(&mut proc.child).await;
                false
            }
        };
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        let _ = tx.send(AgentEvent::Done { success }).await;
        // tx drops here, closing the channel.
    });

    Ok(rx)
}

// ── Retry ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

/// Run `execute` with a fixed delay between attempts. Cancellation is never
/// retried; any other error is, up to `max_retries` additional attempts.
pub async fn execute_with_retry(
    agent: &dyn Agent,
    opts: &ExecOptions,
    policy: RetryPolicy,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<ExecResult> {
    let mut attempt = 0u32;
    loop {
        match execute(agent, opts, cancel.clone()).await {
            Ok(result) => return Ok(result),
            Err(e) if is_cancelled(&e) => return Err(e),
            Err(e) => {
                if attempt >= policy.max_retries {
                    return Err(e.context(format!(
                        "agent '{}' failed after {} attempts",
                        agent.name(),
                        attempt + 1
                    )));
                }
                attempt += 1;
                eprintln!(
                    "⚠️  Agent attempt {attempt} failed: {e:#}. Retrying in {}s…",
                    policy.delay.as_secs()
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}
