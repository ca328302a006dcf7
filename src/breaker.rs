use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};

// ── States ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Monitoring: one more no-progress loop opens the circuit.
    HalfOpen,
    /// Halted: only `reset` rearms the loop.
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
            CircuitState::Open => write!(f, "OPEN"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// No-progress loops before CLOSED → HALF_OPEN.
    pub half_open_threshold: u32,
    /// No-progress loops before HALF_OPEN → OPEN.
    pub open_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            half_open_threshold: 2,
            open_threshold: 3,
        }
    }
}

// ── Persistent state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BreakerState {
    state: CircuitState,
    consecutive_no_progress: u32,
    consecutive_same_error: u32,
    loop_number: u32,
    last_progress_loop: u32,
    total_opens: u32,
    last_reason: Option<String>,
    last_transition_at: DateTime<Utc>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_no_progress: 0,
            consecutive_same_error: 0,
            loop_number: 0,
            last_progress_loop: 0,
            total_opens: 0,
            last_reason: None,
            last_transition_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: CircuitState,
    pub to: CircuitState,
    pub loop_number: u32,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Transition history is capped to the most recent entries.
const HISTORY_CAP: usize = 50;

// ── Breaker ───────────────────────────────────────────────────────────────────

/// Stagnation guard for the agent loop. State survives process restarts via
/// `.circuit_breaker_state`; transitions append to `.circuit_breaker_history`.
pub struct CircuitBreaker {
    state_path: PathBuf,
    history_path: PathBuf,
    config: BreakerConfig,
    state: BreakerState,
}

impl CircuitBreaker {
    /// Load persisted state if present, else start CLOSED.
    pub fn load(state_path: &Path, history_path: &Path, config: BreakerConfig) -> Result<Self> {
        let state = if state_path.exists() {
            let content = std::fs::read_to_string(state_path)
                .with_context(|| format!("Cannot read {}", state_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Cannot parse {}", state_path.display()))?
        } else {
            BreakerState::default()
        };
        Ok(Self {
            state_path: state_path.to_path_buf(),
            history_path: history_path.to_path_buf(),
            config,
            state,
        })
    }

    pub fn state(&self) -> CircuitState {
        self.state.state
    }

    /// False only in OPEN.
    pub fn can_execute(&self) -> bool {
        self.state.state != CircuitState::Open
    }

    pub fn should_halt(&self) -> bool {
        !self.can_execute()
    }

    pub fn consecutive_no_progress(&self) -> u32 {
        self.state.consecutive_no_progress
    }

    pub fn consecutive_same_error(&self) -> u32 {
        self.state.consecutive_same_error
    }

    /// Fold one loop's outcome into the state machine and persist.
    pub fn add_loop_result(
        &mut self,
        has_progress: bool,
        has_errors: bool,
        loop_number: u32,
    ) -> Result<CircuitState> {
        self.state.loop_number = loop_number;

        if has_errors {
            self.state.consecutive_same_error += 1;
        } else {
            self.state.consecutive_same_error = 0;
        }

        let from = self.state.state;
        if from != CircuitState::Open {
            if has_progress {
                self.state.consecutive_no_progress = 0;
                self.state.last_progress_loop = loop_number;
                self.transition(from, CircuitState::Closed, loop_number, "progress observed")?;
            } else {
                self.state.consecutive_no_progress += 1;
                let n = self.state.consecutive_no_progress;
                let to = if n >= self.config.open_threshold {
                    CircuitState::Open
                } else if n >= self.config.half_open_threshold {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Closed
                };
                let reason = format!("{n} consecutive loops without progress");
                self.transition(from, to, loop_number, &reason)?;
            }
        }

        self.persist()?;
        Ok(self.state.state)
    }

    /// Return to CLOSED and zero the counters. The only way out of OPEN.
    pub fn reset(&mut self, reason: &str) -> Result<()> {
        let from = self.state.state;
        self.state.consecutive_no_progress = 0;
        self.state.consecutive_same_error = 0;
        self.transition(from, CircuitState::Closed, self.state.loop_number, reason)?;
        self.persist()
    }

    fn transition(
        &mut self,
        from: CircuitState,
        to: CircuitState,
        loop_number: u32,
        reason: &str,
    ) -> Result<()> {
        if from == to {
            return Ok(());
        }
        self.state.state = to;
        self.state.last_transition_at = Utc::now();
        self.state.last_reason = Some(reason.to_string());
        if to == CircuitState::Open {
            self.state.total_opens += 1;
        }
        self.append_history(TransitionRecord {
            from,
            to,
            loop_number,
            reason: reason.to_string(),
            at: self.state.last_transition_at,
        })
    }

    fn persist(&self) -> Result<()> {
        let content =
            serde_json::to_string_pretty(&self.state).context("Failed to serialise breaker state")?;
        write_atomic(&self.state_path, &content)
    }

    fn append_history(&self, record: TransitionRecord) -> Result<()> {
        let mut history = self.read_history()?;
        history.push(record);
        if history.len() > HISTORY_CAP {
            let excess = history.len() - HISTORY_CAP;
            history.drain(..excess);
        }
        let content =
            serde_json::to_string_pretty(&history).context("Failed to serialise breaker history")?;
        write_atomic(&self.history_path, &content)
    }

    pub fn read_history(&self) -> Result<Vec<TransitionRecord>> {
        if !self.history_path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.history_path)
            .with_context(|| format!("Cannot read {}", self.history_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Cannot parse {}", self.history_path.display()))
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(content.as_bytes())
        .context("Failed to write breaker temp file")?;
    tmp.as_file()
        .sync_all()
        .context("Failed to fsync breaker temp file")?;
    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("Failed to atomically replace {}: {}", path.display(), e))?;
    Ok(())
}
