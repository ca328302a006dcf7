use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

// ── Resolved configuration ────────────────────────────────────────────────────

/// Fully resolved configuration after the layered merge:
/// built-in defaults → `~/.hermes/config.json` → `.hermes/config.json`.
/// CLI flags are applied on top by `main` (flag presence detected through
/// clap's value sources).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub ai: AiConfig,
    pub task_mode: TaskModeConfig,
    pub loop_cfg: LoopConfig,
    pub parallel: ParallelConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AiConfig {
    /// Provider used by plan-generation flows.
    #[allow(dead_code)]
    pub planning: String,
    /// Provider used by the coding loop.
    pub coding: String,
    /// Per-task agent timeout in seconds.
    pub timeout: u64,
    /// Agent timeout for PRD-sized prompts in seconds.
    #[allow(dead_code)]
    pub prd_timeout: u64,
    pub max_retries: u32,
    pub stream_output: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskModeConfig {
    pub auto_branch: bool,
    pub auto_commit: bool,
    pub autonomous: bool,
    pub max_consecutive_errors: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub max_calls_per_hour: u32,
    /// Whole-run wall-clock ceiling in minutes; 0 = unlimited.
    pub timeout_minutes: u64,
    /// Sleep between retries after an agent error, in seconds.
    pub error_delay: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParallelConfig {
    pub enabled: bool,
    pub max_workers: usize,
    pub isolated_workspaces: bool,
    /// `fail-fast` or `continue`.
    pub failure_strategy: String,
    /// 0 = unlimited.
    pub max_cost_per_hour: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathsConfig {
    pub hermes_dir: String,
    pub tasks_dir: String,
    pub logs_dir: String,
    pub docs_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ai: AiConfig {
                planning: "claude".to_string(),
                coding: "claude".to_string(),
                timeout: 300,
                prd_timeout: 1200,
                max_retries: 10,
                stream_output: true,
            },
            task_mode: TaskModeConfig {
                auto_branch: true,
                auto_commit: true,
                autonomous: true,
                max_consecutive_errors: 5,
            },
            loop_cfg: LoopConfig {
                max_calls_per_hour: 100,
                timeout_minutes: 15,
                error_delay: 10,
            },
            parallel: ParallelConfig {
                enabled: false,
                max_workers: 3,
                isolated_workspaces: true,
                failure_strategy: "continue".to_string(),
                max_cost_per_hour: 0.0,
            },
            paths: PathsConfig {
                hermes_dir: ".hermes".to_string(),
                tasks_dir: "tasks".to_string(),
                logs_dir: "logs".to_string(),
                docs_dir: "docs".to_string(),
            },
        }
    }
}

// ── File schema (every key optional) ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    ai: Option<AiFile>,
    task_mode: Option<TaskModeFile>,
    #[serde(rename = "loop")]
    loop_cfg: Option<LoopFile>,
    parallel: Option<ParallelFile>,
    paths: Option<PathsFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiFile {
    planning: Option<String>,
    coding: Option<String>,
    timeout: Option<u64>,
    prd_timeout: Option<u64>,
    max_retries: Option<u32>,
    stream_output: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskModeFile {
    auto_branch: Option<bool>,
    auto_commit: Option<bool>,
    autonomous: Option<bool>,
    max_consecutive_errors: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoopFile {
    max_calls_per_hour: Option<u32>,
    timeout_minutes: Option<u64>,
    error_delay: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParallelFile {
    enabled: Option<bool>,
    max_workers: Option<usize>,
    isolated_workspaces: Option<bool>,
    failure_strategy: Option<String>,
    max_cost_per_hour: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathsFile {
    hermes_dir: Option<String>,
    tasks_dir: Option<String>,
    logs_dir: Option<String>,
    docs_dir: Option<String>,
}

macro_rules! overlay {
    ($dst:expr, $src:expr, [$($field:ident),+ $(,)?]) => {
        $(if let Some(value) = $src.$field {
            $dst.$field = value;
        })+
    };
}

impl Config {
    fn apply(&mut self, file: ConfigFile) {
        if let Some(ai) = file.ai {
            overlay!(self.ai, ai, [planning, coding, timeout, prd_timeout, max_retries, stream_output]);
        }
        if let Some(tm) = file.task_mode {
            overlay!(self.task_mode, tm, [auto_branch, auto_commit, autonomous, max_consecutive_errors]);
        }
        if let Some(lp) = file.loop_cfg {
            overlay!(self.loop_cfg, lp, [max_calls_per_hour, timeout_minutes, error_delay]);
        }
        if let Some(par) = file.parallel {
            overlay!(self.parallel, par, [enabled, max_workers, isolated_workspaces, failure_strategy, max_cost_per_hour]);
        }
        if let Some(paths) = file.paths {
            overlay!(self.paths, paths, [hermes_dir, tasks_dir, logs_dir, docs_dir]);
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Merge defaults, the global config and the project config, in that order.
pub fn load_config(workdir: &Path) -> Result<Config> {
    load_config_from(workdir, home_dir().as_deref())
}

fn load_config_from(workdir: &Path, home_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(home) = home_dir {
        let global = home.join(".hermes").join("config.json");
        if let Some(file) = read_config_file(&global)? {
            config.apply(file);
        }
    }

    // The project config is always looked up under the literal `.hermes/`;
    // the configurable paths apply to everything else.
    let project = workdir.join(".hermes").join("config.json");
    if let Some(file) = read_config_file(&project)? {
        config.apply(file);
    }

    Ok(config)
}

fn read_config_file(path: &Path) -> Result<Option<ConfigFile>> {
    if !path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let parsed = serde_json::from_str::<ConfigFile>(&raw)
        .with_context(|| format!("Failed to parse JSON config {}", path.display()))?;
    Ok(Some(parsed))
}

fn home_dir() -> Option<PathBuf> {
    dirs::home_dir()
}
