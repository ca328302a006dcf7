use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Feature identifier, rendered as `F` + 3-digit zero-padded integer (`F007`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(pub u16);

/// Task identifier, rendered as `T` + 3-digit zero-padded integer (`T042`).
/// Task ids are globally unique across features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u16);

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{:03}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{:03}", self.0)
    }
}

impl FromStr for FeatureId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s
            .trim()
            .strip_prefix(['F', 'f'])
            .context("feature id must start with 'F'")?;
        Ok(Self(digits.parse().context("invalid feature id number")?))
    }
}

impl FromStr for TaskId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s
            .trim()
            .strip_prefix(['T', 't'])
            .context("task id must start with 'T'")?;
        Ok(Self(digits.parse().context("invalid task id number")?))
    }
}

// ── Status & priority ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    NotStarted,
    InProgress,
    Completed,
    Blocked,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::NotStarted => write!(f, "NOT_STARTED"),
            TaskStatus::InProgress => write!(f, "IN_PROGRESS"),
            TaskStatus::Completed => write!(f, "COMPLETED"),
            TaskStatus::Blocked => write!(f, "BLOCKED"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NOT_STARTED" => Ok(TaskStatus::NotStarted),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "BLOCKED" => Ok(TaskStatus::Blocked),
            other => anyhow::bail!("unknown status '{}'", other),
        }
    }
}

/// Task/feature priority. `P1` sorts before `P4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P1,
    P2,
    P3,
    P4,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::P2
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::P1 => write!(f, "P1"),
            Priority::P2 => write!(f, "P2"),
            Priority::P3 => write!(f, "P3"),
            Priority::P4 => write!(f, "P4"),
        }
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    /// Accepts `P2` as well as labeled forms like `P1 - CRITICAL`.
    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim().split_whitespace().next().unwrap_or_default();
        match token.to_ascii_uppercase().as_str() {
            "P1" => Ok(Priority::P1),
            "P2" => Ok(Priority::P2),
            "P3" => Ok(Priority::P3),
            "P4" => Ok(Priority::P4),
            other => anyhow::bail!("unknown priority '{}'", other),
        }
    }
}

// ── Task & feature model ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTouchKind {
    New,
    Update,
}

/// One entry from a task's "Files to Touch" list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTouch {
    pub path: String,
    pub kind: FileTouchKind,
}

/// One success-criteria checkbox line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    pub text: String,
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub feature: FeatureId,
    pub name: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub estimated_effort: Option<String>,
    pub description: String,
    pub technical_details: String,
    pub files_to_touch: Vec<FileTouch>,
    pub depends_on: Vec<TaskId>,
    pub success_criteria: Vec<Criterion>,
    pub parallelizable: bool,
    pub exclusive_files: Vec<String>,
}

impl Task {
    /// All files this task claims: `files_to_touch ∪ exclusive_files`.
    pub fn claimed_files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = self.files_to_touch.iter().map(|f| f.path.as_str()).collect();
        for extra in &self.exclusive_files {
            if !files.contains(&extra.as_str()) {
                files.push(extra);
            }
        }
        files
    }
}

#[derive(Debug, Clone)]
pub struct Feature {
    pub id: FeatureId,
    pub name: String,
    pub status: TaskStatus,
    pub priority: Option<Priority>,
    pub target_version: Option<String>,
    pub estimated_duration: Option<String>,
    pub tasks: Vec<Task>,
    pub source_file: PathBuf,
}

/// Aggregate plan progress.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanProgress {
    pub total: usize,
    pub not_started: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub blocked: usize,
    pub percent_complete: f64,
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Lowercase-kebab a name, truncated to `max_len` bytes on a boundary that
/// never leaves a trailing dash.
pub fn kebab(name: &str, max_len: usize) -> String {
    let mut out = String::new();
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
        if out.len() >= max_len {
            break;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Canonical leaf name for a feature file: `NNN-<kebab>.md`.
#[allow(dead_code)]
pub fn feature_file_name(id: FeatureId, name: &str) -> String {
    format!("{:03}-{}.md", id.0, kebab(name, 40))
}

fn value_after<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    line.trim_start().strip_prefix(label).map(str::trim)
}

/// Match a task header line (`### T007: Name`), returning id and name.
fn parse_task_header(line: &str) -> Option<(TaskId, String)> {
    let rest = line.trim_start().strip_prefix("### ")?;
    let (id_part, name) = rest.split_once(':')?;
    let id = id_part.trim().parse::<TaskId>().ok()?;
    Some((id, name.trim().to_string()))
}

fn is_task_header(line: &str) -> bool {
    parse_task_header(line).is_some()
}

// ── Parsing ───────────────────────────────────────────────────────────────────

fn parse_feature(path: &Path, content: &str) -> Result<Option<Feature>> {
    // A file without a Feature ID line is not a plan file; ignore it.
    let Some(id_line) = content
        .lines()
        .find_map(|l| value_after(l, "**Feature ID:**"))
    else {
        return Ok(None);
    };
    let id: FeatureId = id_line
        .parse()
        .with_context(|| format!("bad feature id '{id_line}' in {}", path.display()))?;

    // Feature name from the leading `# Feature N: NAME` header.
    let name = content
        .lines()
        .find(|l| l.starts_with("# "))
        .map(|l| {
            let header = l.trim_start_matches('#').trim();
            match header.split_once(':') {
                Some((lead, rest)) if lead.trim_start().starts_with("Feature") => {
                    rest.trim().to_string()
                }
                _ => header.to_string(),
            }
        })
        .unwrap_or_else(|| format!("Feature {}", id.0));

    // Header region = everything before the first task header.
    let lines: Vec<&str> = content.lines().collect();
    let first_task = lines
        .iter()
        .position(|l| is_task_header(l))
        .unwrap_or(lines.len());

    let mut status = TaskStatus::NotStarted;
    let mut priority = None;
    let mut target_version = None;
    let mut estimated_duration = None;

    for line in &lines[..first_task] {
        if let Some(v) = value_after(line, "**Status:**") {
            status = v.parse().unwrap_or(TaskStatus::NotStarted);
        } else if let Some(v) = value_after(line, "**Priority:**") {
            priority = v.parse().ok();
        } else if let Some(v) = value_after(line, "**Target Version:**") {
            target_version = Some(v.to_string());
        } else if let Some(v) = value_after(line, "**Estimated Duration:**") {
            estimated_duration = Some(v.to_string());
        }
    }

    // Slice tasks on headers.
    let mut tasks = Vec::new();
    let mut idx = first_task;
    while idx < lines.len() {
        let Some((task_id, task_name)) = parse_task_header(lines[idx]) else {
            idx += 1;
            continue;
        };
        let body_start = idx + 1;
        let mut body_end = body_start;
        while body_end < lines.len() && !is_task_header(lines[body_end]) {
            body_end += 1;
        }
        tasks.push(parse_task(
            task_id,
            task_name,
            id,
            &lines[body_start..body_end],
        ));
        idx = body_end;
    }

    Ok(Some(Feature {
        id,
        name,
        status,
        priority,
        target_version,
        estimated_duration,
        tasks,
        source_file: path.to_path_buf(),
    }))
}

fn parse_task(id: TaskId, name: String, feature: FeatureId, body: &[&str]) -> Task {
    let mut task = Task {
        id,
        feature,
        name,
        status: TaskStatus::NotStarted,
        priority: Priority::default(),
        estimated_effort: None,
        description: String::new(),
        technical_details: String::new(),
        files_to_touch: Vec::new(),
        depends_on: Vec::new(),
        success_criteria: Vec::new(),
        // Absent flag means the task may share a batch with others.
        parallelizable: true,
        exclusive_files: Vec::new(),
    };

    for line in body {
        if let Some(v) = value_after(line, "**Status:**") {
            task.status = v.parse().unwrap_or(TaskStatus::NotStarted);
        } else if let Some(v) = value_after(line, "**Priority:**") {
            task.priority = v.parse().unwrap_or_default();
        } else if let Some(v) = value_after(line, "**Estimated Effort:**") {
            task.estimated_effort = Some(v.to_string());
        } else if let Some(v) = value_after(line, "**Parallelizable:**") {
            task.parallelizable = v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes");
        }
    }

    task.description = section_text(body, "Description");
    task.technical_details = section_text(body, "Technical Details");

    for bullet in section_bullets(body, "Files to Touch") {
        let (path_part, kind) = match bullet.rsplit_once('(') {
            Some((head, tail)) if tail.trim_end().ends_with(')') => {
                let marker = tail.trim_end().trim_end_matches(')').trim();
                let kind = if marker.eq_ignore_ascii_case("new") {
                    FileTouchKind::New
                } else {
                    FileTouchKind::Update
                };
                (head.trim(), kind)
            }
            _ => (bullet.as_str(), FileTouchKind::Update),
        };
        let path = path_part.trim().trim_matches('`').to_string();
        if !path.is_empty() {
            task.files_to_touch.push(FileTouch { path, kind });
        }
    }

    for bullet in section_bullets(body, "Dependencies") {
        let entry = bullet.trim();
        if entry.eq_ignore_ascii_case("none") {
            continue;
        }
        if let Ok(dep) = entry.parse::<TaskId>() {
            task.depends_on.push(dep);
        }
    }

    for bullet in section_bullets(body, "Exclusive Files") {
        let path = bullet.trim().trim_matches('`').to_string();
        if !path.is_empty() {
            task.exclusive_files.push(path);
        }
    }

    for line in section_lines(body, "Success Criteria") {
        let trimmed = line.trim_start();
        let (done, rest) = if let Some(r) = trimmed.strip_prefix("- [x]") {
            (true, r)
        } else if let Some(r) = trimmed.strip_prefix("- [X]") {
            (true, r)
        } else if let Some(r) = trimmed.strip_prefix("- [ ]") {
            (false, r)
        } else {
            continue;
        };
        task.success_criteria.push(Criterion {
            text: rest.trim().to_string(),
            done,
        });
    }

    task
}

/// Lines of the `#### <title>` section, up to the next `####` header or `---`.
fn section_lines<'a>(body: &[&'a str], title: &str) -> Vec<&'a str> {
    let header = format!("#### {title}");
    let Some(start) = body
        .iter()
        .position(|l| l.trim_start().trim_end() == header)
    else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for line in &body[start + 1..] {
        let t = line.trim_start();
        if t.starts_with("####") || t.trim_end() == "---" {
            break;
        }
        out.push(*line);
    }
    out
}

fn section_text(body: &[&str], title: &str) -> String {
    section_lines(body, title)
        .iter()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn section_bullets(body: &[&str], title: &str) -> Vec<String> {
    section_lines(body, title)
        .iter()
        .filter_map(|l| l.trim_start().strip_prefix("- "))
        .map(|s| s.trim().to_string())
        .collect()
}

// ── Task store ────────────────────────────────────────────────────────────────

/// Typed view over the Markdown plan directory. The filesystem stays the
/// system of record; `reload()` re-reads it at well-defined boundaries.
pub struct TaskStore {
    tasks_dir: PathBuf,
    features: Vec<Feature>,
}

impl TaskStore {
    /// Parse every `*.md` file in `tasks_dir`, excluding files whose name
    /// contains "status". A missing directory yields an empty store; a file
    /// that fails to parse is skipped with a warning.
    pub fn load(tasks_dir: &Path) -> Result<Self> {
        let mut store = Self {
            tasks_dir: tasks_dir.to_path_buf(),
            features: Vec::new(),
        };
        store.reload()?;
        Ok(store)
    }

    pub fn reload(&mut self) -> Result<()> {
        self.features.clear();
        if !self.tasks_dir.is_dir() {
            return Ok(());
        }

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.tasks_dir)
            .with_context(|| format!("Cannot read tasks dir {}", self.tasks_dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "md"))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.to_ascii_lowercase().contains("status"))
            })
            .collect();
        entries.sort();

        for path in entries {
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("⚠️  Skipping unreadable task file {}: {e}", path.display());
                    continue;
                }
            };
            match parse_feature(&path, &content) {
                Ok(Some(feature)) => {
                    let leaf = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                    if !leaf.starts_with(&format!("{:03}-", feature.id.0)) {
                        eprintln!(
                            "⚠️  Feature file {} does not match id {} naming (NNN-<kebab>.md)",
                            path.display(),
                            feature.id
                        );
                    }
                    self.features.push(feature);
                }
                Ok(None) => {} // no feature id line; not a plan file
                Err(e) => {
                    eprintln!("⚠️  Skipping malformed task file {}: {e}", path.display());
                }
            }
        }

        self.features.sort_by_key(|f| f.id);
        Ok(())
    }

    /// True iff at least one plan file parsed into a feature.
    pub fn has_tasks(&self) -> bool {
        self.features.iter().any(|f| !f.tasks.is_empty())
    }

    pub fn all_features(&self) -> &[Feature] {
        &self.features
    }

    /// Every task, ordered by ascending feature id then task id.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.features.iter().flat_map(|f| f.tasks.iter()).collect();
        tasks.sort_by_key(|t| (t.feature, t.id));
        tasks
    }

    pub fn task_by_id(&self, id: TaskId) -> Option<&Task> {
        self.features
            .iter()
            .flat_map(|f| f.tasks.iter())
            .find(|t| t.id == id)
    }

    pub fn feature_by_id(&self, id: FeatureId) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == id)
    }

    /// First NOT_STARTED task whose dependencies are all COMPLETED,
    /// tie-broken by priority (P1 first) then ascending task id.
    pub fn next_task(&self) -> Option<&Task> {
        self.all_tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::NotStarted)
            .filter(|t| self.dependencies_met(t))
            .min_by_key(|t| (t.priority, t.id))
    }

    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.all_tasks()
            .into_iter()
            .filter(|t| t.status == status)
            .collect()
    }

    #[allow(dead_code)]
    pub fn tasks_by_priority(&self, priority: Priority) -> Vec<&Task> {
        self.all_tasks()
            .into_iter()
            .filter(|t| t.priority == priority)
            .collect()
    }

    pub fn tasks_by_feature(&self, feature: FeatureId) -> Vec<&Task> {
        self.feature_by_id(feature)
            .map(|f| f.tasks.iter().collect())
            .unwrap_or_default()
    }

    /// True iff every task in the feature is COMPLETED.
    pub fn is_feature_complete(&self, feature: FeatureId) -> bool {
        self.feature_by_id(feature)
            .map(|f| f.tasks.iter().all(|t| t.status == TaskStatus::Completed))
            .unwrap_or(false)
    }

    /// True iff each id in `task.depends_on` refers to a COMPLETED task.
    pub fn dependencies_met(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.task_by_id(*dep)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
    }

    pub fn progress(&self) -> PlanProgress {
        let tasks = self.all_tasks();
        let total = tasks.len();
        let count = |s: TaskStatus| tasks.iter().filter(|t| t.status == s).count();
        let completed = count(TaskStatus::Completed);
        PlanProgress {
            total,
            not_started: count(TaskStatus::NotStarted),
            in_progress: count(TaskStatus::InProgress),
            completed,
            blocked: count(TaskStatus::Blocked),
            percent_complete: if total == 0 {
                0.0
            } else {
                completed as f64 * 100.0 / total as f64
            },
        }
    }

    pub fn highest_feature_id(&self) -> Option<FeatureId> {
        self.features.iter().map(|f| f.id).max()
    }

    pub fn highest_task_id(&self) -> Option<TaskId> {
        self.features
            .iter()
            .flat_map(|f| f.tasks.iter())
            .map(|t| t.id)
            .max()
    }

    /// Next free (feature, task) id pair for incremental plan generators.
    pub fn next_ids(&self) -> (FeatureId, TaskId) {
        (
            FeatureId(self.highest_feature_id().map_or(1, |f| f.0 + 1)),
            TaskId(self.highest_task_id().map_or(1, |t| t.0 + 1)),
        )
    }

    // ── Status mutation ───────────────────────────────────────────────────────

    /// Rewrite only the matching task's `**Status:**` line inside its file,
    /// preserving every other byte, then update the in-memory copy.
    pub fn update_task_status(&mut self, id: TaskId, status: TaskStatus) -> Result<()> {
        let (path, feature_idx, task_idx) = self
            .features
            .iter()
            .enumerate()
            .find_map(|(fi, f)| {
                f.tasks
                    .iter()
                    .position(|t| t.id == id)
                    .map(|ti| (f.source_file.clone(), fi, ti))
            })
            .with_context(|| format!("Unknown task {id}"))?;

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let rewritten = replace_task_status(&content, id, status)
            .with_context(|| format!("No status line found for {id} in {}", path.display()))?;
        write_atomic(&path, &rewritten)?;

        self.features[feature_idx].tasks[task_idx].status = status;
        Ok(())
    }

    /// Rewrite the feature-level `**Status:**` line (the first one before any
    /// task header), preserving every other byte.
    pub fn update_feature_status(&mut self, id: FeatureId, status: TaskStatus) -> Result<()> {
        let idx = self
            .features
            .iter()
            .position(|f| f.id == id)
            .with_context(|| format!("Unknown feature {id}"))?;
        let path = self.features[idx].source_file.clone();

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let rewritten = replace_feature_status(&content, status).with_context(|| {
            format!("No feature status line found in {}", path.display())
        })?;
        write_atomic(&path, &rewritten)?;

        self.features[idx].status = status;
        Ok(())
    }
}

// ── Byte-precise status rewriting ─────────────────────────────────────────────
//
// A line-scan state machine, not a multiline regex: we only ever replace the
// text of exactly one line and keep every other byte (including the file's
// own line endings) untouched.

fn replace_task_status(content: &str, id: TaskId, status: TaskStatus) -> Option<String> {
    let mut out = String::with_capacity(content.len() + 16);
    let mut in_target = false;
    let mut replaced = false;

    for raw in content.split_inclusive('\n') {
        let line = raw.trim_end_matches(['\n', '\r']);
        if let Some((header_id, _)) = parse_task_header(line) {
            in_target = header_id == id;
        }
        if in_target && !replaced && value_after(line, "**Status:**").is_some() {
            let ending = &raw[line.len()..];
            out.push_str(&format!("**Status:** {status}{ending}"));
            replaced = true;
            continue;
        }
        out.push_str(raw);
    }

    replaced.then_some(out)
}

fn replace_feature_status(content: &str, status: TaskStatus) -> Option<String> {
    let mut out = String::with_capacity(content.len() + 16);
    let mut replaced = false;
    let mut past_tasks = false;

    for raw in content.split_inclusive('\n') {
        let line = raw.trim_end_matches(['\n', '\r']);
        if is_task_header(line) {
            past_tasks = true;
        }
        if !past_tasks && !replaced && value_after(line, "**Status:**").is_some() {
            let ending = &raw[line.len()..];
            out.push_str(&format!("**Status:** {status}{ending}"));
            replaced = true;
            continue;
        }
        out.push_str(raw);
    }

    replaced.then_some(out)
}

/// Atomic replace: sibling temp file, fsync, rename.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(content.as_bytes())
        .context("Failed to write temp task file")?;
    tmp.as_file().sync_all().context("Failed to fsync temp task file")?;
    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("Failed to atomically replace {}: {}", path.display(), e))?;
    Ok(())
}
