use std::collections::VecDeque;

// ── Status trailer ────────────────────────────────────────────────────────────

// Both trailer spellings are accepted when parsing; templates written by this
// tool only ever emit the HERMES form.
const STATUS_DELIMS: [(&str, &str); 2] = [
    ("---HERMES_STATUS---", "---END_HERMES_STATUS---"),
    ("---RALPH_STATUS---", "---END_RALPH_STATUS---"),
];

/// Parsed contents of the agent's status trailer, when one is present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusTrailer {
    pub complete: bool,
    pub blocked: bool,
    pub exit_signal: bool,
    pub test_only: bool,
    pub recommendation: Option<String>,
}

/// Locate the trailer: returns (block start, block end, body).
fn find_trailer(output: &str) -> Option<(usize, usize, &str)> {
    for (start, end) in STATUS_DELIMS {
        if let Some(s) = output.find(start) {
            let body_start = s + start.len();
            if let Some(e) = output[body_start..].find(end) {
                let body = &output[body_start..body_start + e];
                return Some((s, body_start + e + end.len(), body));
            }
        }
    }
    None
}

fn parse_trailer(body: &str) -> StatusTrailer {
    let mut trailer = StatusTrailer::default();
    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_uppercase().as_str() {
            "STATUS" => {
                let v = value.to_ascii_uppercase();
                trailer.complete = v == "COMPLETE" || v == "COMPLETED";
                trailer.blocked = v == "BLOCKED";
            }
            "EXIT_SIGNAL" => trailer.exit_signal = value.eq_ignore_ascii_case("true"),
            "WORK_TYPE" => trailer.test_only = value.eq_ignore_ascii_case("testing"),
            "RECOMMENDATION" => {
                if !value.is_empty() {
                    trailer.recommendation = Some(value.to_string());
                }
            }
            _ => {}
        }
    }
    trailer
}

// ── Analysis ──────────────────────────────────────────────────────────────────

/// Classification of one agent response. All fields are derived from textual
/// signals plus the git delta the caller observed; no code semantics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    pub has_progress: bool,
    pub is_complete: bool,
    pub is_blocked: bool,
    pub has_errors: bool,
    pub is_test_only: bool,
    pub is_stuck: bool,
    pub exit_signal: bool,
    /// 0–100.
    pub confidence: u8,
    pub error_count: usize,
    pub output_length: usize,
    pub recommendation: Option<String>,
}

/// Loop-external facts the classifier folds in.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeContext {
    /// `git status` showed uncommitted changes since the last loop.
    pub git_has_changes: bool,
    /// Output length of the previous loop, for the delta heuristic.
    pub prev_output_length: usize,
}

const COMPLETION_KEYWORDS: [(&str, u8); 5] = [
    ("all tasks complete", 30),
    ("project complete", 30),
    ("nothing to do", 20),
    ("already implemented", 20),
    ("done", 10),
];

const NO_WORK_PHRASES: [&str; 3] = ["nothing to do", "no changes needed", "already implemented"];

const TEST_RUNNERS: [&str; 7] = [
    "npm test", "pytest", "go test", "cargo test", "jest", "vitest", "mvn test",
];

const IMPL_KEYWORDS: [&str; 6] = ["creating", "implementing", "fn ", "def ", "class ", "function "];

/// Minimum growth over the previous response before length alone counts as
/// progress.
const PROGRESS_LENGTH_DELTA: usize = 50;

/// At this many errors the loop is considered stuck outright.
const STUCK_ERROR_COUNT: usize = 6;

/// A single error line repeated this often is a stuck signature.
const STUCK_REPEAT_COUNT: usize = 3;

pub fn analyze(output: &str, ctx: AnalyzeContext) -> Analysis {
    let mut analysis = Analysis {
        output_length: output.len(),
        ..Analysis::default()
    };
    let mut confidence: u32 = 0;

    // 1. Status trailer wins over every heuristic. Keyword heuristics below
    //    only look at the text outside the block.
    let found = find_trailer(output);
    let lower = match found {
        Some((start, end, _)) => {
            let mut outside = String::with_capacity(output.len());
            outside.push_str(&output[..start]);
            outside.push_str(&output[end..]);
            outside.to_ascii_lowercase()
        }
        None => output.to_ascii_lowercase(),
    };
    let trailer = found.map(|(_, _, body)| parse_trailer(body));
    if let Some(ref t) = trailer {
        analysis.is_complete = t.complete;
        analysis.is_blocked = t.blocked;
        analysis.is_test_only = t.test_only;
        analysis.recommendation = t.recommendation.clone();
        if t.exit_signal {
            analysis.exit_signal = true;
            confidence = 100;
        } else if t.complete {
            confidence += 50;
        }
    }

    // 2. Completion keywords outside the trailer.
    if !analysis.is_complete {
        for (keyword, weight) in COMPLETION_KEYWORDS {
            if lower.contains(keyword) {
                analysis.is_complete = true;
                confidence += u32::from(weight);
            }
        }
    }

    // 3. Test-only heuristics (unless the trailer already said so).
    if !analysis.is_test_only {
        let ran_tests = TEST_RUNNERS.iter().any(|r| lower.contains(r));
        let has_pass_counter = lower.contains("passed")
            || lower.contains("test result: ok")
            || lower.contains(" ok.")
            || output.contains('✓');
        let implements = IMPL_KEYWORDS.iter().any(|k| lower.contains(k));
        if ran_tests && has_pass_counter && !implements {
            analysis.is_test_only = true;
        }
    }

    // 4. Error counting and stuck detection.
    let error_lines: Vec<&str> = output
        .lines()
        .filter(|l| {
            let ll = l.to_ascii_lowercase();
            ll.contains("error") || ll.contains("panic") || ll.contains("exception")
        })
        .collect();
    analysis.error_count = error_lines.len();
    analysis.has_errors = analysis.error_count > 0;
    analysis.is_stuck = analysis.error_count >= STUCK_ERROR_COUNT
        || has_repeated_signature(&error_lines, STUCK_REPEAT_COUNT);

    // 5. Progress: a git delta always counts; otherwise output must have grown
    //    meaningfully and not be pure testing or a no-work response.
    let no_work = NO_WORK_PHRASES.iter().any(|p| lower.contains(p));
    let grew = output
        .len()
        .saturating_sub(ctx.prev_output_length)
        > PROGRESS_LENGTH_DELTA;
    analysis.has_progress = ctx.git_has_changes || (grew && !analysis.is_test_only && !no_work);

    analysis.confidence = confidence.min(100) as u8;
    analysis
}

fn has_repeated_signature(error_lines: &[&str], threshold: usize) -> bool {
    let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for line in error_lines {
        let sig = line.trim();
        let count = counts.entry(sig).or_insert(0);
        *count += 1;
        if *count >= threshold {
            return true;
        }
    }
    false
}

// ── Exit-signal aggregation ───────────────────────────────────────────────────

/// Why the loop should exit gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Several consecutive loops produced nothing but test runs.
    TestSaturation,
    /// Consecutive loops declared completion.
    CompletionSignals,
    /// The agent raised EXIT_SIGNAL: the plan needs no further work.
    ProjectComplete,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::TestSaturation => "test_saturation",
            ExitReason::CompletionSignals => "completion_signals",
            ExitReason::ProjectComplete => "project_complete",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LoopSignals {
    loop_number: u32,
    test_only: bool,
    done: bool,
}

/// Rolling window over recent loops' completion-ish signals. Exceeding the
/// configured run lengths yields a graceful exit reason.
#[derive(Debug)]
pub struct ExitSignalWindow {
    window: VecDeque<LoopSignals>,
    capacity: usize,
    test_only_threshold: usize,
    done_threshold: usize,
}

impl Default for ExitSignalWindow {
    fn default() -> Self {
        Self::new(5, 3, 2)
    }
}

impl ExitSignalWindow {
    pub fn new(capacity: usize, test_only_threshold: usize, done_threshold: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            test_only_threshold,
            done_threshold,
        }
    }

    /// Record one loop's analysis; returns an exit reason when a threshold is
    /// crossed. `EXIT_SIGNAL: true` short-circuits immediately.
    pub fn record(&mut self, loop_number: u32, analysis: &Analysis) -> Option<ExitReason> {
        if analysis.exit_signal {
            return Some(ExitReason::ProjectComplete);
        }

        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(LoopSignals {
            loop_number,
            test_only: analysis.is_test_only,
            done: analysis.is_complete,
        });

        if self.consecutive_trailing(|s| s.test_only) >= self.test_only_threshold {
            return Some(ExitReason::TestSaturation);
        }
        if self.consecutive_trailing(|s| s.done) >= self.done_threshold {
            return Some(ExitReason::CompletionSignals);
        }
        None
    }

    /// Length of the trailing run where `flag` held on contiguous loop numbers.
    fn consecutive_trailing(&self, flag: impl Fn(&LoopSignals) -> bool) -> usize {
        let mut count = 0usize;
        let mut expected: Option<u32> = None;
        for signals in self.window.iter().rev() {
            if !flag(signals) {
                break;
            }
            if let Some(next) = expected {
                if signals.loop_number != next {
                    break;
                }
            }
            count += 1;
            expected = signals.loop_number.checked_sub(1);
        }
        count
    }
}
