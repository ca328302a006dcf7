use anyhow::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::agents::Cancelled;

// ── Token bucket ──────────────────────────────────────────────────────────────

/// Token bucket enforcing the hourly call budget across every worker:
/// rate = `max_calls_per_hour / 3600` tokens per second, capacity =
/// `max_calls_per_hour`. The bucket starts full.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

impl RateLimiter {
    pub fn new(max_calls_per_hour: u32) -> Self {
        let capacity = f64::from(max_calls_per_hour.max(1));
        Self {
            bucket: Mutex::new(Bucket {
                capacity,
                tokens: capacity,
                refill_per_sec: capacity / 3600.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Non-blocking: take a token if one is available.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().expect("rate limiter poisoned");
        bucket.refill();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block (polling the bucket) until a token is available or the cancel
    /// flag fires. Rate limiting never surfaces as a task failure; the only
    /// error out of here is `Cancelled`.
    pub async fn acquire(&self, cancel: Option<Arc<AtomicBool>>) -> Result<()> {
        loop {
            if let Some(ref flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    return Err(anyhow::Error::new(Cancelled));
                }
            }
            if self.try_acquire() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Currently available tokens (after refill).
    #[allow(dead_code)]
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().expect("rate limiter poisoned");
        bucket.refill();
        bucket.tokens
    }
}

// ── Resource monitor ──────────────────────────────────────────────────────────

/// Optional ceilings; `None` means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLimits {
    pub max_calls_per_min: Option<u32>,
    pub max_cost_per_hour: Option<f64>,
    pub max_rss_bytes: Option<u64>,
}

/// Sliding-window accounting of API calls and cost, plus a soft memory
/// ceiling for admitting new workers. Windows are pruned on access.
pub struct ResourceMonitor {
    limits: ResourceLimits,
    inner: Mutex<Windows>,
}

struct Windows {
    /// Call timestamps within the last minute.
    minute: VecDeque<Instant>,
    /// (timestamp, cost) entries within the last hour.
    hour: VecDeque<(Instant, f64)>,
    total_cost: f64,
}

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

impl ResourceMonitor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(Windows {
                minute: VecDeque::new(),
                hour: VecDeque::new(),
                total_cost: 0.0,
            }),
        }
    }

    pub fn record_api_call(&self, cost: Option<f64>) {
        self.record_api_call_at(Instant::now(), cost);
    }

    fn record_api_call_at(&self, at: Instant, cost: Option<f64>) {
        let mut windows = self.inner.lock().expect("resource monitor poisoned");
        windows.minute.push_back(at);
        let cost = cost.unwrap_or(0.0);
        windows.hour.push_back((at, cost));
        windows.total_cost += cost;
    }

    fn prune(windows: &mut Windows, now: Instant) {
        while windows
            .minute
            .front()
            .is_some_and(|t| now.duration_since(*t) > MINUTE)
        {
            windows.minute.pop_front();
        }
        while windows
            .hour
            .front()
            .is_some_and(|(t, _)| now.duration_since(*t) > HOUR)
        {
            windows.hour.pop_front();
        }
    }

    /// False when either configured ceiling is reached: calls in the last
    /// minute, or cumulative cost in the last hour.
    pub fn can_make_api_call(&self) -> bool {
        let mut windows = self.inner.lock().expect("resource monitor poisoned");
        let now = Instant::now();
        Self::prune(&mut windows, now);

        if let Some(max_calls) = self.limits.max_calls_per_min {
            if windows.minute.len() >= max_calls as usize {
                return false;
            }
        }
        if let Some(max_cost) = self.limits.max_cost_per_hour {
            let hourly: f64 = windows.hour.iter().map(|(_, c)| c).sum();
            if hourly >= max_cost {
                return false;
            }
        }
        true
    }

    /// False when the process RSS exceeds the configured soft ceiling; the
    /// pool stops admitting new tasks until memory recovers.
    pub fn can_start_worker(&self) -> bool {
        let Some(max_rss) = self.limits.max_rss_bytes else {
            return true;
        };
        match current_rss_bytes() {
            Some(rss) => rss < max_rss,
            // No /proc (or unparsable): do not block on a missing reading.
            None => true,
        }
    }

    pub fn recent_minute_calls(&self) -> usize {
        let mut windows = self.inner.lock().expect("resource monitor poisoned");
        let now = Instant::now();
        Self::prune(&mut windows, now);
        windows.minute.len()
    }

    pub fn hourly_cost(&self) -> f64 {
        let mut windows = self.inner.lock().expect("resource monitor poisoned");
        let now = Instant::now();
        Self::prune(&mut windows, now);
        windows.hour.iter().map(|(_, c)| c).sum()
    }

    /// Cumulative cost since the monitor was created (never pruned).
    pub fn total_cost(&self) -> f64 {
        self.inner
            .lock()
            .expect("resource monitor poisoned")
            .total_cost
    }
}

/// Resident set size of this process, read from `/proc/self/status`.
///
/// The line looks like: `VmRSS:     12345 kB`
fn current_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}
