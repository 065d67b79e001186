//! Sliding window counter implementation.
//!
//! Each bucket keeps two fixed windows, `current` and `previous`. The number
//! of requests in the trailing window ending at `now` is approximated by
//! weighting the previous window by the fraction of it that still overlaps:
//!
//! ```text
//! effective = previous.count * (1 - elapsed / window) + current.count
//! ```
//!
//! This needs O(1) memory per bucket and no per-request timestamps.

use serde::Serialize;

/// Align a timestamp down to its window boundary.
///
/// A zero window leaves the timestamp unchanged.
pub fn align_window(now_ms: u64, window_ms: u64) -> u64 {
    now_ms - now_ms.checked_rem(window_ms).unwrap_or(0)
}

/// Request count for one fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowBucket {
    /// Requests admitted in this window
    pub count: u64,
    /// Window start in epoch milliseconds, aligned to the window duration
    pub window_start: u64,
}

impl WindowBucket {
    fn empty(window_start: u64) -> Self {
        Self {
            count: 0,
            window_start,
        }
    }
}

/// The outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Seconds to wait before retrying; set only on denial and always >= 1
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    /// Limit of the governing rule
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Approximate requests left in the trailing window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    /// Id of the governing rule
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl Verdict {
    /// A verdict for a request no rule applies to.
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
            limit: None,
            remaining: None,
            rule_id: None,
        }
    }

    pub fn admitted(limit: u64, remaining: u64) -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
            limit: Some(limit),
            remaining: Some(remaining),
            rule_id: None,
        }
    }

    pub fn denied(limit: u64, retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs: Some(retry_after_secs.max(1)),
            limit: Some(limit),
            remaining: Some(0),
            rule_id: None,
        }
    }

    #[must_use]
    pub fn for_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    /// Value for the `Retry-After` response header, if denied.
    pub fn retry_after_header(&self) -> Option<String> {
        self.retry_after_secs.map(|secs| secs.to_string())
    }
}

/// Counting state for one (rule, key) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitEntry {
    pub current: WindowBucket,
    pub previous: WindowBucket,
    /// Window duration of the owning rule
    pub window_ms: u64,
    /// Last time this entry was checked, used to order hard-cap evictions
    pub last_access: u64,
}

impl RateLimitEntry {
    /// Create an empty entry whose current window contains `now_ms`.
    pub fn new(now_ms: u64, window_ms: u64) -> Self {
        let window_start = align_window(now_ms, window_ms);
        Self {
            current: WindowBucket::empty(window_start),
            previous: WindowBucket::empty(window_start.saturating_sub(window_ms)),
            window_ms,
            last_access: now_ms,
        }
    }

    /// Advance the windows so `current` contains `now_ms`.
    ///
    /// After a gap of two or more windows the previous count is dropped
    /// instead of carried forward.
    pub fn rotate(&mut self, now_ms: u64) {
        let gap = now_ms.saturating_sub(self.current.window_start);
        if gap < self.window_ms {
            return;
        }

        let window_start = align_window(now_ms, self.window_ms);
        self.previous = if gap >= self.window_ms.saturating_mul(2) {
            WindowBucket::empty(window_start.saturating_sub(self.window_ms))
        } else {
            self.current
        };
        self.current = WindowBucket::empty(window_start);
    }

    /// Approximate requests in the trailing window ending at `now_ms`.
    pub fn effective_count(&self, now_ms: u64) -> f64 {
        let mut view = *self;
        view.rotate(now_ms);
        view.weighted_count(now_ms)
    }

    /// Whether the entry has seen no traffic for two full windows.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.current.window_start) >= self.window_ms.saturating_mul(2)
    }

    /// Rotate, decide, and count the request if admitted.
    ///
    /// Denies once the effective count reaches `limit`, so exactly `limit`
    /// requests are admitted per window. Denied requests are not counted.
    pub fn check_and_increment(&mut self, now_ms: u64, limit: u64) -> Verdict {
        self.rotate(now_ms);
        self.last_access = self.last_access.max(now_ms);

        let effective = self.weighted_count(now_ms);
        if effective >= limit as f64 {
            return Verdict::denied(limit, self.retry_after_secs(now_ms));
        }

        self.current.count += 1;
        let remaining = (limit as f64 - (effective + 1.0)).max(0.0).floor() as u64;
        Verdict::admitted(limit, remaining)
    }

    fn weighted_count(&self, now_ms: u64) -> f64 {
        let elapsed = now_ms.saturating_sub(self.current.window_start);
        let elapsed_ratio = elapsed as f64 / self.window_ms as f64;
        self.previous.count as f64 * (1.0 - elapsed_ratio) + self.current.count as f64
    }

    fn retry_after_secs(&self, now_ms: u64) -> u64 {
        let elapsed = now_ms.saturating_sub(self.current.window_start);
        let until_rotation = self.window_ms.saturating_sub(elapsed);
        until_rotation.div_ceil(1000).max(1)
    }
}
