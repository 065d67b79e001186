//! Core rate limiter implementation.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

use super::counter::{RateLimitEntry, Verdict};
use super::key::{extract_key, BucketKey, RequestContext};
use super::rules::{Rule, RuleSet};
use crate::config::LimiterSettings;
use crate::error::{Result, TollgateError};

/// Default ceiling on stored buckets.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Current wall clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Result of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Entries removed for being idle two full windows
    pub expired: usize,
    /// Entries removed to get back under the ceiling
    pub evicted: usize,
    /// Entries left after the pass
    pub remaining: usize,
}

/// Point-in-time limiter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub checks: u64,
    pub allowed: u64,
    pub denied: u64,
    pub entries: usize,
}

/// The rate limiter: a rule table plus per-bucket sliding window state.
///
/// Buckets live in a sharded map. A check holds only its shard's lock while
/// it rotates, decides and increments, so the sequence is atomic per bucket
/// without serializing unrelated keys. Share it across tasks with an `Arc`.
pub struct RateLimiter {
    rules: RuleSet,
    /// Bucket state indexed by (rule, key)
    entries: DashMap<BucketKey, RateLimitEntry>,
    max_entries: usize,
    total_checks: AtomicU64,
    total_allowed: AtomicU64,
    total_denied: AtomicU64,
    last_sweep: Mutex<Option<SweepReport>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rules", &self.rules.len())
            .field("entries", &self.entries.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter with the default entry ceiling.
    pub fn new(rules: RuleSet) -> Self {
        Self::with_entries(rules, DashMap::new(), DEFAULT_MAX_ENTRIES)
    }

    /// Create a rate limiter with a custom entry ceiling.
    pub fn with_max_entries(rules: RuleSet, max_entries: usize) -> Self {
        Self::with_entries(rules, DashMap::new(), max_entries)
    }

    /// Create a rate limiter from loaded settings.
    pub fn from_settings(rules: RuleSet, settings: &LimiterSettings) -> Self {
        let entries = match settings.shard_amount {
            Some(shards) => DashMap::with_shard_amount(shards),
            None => DashMap::new(),
        };
        Self::with_entries(rules, entries, settings.max_entries)
    }

    fn with_entries(
        rules: RuleSet,
        entries: DashMap<BucketKey, RateLimitEntry>,
        max_entries: usize,
    ) -> Self {
        Self {
            rules,
            entries,
            max_entries,
            total_checks: AtomicU64::new(0),
            total_allowed: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
            last_sweep: Mutex::new(None),
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Check a request against the wall clock.
    pub fn check(&self, ctx: &RequestContext) -> Result<Verdict> {
        self.check_at(ctx, now_ms())
    }

    /// Check a request at an explicit time.
    ///
    /// Requests no rule applies to are always allowed. A user-keyed rule
    /// matching a request without identity yields
    /// [`TollgateError::MissingIdentity`]. That request counts as a check but
    /// touches no bucket.
    pub fn check_at(&self, ctx: &RequestContext, now_ms: u64) -> Result<Verdict> {
        let Some(rule) = self.rules.match_rule(&ctx.method, &ctx.path) else {
            trace!(method = %ctx.method, path = %ctx.path, "No rate limit rule applies");
            self.total_checks.fetch_add(1, Ordering::Relaxed);
            self.total_allowed.fetch_add(1, Ordering::Relaxed);
            return Ok(Verdict::unlimited());
        };

        let Some(key) = extract_key(rule.key_type, ctx) else {
            warn!(
                rule = %rule.id,
                path = %ctx.path,
                "User-keyed rule matched a request without identity"
            );
            self.total_checks.fetch_add(1, Ordering::Relaxed);
            return Err(TollgateError::MissingIdentity {
                rule: rule.id.clone(),
            });
        };

        Ok(self.check_and_increment_at(BucketKey::new(rule.id.as_str(), key), rule, now_ms))
    }

    /// Run the sliding window decision for one bucket.
    ///
    /// `rule` must come from this limiter's validated rule set.
    pub(crate) fn check_and_increment_at(&self, key: BucketKey, rule: &Rule, now_ms: u64) -> Verdict {
        trace!(key = %key, now_ms = now_ms, "Checking rate limit");
        self.total_checks.fetch_add(1, Ordering::Relaxed);

        let verdict = {
            let mut entry = self.entries.entry(key).or_insert_with(|| {
                debug!(
                    rule = %rule.id,
                    limit = rule.limit,
                    window_ms = rule.window_ms,
                    "Creating rate limit bucket"
                );
                RateLimitEntry::new(now_ms, rule.window_ms)
            });

            let verdict = entry.check_and_increment(now_ms, rule.limit);
            if !verdict.allowed {
                debug!(
                    key = %entry.key(),
                    retry_after_secs = ?verdict.retry_after_secs,
                    "Rate limit exceeded"
                );
            }
            verdict
        };

        if verdict.allowed {
            self.total_allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
        }
        verdict.for_rule(rule.id.as_str())
    }

    /// Run a cleanup pass against the wall clock.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(now_ms())
    }

    /// Remove idle buckets, then enforce the entry ceiling.
    ///
    /// A bucket is idle once `now - current.window_start >= 2 * window`. If
    /// the map is still above the ceiling, buckets with the oldest current
    /// window (then the oldest access) go first.
    pub fn sweep_at(&self, now_ms: u64) -> SweepReport {
        let mut expired = 0;
        self.entries.retain(|_, entry| {
            if entry.is_stale(now_ms) {
                expired += 1;
                false
            } else {
                true
            }
        });

        let evicted = self.enforce_capacity();
        let report = SweepReport {
            expired,
            evicted,
            remaining: self.entries.len(),
        };

        info!(
            expired = report.expired,
            evicted = report.evicted,
            remaining = report.remaining,
            "Rate limit sweep completed"
        );
        *self.last_sweep.lock() = Some(report);
        report
    }

    fn enforce_capacity(&self) -> usize {
        let len = self.entries.len();
        if len <= self.max_entries {
            return 0;
        }
        let excess = len - self.max_entries;

        let evicted = self.evict_candidates(self.capacity_candidates(), excess);
        warn!(
            evicted = evicted,
            max_entries = self.max_entries,
            "Rate limit bucket ceiling exceeded, evicted oldest buckets"
        );
        evicted
    }

    /// Every bucket with its window start and last access, oldest first.
    fn capacity_candidates(&self) -> Vec<(BucketKey, u64, u64)> {
        let mut candidates: Vec<(BucketKey, u64, u64)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.current.window_start, entry.last_access))
            .collect();
        candidates.sort_unstable_by_key(|(_, window_start, last_access)| (*window_start, *last_access));
        candidates
    }

    fn evict_candidates(&self, candidates: Vec<(BucketKey, u64, u64)>, excess: usize) -> usize {
        let mut evicted = 0;
        for (key, window_start, last_access) in candidates {
            if evicted == excess {
                break;
            }
            // Skip buckets touched since the snapshot
            let removed = self.entries.remove_if(&key, |_, entry| {
                entry.current.window_start == window_start && entry.last_access == last_access
            });
            if removed.is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    /// Snapshot the state of one bucket.
    pub fn peek(&self, rule_id: &str, key: &str) -> Option<RateLimitEntry> {
        self.entries
            .get(&BucketKey::new(rule_id, key))
            .map(|entry| *entry)
    }

    /// Get the number of stored buckets.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Clear all buckets.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            checks: self.total_checks.load(Ordering::Relaxed),
            allowed: self.total_allowed.load(Ordering::Relaxed),
            denied: self.total_denied.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    /// The report of the most recent sweep, if any ran.
    pub fn last_sweep(&self) -> Option<SweepReport> {
        *self.last_sweep.lock()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RuleSet::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::{KeyType, Method, PathPattern, MAX_WINDOW_MS};
    use std::time::Duration;

    fn rule(id: &str, pattern: PathPattern, window_ms: u64, limit: u64, key_type: KeyType) -> Rule {
        Rule::new(
            id,
            pattern,
            &Method::ALL,
            Duration::from_millis(window_ms),
            limit,
            key_type,
        )
        .unwrap()
    }

    fn single_rule_limiter(window_ms: u64, limit: u64) -> RateLimiter {
        let rules = RuleSet::new(vec![rule(
            "test",
            PathPattern::literal("/api/"),
            window_ms,
            limit,
            KeyType::UserId,
        )])
        .unwrap();
        RateLimiter::new(rules)
    }

    fn user_request(user: &str) -> RequestContext {
        RequestContext::new("POST", "/api/things").with_user(user)
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.entry_count(), 0);
        assert_eq!(limiter.max_entries(), DEFAULT_MAX_ENTRIES);
    }

    #[test]
    fn test_concrete_scenario() {
        let limiter = single_rule_limiter(60_000, 5);
        let ctx = user_request("alice");

        for _ in 0..5 {
            assert!(limiter.check_at(&ctx, 0).unwrap().allowed);
        }

        let verdict = limiter.check_at(&ctx, 0).unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.retry_after_secs, Some(60));
        assert_eq!(verdict.rule_id.as_deref(), Some("test"));

        assert!(limiter.check_at(&ctx, 61_000).unwrap().allowed);
    }

    #[test]
    fn test_check_creates_bucket() {
        let limiter = single_rule_limiter(60_000, 5);

        limiter.check_at(&user_request("alice"), 1_000).unwrap();

        assert_eq!(limiter.entry_count(), 1);
        let entry = limiter.peek("test", "alice").unwrap();
        assert_eq!(entry.current.count, 1);
        assert_eq!(entry.current.window_start, 0);
    }

    #[test]
    fn test_keys_have_separate_buckets() {
        let limiter = single_rule_limiter(60_000, 1);

        assert!(limiter.check_at(&user_request("alice"), 0).unwrap().allowed);
        assert!(limiter.check_at(&user_request("bob"), 0).unwrap().allowed);
        assert!(!limiter.check_at(&user_request("alice"), 0).unwrap().allowed);
        assert_eq!(limiter.entry_count(), 2);
    }

    #[test]
    fn test_unmatched_request_is_unlimited() {
        let limiter = single_rule_limiter(60_000, 1);

        for method in ["GET", "POST"] {
            let ctx = RequestContext::new(method, "/health");
            assert_eq!(limiter.check_at(&ctx, 0).unwrap(), Verdict::unlimited());
        }
        let ctx = RequestContext::new("GET", "/api/things");
        assert_eq!(limiter.check_at(&ctx, 0).unwrap(), Verdict::unlimited());

        assert_eq!(limiter.entry_count(), 0);
    }

    #[test]
    fn test_missing_identity_is_reported() {
        let limiter = single_rule_limiter(60_000, 1);
        let ctx = RequestContext::new("POST", "/api/things").with_forwarded_for("10.0.0.1");

        let result = limiter.check_at(&ctx, 0);
        assert!(matches!(result, Err(TollgateError::MissingIdentity { rule }) if rule == "test"));
        assert_eq!(limiter.entry_count(), 0);

        let stats = limiter.stats();
        assert_eq!(stats.checks, 1);
        assert_eq!(stats.allowed, 0);
        assert_eq!(stats.denied, 0);
    }

    #[test]
    fn test_widest_window_checks_and_sweeps() {
        let limiter = single_rule_limiter(MAX_WINDOW_MS, 2);
        let ctx = user_request("alice");

        assert!(limiter.check_at(&ctx, 1_700_000_000_000).unwrap().allowed);
        assert!(limiter.check_at(&ctx, 1_700_000_000_000).unwrap().allowed);
        assert!(!limiter.check_at(&ctx, 1_700_000_000_000).unwrap().allowed);

        let report = limiter.sweep_at(u64::MAX - 2);
        assert_eq!(report.expired, 0);
        assert!(limiter.peek("test", "alice").is_some());

        let report = limiter.sweep_at(u64::MAX);
        assert_eq!(report.expired, 1);
    }

    #[test]
    fn test_ip_keyed_rule() {
        let rules = RuleSet::new(vec![rule(
            "login",
            PathPattern::literal("/login"),
            60_000,
            1,
            KeyType::Ip,
        )])
        .unwrap();
        let limiter = RateLimiter::new(rules);

        let ctx = RequestContext::new("POST", "/login").with_forwarded_for("203.0.113.7, 10.0.0.1");
        assert!(limiter.check_at(&ctx, 0).unwrap().allowed);
        assert!(limiter.peek("login", "203.0.113.7").is_some());

        // Unidentifiable clients share the loopback bucket
        let anonymous = RequestContext::new("POST", "/login");
        assert!(limiter.check_at(&anonymous, 0).unwrap().allowed);
        assert!(!limiter.check_at(&anonymous, 0).unwrap().allowed);
    }

    #[test]
    fn test_specific_rule_is_not_double_counted() {
        let rules = RuleSet::new(vec![
            rule("chat", PathPattern::literal("/api/ask/"), 60_000, 2, KeyType::UserId),
            rule("catch-all", PathPattern::regex("^/api/").unwrap(), 60_000, 100, KeyType::UserId),
        ])
        .unwrap();
        let limiter = RateLimiter::new(rules);
        let chat = RequestContext::new("POST", "/api/ask/openai").with_user("alice");

        assert!(limiter.check_at(&chat, 0).unwrap().allowed);
        assert!(limiter.check_at(&chat, 0).unwrap().allowed);
        assert!(!limiter.check_at(&chat, 0).unwrap().allowed);

        assert_eq!(limiter.peek("chat", "alice").unwrap().current.count, 2);
        assert!(limiter.peek("catch-all", "alice").is_none());

        let other = RequestContext::new("DELETE", "/api/convos/1").with_user("alice");
        let verdict = limiter.check_at(&other, 0).unwrap();
        assert_eq!(verdict.rule_id.as_deref(), Some("catch-all"));
    }

    #[test]
    fn test_sweep_removes_idle_buckets() {
        let limiter = single_rule_limiter(60_000, 5);
        limiter.check_at(&user_request("idle"), 0).unwrap();
        limiter.check_at(&user_request("active"), 90_000).unwrap();

        let report = limiter.sweep_at(119_999);
        assert_eq!(report.expired, 0);

        let report = limiter.sweep_at(120_000);
        assert_eq!(
            report,
            SweepReport {
                expired: 1,
                evicted: 0,
                remaining: 1
            }
        );
        assert!(limiter.peek("test", "idle").is_none());
        assert!(limiter.peek("test", "active").is_some());
        assert_eq!(limiter.last_sweep(), Some(report));
    }

    #[test]
    fn test_hard_cap_keeps_most_recent() {
        let rules = RuleSet::new(vec![rule(
            "test",
            PathPattern::literal("/api/"),
            60_000,
            5,
            KeyType::UserId,
        )])
        .unwrap();
        let limiter = RateLimiter::with_max_entries(rules, 3);

        for (i, user) in ["u0", "u1", "u2", "u3", "u4"].iter().enumerate() {
            limiter.check_at(&user_request(user), i as u64 * 10).unwrap();
        }
        // Bring u0 back so it outranks u1 and u2
        limiter.check_at(&user_request("u0"), 50).unwrap();

        let report = limiter.sweep_at(60);
        assert_eq!(report.expired, 0);
        assert_eq!(report.evicted, 2);
        assert_eq!(limiter.entry_count(), 3);

        for user in ["u0", "u3", "u4"] {
            assert!(limiter.peek("test", user).is_some(), "{} should survive", user);
        }
    }

    #[test]
    fn test_hard_cap_skips_bucket_refreshed_after_snapshot() {
        let limiter = single_rule_limiter(60_000, 5);
        for (i, user) in ["u0", "u1", "u2", "u3"].iter().enumerate() {
            limiter.check_at(&user_request(user), i as u64 * 10).unwrap();
        }

        let candidates = limiter.capacity_candidates();
        let order: Vec<String> = candidates.iter().map(|(key, _, _)| key.to_string()).collect();
        assert_eq!(order, ["test:u0", "test:u1", "test:u2", "test:u3"]);

        // u0 is checked again between the snapshot and the removal
        limiter.check_at(&user_request("u0"), 40).unwrap();

        let evicted = limiter.evict_candidates(candidates, 2);
        assert_eq!(evicted, 2);
        assert_eq!(limiter.entry_count(), 2);

        assert_eq!(limiter.peek("test", "u0").unwrap().current.count, 2);
        assert!(limiter.peek("test", "u1").is_none());
        assert!(limiter.peek("test", "u2").is_none());
        assert!(limiter.peek("test", "u3").is_some());
    }

    #[test]
    fn test_hard_cap_orders_by_window_start() {
        let rules = RuleSet::new(vec![rule(
            "test",
            PathPattern::literal("/api/"),
            1_000,
            5,
            KeyType::UserId,
        )])
        .unwrap();
        let limiter = RateLimiter::with_max_entries(rules, 2);

        limiter.check_at(&user_request("newest"), 1_900).unwrap();
        limiter.check_at(&user_request("older"), 1_100).unwrap();
        limiter.check_at(&user_request("oldest"), 950).unwrap();

        let report = limiter.sweep_at(1_950);
        assert_eq!(report.evicted, 1);
        assert!(limiter.peek("test", "oldest").is_none());
    }

    #[test]
    fn test_under_ceiling_evicts_nothing() {
        let limiter = single_rule_limiter(60_000, 5);
        for user in ["a", "b", "c"] {
            limiter.check_at(&user_request(user), 0).unwrap();
        }
        assert_eq!(limiter.sweep_at(0).evicted, 0);
    }

    #[test]
    fn test_stats() {
        let limiter = single_rule_limiter(60_000, 1);
        limiter.check_at(&user_request("alice"), 0).unwrap();
        limiter.check_at(&user_request("alice"), 0).unwrap();
        limiter.check_at(&RequestContext::new("GET", "/api/things"), 0).unwrap();

        let stats = limiter.stats();
        assert_eq!(stats.checks, 3);
        assert_eq!(stats.allowed, 2);
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_clear_buckets() {
        let limiter = single_rule_limiter(60_000, 5);
        limiter.check_at(&user_request("alice"), 0).unwrap();
        assert_eq!(limiter.entry_count(), 1);

        limiter.clear();
        assert_eq!(limiter.entry_count(), 0);
    }

    #[test]
    fn test_concurrent_checks_admit_exactly_limit() {
        let limiter = single_rule_limiter(60_000, 250);
        let ctx = &user_request("shared");
        let limiter_ref = &limiter;

        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(move || {
                        (0..100)
                            .filter(|_| limiter_ref.check_at(ctx, 1_000).unwrap().allowed)
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(admitted, 250);
        assert_eq!(limiter.peek("test", "shared").unwrap().current.count, 250);
    }

    #[test]
    fn test_from_settings_with_shards() {
        let settings = LimiterSettings {
            shard_amount: Some(8),
            max_entries: 42,
            ..LimiterSettings::default()
        };
        let limiter = RateLimiter::from_settings(RuleSet::default(), &settings);
        assert_eq!(limiter.max_entries(), 42);
    }
}
