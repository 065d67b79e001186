//! Rate limiting logic and state management.

mod counter;
mod evictor;
mod key;
mod limiter;
mod rules;

pub use counter::{align_window, RateLimitEntry, Verdict, WindowBucket};
pub use evictor::Evictor;
pub use key::{extract_key, BucketKey, RequestContext, DEFAULT_CLIENT_IP};
pub use limiter::{now_ms, LimiterStats, RateLimiter, SweepReport, DEFAULT_MAX_ENTRIES};
pub use rules::{KeyType, Method, PathPattern, Rule, RuleConfig, RuleSet, MAX_WINDOW_MS};
