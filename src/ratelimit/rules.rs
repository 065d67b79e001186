//! Rate limit rules configuration and matching.
//!
//! Rules form an ordered table: the first rule whose method set contains the
//! request method and whose path pattern matches the request path wins. Only
//! mutating methods are ever limited.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};

/// An HTTP method subject to rate limiting.
///
/// Read-only verbs have no variant: [`Method::parse`] returns `None` for them,
/// which short-circuits matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// All mutating methods.
    pub const ALL: [Method; 4] = [Method::Post, Method::Put, Method::Patch, Method::Delete];

    /// Parse a request method, case-insensitively.
    pub fn parse(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The dimension a rule is enforced along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Per authenticated user
    UserId,
    /// Per client IP address
    Ip,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::UserId => f.write_str("user_id"),
            KeyType::Ip => f.write_str("ip"),
        }
    }
}

/// How a rule selects request paths.
#[derive(Debug, Clone)]
pub enum PathPattern {
    /// Exact string equality
    Exact(String),
    /// Stored with its trailing `/`; also matches the bare path without it
    Prefix(String),
    /// Regular expression test
    Regex(Regex),
}

impl PathPattern {
    /// Build a literal pattern. A trailing `/` makes it a prefix pattern.
    pub fn literal(path: impl Into<String>) -> Self {
        let path = path.into();
        if path.ends_with('/') {
            PathPattern::Prefix(path)
        } else {
            PathPattern::Exact(path)
        }
    }

    /// Compile a regular expression pattern.
    pub fn regex(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Regex::new(pattern).map(PathPattern::Regex)
    }

    /// Test a request path against this pattern.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(exact) => exact == path,
            PathPattern::Prefix(prefix) => {
                path.starts_with(prefix.as_str())
                    || prefix.strip_suffix('/').is_some_and(|bare| bare == path)
            }
            PathPattern::Regex(re) => re.is_match(path),
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Exact(exact) => write!(f, "{}", exact),
            PathPattern::Prefix(prefix) => write!(f, "{}*", prefix),
            PathPattern::Regex(re) => write!(f, "~{}", re.as_str()),
        }
    }
}

/// A single rate limit rule. Immutable once built.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Unique rule identifier, also the first half of every bucket key
    pub id: String,
    /// Path selector
    pub pattern: PathPattern,
    /// Methods this rule applies to
    pub methods: Vec<Method>,
    /// Window duration in milliseconds
    pub window_ms: u64,
    /// Maximum admitted requests per effective window
    pub limit: u64,
    /// Bucketing dimension
    pub key_type: KeyType,
}

/// Longest accepted window; twice this still fits in a `u64`.
pub const MAX_WINDOW_MS: u64 = u64::MAX / 2;

impl Rule {
    /// Build and validate a rule.
    ///
    /// The window is truncated to whole milliseconds and must end up between
    /// one and [`MAX_WINDOW_MS`].
    pub fn new(
        id: impl Into<String>,
        pattern: PathPattern,
        methods: &[Method],
        window: Duration,
        limit: u64,
        key_type: KeyType,
    ) -> Result<Self> {
        let id = id.into();
        let window_ms = u64::try_from(window.as_millis()).map_err(|_| TollgateError::InvalidRule {
            rule: id.clone(),
            reason: format!("window must not exceed {}ms", MAX_WINDOW_MS),
        })?;

        let rule = Self::builtin(id, pattern, methods, window_ms, limit, key_type);
        rule.validate()?;
        Ok(rule)
    }

    fn builtin(
        id: impl Into<String>,
        pattern: PathPattern,
        methods: &[Method],
        window_ms: u64,
        limit: u64,
        key_type: KeyType,
    ) -> Self {
        Self {
            id: id.into(),
            pattern,
            methods: methods.to_vec(),
            window_ms,
            limit,
            key_type,
        }
    }

    /// Whether this rule governs the given method and path.
    pub fn applies_to(&self, method: Method, path: &str) -> bool {
        self.methods.contains(&method) && self.pattern.matches(path)
    }

    /// The window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| TollgateError::InvalidRule {
            rule: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.methods.is_empty() {
            return Err(invalid("at least one method is required"));
        }
        if self.window_ms == 0 {
            return Err(invalid("window_ms must be greater than zero"));
        }
        if self.window_ms > MAX_WINDOW_MS {
            return Err(invalid(&format!("window_ms must not exceed {}", MAX_WINDOW_MS)));
        }
        if self.limit == 0 {
            return Err(invalid("limit must be greater than zero"));
        }
        Ok(())
    }
}

/// A rule as written in a YAML rule table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    /// Literal path; a trailing `/` makes it a prefix
    #[serde(default)]
    pub path: Option<String>,
    /// Regular expression, mutually exclusive with `path`
    #[serde(default)]
    pub regex: Option<String>,
    pub methods: Vec<Method>,
    pub window_ms: u64,
    pub limit: u64,
    pub key: KeyType,
}

impl RuleConfig {
    /// Compile this definition into a [`Rule`].
    pub fn compile(self) -> Result<Rule> {
        let pattern = match (self.path, self.regex) {
            (Some(path), None) => PathPattern::literal(path),
            (None, Some(pattern)) => {
                PathPattern::regex(&pattern).map_err(|source| TollgateError::InvalidPattern {
                    rule: self.id.clone(),
                    source,
                })?
            }
            _ => {
                return Err(TollgateError::InvalidRule {
                    rule: self.id,
                    reason: "exactly one of `path` or `regex` must be set".to_string(),
                })
            }
        };

        Ok(Rule {
            id: self.id,
            pattern,
            methods: self.methods,
            window_ms: self.window_ms,
            limit: self.limit,
            key_type: self.key,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RuleConfig>,
}

/// The ordered rule table. The first applicable rule wins.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Build a rule set, validating each rule and rejecting duplicate ids.
    pub fn new(rules: Vec<Rule>) -> Result<Self> {
        let mut seen = HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !seen.insert(rule.id.as_str()) {
                return Err(TollgateError::InvalidRule {
                    rule: rule.id.clone(),
                    reason: "duplicate rule id".to_string(),
                });
            }
        }
        Ok(Self { rules })
    }

    /// Load a rule table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a rule table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: RuleFile = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse rule table: {}", e)))?;

        let rules = file
            .rules
            .into_iter()
            .map(RuleConfig::compile)
            .collect::<Result<Vec<_>>>()?;
        Self::new(rules)
    }

    /// Find the rule governing a request, if any.
    ///
    /// Non-mutating methods never match.
    pub fn match_rule(&self, method: &str, path: &str) -> Option<&Rule> {
        let method = Method::parse(method)?;
        self.rules.iter().find(|rule| rule.applies_to(method, path))
    }

    /// Look up a rule by id.
    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    /// The compiled-in table, most specific first.
    fn default() -> Self {
        const MINUTE_MS: u64 = 60_000;
        const HOUR_MS: u64 = 3_600_000;

        let rules = vec![
            Rule::builtin(
                "auth-login",
                PathPattern::literal("/api/auth/login"),
                &[Method::Post],
                15 * MINUTE_MS,
                7,
                KeyType::Ip,
            ),
            Rule::builtin(
                "auth-register",
                PathPattern::literal("/api/auth/register"),
                &[Method::Post],
                HOUR_MS,
                5,
                KeyType::Ip,
            ),
            Rule::builtin(
                "auth-password-reset",
                PathPattern::literal("/api/auth/password-reset/"),
                &[Method::Post],
                HOUR_MS,
                3,
                KeyType::Ip,
            ),
            Rule::builtin(
                "chat",
                PathPattern::literal("/api/ask/"),
                &[Method::Post],
                MINUTE_MS,
                30,
                KeyType::UserId,
            ),
            Rule::builtin(
                "file-upload",
                PathPattern::literal("/api/files/"),
                &[Method::Post, Method::Put],
                MINUTE_MS,
                20,
                KeyType::UserId,
            ),
            Rule::builtin(
                "convo-import",
                PathPattern::Regex(
                    Regex::new(r"^/api/convos/(import|fork|duplicate)$")
                        .expect("static pattern is valid"),
                ),
                &[Method::Post],
                HOUR_MS,
                10,
                KeyType::UserId,
            ),
            Rule::builtin(
                "api-mutation",
                PathPattern::Regex(Regex::new(r"^/api/").expect("static pattern is valid")),
                &Method::ALL,
                MINUTE_MS,
                120,
                KeyType::UserId,
            ),
        ];

        Self { rules }
    }
}
