//! Bucket key derivation.

use std::fmt;

use super::rules::KeyType;

/// Key used when no client address can be derived from the request.
pub const DEFAULT_CLIENT_IP: &str = "127.0.0.1";

/// Request attributes supplied by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Authenticated user identity, if any
    pub user_id: Option<String>,
    /// Raw `x-forwarded-for` header value
    pub forwarded_for: Option<String>,
    /// Raw `x-real-ip` header value
    pub real_ip: Option<String>,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_real_ip(mut self, value: impl Into<String>) -> Self {
        self.real_ip = Some(value.into());
        self
    }

    /// Derive the client address from proxy headers.
    ///
    /// Order: first `x-forwarded-for` entry, then `x-real-ip`, then
    /// [`DEFAULT_CLIENT_IP`]. Headers are trusted as-is; only a trusted proxy
    /// must be able to set them.
    pub fn client_ip(&self) -> &str {
        if let Some(first) = self
            .forwarded_for
            .as_deref()
            .and_then(|xff| xff.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
        {
            return first;
        }

        self.real_ip
            .as_deref()
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .unwrap_or(DEFAULT_CLIENT_IP)
    }
}

/// Derive the bucketing key for a rule's key type.
///
/// Returns `None` only for user keying when the request has no identity.
pub fn extract_key(key_type: KeyType, ctx: &RequestContext) -> Option<String> {
    match key_type {
        KeyType::UserId => ctx.user_id.clone(),
        KeyType::Ip => Some(ctx.client_ip().to_string()),
    }
}

/// Composite key identifying one bucket: the rule plus the caller key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub rule_id: String,
    pub key: String,
}

impl BucketKey {
    pub fn new(rule_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rule_id, self.key)
    }
}
