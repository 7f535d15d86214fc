//! Protocol configuration.
//!
//! Loads from environment variables with sensible defaults:
//!
//! | Variable                            | Default  | Meaning                                   |
//! |-------------------------------------|----------|-------------------------------------------|
//! | `IDEMPOTENCY_KEY_LOCK_TIMEOUT`      | `300`    | Seconds before a held lock is abandoned   |
//! | `IDEMPOTENCY_EXEMPT_STATUSES`       | `400`    | Comma list of statuses that are not cached|
//! | `IDEMPOTENCY_RELEASE_POLICY`        | `always` | `always` or `hold-on-error`               |
//! | `IDEMPOTENCY_REJECT_MALFORMED_KEYS` | `true`   | Reject non-UUID keys with 400             |

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::time::Duration;

/// Default lock timeout (5 minutes).
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// What happens to the lock when the request fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockReleasePolicy {
    /// Clear the lock on every path, so a retry can resume immediately.
    #[default]
    Always,
    /// Keep the lock after a failure; retries wait for the lock timeout.
    HoldOnError,
}

impl LockReleasePolicy {
    /// Parse `always` / `hold-on-error`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Some(Self::Always),
            "hold-on-error" | "hold_on_error" => Some(Self::HoldOnError),
            _ => None,
        }
    }
}

/// Idempotency protocol configuration.
///
/// # Default Values
///
/// - `lock_timeout`: 300 seconds
/// - `exempt_statuses`: `{400}`
/// - `release_policy`: [`LockReleasePolicy::Always`]
/// - `reject_malformed_keys`: `true`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Age after which a held lock is considered abandoned and may be reclaimed.
    ///
    /// Must exceed the slowest stage; otherwise two executions can both
    /// believe they own the lock.
    pub lock_timeout: Duration,
    /// Terminal status codes whose records are deleted instead of cached.
    pub exempt_statuses: BTreeSet<u16>,
    /// Lock handling after a failed request.
    pub release_policy: LockReleasePolicy,
    /// Reject non-UUID keys (400) instead of bypassing the protocol.
    pub reject_malformed_keys: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            exempt_statuses: BTreeSet::from([400]),
            release_policy: LockReleasePolicy::Always,
            reject_malformed_keys: true,
        }
    }
}

impl IdempotencyConfig {
    /// Create a new config builder.
    #[must_use]
    pub fn builder() -> IdempotencyConfigBuilder {
        IdempotencyConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Missing or unparsable values fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let lock_timeout = parse_var(&lookup, "IDEMPOTENCY_KEY_LOCK_TIMEOUT", |s| {
            s.parse().ok().map(Duration::from_secs)
        })
        .unwrap_or(defaults.lock_timeout);

        let exempt_statuses = parse_var(&lookup, "IDEMPOTENCY_EXEMPT_STATUSES", |s| {
            s.split(',')
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(str::parse)
                .collect::<Result<BTreeSet<u16>, _>>()
                .ok()
        })
        .unwrap_or(defaults.exempt_statuses);

        let release_policy = parse_var(&lookup, "IDEMPOTENCY_RELEASE_POLICY", LockReleasePolicy::parse)
            .unwrap_or(defaults.release_policy);

        let reject_malformed_keys =
            parse_var(&lookup, "IDEMPOTENCY_REJECT_MALFORMED_KEYS", |s| s.parse().ok())
                .unwrap_or(defaults.reject_malformed_keys);

        Self {
            lock_timeout,
            exempt_statuses,
            release_policy,
            reject_malformed_keys,
        }
    }

    /// Whether records ending with `status` are deleted rather than cached.
    #[must_use]
    pub fn is_exempt(&self, status: u16) -> bool {
        self.exempt_statuses.contains(&status)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(name)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        tracing::warn!(variable = name, value = %raw, "Ignoring invalid configuration value");
    }
    parsed
}

/// Builder for [`IdempotencyConfig`].
#[derive(Debug, Clone)]
pub struct IdempotencyConfigBuilder {
    config: IdempotencyConfig,
}

impl IdempotencyConfigBuilder {
    /// Set the lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Replace the exempt status set.
    #[must_use]
    pub fn exempt_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.config.exempt_statuses = statuses.into_iter().collect();
        self
    }

    /// Set the lock release policy.
    #[must_use]
    pub const fn release_policy(mut self, policy: LockReleasePolicy) -> Self {
        self.config.release_policy = policy;
        self
    }

    /// Choose whether malformed keys are rejected.
    #[must_use]
    pub const fn reject_malformed_keys(mut self, reject: bool) -> Self {
        self.config.reject_malformed_keys = reject;
        self
    }

    /// Build the [`IdempotencyConfig`].
    #[must_use]
    pub fn build(self) -> IdempotencyConfig {
        self.config
    }
}
