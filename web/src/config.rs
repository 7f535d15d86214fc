//! HTTP binding configuration.

use std::env;

/// Default request body limit for idempotent requests (2 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Settings for [`crate::IdempotencyLayer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebConfig {
    /// Largest body the layer buffers for digesting; larger requests get 413.
    pub max_body_bytes: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl WebConfig {
    /// Load from `IDEMPOTENCY_MAX_BODY_BYTES`, falling back to the default.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load through an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let max_body_bytes = match lookup("IDEMPOTENCY_MAX_BODY_BYTES") {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(
                    variable = "IDEMPOTENCY_MAX_BODY_BYTES",
                    value = %raw,
                    "Ignoring invalid configuration value"
                );
                DEFAULT_MAX_BODY_BYTES
            }),
            None => DEFAULT_MAX_BODY_BYTES,
        };
        Self { max_body_bytes }
    }
}
