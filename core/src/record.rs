//! The persistent unit of coordination.

use crate::digest::RequestDigest;
use crate::recovery_point::RecoveryPoint;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identity of a record: the client's key, optionally scoped to an owner.
///
/// Two callers may pick the same UUID without colliding when the deployment
/// scopes keys per authenticated owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    owner: Option<String>,
    key: Uuid,
}

impl RecordKey {
    /// An unscoped key.
    #[must_use]
    pub const fn new(key: Uuid) -> Self {
        Self { owner: None, key }
    }

    /// A key scoped to `owner`; `None` means unscoped.
    ///
    /// An empty owner string is treated as unscoped.
    #[must_use]
    pub fn scoped(owner: Option<String>, key: Uuid) -> Self {
        Self {
            owner: owner.filter(|o| !o.is_empty()),
            key,
        }
    }

    /// The client-supplied idempotency key.
    #[must_use]
    pub const fn key(&self) -> Uuid {
        self.key
    }

    /// The owner scope, if any.
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// The owner scope as stored: empty when unscoped.
    #[must_use]
    pub fn scope(&self) -> &str {
        self.owner.as_deref().unwrap_or("")
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner {
            Some(owner) => write!(f, "{owner}/{}", self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

/// Field values used when a record is created.
#[derive(Debug, Clone)]
pub struct NewRecord {
    /// Original request method
    pub request_method: String,
    /// Original request path (without query string)
    pub request_path: String,
    /// Original request body
    pub request_body: Vec<u8>,
    /// Fingerprint of method, path and body
    pub request_digest: RequestDigest,
    /// Initial recovery point
    pub recovery_point: RecoveryPoint,
    /// Lock timestamp; set when the creating execution owns the lock
    pub locked_at: Option<DateTime<Utc>>,
    /// Creation time, also used as the first `last_run_at`
    pub now: DateTime<Utc>,
}

/// One row per idempotency key.
///
/// `response_code` and `response_body` are both `None` until the record
/// reaches [`RecoveryPoint::FINISHED`], after which both are set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    /// Owner-scoped key
    pub key: RecordKey,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When an execution last acquired the lock or advanced the record
    pub last_run_at: DateTime<Utc>,
    /// Set while an execution holds the lock
    pub locked_at: Option<DateTime<Utc>>,
    /// Original request method
    pub request_method: String,
    /// Original request path
    pub request_path: String,
    /// Original request body
    pub request_body: Vec<u8>,
    /// Fingerprint of the original request; never changes
    pub request_digest: RequestDigest,
    /// Cached status code, set at `FINISHED`
    pub response_code: Option<u16>,
    /// Cached canonical JSON body, set at `FINISHED`
    pub response_body: Option<String>,
    /// Current stage
    pub recovery_point: RecoveryPoint,
}

impl IdempotencyRecord {
    /// Build the record a store inserts for `key`.
    #[must_use]
    pub fn from_new(key: RecordKey, new: NewRecord) -> Self {
        Self {
            key,
            created_at: new.now,
            last_run_at: new.now,
            locked_at: new.locked_at,
            request_method: new.request_method,
            request_path: new.request_path,
            request_body: new.request_body,
            request_digest: new.request_digest,
            response_code: None,
            response_body: None,
            recovery_point: new.recovery_point,
        }
    }

    /// The record's key.
    #[must_use]
    pub const fn key(&self) -> &RecordKey {
        &self.key
    }

    /// Whether the record reached the terminal recovery point.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.recovery_point.is_finished()
    }

    /// Whether a lock is held and younger than `lock_timeout` at `now`.
    ///
    /// A `locked_at` in the future (clock skew between processes) counts as held.
    #[must_use]
    pub fn lock_is_live(&self, now: DateTime<Utc>, lock_timeout: Duration) -> bool {
        self.locked_at
            .is_some_and(|locked_at| match (now - locked_at).to_std() {
                Ok(age) => age < lock_timeout,
                Err(_) => true,
            })
    }

    /// The cached `(status, body)` pair once finished.
    #[must_use]
    pub fn cached_response(&self) -> Option<(u16, &str)> {
        match (self.response_code, self.response_body.as_deref()) {
            (Some(code), Some(body)) => Some((code, body)),
            _ => None,
        }
    }
}

/// Columns a partial update may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordField {
    /// `locked_at`
    LockedAt,
    /// `last_run_at`
    LastRunAt,
    /// `recovery_point`
    RecoveryPoint,
    /// `response_code` and `response_body` together
    Response,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::digest::digest;
    use chrono::TimeZone;

    fn record(locked_at: Option<DateTime<Utc>>) -> IdempotencyRecord {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        IdempotencyRecord::from_new(
            RecordKey::new(Uuid::nil()),
            NewRecord {
                request_method: "POST".to_string(),
                request_path: "/orders".to_string(),
                request_body: b"{}".to_vec(),
                request_digest: digest("POST", "/orders", b"{}"),
                recovery_point: RecoveryPoint::STARTED,
                locked_at,
                now,
            },
        )
    }

    #[test]
    fn lock_liveness_follows_timeout() {
        let locked = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let r = record(Some(locked));
        let timeout = Duration::from_secs(60);

        assert!(r.lock_is_live(locked + chrono::Duration::seconds(59), timeout));
        assert!(!r.lock_is_live(locked + chrono::Duration::seconds(60), timeout));
        // Clock skew: lock taken "in the future" is still held
        assert!(r.lock_is_live(locked - chrono::Duration::seconds(5), timeout));
        assert!(!record(None).lock_is_live(locked, timeout));
    }

    #[test]
    fn new_record_has_no_cached_response() {
        let r = record(None);
        assert_eq!(r.cached_response(), None);
        assert_eq!(r.created_at, r.last_run_at);
        assert!(!r.is_finished());
    }

    #[test]
    fn empty_owner_is_unscoped() {
        let key = RecordKey::scoped(Some(String::new()), Uuid::nil());
        assert_eq!(key, RecordKey::new(Uuid::nil()));
        assert_eq!(key.scope(), "");

        let scoped = RecordKey::scoped(Some("user-1".to_string()), Uuid::nil());
        assert_eq!(scoped.owner(), Some("user-1"));
        assert_eq!(scoped.to_string(), format!("user-1/{}", Uuid::nil()));
    }
}
