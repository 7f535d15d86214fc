//! Lock/admission coordinator.
//!
//! [`IdempotencyCoordinator::admit`] decides what happens to an incoming
//! request before the handler sees it, and
//! [`IdempotencyCoordinator::release`] gives the lock back once the request
//! is over. Both run as a single store transaction with a locking re-read,
//! so two requests for the same key are serialized by the store.
//!
//! # Admission
//!
//! | Record state                              | Decision                          |
//! |-------------------------------------------|-----------------------------------|
//! | none (created now, locked by us)          | `Admitted(Fresh)`                 |
//! | digest differs                            | `Conflict(ParameterMismatch)`     |
//! | locked, lock younger than `lock_timeout`  | `Conflict(InProgress)`            |
//! | not finished (lock expired or released)   | `Admitted(Resumed)`, lock retaken |
//! | finished                                  | `Admitted(Replay)`, no lock       |

use crate::config::{IdempotencyConfig, LockReleasePolicy};
use crate::digest::{RequestDigest, digest};
use crate::environment::{Clock, SystemClock, store_now};
use crate::error::{IdempotencyError, StoreError};
use crate::executor::{RecoveryExecutor, StageFuture, StageMap};
use crate::record::{IdempotencyRecord, NewRecord, RecordField, RecordKey};
use crate::recovery_point::RecoveryPoint;
use crate::request::{IncomingRequest, OutcomeResponse, is_mutating_method};
use crate::store::{IdempotencyStore, StoreTransaction};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// The key was used before for a different method, path or body.
    ParameterMismatch,
    /// Another execution holds a live lock on the key.
    InProgress,
}

impl ConflictReason {
    /// Client-facing message.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ParameterMismatch => "parameter mismatch",
            Self::InProgress => "in progress",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// How an admitted request relates to earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionKind {
    /// First request with this key.
    Fresh,
    /// An unfinished record whose lock was free; execution continues from
    /// its recovery point.
    Resumed,
    /// Finished record; the cached response is returned as is.
    Replay,
}

/// An admitted request: the record as it stood right after admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedKey {
    record: IdempotencyRecord,
    kind: AdmissionKind,
}

impl AdmittedKey {
    /// Snapshot of the record taken at admission.
    #[must_use]
    pub const fn record(&self) -> &IdempotencyRecord {
        &self.record
    }

    /// Fresh, resumed or replay.
    #[must_use]
    pub const fn kind(&self) -> AdmissionKind {
        self.kind
    }

    /// The record's key.
    #[must_use]
    pub const fn key(&self) -> &RecordKey {
        &self.record.key
    }

    /// Whether this execution owns the record's lock.
    #[must_use]
    pub const fn holds_lock(&self) -> bool {
        self.record.locked_at.is_some()
    }
}

/// Outcome of [`IdempotencyCoordinator::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No key or a non-mutating method: run the handler without coordination.
    NotApplicable,
    /// The key header is present but unusable.
    InvalidKey(String),
    /// Turned away; the handler must not run.
    Conflict(ConflictReason),
    /// Go ahead.
    Admitted(AdmittedKey),
}

impl Decision {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NotApplicable => "not_applicable",
            Self::InvalidKey(_) => "invalid_key",
            Self::Conflict(ConflictReason::ParameterMismatch) => "parameter_mismatch",
            Self::Conflict(ConflictReason::InProgress) => "in_progress",
            Self::Admitted(admitted) => match admitted.kind {
                AdmissionKind::Fresh => "fresh",
                AdmissionKind::Resumed => "resumed",
                AdmissionKind::Replay => "replay",
            },
        }
    }
}

/// How the request ended, as far as lock release is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The handler produced a response.
    Completed,
    /// The handler failed.
    Failed,
}

impl ReleaseOutcome {
    /// `Failed` for an `Err`, `Completed` otherwise.
    #[must_use]
    pub const fn from_result<T, E>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Completed,
            Err(_) => Self::Failed,
        }
    }

    /// `Failed` for a server error status, `Completed` otherwise.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        if status >= 500 {
            Self::Failed
        } else {
            Self::Completed
        }
    }
}

/// What [`IdempotencyCoordinator::release`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
    /// This execution never held the lock (replay of an unlocked record).
    Skipped,
    /// Terminal status was exempt; the record is gone.
    Deleted,
    /// Lock cleared; the record stays for replay or resume.
    Unlocked,
    /// Request failed under [`LockReleasePolicy::HoldOnError`]; the lock
    /// stays until it times out.
    Held,
    /// The record no longer exists.
    Vanished,
    /// Another execution reclaimed the lock; left alone.
    Superseded,
}

impl ReleaseAction {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Deleted => "deleted",
            Self::Unlocked => "unlocked",
            Self::Held => "held",
            Self::Vanished => "vanished",
            Self::Superseded => "superseded",
        }
    }
}

/// Admits, runs and releases idempotent requests against one store.
pub struct IdempotencyCoordinator<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
}

impl<S> Clone for IdempotencyCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
        }
    }
}

impl<S> fmt::Debug for IdempotencyCoordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: IdempotencyStore> IdempotencyCoordinator<S> {
    /// Create a coordinator.
    #[must_use]
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: IdempotencyConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Create a coordinator reading the system clock.
    #[must_use]
    pub fn with_system_clock(store: Arc<S>, config: IdempotencyConfig) -> Self {
        Self::new(store, Arc::new(SystemClock), config)
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Executor sharing this coordinator's store and clock.
    #[must_use]
    pub fn executor(&self) -> RecoveryExecutor<S> {
        RecoveryExecutor::new(Arc::clone(&self.store), Arc::clone(&self.clock))
    }

    fn now(&self) -> DateTime<Utc> {
        store_now(self.clock.as_ref())
    }

    /// Decide whether `request` may run.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Store`] if the store fails. Conflicts are
    /// not errors; they come back as [`Decision::Conflict`].
    #[tracing::instrument(
        skip(self, request),
        fields(method = %request.method, path = %request.path, owner = ?request.owner)
    )]
    pub async fn admit(&self, request: &IncomingRequest) -> Result<Decision, IdempotencyError> {
        let Some(header) = request.idempotency_key_header() else {
            return Ok(Decision::NotApplicable);
        };
        if !is_mutating_method(&request.method) {
            return Ok(Decision::NotApplicable);
        }

        let parsed = header
            .to_str()
            .ok()
            .and_then(|value| Uuid::parse_str(value.trim()).ok());
        let Some(key) = parsed else {
            let decision = if self.config.reject_malformed_keys {
                Decision::InvalidKey("Idempotency-Key must be a UUID".to_string())
            } else {
                Decision::NotApplicable
            };
            tracing::debug!(decision = decision.label(), "Malformed idempotency key");
            metrics::counter!("idempotency.admission", "decision" => decision.label()).increment(1);
            return Ok(decision);
        };

        let key = RecordKey::scoped(request.owner.clone(), key);
        let request_digest = digest(request.method.as_str(), &request.path, &request.body);
        let now = self.now();

        let mut tx = self.store.begin().await?;
        let defaults = NewRecord {
            request_method: request.method.as_str().to_string(),
            request_path: request.path.clone(),
            request_body: request.body.to_vec(),
            request_digest,
            recovery_point: RecoveryPoint::STARTED,
            locked_at: Some(now),
            now,
        };
        let (record, created) = tx.get_or_create(&key, defaults).await?;

        let decision = if created {
            tx.commit().await?;
            Decision::Admitted(AdmittedKey {
                record,
                kind: AdmissionKind::Fresh,
            })
        } else {
            self.admit_existing(tx, &key, request_digest, now).await?
        };

        tracing::info!(key = %key, decision = decision.label(), "Idempotency admission");
        metrics::counter!("idempotency.admission", "decision" => decision.label()).increment(1);
        Ok(decision)
    }

    async fn admit_existing(
        &self,
        mut tx: S::Transaction,
        key: &RecordKey,
        request_digest: RequestDigest,
        now: DateTime<Utc>,
    ) -> Result<Decision, IdempotencyError> {
        let mut record = tx.lock_for_update(key).await?;

        if record.request_digest != request_digest {
            tx.rollback().await?;
            return Ok(Decision::Conflict(ConflictReason::ParameterMismatch));
        }

        if record.lock_is_live(now, self.config.lock_timeout) {
            tx.rollback().await?;
            return Ok(Decision::Conflict(ConflictReason::InProgress));
        }

        let kind = if record.is_finished() {
            AdmissionKind::Replay
        } else {
            if record.locked_at.is_some() {
                tracing::warn!(
                    key = %key,
                    recovery_point = %record.recovery_point,
                    "Reclaiming expired idempotency lock"
                );
            }
            record.locked_at = Some(now);
            record.last_run_at = now;
            tx.save(&record, &[RecordField::LockedAt, RecordField::LastRunAt])
                .await?;
            AdmissionKind::Resumed
        };

        tx.commit().await?;
        Ok(Decision::Admitted(AdmittedKey { record, kind }))
    }

    /// Run `stages` for an admitted request. See [`RecoveryExecutor::proceed`].
    ///
    /// # Errors
    ///
    /// Fails like [`RecoveryExecutor::proceed`].
    pub async fn proceed(
        &self,
        admitted: &AdmittedKey,
        stages: &StageMap<S::Transaction>,
    ) -> Result<OutcomeResponse, IdempotencyError> {
        self.executor().proceed(admitted, stages).await
    }

    /// Run a single-stage handler. See [`RecoveryExecutor::proceed_single`].
    ///
    /// # Errors
    ///
    /// Fails like [`RecoveryExecutor::proceed_single`].
    pub async fn proceed_single<F>(
        &self,
        admitted: &AdmittedKey,
        action: F,
    ) -> Result<OutcomeResponse, IdempotencyError>
    where
        F: for<'a> Fn(&'a mut S::Transaction) -> StageFuture<'a> + Send + Sync,
    {
        self.executor().proceed_single(admitted, action).await
    }

    /// Give back the lock taken at admission.
    ///
    /// Must run once per admitted request, whether the handler succeeded or
    /// not. A record whose cached status is exempt is deleted so the key can
    /// be reused from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Store`] if the store fails.
    #[tracing::instrument(skip(self, admitted), fields(key = %admitted.key()))]
    pub async fn release(
        &self,
        admitted: &AdmittedKey,
        outcome: ReleaseOutcome,
    ) -> Result<ReleaseAction, IdempotencyError> {
        let Some(token) = admitted.record.locked_at else {
            return Ok(ReleaseAction::Skipped);
        };

        let mut tx = self.store.begin().await?;
        let mut record = match tx.lock_for_update(admitted.key()).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                tx.rollback().await?;
                tracing::debug!("Idempotency record vanished before release");
                metrics::counter!("idempotency.release", "action" => ReleaseAction::Vanished.label())
                    .increment(1);
                return Ok(ReleaseAction::Vanished);
            }
            Err(error) => return Err(error.into()),
        };

        let action = if record.locked_at != Some(token) {
            ReleaseAction::Superseded
        } else if record
            .response_code
            .is_some_and(|code| self.config.is_exempt(code))
        {
            tx.delete(&record).await?;
            ReleaseAction::Deleted
        } else if outcome == ReleaseOutcome::Failed
            && self.config.release_policy == LockReleasePolicy::HoldOnError
        {
            ReleaseAction::Held
        } else {
            record.locked_at = None;
            tx.save(&record, &[RecordField::LockedAt]).await?;
            ReleaseAction::Unlocked
        };
        tx.commit().await?;

        tracing::debug!(action = action.label(), ?outcome, "Idempotency lock released");
        metrics::counter!("idempotency.release", "action" => action.label()).increment(1);
        Ok(action)
    }

    /// Delete unlocked finished records created more than `older_than` ago.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Store`] if the store fails.
    pub async fn purge_finished_before(
        &self,
        older_than: std::time::Duration,
    ) -> Result<u64, IdempotencyError> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| self.now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.store.purge_finished_before(cutoff).await?;
        tracing::info!(purged, %cutoff, "Purged finished idempotency records");
        Ok(purged)
    }
}
