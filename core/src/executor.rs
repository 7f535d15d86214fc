//! Recovery-point executor.
//!
//! A handler is expressed as a [`StageMap`]: one async action per
//! [`RecoveryPoint`]. The executor runs the action registered for the
//! record's current point inside a fresh store transaction, then advances the
//! record to the point the action returned, in the same transaction. A crash
//! between stages therefore leaves the record at the last committed point and
//! a later execution resumes from there.
//!
//! ```text
//! STARTED ──stage──► charge_created ──stage──► FINISHED (response cached)
//!    │                     │
//!    └─ tx commit ─────────┴─ tx commit
//! ```

use crate::coordinator::AdmittedKey;
use crate::environment::{Clock, store_now};
use crate::error::{IdempotencyError, StoreError};
use crate::record::RecordField;
use crate::recovery_point::RecoveryPoint;
use crate::request::{OutcomeResponse, canonical_json};
use crate::store::{IdempotencyStore, StoreTransaction};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by a stage action, borrowing the stage's transaction.
pub type StageFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<StageOutcome>> + Send + 'a>>;

/// Result of one stage: the response so far and the point to continue from.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    /// HTTP status code
    pub status_code: u16,
    /// Response body; only persisted when `next` is `FINISHED`
    pub body: Value,
    /// Recovery point the record advances to
    pub next: RecoveryPoint,
}

impl StageOutcome {
    /// Advance to `next`.
    #[must_use]
    pub const fn new(status_code: u16, body: Value, next: RecoveryPoint) -> Self {
        Self {
            status_code,
            body,
            next,
        }
    }

    /// Final outcome: advance to `FINISHED` and cache the response.
    #[must_use]
    pub const fn finish(status_code: u16, body: Value) -> Self {
        Self::new(status_code, body, RecoveryPoint::FINISHED)
    }
}

/// One resumable step of a handler.
///
/// The action receives the store transaction the recovery-point advance is
/// committed in, so business writes made through it are atomic with the
/// progress marker.
///
/// Any `Fn(&mut Tx) -> StageFuture<'_>` closure is a stage.
pub trait Stage<Tx>: Send + Sync {
    /// Run the stage inside `tx`.
    fn run<'a>(&'a self, tx: &'a mut Tx) -> StageFuture<'a>;
}

impl<Tx, F> Stage<Tx> for F
where
    F: for<'a> Fn(&'a mut Tx) -> StageFuture<'a> + Send + Sync,
{
    fn run<'a>(&'a self, tx: &'a mut Tx) -> StageFuture<'a> {
        (self)(tx)
    }
}

/// Stage actions keyed by the recovery point they run at.
///
/// # Example
///
/// ```ignore
/// let stages = StageMap::new()
///     .stage(RecoveryPoint::STARTED, |tx| {
///         Box::pin(async move {
///             create_charge(tx).await?;
///             Ok(StageOutcome::new(202, json!({}), CHARGE_CREATED))
///         })
///     })
///     .stage(CHARGE_CREATED, |tx| {
///         Box::pin(async move {
///             let receipt = send_receipt(tx).await?;
///             Ok(StageOutcome::finish(201, json!({"receipt": receipt})))
///         })
///     });
/// ```
pub struct StageMap<Tx> {
    stages: HashMap<RecoveryPoint, Box<dyn Stage<Tx>>>,
}

impl<Tx> StageMap<Tx> {
    /// An empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stages: HashMap::new(),
        }
    }

    /// Register `action` for `point`, replacing any previous action.
    #[must_use]
    pub fn stage<F>(mut self, point: RecoveryPoint, action: F) -> Self
    where
        F: for<'a> Fn(&'a mut Tx) -> StageFuture<'a> + Send + Sync + 'static,
    {
        self.stages.insert(point, Box::new(action));
        self
    }

    /// The action registered for `point`.
    #[must_use]
    pub fn get(&self, point: &RecoveryPoint) -> Option<&dyn Stage<Tx>> {
        self.stages.get(point).map(AsRef::as_ref)
    }

    /// Whether an action is registered for `point`.
    #[must_use]
    pub fn contains(&self, point: &RecoveryPoint) -> bool {
        self.stages.contains_key(point)
    }

    /// Number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether no stage is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl<Tx> Default for StageMap<Tx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Tx> fmt::Debug for StageMap<Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut points: Vec<_> = self.stages.keys().map(RecoveryPoint::as_str).collect();
        points.sort_unstable();
        f.debug_struct("StageMap").field("points", &points).finish()
    }
}

/// Drives an admitted record through its stages until `FINISHED`.
pub struct RecoveryExecutor<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for RecoveryExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S> fmt::Debug for RecoveryExecutor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryExecutor").finish_non_exhaustive()
    }
}

impl<S: IdempotencyStore> RecoveryExecutor<S> {
    /// Create an executor over `store`.
    #[must_use]
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Run stages from `stages` until the record is `FINISHED`, then return
    /// the cached response.
    ///
    /// A record admitted as a replay is already `FINISHED`: no stage runs.
    ///
    /// # Errors
    ///
    /// - [`IdempotencyError::MissingStage`]: no action for the current point
    /// - [`IdempotencyError::LockLost`]: another execution took over the record
    /// - [`IdempotencyError::Stage`]: an action failed; its transaction was rolled back
    /// - [`IdempotencyError::Store`]: the store failed
    pub async fn proceed(
        &self,
        admitted: &AdmittedKey,
        stages: &StageMap<S::Transaction>,
    ) -> Result<OutcomeResponse, IdempotencyError> {
        self.drive(admitted, |point| stages.get(point)).await
    }

    /// Run `action` as the only stage, from `STARTED` straight to `FINISHED`.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::UnexpectedRecoveryPoint`] if the record sits
    /// at a custom point, which only a multi-stage handler can resume from.
    /// Otherwise fails like [`RecoveryExecutor::proceed`].
    pub async fn proceed_single<F>(
        &self,
        admitted: &AdmittedKey,
        action: F,
    ) -> Result<OutcomeResponse, IdempotencyError>
    where
        F: for<'a> Fn(&'a mut S::Transaction) -> StageFuture<'a> + Send + Sync,
    {
        let point = &admitted.record().recovery_point;
        if !point.is_started() && !point.is_finished() {
            return Err(IdempotencyError::UnexpectedRecoveryPoint(point.clone()));
        }

        let action: &dyn Stage<S::Transaction> = &action;
        self.drive(admitted, |point| point.is_started().then_some(action))
            .await
    }

    #[tracing::instrument(
        skip(self, admitted, lookup),
        fields(key = %admitted.key(), kind = ?admitted.kind())
    )]
    async fn drive<'s, L>(
        &self,
        admitted: &AdmittedKey,
        lookup: L,
    ) -> Result<OutcomeResponse, IdempotencyError>
    where
        L: Fn(&RecoveryPoint) -> Option<&'s dyn Stage<S::Transaction>> + Send + Sync,
        S::Transaction: 's,
    {
        let key = admitted.key();
        let token = admitted.record().locked_at;
        let mut current = admitted.record().clone();

        while !current.is_finished() {
            let expected = current.recovery_point.clone();
            let stage =
                lookup(&expected).ok_or_else(|| IdempotencyError::MissingStage(expected.clone()))?;

            let mut tx = self.store.begin().await?;
            let mut record = tx.lock_for_update(key).await?;
            if record.recovery_point != expected || record.locked_at != token {
                tx.rollback().await?;
                tracing::warn!(
                    expected = %expected,
                    found = %record.recovery_point,
                    "Idempotency lock taken over by another execution"
                );
                return Err(IdempotencyError::LockLost {
                    expected,
                    found: record.recovery_point,
                });
            }

            tracing::debug!(recovery_point = %expected, "Running stage");
            let outcome = match stage.run(&mut tx).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    if let Err(rollback_error) = tx.rollback().await {
                        tracing::warn!(error = %rollback_error, "Failed to roll back stage transaction");
                    }
                    metrics::counter!("idempotency.stage.failed", "recovery_point" => expected.to_string())
                        .increment(1);
                    tracing::warn!(recovery_point = %expected, error = %error, "Stage failed");
                    return Err(IdempotencyError::Stage(error));
                }
            };

            record.recovery_point = outcome.next;
            record.last_run_at = store_now(self.clock.as_ref());
            let mut fields = vec![RecordField::RecoveryPoint, RecordField::LastRunAt];
            if record.recovery_point.is_finished() {
                record.response_code = Some(outcome.status_code);
                record.response_body = Some(canonical_json(&outcome.body)?);
                fields.push(RecordField::Response);
            }

            tx.save(&record, &fields).await?;
            tx.commit().await?;

            metrics::counter!("idempotency.stage.completed", "recovery_point" => expected.to_string())
                .increment(1);
            tracing::debug!(from = %expected, to = %record.recovery_point, "Recovery point advanced");
            current = record;
        }

        let (status_code, body) = current.cached_response().ok_or_else(|| {
            StoreError::Corrupt(format!("finished record {key} has no cached response"))
        })?;
        OutcomeResponse::from_cached(status_code, body)
    }
}
