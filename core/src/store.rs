//! Storage contract for idempotency records.
//!
//! The protocol needs a transactional store with row-level locking. Every
//! operation runs inside a [`StoreTransaction`]; admission composes
//! `get_or_create`, `lock_for_update` and a conditional `save` into one
//! atomic unit, and each recovery-point stage gets a transaction of its own.
//!
//! # Implementations
//!
//! - `PostgresIdempotencyStore` (in `idempotency-postgres`): production store
//! - `InMemoryIdempotencyStore` (in `idempotency-testing`): fast, deterministic tests

use crate::error::StoreError;
use crate::record::{IdempotencyRecord, NewRecord, RecordField, RecordKey};
use chrono::{DateTime, Utc};
use std::future::Future;

/// A transactional store of idempotency records.
///
/// # Thread Safety
///
/// Implementations are shared between concurrent requests and must be
/// `Send + Sync`. Mutual exclusion between requests comes from the store's
/// own locking, never from locks held in application memory.
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Transaction handle; also handed to stage actions so business writes
    /// commit atomically with the recovery-point advance.
    type Transaction: StoreTransaction;

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if no connection is available.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, StoreError>> + Send;

    /// Delete unlocked, finished records created before `cutoff`.
    ///
    /// Records are otherwise kept forever; this is an explicit retention
    /// sweep for operators. Returns the number of deleted records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    fn purge_finished_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// Operations available inside one store transaction.
///
/// Dropping a transaction without calling [`StoreTransaction::commit`]
/// rolls it back.
pub trait StoreTransaction: Send {
    /// Insert a record for `key` unless one exists.
    ///
    /// Returns the record and `true` if this call created it. Concurrent
    /// callers racing on the same key see exactly one `true`; the others get
    /// the existing record (unlocked) and `false`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert or read fails.
    fn get_or_create(
        &mut self,
        key: &RecordKey,
        defaults: NewRecord,
    ) -> impl Future<Output = Result<(IdempotencyRecord, bool), StoreError>> + Send;

    /// Read a record holding an exclusive row lock until the transaction ends.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no record exists for `key`.
    fn lock_for_update(
        &mut self,
        key: &RecordKey,
    ) -> impl Future<Output = Result<IdempotencyRecord, StoreError>> + Send;

    /// Write the listed fields of `record`; other columns are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the record no longer exists.
    fn save(
        &mut self,
        record: &IdempotencyRecord,
        fields: &[RecordField],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete `record`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    fn delete(
        &mut self,
        record: &IdempotencyRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Commit all changes made in this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the commit fails; nothing is applied.
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Discard all changes made in this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the rollback fails.
    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}
