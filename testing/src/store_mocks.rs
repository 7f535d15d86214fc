//! In-memory idempotency store.
//!
//! Provides fast, deterministic storage for protocol tests:
//! - [`InMemoryIdempotencyStore`]: `HashMap`-backed records
//! - [`InMemoryTransaction`]: snapshot transaction with rollback on drop
//!
//! Transactions serialize on a single store-wide lock. That is coarser than
//! a row lock but gives the same guarantee the protocol relies on: a
//! `lock_for_update` read cannot interleave with another transaction.

use idempotency_core::{
    DateTime, IdempotencyRecord, IdempotencyStore, NewRecord, RecordField, RecordKey, StoreError,
    StoreTransaction, Utc,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Table = HashMap<RecordKey, IdempotencyRecord>;

/// In-memory idempotency store for fast, deterministic testing.
///
/// Clones share the same records.
///
/// # Example
///
/// ```
/// use idempotency_testing::InMemoryIdempotencyStore;
/// use idempotency_core::IdempotencyStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryIdempotencyStore::new();
/// let tx = store.begin().await?;
/// drop(tx); // rolled back
/// assert!(store.is_empty().await);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<Mutex<Table>>,
}

impl InMemoryIdempotencyStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a record without a transaction (for assertions)
    pub async fn get(&self, key: &RecordKey) -> Option<IdempotencyRecord> {
        self.records.lock().await.get(key).cloned()
    }

    /// Insert or replace a record directly (for seeding scenarios)
    pub async fn insert(&self, record: IdempotencyRecord) {
        self.records.lock().await.insert(record.key.clone(), record);
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Check if the store is empty
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Remove all records (for test isolation)
    pub async fn clear(&self) {
        self.records.lock().await.clear();
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        let guard = Arc::clone(&self.records).lock_owned().await;
        let snapshot = guard.clone();
        Ok(InMemoryTransaction {
            guard,
            snapshot: Some(snapshot),
        })
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| {
            !(record.is_finished() && record.locked_at.is_none() && record.created_at < cutoff)
        });
        Ok((before - records.len()) as u64)
    }
}

/// Transaction over [`InMemoryIdempotencyStore`].
///
/// Holds the store lock until committed, rolled back or dropped. Changes
/// are applied in place; the snapshot taken at `begin` is restored unless
/// the transaction commits.
#[derive(Debug)]
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<Table>,
    snapshot: Option<Table>,
}

impl StoreTransaction for InMemoryTransaction {
    async fn get_or_create(
        &mut self,
        key: &RecordKey,
        defaults: NewRecord,
    ) -> Result<(IdempotencyRecord, bool), StoreError> {
        if let Some(existing) = self.guard.get(key) {
            return Ok((existing.clone(), false));
        }
        let record = IdempotencyRecord::from_new(key.clone(), defaults);
        self.guard.insert(key.clone(), record.clone());
        Ok((record, true))
    }

    async fn lock_for_update(&mut self, key: &RecordKey) -> Result<IdempotencyRecord, StoreError> {
        self.guard
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn save(
        &mut self,
        record: &IdempotencyRecord,
        fields: &[RecordField],
    ) -> Result<(), StoreError> {
        let stored = self
            .guard
            .get_mut(&record.key)
            .ok_or_else(|| StoreError::NotFound(record.key.clone()))?;

        for field in fields {
            match field {
                RecordField::LockedAt => stored.locked_at = record.locked_at,
                RecordField::LastRunAt => stored.last_run_at = record.last_run_at,
                RecordField::RecoveryPoint => {
                    stored.recovery_point = record.recovery_point.clone();
                }
                RecordField::Response => {
                    stored.response_code = record.response_code;
                    stored.response_body.clone_from(&record.response_body);
                }
            }
        }
        Ok(())
    }

    async fn delete(&mut self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        self.guard.remove(&record.key);
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}
