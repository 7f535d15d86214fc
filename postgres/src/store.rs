//! `PostgreSQL` idempotency store.
//!
//! Records live in the `idempotency_keys` table (see `migrations/`). Row
//! locking uses `SELECT ... FOR UPDATE` inside an explicit transaction, and
//! creation races are settled by the `(owner, idempotency_key)` unique
//! constraint through `INSERT ... ON CONFLICT DO NOTHING`.

use chrono::{DateTime, Utc};
use idempotency_core::{
    IdempotencyRecord, IdempotencyStore, NewRecord, RecordField, RecordKey, RecoveryPoint,
    RequestDigest, StoreError, StoreTransaction,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

const COLUMNS: &str = "owner, idempotency_key, created_at, last_run_at, locked_at, \
     request_method, request_path, request_body, request_digest, \
     response_code, response_body, recovery_point";

/// `PostgreSQL`-backed [`IdempotencyStore`].
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a pool of up to `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect: {e}")))?;
        Ok(Self::new(pool))
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if migrations fail.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Idempotency store migrations applied");
        Ok(())
    }

    /// Read a record outside any transaction, without locking it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or the row cannot be decoded.
    pub async fn fetch(&self, key: &RecordKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM idempotency_keys WHERE owner = $1 AND idempotency_key = $2"
        );
        let row = sqlx::query(&sql)
            .bind(key.scope())
            .bind(key.key())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to fetch record: {e}")))?;
        row.as_ref().map(row_to_record).transpose()
    }
}

impl IdempotencyStore for PostgresIdempotencyStore {
    type Transaction = PostgresTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(format!("Failed to start transaction: {e}")))?;
        Ok(PostgresTransaction { tx })
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r"
            DELETE FROM idempotency_keys
            WHERE recovery_point = $1 AND locked_at IS NULL AND created_at < $2
            ",
        )
        .bind(RecoveryPoint::FINISHED.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to purge records: {e}")))?;
        Ok(result.rows_affected())
    }
}

/// An open `PostgreSQL` transaction.
///
/// Stage actions receive this; business writes made through
/// [`PostgresTransaction::connection`] commit together with the
/// recovery-point advance.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction").finish_non_exhaustive()
    }
}

impl PostgresTransaction {
    /// Connection bound to this transaction.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    async fn insert_if_absent(
        &mut self,
        key: &RecordKey,
        defaults: &NewRecord,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let sql = format!(
            r"
            INSERT INTO idempotency_keys (
                owner, idempotency_key, created_at, last_run_at, locked_at,
                request_method, request_path, request_body, request_digest, recovery_point
            )
            VALUES ($1, $2, $3, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (owner, idempotency_key) DO NOTHING
            RETURNING {COLUMNS}
            "
        );
        let row = sqlx::query(&sql)
            .bind(key.scope())
            .bind(key.key())
            .bind(defaults.now)
            .bind(defaults.locked_at)
            .bind(&defaults.request_method)
            .bind(&defaults.request_path)
            .bind(&defaults.request_body)
            .bind(defaults.request_digest.as_bytes().as_slice())
            .bind(defaults.recovery_point.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to insert record: {e}")))?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn select(
        &mut self,
        key: &RecordKey,
        for_update: bool,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let sql = format!(
            "SELECT {COLUMNS} FROM idempotency_keys \
             WHERE owner = $1 AND idempotency_key = $2{lock}"
        );
        let row = sqlx::query(&sql)
            .bind(key.scope())
            .bind(key.key())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to read record: {e}")))?;
        row.as_ref().map(row_to_record).transpose()
    }
}

impl StoreTransaction for PostgresTransaction {
    async fn get_or_create(
        &mut self,
        key: &RecordKey,
        defaults: NewRecord,
    ) -> Result<(IdempotencyRecord, bool), StoreError> {
        // A concurrent delete can remove the conflicting row between the
        // insert and the read; one more insert settles it.
        for _ in 0..2 {
            if let Some(record) = self.insert_if_absent(key, &defaults).await? {
                return Ok((record, true));
            }
            metrics::counter!("idempotency.postgres.insert_conflict").increment(1);
            if let Some(record) = self.select(key, false).await? {
                return Ok((record, false));
            }
        }
        Err(StoreError::NotFound(key.clone()))
    }

    async fn lock_for_update(&mut self, key: &RecordKey) -> Result<IdempotencyRecord, StoreError> {
        self.select(key, true)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn save(
        &mut self,
        record: &IdempotencyRecord,
        fields: &[RecordField],
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::<Postgres>::new("UPDATE idempotency_keys SET ");
        {
            let mut set = builder.separated(", ");
            for field in fields {
                match field {
                    RecordField::LockedAt => {
                        set.push("locked_at = ");
                        set.push_bind_unseparated(record.locked_at);
                    }
                    RecordField::LastRunAt => {
                        set.push("last_run_at = ");
                        set.push_bind_unseparated(record.last_run_at);
                    }
                    RecordField::RecoveryPoint => {
                        set.push("recovery_point = ");
                        set.push_bind_unseparated(record.recovery_point.as_str().to_string());
                    }
                    RecordField::Response => {
                        set.push("response_code = ");
                        set.push_bind_unseparated(record.response_code.map(i32::from));
                        set.push("response_body = ");
                        set.push_bind_unseparated(record.response_body.clone());
                    }
                }
            }
        }
        builder.push(" WHERE owner = ");
        builder.push_bind(record.key.scope().to_string());
        builder.push(" AND idempotency_key = ");
        builder.push_bind(record.key.key());

        let result = builder
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to update record: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record.key.clone()));
        }
        Ok(())
    }

    async fn delete(&mut self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM idempotency_keys WHERE owner = $1 AND idempotency_key = $2")
            .bind(record.key.scope())
            .bind(record.key.key())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to delete record: {e}")))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| StoreError::Database(format!("Failed to commit transaction: {e}")))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| StoreError::Database(format!("Failed to roll back transaction: {e}")))
    }
}

fn row_to_record(row: &PgRow) -> Result<IdempotencyRecord, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Corrupt(e.to_string());

    let owner: String = row.try_get("owner").map_err(decode)?;
    let key: Uuid = row.try_get("idempotency_key").map_err(decode)?;
    let digest: Vec<u8> = row.try_get("request_digest").map_err(decode)?;
    let response_code: Option<i32> = row.try_get("response_code").map_err(decode)?;
    let recovery_point: String = row.try_get("recovery_point").map_err(decode)?;

    let response_code = response_code
        .map(|code| {
            u16::try_from(code)
                .map_err(|_| StoreError::Corrupt(format!("response code out of range: {code}")))
        })
        .transpose()?;

    Ok(IdempotencyRecord {
        key: RecordKey::scoped(Some(owner), key),
        created_at: row.try_get("created_at").map_err(decode)?,
        last_run_at: row.try_get("last_run_at").map_err(decode)?,
        locked_at: row.try_get("locked_at").map_err(decode)?,
        request_method: row.try_get("request_method").map_err(decode)?,
        request_path: row.try_get("request_path").map_err(decode)?,
        request_body: row.try_get("request_body").map_err(decode)?,
        request_digest: RequestDigest::from_slice(&digest)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        response_code,
        response_body: row.try_get("response_body").map_err(decode)?,
        recovery_point: RecoveryPoint::parse(recovery_point)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
    })
}
