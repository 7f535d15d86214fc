//! # Idempotency Core
//!
//! Coordination protocol for HTTP idempotency keys.
//!
//! A client retrying a mutating request with the same `Idempotency-Key` must
//! observe exactly the outcome of the original request, and the handler's
//! business logic must not run twice, even when retries race each other or
//! the original execution crashed half way through.
//!
//! ## Core Concepts
//!
//! - **Digest**: SHA-256 fingerprint of `(method, path, body)` identifying the request
//! - **Record**: one persistent row per key holding the digest, lock, recovery point and cached response
//! - **Coordinator**: admits, rejects or replays a request, and releases the lock afterwards
//! - **Recovery point**: named stage of a resumable handler (`started` → ... → `finished`)
//! - **Executor**: runs stages from a [`StageMap`], committing progress after each one
//!
//! ## Request Flow
//!
//! ```text
//! request ──► admit() ──► Conflict ───────────────► 409 {"message": ...}
//!                │
//!                ├──► NotApplicable ──► handler (no coordination)
//!                │
//!                └──► Admitted ──► proceed(stage map) ──► response
//!                                        │
//!                      release() ◄───────┘   (always, success or failure)
//! ```
//!
//! All mutual exclusion goes through the store's transactional row locks; there
//! are no in-process locks, so any number of processes can share one store.
//!
//! ## Example
//!
//! ```ignore
//! use idempotency_core::{Decision, IdempotencyCoordinator, ReleaseOutcome, StageMap, StageOutcome};
//! use idempotency_core::recovery_point::RecoveryPoint;
//!
//! let coordinator = IdempotencyCoordinator::with_system_clock(store, config);
//!
//! match coordinator.admit(&request).await? {
//!     Decision::Admitted(admitted) => {
//!         let stages = StageMap::new().stage(RecoveryPoint::STARTED, |tx| {
//!             Box::pin(async move {
//!                 create_order(tx).await?;
//!                 Ok(StageOutcome::finish(201, json!({"id": 7})))
//!             })
//!         });
//!         let outcome = coordinator.proceed(&admitted, &stages).await;
//!         coordinator.release(&admitted, ReleaseOutcome::from_result(&outcome)).await?;
//!         outcome
//!     }
//!     other => /* bypass or reject */
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod digest;
pub mod error;
pub mod executor;
pub mod record;
pub mod recovery_point;
pub mod request;
pub mod store;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use config::{IdempotencyConfig, LockReleasePolicy};
pub use coordinator::{
    AdmissionKind, AdmittedKey, ConflictReason, Decision, IdempotencyCoordinator, ReleaseAction,
    ReleaseOutcome,
};
pub use digest::{RequestDigest, digest};
pub use error::{IdempotencyError, StoreError};
pub use executor::{RecoveryExecutor, Stage, StageFuture, StageMap, StageOutcome};
pub use record::{IdempotencyRecord, NewRecord, RecordField, RecordKey};
pub use recovery_point::RecoveryPoint;
pub use request::{IDEMPOTENCY_KEY_HEADER, IncomingRequest, OutcomeResponse, canonical_json};
pub use store::{IdempotencyStore, StoreTransaction};

/// Environment module - Time abstraction
///
/// Lock expiry is decided by comparing `locked_at` against the current time,
/// so the clock is injected rather than read from the system directly.
pub mod environment {
    use chrono::{DateTime, SubsecRound, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Current time truncated to microseconds, the precision stores keep.
    ///
    /// `locked_at` doubles as the lock owner's token and is compared for
    /// equality after a round trip through storage.
    #[must_use]
    pub fn store_now(clock: &dyn Clock) -> DateTime<Utc> {
        clock.now().trunc_subsecs(6)
    }
}
