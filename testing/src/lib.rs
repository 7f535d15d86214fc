//! # Idempotency Testing
//!
//! Testing utilities for the idempotency-key protocol.
//!
//! This crate provides:
//! - An in-memory transactional store
//! - Fixed and manually advanced clocks
//! - Request builders and tracing setup for tests
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```ignore
//! use idempotency_testing::{InMemoryIdempotencyStore, helpers::post, test_clock};
//!
//! #[tokio::test]
//! async fn replays_finished_request() {
//!     let store = Arc::new(InMemoryIdempotencyStore::new());
//!     let coordinator =
//!         IdempotencyCoordinator::new(store, Arc::new(test_clock()), IdempotencyConfig::default());
//!
//!     let decision = coordinator.admit(&post("/orders", r#"{"x":1}"#, KEY)).await?;
//!     assert!(matches!(decision, Decision::Admitted(_)));
//! }
//! ```

use chrono::{DateTime, Utc};
use idempotency_core::environment::Clock;

pub mod store_mocks;

/// Mock implementations of the environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, PoisonError, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use idempotency_testing::mocks::FixedClock;
    /// use idempotency_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock moved forward by hand, for lock-expiry scenarios.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the coordinator.
    ///
    /// # Example
    ///
    /// ```
    /// use idempotency_testing::mocks::ManualClock;
    /// use idempotency_core::environment::Clock;
    ///
    /// let clock = ManualClock::new(idempotency_testing::test_clock().now());
    /// let start = clock.now();
    /// clock.advance(chrono::Duration::minutes(10));
    /// assert_eq!(clock.now() - start, chrono::Duration::minutes(10));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward by `by`
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to `time`
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.write().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use http::Method;
    use idempotency_core::IncomingRequest;

    /// A `POST` carrying an `Idempotency-Key` header
    #[must_use]
    pub fn post(path: &str, body: &str, key: &str) -> IncomingRequest {
        request(Method::POST, path, body, key)
    }

    /// A request with `method` carrying an `Idempotency-Key` header
    #[must_use]
    pub fn request(method: Method, path: &str, body: &str, key: &str) -> IncomingRequest {
        IncomingRequest::new(method, path, body.to_string()).with_idempotency_key(key)
    }

    /// Install a test-friendly `tracing` subscriber, once per process.
    ///
    /// Honors `RUST_LOG`; output is captured by the test harness.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing strategies using proptest.
pub mod properties {
    use idempotency_core::RecoveryPoint;
    use proptest::prelude::*;
    use serde_json::{Map, Value};

    /// A mutating HTTP method
    pub fn mutating_method() -> impl Strategy<Value = http::Method> {
        prop_oneof![
            Just(http::Method::POST),
            Just(http::Method::PUT),
            Just(http::Method::PATCH),
        ]
    }

    /// A request path like `/orders/42`
    pub fn request_path() -> impl Strategy<Value = String> {
        proptest::collection::vec("[a-z0-9_-]{1,12}", 1..4)
            .prop_map(|segments| format!("/{}", segments.join("/")))
    }

    /// A custom (intermediate) recovery point name
    pub fn custom_recovery_point() -> impl Strategy<Value = RecoveryPoint> {
        "[a-z][a-z_]{0,30}"
            .prop_filter("reserved names", |name| {
                name != RecoveryPoint::STARTED.as_str() && name != RecoveryPoint::FINISHED.as_str()
            })
            .prop_filter_map("valid recovery point", |name| RecoveryPoint::parse(name).ok())
    }

    /// A JSON response body, nested up to three levels
    pub fn json_body() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[ -~]{0,16}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                proptest::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                    .prop_map(|map| Value::Object(map.into_iter().collect::<Map<_, _>>())),
            ]
        })
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use store_mocks::{InMemoryIdempotencyStore, InMemoryTransaction};
