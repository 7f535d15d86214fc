//! `PostgreSQL` idempotency store.
//!
//! This crate provides a production-ready PostgreSQL-based store that
//! implements the `IdempotencyStore` trait from `idempotency-core`. It uses
//! sqlx and supports:
//!
//! - Atomic record creation (`INSERT ... ON CONFLICT DO NOTHING`)
//! - Row-level locking (`SELECT ... FOR UPDATE`)
//! - Partial updates of the fields the protocol advances
//! - Stage transactions shared with business writes
//! - An embedded migration and a retention sweep
//!
//! # Example
//!
//! ```ignore
//! use idempotency_postgres::PostgresIdempotencyStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresIdempotencyStore::connect("postgres://localhost/mydb", 10).await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod store;

pub use store::{PostgresIdempotencyStore, PostgresTransaction};
