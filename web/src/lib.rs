//! Axum integration for the idempotency-key protocol.
//!
//! Two pieces wire the protocol into a router:
//!
//! - [`IdempotencyLayer`] admits each mutating request that carries an
//!   `Idempotency-Key` header, answers conflicts with 409, and releases the
//!   lock once the response is ready.
//! - [`Idempotent`] gives the handler the admitted key so it can run its
//!   stages with [`Idempotent::proceed`] or [`Idempotent::proceed_single`].
//!
//! # Request Flow
//!
//! ```text
//! client ─▶ IdempotencyLayer ─admit─▶ handler(Idempotent) ─proceed─▶ stages
//!                 ▲                                                     │
//!                 └──────────────── release ◀──── response ◀────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::post};
//! use idempotency_web::{IdempotencyLayer, Idempotent, WebResult};
//!
//! async fn create_order(idempotent: Idempotent<MyStore>) -> WebResult<Response> {
//!     idempotent
//!         .proceed_single(|tx| Box::pin(async move {
//!             Ok(StageOutcome::finish(201, json!({"id": insert(tx).await?})))
//!         }))
//!         .await
//! }
//!
//! let app = Router::new()
//!     .route("/orders", post(create_order))
//!     .layer(IdempotencyLayer::new(coordinator));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod extractors;
pub mod middleware;

// Re-export key types for convenience
pub use config::WebConfig;
pub use error::AppError;
pub use extractors::{IdempotencyOwner, Idempotent};
pub use middleware::{IdempotencyContext, IdempotencyLayer, IdempotencyMiddleware};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
