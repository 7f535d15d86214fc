//! Tower middleware that admits and releases idempotent requests.
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::post};
//! use idempotency_web::IdempotencyLayer;
//!
//! let app = Router::new()
//!     .route("/orders", post(create_order))
//!     .layer(IdempotencyLayer::new(coordinator));
//! ```
//!
//! # Flow
//!
//! 1. **Bypass** requests without an `Idempotency-Key` header or with a
//!    non-mutating method
//! 2. **Buffer** the body (up to `max_body_bytes`) and digest it together
//!    with the request path as the client sent it, including any prefix a
//!    `Router::nest` has stripped
//! 3. **Admit** through the coordinator; conflicts are answered with 409
//!    without reaching the handler
//! 4. **Expose** the admitted key to the handler as an
//!    [`IdempotencyContext`] extension
//! 5. **Release** the lock once the handler's response is ready, or in the
//!    background if the request future is dropped

use crate::config::WebConfig;
use crate::error::AppError;
use crate::extractors::IdempotencyOwner;
use axum::{
    body::Body,
    extract::{OriginalUri, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use idempotency_core::request::is_mutating_method;
use idempotency_core::{
    AdmittedKey, Decision, IDEMPOTENCY_KEY_HEADER, IdempotencyCoordinator, IdempotencyStore,
    IncomingRequest, ReleaseOutcome,
};
use http_body_util::LengthLimitError;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;

/// The admitted key and the coordinator that admitted it.
///
/// Inserted into request extensions by [`IdempotencyMiddleware`]; handlers
/// reach it through [`crate::Idempotent`].
pub struct IdempotencyContext<S> {
    coordinator: IdempotencyCoordinator<S>,
    admitted: AdmittedKey,
}

impl<S> IdempotencyContext<S> {
    /// Coordinator that admitted the request.
    #[must_use]
    pub const fn coordinator(&self) -> &IdempotencyCoordinator<S> {
        &self.coordinator
    }

    /// The admitted key and its record snapshot.
    #[must_use]
    pub const fn admitted(&self) -> &AdmittedKey {
        &self.admitted
    }
}

impl<S> Clone for IdempotencyContext<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            admitted: self.admitted.clone(),
        }
    }
}

impl<S> fmt::Debug for IdempotencyContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyContext")
            .field("admitted", &self.admitted)
            .finish_non_exhaustive()
    }
}

/// Layer that runs the idempotency protocol around the wrapped service.
pub struct IdempotencyLayer<S> {
    coordinator: IdempotencyCoordinator<S>,
    config: WebConfig,
}

impl<S> IdempotencyLayer<S> {
    /// Create a layer with the default [`WebConfig`].
    #[must_use]
    pub fn new(coordinator: IdempotencyCoordinator<S>) -> Self {
        Self::with_config(coordinator, WebConfig::default())
    }

    /// Create a layer with explicit HTTP settings.
    #[must_use]
    pub const fn with_config(coordinator: IdempotencyCoordinator<S>, config: WebConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }
}

impl<S> Clone for IdempotencyLayer<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            config: self.config,
        }
    }
}

impl<S> fmt::Debug for IdempotencyLayer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyLayer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, I> Layer<I> for IdempotencyLayer<S> {
    type Service = IdempotencyMiddleware<S, I>;

    fn layer(&self, inner: I) -> Self::Service {
        IdempotencyMiddleware {
            coordinator: self.coordinator.clone(),
            config: self.config,
            inner,
        }
    }
}

/// Middleware service produced by [`IdempotencyLayer`].
pub struct IdempotencyMiddleware<S, I> {
    coordinator: IdempotencyCoordinator<S>,
    config: WebConfig,
    inner: I,
}

impl<S, I: Clone> Clone for IdempotencyMiddleware<S, I> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            config: self.config,
            inner: self.inner.clone(),
        }
    }
}

impl<S, I> fmt::Debug for IdempotencyMiddleware<S, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyMiddleware")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, I> Service<Request> for IdempotencyMiddleware<S, I>
where
    S: IdempotencyStore,
    I: Service<Request, Response = Response> + Clone + Send + 'static,
    I::Future: Send + 'static,
    I::Error: Send + 'static,
{
    type Response = Response;
    type Error = I::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // The clone is not necessarily ready; keep the one that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !is_mutating_method(req.method()) || !req.headers().contains_key(IDEMPOTENCY_KEY_HEADER)
        {
            return Box::pin(inner.call(req));
        }

        let coordinator = self.coordinator.clone();
        let max_body_bytes = self.config.max_body_bytes;
        let path = original_path(&req);
        let span = tracing::info_span!(
            "idempotent_request",
            method = %req.method(),
            path = %path,
        );

        Box::pin(
            async move {
                let (mut parts, body) = req.into_parts();
                let bytes = match axum::body::to_bytes(body, max_body_bytes).await {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        let error = error.into_inner();
                        if !exceeds_length_limit(&*error) {
                            tracing::debug!(%error, "Request body could not be read");
                            return Ok(AppError::bad_request("Request body could not be read")
                                .into_response());
                        }
                        tracing::debug!(max_body_bytes, "Rejecting oversized request body");
                        metrics::counter!("idempotency.http.body_rejected").increment(1);
                        return Ok(AppError::payload_too_large(format!(
                            "Request body must be at most {max_body_bytes} bytes"
                        ))
                        .into_response());
                    }
                };

                let incoming = IncomingRequest {
                    method: parts.method.clone(),
                    path,
                    body: bytes.clone(),
                    headers: parts.headers.clone(),
                    owner: parts
                        .extensions
                        .get::<IdempotencyOwner>()
                        .map(|owner| owner.0.clone()),
                };

                let decision = match coordinator.admit(&incoming).await {
                    Ok(decision) => decision,
                    Err(error) => return Ok(AppError::from(error).into_response()),
                };

                let admitted = match decision {
                    Decision::NotApplicable => {
                        return inner.call(Request::from_parts(parts, Body::from(bytes))).await;
                    }
                    Decision::InvalidKey(reason) => {
                        return Ok(
                            AppError::rejection(StatusCode::BAD_REQUEST, reason).into_response()
                        );
                    }
                    Decision::Conflict(reason) => {
                        return Ok(AppError::from(reason).into_response());
                    }
                    Decision::Admitted(admitted) => admitted,
                };

                parts.extensions.insert(IdempotencyContext {
                    coordinator: coordinator.clone(),
                    admitted: admitted.clone(),
                });
                let guard = ReleaseGuard::new(coordinator, admitted);

                let result = inner
                    .call(Request::from_parts(parts, Body::from(bytes)))
                    .await;
                let outcome = match &result {
                    Ok(response) => ReleaseOutcome::from_status(response.status().as_u16()),
                    Err(_) => ReleaseOutcome::Failed,
                };
                guard.release(outcome).await;
                result
            }
            .instrument(span),
        )
    }
}

/// Path the client requested.
///
/// Nested routers see `uri` with their mount prefix removed; the outer router
/// keeps the full URI in [`OriginalUri`].
fn original_path(req: &Request) -> String {
    req.extensions()
        .get::<OriginalUri>()
        .map_or_else(|| req.uri().path(), |original| original.0.path())
        .to_string()
}

/// Whether a body error came from the size limit rather than the stream.
fn exceeds_length_limit(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(error) = current {
        if error.is::<LengthLimitError>() {
            return true;
        }
        current = error.source();
    }
    false
}

/// Releases the admitted lock exactly once.
///
/// If the request future is dropped before the handler finishes (client
/// disconnect, timeout layer), the release is spawned onto the runtime as a
/// failure.
struct ReleaseGuard<S: IdempotencyStore> {
    pending: Option<(IdempotencyCoordinator<S>, AdmittedKey)>,
}

impl<S: IdempotencyStore> ReleaseGuard<S> {
    const fn new(coordinator: IdempotencyCoordinator<S>, admitted: AdmittedKey) -> Self {
        Self {
            pending: Some((coordinator, admitted)),
        }
    }

    async fn release(mut self, outcome: ReleaseOutcome) {
        if let Some((coordinator, admitted)) = self.pending.take() {
            release(&coordinator, &admitted, outcome).await;
        }
    }
}

impl<S: IdempotencyStore> Drop for ReleaseGuard<S> {
    fn drop(&mut self) {
        let Some((coordinator, admitted)) = self.pending.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                metrics::counter!("idempotency.release.abandoned").increment(1);
                handle.spawn(async move {
                    release(&coordinator, &admitted, ReleaseOutcome::Failed).await;
                });
            }
            Err(_) => tracing::warn!(
                key = %admitted.key(),
                "No runtime to release idempotency lock; it will expire"
            ),
        }
    }
}

async fn release<S: IdempotencyStore>(
    coordinator: &IdempotencyCoordinator<S>,
    admitted: &AdmittedKey,
    outcome: ReleaseOutcome,
) {
    if let Err(error) = coordinator.release(admitted, outcome).await {
        tracing::error!(
            key = %admitted.key(),
            %error,
            "Failed to release idempotency lock; it will expire"
        );
    }
}
