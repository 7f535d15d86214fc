//! Extractors for idempotent handlers.

use crate::error::AppError;
use crate::middleware::IdempotencyContext;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use idempotency_core::{
    AdmittedKey, IDEMPOTENCY_KEY_HEADER, IdempotencyStore, OutcomeResponse, StageFuture, StageMap,
};
use uuid::Uuid;

/// Owner scope for idempotency keys.
///
/// An authentication layer that runs before [`crate::IdempotencyLayer`]
/// inserts this into request extensions; keys are then unique per owner
/// rather than globally.
///
/// # Example
///
/// ```ignore
/// async fn authenticate(mut req: Request, next: Next) -> Response {
///     let user = verify(&req)?;
///     req.extensions_mut().insert(IdempotencyOwner(user.id.to_string()));
///     next.run(req).await
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyOwner(pub String);

/// Handle to the admitted idempotency key.
///
/// Requires [`crate::IdempotencyLayer`] on the route. Rejects with 400 when
/// the request carries no usable `Idempotency-Key` header.
///
/// # Example
///
/// ```ignore
/// async fn create_order(
///     idempotent: Idempotent<PostgresIdempotencyStore>,
///     Json(order): Json<NewOrder>,
/// ) -> WebResult<Response> {
///     idempotent
///         .proceed_single(move |tx| {
///             let order = order.clone();
///             Box::pin(async move {
///                 let id = insert_order(tx.connection(), &order).await?;
///                 Ok(StageOutcome::finish(201, json!({"id": id})))
///             })
///         })
///         .await
/// }
/// ```
pub struct Idempotent<S> {
    context: IdempotencyContext<S>,
}

impl<S: IdempotencyStore> Idempotent<S> {
    /// The admitted key and its record snapshot.
    #[must_use]
    pub const fn admitted(&self) -> &AdmittedKey {
        self.context.admitted()
    }

    /// Run a multi-stage handler and render its final outcome.
    ///
    /// # Errors
    ///
    /// Returns the failing stage's own [`AppError`] if it produced one, 409 if
    /// the lock was lost, and 500 otherwise.
    pub async fn proceed(&self, stages: &StageMap<S::Transaction>) -> Result<Response, AppError> {
        let outcome = self
            .context
            .coordinator()
            .proceed(self.admitted(), stages)
            .await?;
        render(&outcome)
    }

    /// Run a single-stage handler and render its outcome.
    ///
    /// # Errors
    ///
    /// Fails like [`Idempotent::proceed`].
    pub async fn proceed_single<F>(&self, action: F) -> Result<Response, AppError>
    where
        F: for<'a> Fn(&'a mut S::Transaction) -> StageFuture<'a> + Send + Sync,
    {
        let outcome = self
            .context
            .coordinator()
            .proceed_single(self.admitted(), action)
            .await?;
        render(&outcome)
    }
}

/// Status and canonical JSON body, byte-identical on every replay.
fn render(outcome: &OutcomeResponse) -> Result<Response, AppError> {
    let status = StatusCode::from_u16(outcome.status_code).map_err(|e| {
        AppError::internal("An internal error occurred").with_source(anyhow::Error::new(e))
    })?;
    let body = outcome.canonical_body()?;
    Ok((
        status,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )],
        body,
    )
        .into_response())
}

#[async_trait]
impl<S, St> FromRequestParts<St> for Idempotent<S>
where
    S: IdempotencyStore,
    St: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
        if let Some(context) = parts.extensions.get::<IdempotencyContext<S>>() {
            return Ok(Self {
                context: context.clone(),
            });
        }

        let has_key = parts
            .headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| Uuid::parse_str(value.trim()).is_ok());
        if has_key {
            tracing::error!(
                method = %parts.method,
                path = %parts.uri.path(),
                "Idempotent handler reached without IdempotencyLayer"
            );
            Err(AppError::internal("Idempotency layer is not installed"))
        } else {
            Err(AppError::rejection(
                StatusCode::BAD_REQUEST,
                "A valid Idempotency-Key header is required",
            ))
        }
    }
}
