//! HTTP routes for orders and charges.
//!
//! `POST /orders` is a single-stage handler: the order row and the cached
//! response commit in one transaction. `POST /charges` runs two stages so a
//! crash after the charge row is written resumes at settlement instead of
//! charging twice.

use axum::{
    Json, Router,
    extract::{Path, State},
    response::Response,
    routing::{get, post},
};
use idempotency_core::{IdempotencyCoordinator, RecoveryPoint, StageMap, StageOutcome};
use idempotency_postgres::{PostgresIdempotencyStore, PostgresTransaction};
use idempotency_web::{AppError, IdempotencyLayer, Idempotent, WebConfig, WebResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

type Store = PostgresIdempotencyStore;

/// Charge row written, settlement pending.
const CHARGE_CREATED: RecoveryPoint = RecoveryPoint::custom("charge_created");

/// Create the demo's business tables.
///
/// # Errors
///
/// Returns the database error if a statement fails.
pub async fn prepare_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS orders (
            id BIGSERIAL PRIMARY KEY,
            item TEXT NOT NULL,
            quantity INT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS charges (
            id BIGSERIAL PRIMARY KEY,
            idempotency_key UUID NOT NULL UNIQUE,
            amount_cents BIGINT NOT NULL,
            status TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        ",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Build the application router.
pub fn router(coordinator: IdempotencyCoordinator<Store>, web: WebConfig) -> Router {
    let pool = coordinator.store().pool().clone();
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/charges", post(create_charge))
        .layer(IdempotencyLayer::with_config(coordinator, web))
        .with_state(pool)
}

#[derive(Debug, Clone, Deserialize)]
struct NewOrder {
    item: String,
    quantity: i32,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct Order {
    id: i64,
    item: String,
    quantity: i32,
}

async fn create_order(
    idempotent: Idempotent<Store>,
    Json(order): Json<NewOrder>,
) -> WebResult<Response> {
    idempotent
        .proceed_single(move |tx| Box::pin(insert_order(tx, order.clone())))
        .await
}

async fn insert_order(
    tx: &mut PostgresTransaction,
    order: NewOrder,
) -> anyhow::Result<StageOutcome> {
    // 400 is exempt: the record is dropped and the key can be reused.
    if order.quantity <= 0 {
        return Ok(StageOutcome::finish(
            400,
            json!({"message": "quantity must be positive"}),
        ));
    }

    let id: i64 =
        sqlx::query_scalar("INSERT INTO orders (item, quantity) VALUES ($1, $2) RETURNING id")
            .bind(&order.item)
            .bind(order.quantity)
            .fetch_one(tx.connection())
            .await?;
    tracing::info!(order_id = id, "Order created");

    Ok(StageOutcome::finish(
        201,
        json!({"id": id, "item": order.item, "quantity": order.quantity}),
    ))
}

async fn get_order(State(pool): State<PgPool>, Path(id): Path<i64>) -> WebResult<Json<Order>> {
    sqlx::query_as::<_, Order>("SELECT id, item, quantity FROM orders WHERE id = $1")
        .bind(id)
        .fetch_optional(&pool)
        .await
        .map_err(|e| AppError::from(anyhow::Error::new(e)))?
        .map(Json)
        .ok_or_else(|| AppError::not_found("Order", id))
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct NewCharge {
    amount_cents: i64,
}

async fn create_charge(
    idempotent: Idempotent<Store>,
    Json(charge): Json<NewCharge>,
) -> WebResult<Response> {
    if charge.amount_cents <= 0 {
        return Err(AppError::validation("amount_cents must be positive"));
    }

    let key = idempotent.admitted().key().key();
    let stages: StageMap<PostgresTransaction> = StageMap::new()
        .stage(RecoveryPoint::STARTED, move |tx| {
            Box::pin(record_charge(tx, key, charge.amount_cents))
        })
        .stage(CHARGE_CREATED, move |tx| Box::pin(settle_charge(tx, key)));
    idempotent.proceed(&stages).await
}

async fn record_charge(
    tx: &mut PostgresTransaction,
    key: Uuid,
    amount_cents: i64,
) -> anyhow::Result<StageOutcome> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO charges (idempotency_key, amount_cents, status) \
         VALUES ($1, $2, 'pending') RETURNING id",
    )
    .bind(key)
    .bind(amount_cents)
    .fetch_one(tx.connection())
    .await?;

    Ok(StageOutcome::new(
        202,
        json!({"charge_id": id, "status": "pending"}),
        CHARGE_CREATED,
    ))
}

async fn settle_charge(tx: &mut PostgresTransaction, key: Uuid) -> anyhow::Result<StageOutcome> {
    let (id, amount_cents): (i64, i64) = sqlx::query_as(
        "UPDATE charges SET status = 'succeeded' \
         WHERE idempotency_key = $1 RETURNING id, amount_cents",
    )
    .bind(key)
    .fetch_one(tx.connection())
    .await?;
    tracing::info!(charge_id = id, amount_cents, "Charge settled");

    Ok(StageOutcome::finish(
        201,
        json!({"charge_id": id, "amount_cents": amount_cents, "status": "succeeded"}),
    ))
}
