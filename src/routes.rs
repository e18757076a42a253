// ABOUTME: HTTP surface: signed payment webhooks, entitlement status, health
// ABOUTME: Webhook handling verifies the HMAC signature before touching any state
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

use crate::context::ServerResources;
use crate::errors::{AppError, AppResult};
use crate::finalizer::ChargeFinalizer;
use crate::models::EntitlementStatus;
use crate::payments::{verify_webhook_signature, PaymentWebhook};

/// Signature header the payment provider sends with every webhook
const SIGNATURE_HEADER: &str = "x-payment-signature";

#[derive(Clone)]
struct ApiState {
    resources: ServerResources,
    finalizer: ChargeFinalizer,
}

/// Build the HTTP router over the shared server resources
#[must_use]
pub fn router(resources: ServerResources) -> Router {
    let state = ApiState {
        finalizer: ChargeFinalizer::new(resources.clone()),
        resources,
    };

    Router::new()
        .route("/webhooks/payment", post(payment_webhook))
        .route("/entitlements/:owner_id", get(entitlement_status))
        .route("/health", get(health))
        .with_state(state)
}

/// Payment confirmation webhook
///
/// The signature is verified over the raw body before parsing. An
/// already-finalized charge returns 200 so provider retries stop; every
/// delivery of the same confirmation converges on the same stored state.
async fn payment_webhook(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::invalid_input("Missing webhook signature header"))?;

    verify_webhook_signature(
        &state.resources.config.payments.webhook_secret,
        &body,
        signature,
    )?;

    let webhook: PaymentWebhook = serde_json::from_slice(&body)
        .map_err(|e| AppError::invalid_input(format!("Malformed webhook body: {e}")))?;

    info!(charge_id = webhook.charge_id, "Payment webhook received");

    match state
        .finalizer
        .finalize(
            &webhook.charge_id,
            webhook.amount,
            webhook.payment_reference.as_deref(),
        )
        .await
    {
        Ok(outcome) => Ok(Json(json!({ "outcome": outcome })).into_response()),
        Err(e) if e.is_conflict() => {
            // Redelivery of a confirmation we already applied
            Ok(Json(json!({ "outcome": "already_finalized" })).into_response())
        }
        Err(e) => Err(e),
    }
}

/// Read-only entitlement status for chat-layer collaborators
async fn entitlement_status(
    State(state): State<ApiState>,
    Path(owner_id): Path<String>,
) -> AppResult<Json<EntitlementStatus>> {
    let status = state
        .resources
        .database
        .get_entitlement_status(&owner_id)
        .await?;
    Ok(Json(status))
}

/// Liveness endpoint: database reachability plus breaker states
async fn health(State(state): State<ApiState>) -> AppResult<Json<serde_json::Value>> {
    sqlx::query("SELECT 1")
        .execute(state.resources.database.pool())
        .await
        .map_err(|e| AppError::database(format!("Health probe query failed: {e}")))?;

    let breakers: serde_json::Map<String, serde_json::Value> = state
        .resources
        .breakers
        .states()
        .map(|(name, breaker_state)| (name.to_owned(), json!(breaker_state.as_str())))
        .collect();

    // Gateway unreachability is reported, not fatal: the service keeps
    // accepting payments while provisioning is deferred
    let gateway = if state.resources.gateway.health_check().await.is_ok() {
        "ok"
    } else {
        "unreachable"
    };

    Ok(Json(json!({
        "status": "ok",
        "gateway": gateway,
        "breakers": breakers,
    })))
}
