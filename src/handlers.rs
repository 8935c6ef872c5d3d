//! HTTP RPC surface implemented by the x402 **facilitator**.
//!
//! These are the server-side handlers for processing client-submitted x402 payments:
//! protocol-critical `POST /verify` and `POST /settle`, plus discovery endpoints
//! `GET /verify`, `GET /settle`, `GET /supported` and `GET /health`.
//!
//! Grounded on the teacher's `handlers.rs`: the `GET` info endpoints describing a
//! `POST` sibling's body shape, the `#[instrument(skip_all)]` logging discipline, and
//! the `routes()` router-builder shape are kept near-verbatim; the error mapping is new
//! since this facilitator's `Facilitator` trait returns typed response bodies directly
//! rather than a `Result<_, Self::Error>`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{instrument, warn};

use crate::domain::NetworkId;
use crate::facilitator::Facilitator;
use crate::types::{ReasonToken, SettleRequest, VerifyRequest, VerifyResponse};

pub fn routes(facilitator: Arc<dyn Facilitator>) -> Router {
    Router::new()
        .route("/", get(get_root))
        .route("/verify", get(get_verify_info))
        .route("/verify", post(post_verify))
        .route("/settle", get(get_settle_info))
        .route("/settle", post(post_settle))
        .route("/supported", get(get_supported))
        .route("/health", get(get_health))
        .with_state(facilitator)
}

#[instrument(skip_all)]
pub async fn get_root() -> impl IntoResponse {
    (StatusCode::OK, format!("Hello from {}!", env!("CARGO_PKG_NAME")))
}

#[instrument(skip_all)]
pub async fn get_verify_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/verify",
        "description": "POST to verify an x402 payment payload against its requirements",
        "body": { "paymentPayload": "PaymentPayload", "paymentRequirements": "PaymentRequirements" }
    }))
}

#[instrument(skip_all)]
pub async fn get_settle_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/settle",
        "description": "POST to verify and settle an x402 payment on-chain",
        "body": { "paymentPayload": "PaymentPayload", "paymentRequirements": "PaymentRequirements" }
    }))
}

#[instrument(skip_all)]
pub async fn get_supported() -> impl IntoResponse {
    Json(json!({
        "kinds": NetworkId::ALL.map(|network| json!({
            "x402Version": 2,
            "scheme": "exact",
            "network": network.as_str(),
        })),
    }))
}

#[instrument(skip_all)]
pub async fn get_health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

#[instrument(skip_all)]
pub async fn post_verify(
    State(facilitator): State<Arc<dyn Facilitator>>,
    Json(body): Json<VerifyRequest>,
) -> impl IntoResponse {
    let response = facilitator
        .verify(&body.payment_payload, &body.payment_requirements)
        .await;
    if !response.is_valid {
        warn!(reason = ?response.invalid_reason, "verification failed");
    }
    verify_response_into(response)
}

#[instrument(skip_all)]
pub async fn post_settle(
    State(facilitator): State<Arc<dyn Facilitator>>,
    Json(body): Json<SettleRequest>,
) -> impl IntoResponse {
    let response = facilitator
        .settle(&body.payment_payload, &body.payment_requirements)
        .await;
    if !response.success {
        warn!(reason = ?response.error_reason, "settlement failed");
    }

    let mut http_response = (StatusCode::OK, Json(response.clone())).into_response();
    apply_reason_status(&mut http_response, response.error_reason, response.success);
    http_response
}

fn verify_response_into(response: VerifyResponse) -> Response {
    let mut http_response = (StatusCode::OK, Json(response.clone())).into_response();
    apply_reason_status(&mut http_response, response.invalid_reason, response.is_valid);
    http_response
}

/// Maps a rejected verify/settle outcome onto the HTTP status SPEC_FULL's §4.10 names for
/// that reason token, and attaches `X-PAYMENT-ERROR`/`Retry-After` where relevant. A
/// successful outcome is left at `200 OK`.
fn apply_reason_status(response: &mut Response, reason: Option<ReasonToken>, ok: bool) {
    if ok {
        return;
    }
    let Some(reason) = reason else {
        return;
    };

    let status = match reason {
        ReasonToken::InProgress => StatusCode::CONFLICT,
        ReasonToken::Backpressure => StatusCode::TOO_MANY_REQUESTS,
        ReasonToken::ChainUnreachable
        | ReasonToken::StoreUnavailable
        | ReasonToken::SettlementTimeout => StatusCode::SERVICE_UNAVAILABLE,
        ReasonToken::SettlementReverted => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    *response.status_mut() = status;

    if let Ok(value) = HeaderValue::from_str(&reason.to_string()) {
        response.headers_mut().insert("x-payment-error", value);
    }
    if matches!(reason, ReasonToken::InProgress) {
        response
            .headers_mut()
            .insert("retry-after", HeaderValue::from_static("2"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_network_maps_to_bad_request() {
        let mut response = (StatusCode::OK, "body").into_response();
        apply_reason_status(&mut response, Some(ReasonToken::UnknownNetwork), false);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn in_progress_maps_to_conflict_with_retry_after() {
        let mut response = (StatusCode::OK, "body").into_response();
        apply_reason_status(&mut response, Some(ReasonToken::InProgress), false);
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers().get("retry-after").unwrap(), "2");
    }

    #[test]
    fn successful_outcome_keeps_ok_status() {
        let mut response = (StatusCode::OK, "body").into_response();
        apply_reason_status(&mut response, None, true);
        assert_eq!(response.status(), StatusCode::OK);
    }
}
