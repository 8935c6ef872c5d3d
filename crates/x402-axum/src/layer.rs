//! Tower [`Layer`]/[`Service`] implementing the Gate (C10): turns a `402 Payment
//! Required` challenge into an enforced, in-process payment on any wrapped Axum route.
//!
//! Grounded on the teacher's `layer.rs` — the `X402Middleware` builder, the
//! `X402MiddlewareService`/`X402Paygate` split, and the "verify, run the inner handler,
//! settle only on success" sequencing are kept close to the original. What changed:
//! the facilitator is called in-process through [`x402_facilitator::facilitator::Facilitator`]
//! rather than over HTTP through a `FacilitatorClient`, so there is no remote-client error
//! type and no dynamic-pricing callback (`paygate.rs`'s caching/dynamic-price machinery has
//! no counterpart here and was dropped — see `DESIGN.md`). Payment offers are also
//! recomputed per request rather than cached, since each quote's `expires_at` is
//! timestamped at issue time.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum_core::{
    extract::Request,
    response::{IntoResponse, Response},
};
use http::{HeaderValue, StatusCode};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

#[cfg(feature = "telemetry")]
use tracing::{Level, instrument};

use x402_facilitator::codec;
use x402_facilitator::domain::NetworkId;
use x402_facilitator::facilitator::Facilitator;
use x402_facilitator::requirements::{self, PriceTag};
use x402_facilitator::timestamp::UnixTimestamp;
use x402_facilitator::types::{
    ErrorResponse, PaymentPayload, PaymentRequired, PaymentRequirements, ReasonToken, X402Version2,
};

/// Middleware layer enforcing x402 payment verification and settlement on a route.
///
/// Wraps an Axum service, intercepts incoming requests, verifies the payment carried in
/// `X-PAYMENT` against a configured [`PriceTag`], runs the inner handler only once
/// verification succeeds, and settles the payment afterward. Adds a
/// `X-PAYMENT-RESPONSE` header to the final response on success.
pub struct X402Middleware<F: ?Sized> {
    facilitator: Arc<F>,
    description: Option<String>,
    mime_type: Option<String>,
    resource: Option<String>,
    base_url: Option<String>,
    price_tag: Option<PriceTag>,
}

impl<F: ?Sized> Clone for X402Middleware<F> {
    fn clone(&self) -> Self {
        Self {
            facilitator: self.facilitator.clone(),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
            resource: self.resource.clone(),
            base_url: self.base_url.clone(),
            price_tag: self.price_tag.clone(),
        }
    }
}

impl<F: ?Sized> X402Middleware<F> {
    pub fn new(facilitator: Arc<F>) -> Self {
        Self {
            facilitator,
            description: None,
            mime_type: None,
            resource: None,
            base_url: None,
            price_tag: None,
        }
    }

    /// Sets the description surfaced on the `402` challenge's accepted payment methods.
    pub fn with_description(&self, description: &str) -> Self {
        let mut this = self.clone();
        this.description = Some(description.to_string());
        this
    }

    /// Sets the MIME type of the protected resource, carried on each payment requirement.
    pub fn with_mime_type(&self, mime: &str) -> Self {
        let mut this = self.clone();
        this.mime_type = Some(mime.to_string());
        this
    }

    /// Sets the resource URI directly, avoiding per-request derivation from the request URI.
    pub fn with_resource(&self, resource: &str) -> Self {
        let mut this = self.clone();
        this.resource = Some(resource.to_string());
        this
    }

    /// Sets the base URL used to derive the resource URI when [`Self::with_resource`] is
    /// not used. Defaults to `http://localhost` — avoid relying on that default in
    /// production.
    pub fn with_base_url(&self, base_url: &str) -> Self {
        let mut this = self.clone();
        this.base_url = Some(base_url.trim_end_matches('/').to_string());
        this
    }

    /// Sets the price tag accepted for this route: asset amount, networks, and quote TTL.
    pub fn with_price_tag(&self, price_tag: PriceTag) -> Self {
        let mut this = self.clone();
        this.price_tag = Some(price_tag);
        this
    }

    /// Builds the fully resolved [`PriceTag`] for a request, applying the builder's
    /// description/MIME-type overrides and resolving the resource URI.
    fn effective_tag(&self, req: &Request) -> Option<PriceTag> {
        let mut tag = self.price_tag.clone()?;
        if let Some(description) = &self.description {
            tag.description = description.clone();
        }
        if let Some(mime_type) = &self.mime_type {
            tag.mime_type = Some(mime_type.clone());
        }
        tag.resource = self.resource.clone().unwrap_or_else(|| {
            let base = self.base_url.as_deref().unwrap_or("http://localhost");
            let path_and_query = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or_else(|| req.uri().path());
            format!("{base}{path_and_query}")
        });
        Some(tag)
    }
}

/// Wraps a cloned inner Axum service and augments it with payment enforcement.
pub struct X402MiddlewareService<F: ?Sized> {
    middleware: X402Middleware<F>,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl<F: ?Sized> Clone for X402MiddlewareService<F> {
    fn clone(&self) -> Self {
        Self {
            middleware: self.middleware.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<S, F> Layer<S> for X402Middleware<F>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    F: Facilitator + ?Sized + 'static,
{
    type Service = X402MiddlewareService<F>;

    fn layer(&self, inner: S) -> Self::Service {
        if self.price_tag.is_none() {
            #[cfg(feature = "telemetry")]
            tracing::warn!("X402Middleware has no price tag configured; every request will be rejected");
        }
        X402MiddlewareService {
            middleware: self.clone(),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

impl<F> Service<Request> for X402MiddlewareService<F>
where
    F: Facilitator + ?Sized + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let tag = self.middleware.effective_tag(&req);
        let gate = X402Paygate {
            facilitator: self.middleware.facilitator.clone(),
            tag,
        };
        let inner = self.inner.clone();
        Box::pin(gate.call(inner, req))
    }
}

/// Wrapper producing a `402 Payment Required` response with the offered payment methods.
/// Every `402` carries `X-PAYMENT-REQUIRED` (the same envelope as the body, base64url
/// encoded, so a client can read the offer without parsing JSON); a `402` triggered by a
/// rejected payment (as opposed to a first-time challenge) additionally carries
/// `X-PAYMENT-ERROR` naming the reason.
#[derive(Debug)]
pub struct X402Error {
    body: PaymentRequired,
    reason_token: Option<ReasonToken>,
}

impl X402Error {
    fn with_message(message: &str, accepts: Vec<PaymentRequirements>) -> Self {
        Self {
            body: PaymentRequired {
                x402_version: X402Version2,
                accepts,
                error: Some(message.to_string()),
            },
            reason_token: None,
        }
    }

    fn misconfigured() -> Self {
        Self::with_message("no price tag configured for this route", Vec::new())
    }

    fn payment_header_required(accepts: Vec<PaymentRequirements>) -> Self {
        Self::with_message("X-PAYMENT header is required", accepts)
    }

    fn no_matching_requirement(accepts: Vec<PaymentRequirements>) -> Self {
        Self::with_message("no accepted payment method matches this payload", accepts)
    }

    fn verification_failed(reason: Option<ReasonToken>, accepts: Vec<PaymentRequirements>) -> Self {
        let message = reason.map(|r| r.to_string()).unwrap_or_default();
        let mut this = Self::with_message(&format!("verification failed: {message}"), accepts);
        this.reason_token = reason;
        this
    }
}

impl IntoResponse for X402Error {
    fn into_response(self) -> Response {
        let bytes = serde_json::to_vec(&self.body).expect("PaymentRequired always serializes");
        let mut builder = Response::builder()
            .status(StatusCode::PAYMENT_REQUIRED)
            .header("content-type", "application/json");
        if let Ok(value) = HeaderValue::from_str(&codec::encode(&self.body)) {
            builder = builder.header("x-payment-required", value);
        }
        if let Some(reason) = self.reason_token {
            if let Ok(value) = HeaderValue::from_str(&reason.to_string()) {
                builder = builder.header("x-payment-error", value);
            }
        }
        builder
            .body(axum_core::body::Body::from(bytes))
            .expect("well-formed 402 response")
    }
}

/// `400 Bad Request` for an `X-PAYMENT` header that could not even be decoded — never
/// `402`, which would make the client retry the exact same malformed header forever.
fn decode_failure_response() -> Response {
    let body = ErrorResponse {
        error: "invalid X-PAYMENT".to_string(),
    };
    let bytes = serde_json::to_vec(&body).expect("ErrorResponse always serializes");
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header("content-type", "application/json")
        .body(axum_core::body::Body::from(bytes))
        .expect("well-formed 400 response")
}

/// Maps a failed `settle` outcome onto its HTTP status: `InProgress` is a `409` the
/// client should retry shortly, `Backpressure` is a `429`, and anything else is a fatal
/// `502` settlement failure.
fn settlement_outcome_response(reason: ReasonToken) -> Response {
    let status = match reason {
        ReasonToken::InProgress => StatusCode::CONFLICT,
        ReasonToken::Backpressure => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::BAD_GATEWAY,
    };
    let body = ErrorResponse {
        error: reason.to_string(),
    };
    let bytes = serde_json::to_vec(&body).expect("ErrorResponse always serializes");
    let mut builder = Response::builder()
        .status(status)
        .header("content-type", "application/json");
    if reason == ReasonToken::InProgress {
        builder = builder.header("retry-after", "2");
    }
    builder
        .body(axum_core::body::Body::from(bytes))
        .expect("well-formed response")
}

/// Resolves the single [`PaymentRequirements`] entry matching a payload's network, if
/// that network is among the ones this route's price tag accepts.
fn requirement_for_network(
    tag: &PriceTag,
    network: NetworkId,
    now: UnixTimestamp,
) -> Option<PaymentRequirements> {
    if !tag.networks.contains(&network) {
        return None;
    }
    let mut narrowed = tag.clone();
    narrowed.networks = vec![network];
    requirements::issue(&narrowed, now).into_iter().next()
}

/// Per-request payment enforcement: decode, verify, run the inner handler, then settle.
struct X402Paygate<F: ?Sized> {
    facilitator: Arc<F>,
    tag: Option<PriceTag>,
}

impl<F> X402Paygate<F>
where
    F: Facilitator + ?Sized,
{
    async fn call<ReqBody, ResBody, S>(
        self,
        mut inner: S,
        req: http::Request<ReqBody>,
    ) -> Result<Response, Infallible>
    where
        S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
        S::Response: IntoResponse,
        S::Error: IntoResponse,
    {
        Ok(self.handle(&mut inner, req).await)
    }

    #[cfg_attr(feature = "telemetry", instrument(name = "x402.handle_request", skip_all))]
    async fn handle<ReqBody, ResBody, S>(self, inner: &mut S, req: http::Request<ReqBody>) -> Response
    where
        S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
        S::Response: IntoResponse,
        S::Error: IntoResponse,
    {
        let Some(tag) = self.tag else {
            return X402Error::misconfigured().into_response();
        };
        let now = UnixTimestamp::try_now().unwrap_or(UnixTimestamp(0));
        let accepts = requirements::issue(&tag, now);

        let payment_header = match req.headers().get("x-payment") {
            Some(value) => value.clone(),
            None => return X402Error::payment_header_required(accepts).into_response(),
        };
        let header_str = match payment_header.to_str() {
            Ok(s) => s,
            Err(_) => return decode_failure_response(),
        };
        let payload: PaymentPayload = match codec::decode(header_str) {
            Ok(payload) => payload,
            Err(_) => return decode_failure_response(),
        };

        let Some(requirement) = requirement_for_network(&tag, payload.network, now) else {
            return X402Error::no_matching_requirement(accepts).into_response();
        };

        let verify_response = self.facilitator.verify(&payload, &requirement).await;
        if !verify_response.is_valid {
            #[cfg(feature = "telemetry")]
            tracing::event!(Level::INFO, reason = ?verify_response.invalid_reason, "payment rejected");
            return X402Error::verification_failed(verify_response.invalid_reason, accepts).into_response();
        }

        let response = match inner.call(req).await {
            Ok(response) => response.into_response(),
            Err(err) => return err.into_response(),
        };
        if response.status().is_client_error() || response.status().is_server_error() {
            return response;
        }

        let settle_response = self.facilitator.settle(&payload, &requirement).await;
        if !settle_response.success {
            let reason = settle_response.error_reason.unwrap_or(ReasonToken::ChainUnreachable);
            return settlement_outcome_response(reason);
        }

        let mut response = response;
        let encoded = codec::encode(&settle_response);
        if let Ok(header_value) = HeaderValue::from_str(&encoded) {
            response.headers_mut().insert("x-payment-response", header_value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use alloy_primitives::U256;
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;
    use axum::body::Body as AxumBody;
    use axum::routing::get;
    use axum::{Json, Router};
    use http::Request as HttpRequest;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::time::Duration;
    use tower::ServiceExt;
    use x402_facilitator::digest::authorization_digest;
    use x402_facilitator::domain;
    use x402_facilitator::types::{
        EvmAddress, EvmSignature, ExactEvmPayload, ExactEvmPayloadAuthorization, HexEncodedNonce,
        Scheme, SettleResponse, VerifyResponse,
    };

    struct FakeFacilitator {
        verify_accept: bool,
        settle_accept: bool,
        settle_error_reason: ReasonToken,
    }

    impl FakeFacilitator {
        fn new(accept: bool) -> Self {
            Self {
                verify_accept: accept,
                settle_accept: accept,
                settle_error_reason: ReasonToken::SettlementReverted,
            }
        }
    }

    #[async_trait::async_trait]
    impl Facilitator for FakeFacilitator {
        async fn verify(
            &self,
            payload: &PaymentPayload,
            _requirements: &PaymentRequirements,
        ) -> VerifyResponse {
            VerifyResponse {
                is_valid: self.verify_accept,
                invalid_reason: if self.verify_accept { None } else { Some(ReasonToken::InvalidSignature) },
                payer: payload.payload.authorization.from,
            }
        }

        async fn settle(
            &self,
            payload: &PaymentPayload,
            _requirements: &PaymentRequirements,
        ) -> SettleResponse {
            SettleResponse {
                success: self.settle_accept,
                error_reason: if self.settle_accept { None } else { Some(self.settle_error_reason) },
                payer: payload.payload.authorization.from,
                transaction: None,
                network: payload.network,
            }
        }
    }

    fn signer() -> PrivateKeySigner {
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
            .parse()
            .unwrap()
    }

    fn signed_payload(nonce: [u8; 32]) -> PaymentPayload {
        let signer = signer();
        let network = domain::descriptor(NetworkId::BaseMainnet).unwrap();
        let authorization = ExactEvmPayloadAuthorization {
            from: EvmAddress(signer.address()),
            to: EvmAddress(address!("2222222222222222222222222222222222222222")),
            value: x402_facilitator::types::AmountString::new(U256::from(1_000_000u64)),
            valid_after: x402_facilitator::timestamp::UnixTimestamp(0),
            valid_before: x402_facilitator::timestamp::UnixTimestamp(2_000_000_000),
            nonce: HexEncodedNonce(nonce),
        };
        let digest = authorization_digest(network, &authorization);
        let sig = signer.sign_hash_sync(&digest).unwrap();
        PaymentPayload {
            x402_version: X402Version2,
            scheme: Scheme::Exact,
            network: NetworkId::BaseMainnet,
            payload: ExactEvmPayload {
                signature: EvmSignature(sig.as_bytes()),
                authorization,
            },
        }
    }

    fn test_price_tag() -> PriceTag {
        PriceTag {
            usd_amount: Decimal::from_str("1.00").unwrap(),
            resource: String::new(),
            description: "a report".to_string(),
            mime_type: Some("application/json".to_string()),
            pay_to: EvmAddress(address!("2222222222222222222222222222222222222222")),
            networks: vec![NetworkId::BaseMainnet],
            quote_ttl: Duration::from_secs(120),
            max_timeout_seconds: Some(60),
        }
    }

    async fn handler() -> impl IntoResponse {
        (StatusCode::OK, Json(serde_json::json!({"ok": true})))
    }

    fn app(facilitator: Arc<FakeFacilitator>) -> Router {
        let x402 = X402Middleware::new(facilitator).with_price_tag(test_price_tag());
        Router::new().route("/protected", get(handler).layer(x402))
    }

    #[tokio::test]
    async fn missing_payment_header_returns_402() {
        let app = app(Arc::new(FakeFacilitator::new(true)));
        let request = HttpRequest::builder()
            .uri("/protected")
            .body(AxumBody::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert!(response.headers().contains_key("x-payment-required"));
    }

    #[tokio::test]
    async fn malformed_payment_header_returns_400() {
        let app = app(Arc::new(FakeFacilitator::new(true)));
        let request = HttpRequest::builder()
            .uri("/protected")
            .header("x-payment", "not valid base64!!!")
            .body(AxumBody::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejected_verification_returns_402_with_reason_header() {
        let app = app(Arc::new(FakeFacilitator::new(false)));
        let payload = signed_payload([7u8; 32]);
        let header = codec::encode(&payload);
        let request = HttpRequest::builder()
            .uri("/protected")
            .header("x-payment", header)
            .body(AxumBody::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert!(response.headers().contains_key("x-payment-required"));
        assert_eq!(
            response.headers().get("x-payment-error").unwrap(),
            "invalidSignature"
        );
    }

    #[tokio::test]
    async fn valid_payment_reaches_handler_and_carries_settlement_header() {
        let app = app(Arc::new(FakeFacilitator::new(true)));
        let payload = signed_payload([8u8; 32]);
        let header = codec::encode(&payload);
        let request = HttpRequest::builder()
            .uri("/protected")
            .header("x-payment", header)
            .body(AxumBody::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-payment-response"));
    }

    #[tokio::test]
    async fn in_progress_settlement_returns_409_with_retry_after() {
        let mut facilitator = FakeFacilitator::new(true);
        facilitator.settle_accept = false;
        facilitator.settle_error_reason = ReasonToken::InProgress;
        let app = app(Arc::new(facilitator));
        let payload = signed_payload([11u8; 32]);
        let header = codec::encode(&payload);
        let request = HttpRequest::builder()
            .uri("/protected")
            .header("x-payment", header)
            .body(AxumBody::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers().get("retry-after").unwrap(), "2");
    }

    #[tokio::test]
    async fn backpressure_settlement_returns_429() {
        let mut facilitator = FakeFacilitator::new(true);
        facilitator.settle_accept = false;
        facilitator.settle_error_reason = ReasonToken::Backpressure;
        let app = app(Arc::new(facilitator));
        let payload = signed_payload([12u8; 32]);
        let header = codec::encode(&payload);
        let request = HttpRequest::builder()
            .uri("/protected")
            .header("x-payment", header)
            .body(AxumBody::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn reverted_settlement_returns_502() {
        let mut facilitator = FakeFacilitator::new(true);
        facilitator.settle_accept = false;
        let app = app(Arc::new(facilitator));
        let payload = signed_payload([13u8; 32]);
        let header = codec::encode(&payload);
        let request = HttpRequest::builder()
            .uri("/protected")
            .header("x-payment", header)
            .body(AxumBody::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
