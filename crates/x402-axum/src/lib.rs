#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Axum middleware for enforcing [x402](https://www.x402.org) payments on protected routes.
//!
//! This is the Gate: it wraps a route with an in-process [`x402_facilitator::facilitator::Facilitator`],
//! answering unpaid requests with `402 Payment Required` and settling paid ones after the
//! inner handler runs.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use axum::{Router, routing::get, Json};
//! use axum::response::IntoResponse;
//! use http::StatusCode;
//! use serde_json::json;
//! use x402_facilitator::domain::NetworkId;
//! use x402_facilitator::facilitator::Facilitator;
//! use x402_facilitator::requirements::PriceTag;
//! use x402_axum::X402Middleware;
//!
//! # fn build_app(facilitator: Arc<dyn Facilitator>, price_tag: PriceTag) -> Router {
//! let x402 = X402Middleware::new(facilitator);
//!
//! Router::new().route(
//!     "/protected",
//!     get(my_handler).layer(
//!         x402.with_description("Access to /protected")
//!             .with_price_tag(price_tag)
//!     ),
//! )
//! # }
//!
//! async fn my_handler() -> impl IntoResponse {
//!     (StatusCode::OK, Json(json!({ "hello": "world" })))
//! }
//! ```
//!
//! ## Configuration Notes
//!
//! - **[`X402Middleware::with_price_tag`]** sets the asset, amount and accepted networks.
//! - **[`X402Middleware::with_description`]** and **[`X402Middleware::with_mime_type`]** are
//!   optional but help the payer understand what is being paid for.
//! - **[`X402Middleware::with_resource`]** explicitly sets the full URI of the protected
//!   resource. If not set, it is derived per-request from **[`X402Middleware::with_base_url`]**
//!   plus the request path and query.
//! - If no base URL is provided, the default is `http://localhost/` (avoid this in production).

pub mod layer;

pub use layer::X402Middleware;
