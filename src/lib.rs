//! An x402 V2 facilitator: verifies and settles HTTP-native micropayments authorized via
//! EIP-3009 `transferWithAuthorization` on EVM chains, denominated in USDC.
//!
//! # Overview
//!
//! The x402 protocol lets an HTTP server answer a request with `402 Payment Required`
//! and a machine-readable list of ways to pay for it. A client signs an EIP-712
//! authorization off-chain, retries the request carrying it in `X-PAYMENT`, and the
//! server asks this facilitator to verify and, once satisfied, settle the payment
//! on-chain — without the server ever touching a private key itself.
//!
//! # Modules
//!
//! - [`types`] — wire types for the `exact` scheme's payloads, requirements, and
//!   responses (C1 Codec's data model).
//! - [`codec`] — the base64url-no-pad envelope carried in `X-PAYMENT` and
//!   `X-PAYMENT-RESPONSE` headers (C1 Codec's wire transform).
//! - [`domain`] — the closed registry of supported networks and their EIP-712 domains
//!   (C2 DomainRegistry).
//! - [`digest`] — builds the EIP-712 signing hash an authorization must be signed over
//!   (C3 DigestBuilder).
//! - [`signature`] — recovers and checks an ECDSA signature against a digest (C4
//!   SignatureVerifier).
//! - [`nonce_ledger`] — the durable record of which authorization nonces are spent (C5
//!   NonceLedger).
//! - [`verifier`] — the pure check of a payload against its requirements (C6 Verifier).
//! - [`submitter`] — executes a verified authorization on-chain (C7 Submitter).
//! - [`store`] — the durable payment audit log and its state machine (C8 PaymentStore).
//! - [`facilitator`] — the orchestrator tying C1-C8 together into `verify`/`settle` (C9
//!   Facilitator).
//! - [`requirements`] — turns a seller's USD price into a `PaymentRequirements` list (C11
//!   Requirement Issuer).
//! - [`handlers`] — the HTTP RPC surface a seller or gate calls.
//! - [`config`] — CLI/environment configuration.
//! - [`timestamp`] — the Unix-seconds timestamp type used throughout authorization
//!   windows.
//! - [`telemetry`] — structured logging and OpenTelemetry export, feature-gated behind
//!   `telemetry`.
//! - [`sig_down`] — SIGTERM/SIGINT-driven graceful shutdown.
//!
//! The Gate (C10), the tower middleware that turns a `402` challenge into a protected
//! route, lives in the separate `x402-axum` crate so non-facilitator services can depend
//! on it without pulling in a chain client.

pub mod codec;
pub mod config;
pub mod digest;
pub mod domain;
pub mod facilitator;
pub mod handlers;
pub mod nonce_ledger;
pub mod requirements;
pub mod sig_down;
pub mod signature;
pub mod store;
pub mod submitter;
pub mod telemetry;
pub mod timestamp;
pub mod types;
pub mod verifier;
