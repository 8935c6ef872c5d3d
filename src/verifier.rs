//! C6 Verifier: checks a `PaymentPayload` against `PaymentRequirements` without touching
//! the chain or a store. Pure and composed entirely from C1-C5.
//!
//! Grounded on the teacher's `scheme/v1_eip155_exact/mod.rs` `assert_valid_payment`
//! method, which runs requirement/time/domain/signature/balance checks in a fixed,
//! fail-fast order; this keeps that ordering (requirements shape, then timing, then
//! signature) but drops the balance/allowance RPC calls the teacher makes inline here —
//! those live in the Submitter (C7), which is the only component that talks to a chain.

use alloy_primitives::Address;

use crate::digest::authorization_digest;
use crate::domain::{self, NetworkDescriptor};
use crate::nonce_ledger::NonceLedger;
use crate::signature::verify_signer_matches;
use crate::timestamp::UnixTimestamp;
use crate::types::{PaymentPayload, PaymentRequirements, ReasonToken};

/// The outcome of a successful verification: the resolved network descriptor and the
/// recovered payer address, both needed by the Facilitator to drive settlement.
#[derive(Debug, Clone)]
pub struct Verified {
    pub payer: Address,
    pub network: &'static NetworkDescriptor,
}

/// Checks shape, timing, domain, signature, and nonce freshness. Does not check on-chain
/// balance or allowance, and does not touch a store.
///
/// `clock_skew_seconds` (`σ`) widens the `validAfter`/`validBefore` window to tolerate
/// clock drift between client and facilitator; `min_remaining_lifetime_seconds` (`ε`)
/// additionally rejects an authorization that is technically still valid but expires too
/// soon to safely submit. The nonce check is the final one run, and is the only step
/// `reserve_nonce` changes: when `false` (the bare `/verify` RPC) it only peeks at the
/// ledger; when `true` (the `/settle` path) it atomically reserves the nonce as part of
/// this call, so a concurrent settlement of the same authorization can never both pass.
pub async fn verify(
    payload: &PaymentPayload,
    requirements: &PaymentRequirements,
    nonce_ledger: &dyn NonceLedger,
    now: UnixTimestamp,
    clock_skew_seconds: u64,
    min_remaining_lifetime_seconds: u64,
    reserve_nonce: bool,
) -> Result<Verified, ReasonToken> {
    if payload.scheme != requirements.scheme {
        return Err(ReasonToken::SchemeMismatch);
    }
    if payload.network != requirements.network {
        return Err(ReasonToken::NetworkMismatch);
    }

    let network = domain::descriptor(payload.network).ok_or(ReasonToken::UnknownNetwork)?;

    let authorization = &payload.payload.authorization;

    if authorization.to != requirements.pay_to {
        return Err(ReasonToken::RecipientMismatch);
    }

    let value = authorization
        .value
        .as_u256()
        .ok_or(ReasonToken::AmountOutOfRange)?;
    let required = requirements
        .max_amount_required
        .as_u256()
        .ok_or(ReasonToken::AmountOutOfRange)?;
    if value < required {
        return Err(ReasonToken::InsufficientAmount);
    }

    let now_secs = now.seconds_since_epoch();
    if authorization.valid_after.seconds_since_epoch() > now_secs.saturating_add(clock_skew_seconds) {
        return Err(ReasonToken::NotYetValid);
    }
    let min_valid_before = now_secs
        .saturating_sub(clock_skew_seconds)
        .saturating_add(min_remaining_lifetime_seconds);
    if authorization.valid_before.seconds_since_epoch() < min_valid_before {
        return Err(ReasonToken::Expired);
    }

    let digest = authorization_digest(network, authorization);
    verify_signer_matches(digest, &payload.payload.signature, authorization.from.0)?;

    if reserve_nonce {
        let reserved = nonce_ledger
            .reserve(
                payload.network,
                network.token_contract,
                authorization.from.0,
                authorization.nonce,
            )
            .await
            .map_err(|_| ReasonToken::StoreUnavailable)?;
        if !reserved {
            return Err(ReasonToken::NonceReused);
        }
    } else {
        let already_spent = nonce_ledger
            .is_reserved(
                payload.network,
                network.token_contract,
                authorization.from.0,
                authorization.nonce,
            )
            .await
            .map_err(|_| ReasonToken::StoreUnavailable)?;
        if already_spent {
            return Err(ReasonToken::NonceReused);
        }
    }

    Ok(Verified {
        payer: authorization.from.0,
        network,
    })
}
