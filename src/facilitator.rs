//! C9 Facilitator: the orchestrator. Ties the Verifier, NonceLedger, PaymentStore and
//! Submitter together into the two RPCs sellers and gates actually call: `verify` and
//! `settle`.
//!
//! Grounded on the teacher's `facilitator.rs` (trait shape, blanket `Arc<T>` impl so the
//! trait object can be shared across axum handlers without an extra wrapper type) and
//! `facilitator_local.rs` (the verify-then-submit orchestration sequence). The in-flight
//! settlement semaphore is new: the teacher has no backpressure concept, so this is
//! grounded on SPEC_FULL's own `maxInFlightSettlements` requirement rather than ported
//! from a teacher file, and documented as an Open Question decision in `DESIGN.md`.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::domain::NetworkDescriptor;
use crate::nonce_ledger::{NonceLedger, NonceLedgerError};
use crate::store::{NewPayment, PaymentKey, PaymentRecord, PaymentStatus, PaymentStore, PaymentStoreError};
use crate::submitter::{Inclusion, Submitter, SubmitterError};
use crate::timestamp::UnixTimestamp;
use crate::types::{EvmAddress, PaymentPayload, PaymentRequirements, ReasonToken, SettleResponse, VerifyResponse};
use crate::verifier::verify;

/// How long `settle` polls `Submitter.awaitInclusion` before giving up on an *existing*
/// `Submitted` record and returning `InProgress` — deliberately short, since the caller is
/// retrying an idempotent request and shouldn't be blocked by the full settlement timeout
/// a first-time submission gets.
const IDEMPOTENT_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// Reconstructs the `ReasonToken` a terminal payment record failed with, from the
/// `error_kind` string `mark_errored` persisted — reuses `ReasonToken`'s own
/// `camelCase` wire encoding rather than a separate `FromStr` impl.
fn parse_reason_token(error_kind: &str) -> Option<ReasonToken> {
    serde_json::from_value(serde_json::Value::String(error_kind.to_string())).ok()
}

#[derive(Debug, Error)]
pub enum FacilitatorError {
    #[error("payment rejected: {0}")]
    Rejected(ReasonToken),
    #[error("nonce ledger error: {0}")]
    NonceLedger(#[from] NonceLedgerError),
    #[error("payment store error: {0}")]
    Store(#[from] PaymentStoreError),
}

/// Verifies and settles payments. Implemented once, in-process, by [`FacilitatorLocal`];
/// the trait exists so the Gate and the HTTP handlers can depend on an `Arc<dyn
/// Facilitator>` rather than a concrete type.
#[async_trait::async_trait]
pub trait Facilitator: Send + Sync {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> VerifyResponse;

    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> SettleResponse;
}

/// The in-process Facilitator: owns the NonceLedger, PaymentStore and Submitter, and
/// bounds the number of settlements running concurrently against the chain.
pub struct FacilitatorLocal {
    nonce_ledger: Arc<dyn NonceLedger>,
    store: Arc<dyn PaymentStore>,
    submitter: Arc<dyn Submitter>,
    in_flight: Arc<Semaphore>,
    clock_skew_seconds: u64,
    min_remaining_lifetime_seconds: u64,
    inclusion_timeout: Duration,
}

impl FacilitatorLocal {
    pub fn new(
        nonce_ledger: Arc<dyn NonceLedger>,
        store: Arc<dyn PaymentStore>,
        submitter: Arc<dyn Submitter>,
        max_in_flight_settlements: usize,
        clock_skew_seconds: u64,
        min_remaining_lifetime_seconds: u64,
        inclusion_timeout: Duration,
    ) -> Self {
        Self {
            nonce_ledger,
            store,
            submitter,
            in_flight: Arc::new(Semaphore::new(max_in_flight_settlements)),
            clock_skew_seconds,
            min_remaining_lifetime_seconds,
            inclusion_timeout,
        }
    }

    async fn record_pending(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<PaymentRecord, FacilitatorError> {
        let network = crate::domain::descriptor(payload.network)
            .ok_or(FacilitatorError::Rejected(ReasonToken::UnknownNetwork))?;
        let authorization = &payload.payload.authorization;
        let key = PaymentKey {
            network: payload.network,
            token_contract: network.token_contract,
            from: authorization.from.0,
            nonce: authorization.nonce,
        };

        match self.store.find_by_key(key).await? {
            Some(existing) => Ok(existing),
            None => {
                let record = self
                    .store
                    .insert_pending(NewPayment {
                        key,
                        to: authorization.to.0,
                        amount: authorization.value.clone(),
                        valid_after: authorization.valid_after.seconds_since_epoch(),
                        valid_before: authorization.valid_before.seconds_since_epoch(),
                        resource: requirements.resource.clone(),
                    })
                    .await;
                match record {
                    Ok(record) => Ok(record),
                    Err(PaymentStoreError::AlreadyExists) => self
                        .store
                        .find_by_key(key)
                        .await?
                        .ok_or(FacilitatorError::Rejected(ReasonToken::StoreUnavailable)),
                    Err(other) => Err(other.into()),
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Facilitator for FacilitatorLocal {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> VerifyResponse {
        let now = UnixTimestamp::try_now().unwrap_or(UnixTimestamp(0));
        let result = verify(
            payload,
            requirements,
            self.nonce_ledger.as_ref(),
            now,
            self.clock_skew_seconds,
            self.min_remaining_lifetime_seconds,
            false,
        )
        .await;
        match result {
            Ok(verified) => VerifyResponse {
                is_valid: true,
                invalid_reason: None,
                payer: crate::types::EvmAddress(verified.payer),
            },
            Err(reason) => VerifyResponse {
                is_valid: false,
                invalid_reason: Some(reason),
                payer: payload.payload.authorization.from,
            },
        }
    }

    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> SettleResponse {
        let payer = payload.payload.authorization.from;
        let fail = |reason: ReasonToken| SettleResponse {
            success: false,
            error_reason: Some(reason),
            payer,
            transaction: None,
            network: payload.network,
        };

        let now = match UnixTimestamp::try_now() {
            Ok(now) => now,
            Err(_) => return fail(ReasonToken::StoreUnavailable),
        };

        let network = match crate::domain::descriptor(payload.network) {
            Some(network) => network,
            None => return fail(ReasonToken::UnknownNetwork),
        };

        let record = match self.record_pending(payload, requirements).await {
            Ok(record) => record,
            Err(FacilitatorError::Rejected(reason)) => return fail(reason),
            Err(_) => return fail(ReasonToken::StoreUnavailable),
        };

        if record.status != PaymentStatus::Pending {
            return self.settle_existing(record, network, payer, payload.network).await;
        }

        let authorization = &payload.payload.authorization;
        let verified = match verify(
            payload,
            requirements,
            self.nonce_ledger.as_ref(),
            now,
            self.clock_skew_seconds,
            self.min_remaining_lifetime_seconds,
            true,
        )
        .await
        {
            Ok(verified) => verified,
            Err(reason) => {
                let _ = self
                    .store
                    .mark_errored(
                        record.id,
                        PaymentStatus::Pending,
                        PaymentStatus::Rejected,
                        &reason.to_string(),
                        "verification failed",
                    )
                    .await;
                return fail(reason);
            }
        };

        let balance = self
            .submitter
            .balance_of(verified.network, verified.payer)
            .await;
        let required = authorization.value.as_u256().unwrap_or_default();
        match balance {
            Ok(balance) if balance < required => {
                let _ = self
                    .store
                    .mark_errored(
                        record.id,
                        PaymentStatus::Pending,
                        PaymentStatus::Rejected,
                        "insufficientAmount",
                        "payer balance below required amount",
                    )
                    .await;
                return fail(ReasonToken::InsufficientAmount);
            }
            Err(_) => return fail(ReasonToken::ChainUnreachable),
            Ok(_) => {}
        }

        let Ok(permit) = self.in_flight.clone().try_acquire_owned() else {
            return fail(ReasonToken::Backpressure);
        };

        if self
            .store
            .transition(record.id, PaymentStatus::Pending, PaymentStatus::Verified)
            .await
            .is_err()
        {
            return fail(ReasonToken::InProgress);
        }
        if self
            .store
            .transition(record.id, PaymentStatus::Verified, PaymentStatus::Submitted)
            .await
            .is_err()
        {
            return fail(ReasonToken::InProgress);
        }

        let submission = {
            let _permit = permit;
            self.submitter
                .submit(verified.network, authorization, &payload.payload.signature)
                .await
        };

        let tx_hash = match submission {
            Ok(tx_hash) => tx_hash,
            Err(submit_error) => {
                let reason = ReasonToken::from(&submit_error);
                let _ = self
                    .store
                    .mark_errored(
                        record.id,
                        PaymentStatus::Submitted,
                        PaymentStatus::Failed,
                        &reason.to_string(),
                        &submit_error.to_string(),
                    )
                    .await;
                return fail(reason);
            }
        };

        match self
            .submitter
            .await_inclusion(verified.network, tx_hash, self.inclusion_timeout)
            .await
        {
            Ok(Inclusion::Confirmed) => {
                if let Err(e) = self
                    .store
                    .mark_settled(record.id, PaymentStatus::Submitted, tx_hash)
                    .await
                {
                    error!(error = %e, payment_id = record.id, "settled on-chain but failed to record settlement");
                }
                info!(payment_id = record.id, tx_hash = %tx_hash, "payment settled");
                SettleResponse {
                    success: true,
                    error_reason: None,
                    payer,
                    transaction: Some(tx_hash),
                    network: payload.network,
                }
            }
            Ok(Inclusion::Reverted(message)) => {
                let _ = self
                    .store
                    .mark_errored(
                        record.id,
                        PaymentStatus::Submitted,
                        PaymentStatus::Failed,
                        "settlementReverted",
                        &message,
                    )
                    .await;
                fail(ReasonToken::SettlementReverted)
            }
            Ok(Inclusion::Timeout) => {
                warn!(payment_id = record.id, tx_hash = %tx_hash, "settlement broadcast but not yet included; leaving status submitted");
                SettleResponse {
                    success: false,
                    error_reason: Some(ReasonToken::InProgress),
                    payer,
                    transaction: Some(tx_hash),
                    network: payload.network,
                }
            }
            Err(e) => {
                error!(error = %e, payment_id = record.id, "inclusion polling failed after broadcast");
                SettleResponse {
                    success: false,
                    error_reason: Some(ReasonToken::InProgress),
                    payer,
                    transaction: Some(tx_hash),
                    network: payload.network,
                }
            }
        }
    }
}

impl FacilitatorLocal {
    /// Handles `settle` being called again for a payment whose record already exists in a
    /// non-`Pending` status: `Settled` returns the original success without re-submitting,
    /// `Submitted` polls briefly for inclusion before reporting `InProgress`, and a
    /// terminal failure returns the originally recorded reason rather than `InProgress`.
    async fn settle_existing(
        &self,
        record: PaymentRecord,
        network: &'static NetworkDescriptor,
        payer: EvmAddress,
        network_id: crate::domain::NetworkId,
    ) -> SettleResponse {
        let fail = |reason: ReasonToken| SettleResponse {
            success: false,
            error_reason: Some(reason),
            payer,
            transaction: None,
            network: network_id,
        };

        match record.status {
            PaymentStatus::Settled => SettleResponse {
                success: true,
                error_reason: None,
                payer,
                transaction: record.tx_hash,
                network: network_id,
            },
            PaymentStatus::Submitted => {
                let Some(tx_hash) = record.tx_hash else {
                    return fail(ReasonToken::StoreUnavailable);
                };
                match self
                    .submitter
                    .await_inclusion(network, tx_hash, IDEMPOTENT_POLL_TIMEOUT)
                    .await
                {
                    Ok(Inclusion::Confirmed) => {
                        let _ = self
                            .store
                            .mark_settled(record.id, PaymentStatus::Submitted, tx_hash)
                            .await;
                        SettleResponse {
                            success: true,
                            error_reason: None,
                            payer,
                            transaction: Some(tx_hash),
                            network: network_id,
                        }
                    }
                    Ok(Inclusion::Reverted(message)) => {
                        let _ = self
                            .store
                            .mark_errored(
                                record.id,
                                PaymentStatus::Submitted,
                                PaymentStatus::Failed,
                                "settlementReverted",
                                &message,
                            )
                            .await;
                        fail(ReasonToken::SettlementReverted)
                    }
                    _ => SettleResponse {
                        success: false,
                        error_reason: Some(ReasonToken::InProgress),
                        payer,
                        transaction: Some(tx_hash),
                        network: network_id,
                    },
                }
            }
            PaymentStatus::Pending | PaymentStatus::Verified => fail(ReasonToken::InProgress),
            PaymentStatus::Failed | PaymentStatus::Rejected | PaymentStatus::Expired => {
                let reason = record
                    .error_kind
                    .as_deref()
                    .and_then(parse_reason_token)
                    .unwrap_or(ReasonToken::StoreUnavailable);
                fail(reason)
            }
        }
    }
}

#[async_trait::async_trait]
impl<T: Facilitator + ?Sized> Facilitator for Arc<T> {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> VerifyResponse {
        (**self).verify(payload, requirements).await
    }

    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> SettleResponse {
        (**self).settle(payload, requirements).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::authorization_digest;
    use crate::domain::{self, NetworkId};
    use crate::nonce_ledger::fake::InMemoryNonceLedger;
    use crate::store::fake::InMemoryPaymentStore;
    use crate::submitter::fake::FakeSubmitter;
    use crate::types::{
        AmountString, EvmAddress, EvmSignature, ExactEvmPayload, ExactEvmPayloadAuthorization,
        HexEncodedNonce, PaymentRequirementsExtra, Scheme, X402Version2,
    };
    use alloy_primitives::{address, U256};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    fn test_signer() -> PrivateKeySigner {
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
            .parse()
            .unwrap()
    }

    fn build(
        signer: &PrivateKeySigner,
        nonce: [u8; 32],
    ) -> (PaymentPayload, PaymentRequirements) {
        let network = domain::descriptor(NetworkId::BaseMainnet).unwrap();
        let pay_to = EvmAddress(address!("2222222222222222222222222222222222222222"));

        let authorization = ExactEvmPayloadAuthorization {
            from: EvmAddress(signer.address()),
            to: pay_to,
            value: AmountString::new(U256::from(1_000_000u64)),
            valid_after: UnixTimestamp(0),
            valid_before: UnixTimestamp(2_000_000_000),
            nonce: HexEncodedNonce(nonce),
        };
        let digest = authorization_digest(network, &authorization);
        let sig = signer.sign_hash_sync(&digest).unwrap();

        let payload = PaymentPayload {
            x402_version: X402Version2,
            scheme: Scheme::Exact,
            network: NetworkId::BaseMainnet,
            payload: ExactEvmPayload {
                signature: EvmSignature(sig.as_bytes()),
                authorization,
            },
        };
        let requirements = PaymentRequirements {
            scheme: Scheme::Exact,
            network: NetworkId::BaseMainnet,
            max_amount_required: AmountString::new(U256::from(1_000_000u64)),
            resource: "https://example.com/report".to_string(),
            description: "a report".to_string(),
            mime_type: None,
            output_schema: None,
            pay_to,
            max_timeout_seconds: Some(60),
            asset: EvmAddress(network.token_contract),
            extra: PaymentRequirementsExtra {
                name: network.token_name.to_string(),
                version: network.token_version.to_string(),
                expires_at: UnixTimestamp(2_000_000_000),
            },
        };
        (payload, requirements)
    }

    fn facilitator(submitter: FakeSubmitter) -> FacilitatorLocal {
        FacilitatorLocal::new(
            Arc::new(InMemoryNonceLedger::default()),
            Arc::new(InMemoryPaymentStore::default()),
            Arc::new(submitter),
            4,
            5,
            10,
            std::time::Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn verify_accepts_a_well_formed_payment() {
        let signer = test_signer();
        let (payload, requirements) = build(&signer, [1u8; 32]);
        let facilitator = facilitator(FakeSubmitter::succeeding(
            crate::types::TransactionHash([0u8; 32]),
            U256::from(1_000_000u64),
        ));

        let response = facilitator.verify(&payload, &requirements).await;
        assert!(response.is_valid);
    }

    #[tokio::test]
    async fn settle_succeeds_and_records_the_transaction_hash() {
        let signer = test_signer();
        let (payload, requirements) = build(&signer, [2u8; 32]);
        let tx_hash = crate::types::TransactionHash([9u8; 32]);
        let facilitator = facilitator(FakeSubmitter::succeeding(tx_hash, U256::from(1_000_000u64)));

        let response = facilitator.settle(&payload, &requirements).await;
        assert!(response.success);
        assert_eq!(response.transaction, Some(tx_hash));
    }

    #[tokio::test]
    async fn settle_rejects_insufficient_on_chain_balance() {
        let signer = test_signer();
        let (payload, requirements) = build(&signer, [3u8; 32]);
        let facilitator = facilitator(FakeSubmitter::succeeding(
            crate::types::TransactionHash([0u8; 32]),
            U256::from(1u64),
        ));

        let response = facilitator.settle(&payload, &requirements).await;
        assert!(!response.success);
        assert_eq!(response.error_reason, Some(ReasonToken::InsufficientAmount));
    }

    #[tokio::test]
    async fn settling_the_same_payload_twice_is_idempotent() {
        let signer = test_signer();
        let (payload, requirements) = build(&signer, [4u8; 32]);
        let tx_hash = crate::types::TransactionHash([5u8; 32]);
        let facilitator = facilitator(FakeSubmitter::succeeding(tx_hash, U256::from(1_000_000u64)));

        let first = facilitator.settle(&payload, &requirements).await;
        assert!(first.success);

        let second = facilitator.settle(&payload, &requirements).await;
        assert!(second.success);
        assert_eq!(second.transaction, Some(tx_hash));
    }

    #[tokio::test]
    async fn settle_reserves_the_nonce_in_the_ledger() {
        let signer = test_signer();
        let (payload, requirements) = build(&signer, [6u8; 32]);
        let network = domain::descriptor(NetworkId::BaseMainnet).unwrap();
        let tx_hash = crate::types::TransactionHash([6u8; 32]);
        let nonce_ledger = Arc::new(InMemoryNonceLedger::default());
        let facilitator = FacilitatorLocal::new(
            nonce_ledger.clone(),
            Arc::new(InMemoryPaymentStore::default()),
            Arc::new(FakeSubmitter::succeeding(tx_hash, U256::from(1_000_000u64))),
            4,
            5,
            10,
            std::time::Duration::from_secs(30),
        );

        let response = facilitator.settle(&payload, &requirements).await;
        assert!(response.success);

        let already_reserved = nonce_ledger
            .is_reserved(
                NetworkId::BaseMainnet,
                network.token_contract,
                signer.address(),
                payload.payload.authorization.nonce,
            )
            .await
            .unwrap();
        assert!(already_reserved, "settling a payment must reserve its nonce");
    }

    #[tokio::test]
    async fn inclusion_timeout_keeps_the_payment_in_progress_with_its_tx_hash() {
        let signer = test_signer();
        let (payload, requirements) = build(&signer, [7u8; 32]);
        let tx_hash = crate::types::TransactionHash([7u8; 32]);
        let facilitator = facilitator(FakeSubmitter::timing_out(tx_hash, U256::from(1_000_000u64)));

        let response = facilitator.settle(&payload, &requirements).await;
        assert!(!response.success);
        assert_eq!(response.error_reason, Some(ReasonToken::InProgress));
        assert_eq!(response.transaction, Some(tx_hash));
    }

    #[tokio::test]
    async fn retrying_a_rejected_payment_returns_the_original_reason() {
        let signer = test_signer();
        let (payload, mut requirements) = build(&signer, [8u8; 32]);
        // A required amount above what the payload carries rejects on the first attempt.
        requirements.max_amount_required = AmountString::new(U256::from(2_000_000u64));
        let facilitator = facilitator(FakeSubmitter::succeeding(
            crate::types::TransactionHash([0u8; 32]),
            U256::from(1_000_000u64),
        ));

        let first = facilitator.settle(&payload, &requirements).await;
        assert!(!first.success);
        assert_eq!(first.error_reason, Some(ReasonToken::InsufficientAmount));

        let second = facilitator.settle(&payload, &requirements).await;
        assert!(!second.success);
        assert_eq!(second.error_reason, Some(ReasonToken::InsufficientAmount));
    }
}
