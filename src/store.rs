//! C8 PaymentStore: the durable audit log of every payment this facilitator has seen,
//! tracked through its state machine from first verification to final settlement.
//!
//! Grounded on the upsert/status-transition SQL idiom in
//! `examples/longcipher-ledgerflow/ledgerflow-indexer/src/database.rs` and the pool/
//! migration setup in `ledgerflow-migrations/src/main.rs`; state transitions are enforced
//! with a compare-and-swap `UPDATE ... WHERE id = $id AND status = $expected`, matching
//! that codebase's guard against racing a transition that already happened.

use alloy_primitives::Address;
use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

use crate::domain::NetworkId;
use crate::types::{AmountString, HexEncodedNonce, TransactionHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Verified,
    Submitted,
    Settled,
    Failed,
    Rejected,
    Expired,
}

impl PaymentStatus {
    fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Verified => "verified",
            PaymentStatus::Submitted => "submitted",
            PaymentStatus::Settled => "settled",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Rejected => "rejected",
            PaymentStatus::Expired => "expired",
        }
    }
}

/// The idempotency key shared by the PaymentStore and the NonceLedger: a payment is
/// uniquely identified by the four-tuple of chain, token, payer and nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaymentKey {
    pub network: NetworkId,
    pub token_contract: Address,
    pub from: Address,
    pub nonce: HexEncodedNonce,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub key: PaymentKey,
    pub to: Address,
    pub amount: AmountString,
    pub valid_after: u64,
    pub valid_before: u64,
    pub resource: String,
}

#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub id: i64,
    pub key: PaymentKey,
    pub to: Address,
    pub amount: AmountString,
    pub status: PaymentStatus,
    pub tx_hash: Option<TransactionHash>,
    pub error_kind: Option<String>,
}

#[derive(Debug, Error)]
pub enum PaymentStoreError {
    #[error("payment store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("payment already recorded for this idempotency key")]
    AlreadyExists,
    #[error("no payment row transitioned: expected status {expected}, row id {id}")]
    StaleTransition { id: i64, expected: &'static str },
}

/// Durable record of every payment this facilitator has verified, submitted, or settled.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Inserts a new `pending` record. Fails with `AlreadyExists` if the idempotency key
    /// is already recorded — the Facilitator treats this as "this payment was already
    /// seen" and looks up the existing record instead of re-verifying.
    async fn insert_pending(&self, payment: NewPayment) -> Result<PaymentRecord, PaymentStoreError>;

    async fn find_by_key(&self, key: PaymentKey) -> Result<Option<PaymentRecord>, PaymentStoreError>;

    /// Compare-and-swap transition: succeeds only if the row's current status matches
    /// `expected`.
    async fn transition(
        &self,
        id: i64,
        expected: PaymentStatus,
        next: PaymentStatus,
    ) -> Result<(), PaymentStoreError>;

    /// Marks a payment settled, recording its transaction hash in the same CAS step.
    async fn mark_settled(
        &self,
        id: i64,
        expected: PaymentStatus,
        tx_hash: TransactionHash,
    ) -> Result<(), PaymentStoreError>;

    /// Marks a payment failed or rejected, recording the reason token that explains why.
    async fn mark_errored(
        &self,
        id: i64,
        expected: PaymentStatus,
        next: PaymentStatus,
        error_kind: &str,
        error_message: &str,
    ) -> Result<(), PaymentStoreError>;
}

pub struct PostgresPaymentStore {
    pool: PgPool,
}

impl PostgresPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentStore for PostgresPaymentStore {
    async fn insert_pending(&self, payment: NewPayment) -> Result<PaymentRecord, PaymentStoreError> {
        let descriptor = crate::domain::descriptor(payment.key.network);
        let chain_id = descriptor.map(|d| d.chain_id as i64).unwrap_or(0);
        let nonce_hex = format!("0x{}", alloy_primitives::hex::encode(payment.key.nonce.0));

        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO payments
                (chain_id, token_contract, from_address, nonce, to_address, amount,
                 valid_after, valid_before, resource, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (chain_id, token_contract, from_address, nonce) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(chain_id)
        .bind(payment.key.token_contract.to_string())
        .bind(payment.key.from.to_string())
        .bind(&nonce_hex)
        .bind(payment.to.to_string())
        .bind(payment.amount.0.clone())
        .bind(payment.valid_after as i64)
        .bind(payment.valid_before as i64)
        .bind(&payment.resource)
        .bind(PaymentStatus::Pending.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let id = row.ok_or(PaymentStoreError::AlreadyExists)?.0;

        Ok(PaymentRecord {
            id,
            key: payment.key,
            to: payment.to,
            amount: payment.amount,
            status: PaymentStatus::Pending,
            tx_hash: None,
            error_kind: None,
        })
    }

    async fn find_by_key(&self, key: PaymentKey) -> Result<Option<PaymentRecord>, PaymentStoreError> {
        let descriptor = crate::domain::descriptor(key.network);
        let chain_id = descriptor.map(|d| d.chain_id as i64).unwrap_or(0);
        let nonce_hex = format!("0x{}", alloy_primitives::hex::encode(key.nonce.0));

        #[derive(sqlx::FromRow)]
        struct Row {
            id: i64,
            to_address: String,
            amount: String,
            status: String,
            tx_hash: Option<String>,
            error_kind: Option<String>,
        }

        let row: Option<Row> = sqlx::query_as(
            r#"
            SELECT id, to_address, amount, status, tx_hash, error_kind
            FROM payments
            WHERE chain_id = $1 AND token_contract = $2 AND from_address = $3 AND nonce = $4
            "#,
        )
        .bind(chain_id)
        .bind(key.token_contract.to_string())
        .bind(key.from.to_string())
        .bind(&nonce_hex)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| PaymentRecord {
            id: r.id,
            key,
            to: r.to_address.parse().unwrap_or(Address::ZERO),
            amount: AmountString(r.amount),
            status: parse_status(&r.status),
            tx_hash: r.tx_hash.and_then(|h| h.parse().ok()),
            error_kind: r.error_kind,
        }))
    }

    async fn transition(
        &self,
        id: i64,
        expected: PaymentStatus,
        next: PaymentStatus,
    ) -> Result<(), PaymentStoreError> {
        let touched_at_column = match next {
            PaymentStatus::Verified => "verified_at",
            PaymentStatus::Submitted => "submitted_at",
            _ => "created_at",
        };
        let query = format!(
            "UPDATE payments SET status = $1, {touched_at_column} = now() WHERE id = $2 AND status = $3"
        );
        let result = sqlx::query(&query)
            .bind(next.as_str())
            .bind(id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() != 1 {
            return Err(PaymentStoreError::StaleTransition {
                id,
                expected: expected.as_str(),
            });
        }
        Ok(())
    }

    async fn mark_settled(
        &self,
        id: i64,
        expected: PaymentStatus,
        tx_hash: TransactionHash,
    ) -> Result<(), PaymentStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET status = $1, tx_hash = $2, settled_at = now()
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(PaymentStatus::Settled.as_str())
        .bind(tx_hash.to_string())
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(PaymentStoreError::StaleTransition {
                id,
                expected: expected.as_str(),
            });
        }
        Ok(())
    }

    async fn mark_errored(
        &self,
        id: i64,
        expected: PaymentStatus,
        next: PaymentStatus,
        error_kind: &str,
        error_message: &str,
    ) -> Result<(), PaymentStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET status = $1, error_kind = $2, error_message = $3
            WHERE id = $4 AND status = $5
            "#,
        )
        .bind(next.as_str())
        .bind(error_kind)
        .bind(error_message)
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(PaymentStoreError::StaleTransition {
                id,
                expected: expected.as_str(),
            });
        }
        Ok(())
    }
}

fn parse_status(s: &str) -> PaymentStatus {
    match s {
        "pending" => PaymentStatus::Pending,
        "verified" => PaymentStatus::Verified,
        "submitted" => PaymentStatus::Submitted,
        "settled" => PaymentStatus::Settled,
        "failed" => PaymentStatus::Failed,
        "rejected" => PaymentStatus::Rejected,
        "expired" => PaymentStatus::Expired,
        other => panic!("unknown payment status persisted: {other}"),
    }
}


#[cfg(test)]
mod tests {
    use super::fake::InMemoryPaymentStore;
    use super::*;
    use alloy_primitives::{address, U256};

    fn sample_key() -> PaymentKey {
        PaymentKey {
            network: NetworkId::BaseMainnet,
            token_contract: address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            from: address!("1111111111111111111111111111111111111111"),
            nonce: HexEncodedNonce([3u8; 32]),
        }
    }

    #[tokio::test]
    async fn second_insert_with_the_same_key_is_rejected() {
        let store = InMemoryPaymentStore::default();
        let new_payment = NewPayment {
            key: sample_key(),
            to: address!("2222222222222222222222222222222222222222"),
            amount: AmountString::new(U256::from(1_000_000u64)),
            valid_after: 0,
            valid_before: 1_000_000_000,
            resource: "https://example.com/report".to_string(),
        };

        store.insert_pending(new_payment.clone()).await.unwrap();
        let result = store.insert_pending(new_payment).await;
        assert!(matches!(result, Err(PaymentStoreError::AlreadyExists)));
    }

    #[tokio::test]
    async fn transition_fails_when_expected_status_is_stale() {
        let store = InMemoryPaymentStore::default();
        let new_payment = NewPayment {
            key: sample_key(),
            to: address!("2222222222222222222222222222222222222222"),
            amount: AmountString::new(U256::from(1_000_000u64)),
            valid_after: 0,
            valid_before: 1_000_000_000,
            resource: "https://example.com/report".to_string(),
        };
        let record = store.insert_pending(new_payment).await.unwrap();

        store
            .transition(record.id, PaymentStatus::Pending, PaymentStatus::Verified)
            .await
            .unwrap();

        let stale = store
            .transition(record.id, PaymentStatus::Pending, PaymentStatus::Verified)
            .await;
        assert!(matches!(stale, Err(PaymentStoreError::StaleTransition { .. })));
    }
}
