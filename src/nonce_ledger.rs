//! C5 NonceLedger: the sole source of truth for "has this authorization nonce been spent",
//! independent of on-chain settlement state.
//!
//! Grounded on the `ON CONFLICT DO NOTHING` idempotent-insert idiom used for durable
//! dedup keys in `examples/longcipher-ledgerflow/ledgerflow-indexer/src/database.rs`,
//! adapted here to the (chainId, tokenContract, from, nonce) key this facilitator uses.

use alloy_primitives::Address;
use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

use crate::domain::NetworkId;
use crate::types::HexEncodedNonce;

#[derive(Debug, Error)]
pub enum NonceLedgerError {
    #[error("nonce ledger unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

/// Reserves and checks EIP-3009 authorization nonces. A nonce is reserved exactly once;
/// any later reservation attempt for the same key is rejected regardless of whether the
/// first reservation's payment ever settled.
#[async_trait]
pub trait NonceLedger: Send + Sync {
    /// Atomically reserves `nonce` for `(network, token_contract, from)`. Returns `true`
    /// if this call performed the reservation, `false` if it was already reserved.
    async fn reserve(
        &self,
        network: NetworkId,
        token_contract: Address,
        from: Address,
        nonce: HexEncodedNonce,
    ) -> Result<bool, NonceLedgerError>;

    /// Checks whether a nonce is already reserved, without reserving it.
    async fn is_reserved(
        &self,
        network: NetworkId,
        token_contract: Address,
        from: Address,
        nonce: HexEncodedNonce,
    ) -> Result<bool, NonceLedgerError>;
}

pub struct PostgresNonceLedger {
    pool: PgPool,
}

impl PostgresNonceLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NonceLedger for PostgresNonceLedger {
    async fn reserve(
        &self,
        network: NetworkId,
        token_contract: Address,
        from: Address,
        nonce: HexEncodedNonce,
    ) -> Result<bool, NonceLedgerError> {
        let descriptor = crate::domain::descriptor(network);
        let chain_id = descriptor.map(|d| d.chain_id as i64).unwrap_or(0);

        let result = sqlx::query(
            r#"
            INSERT INTO nonces (chain_id, token_contract, from_address, nonce)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (chain_id, token_contract, from_address, nonce) DO NOTHING
            "#,
        )
        .bind(chain_id)
        .bind(token_contract.to_string())
        .bind(from.to_string())
        .bind(format!("0x{}", alloy_primitives::hex::encode(nonce.0)))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn is_reserved(
        &self,
        network: NetworkId,
        token_contract: Address,
        from: Address,
        nonce: HexEncodedNonce,
    ) -> Result<bool, NonceLedgerError> {
        let descriptor = crate::domain::descriptor(network);
        let chain_id = descriptor.map(|d| d.chain_id as i64).unwrap_or(0);

        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM nonces
            WHERE chain_id = $1 AND token_contract = $2 AND from_address = $3 AND nonce = $4
            "#,
        )
        .bind(chain_id)
        .bind(token_contract.to_string())
        .bind(from.to_string())
        .bind(format!("0x{}", alloy_primitives::hex::encode(nonce.0)))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// An in-memory stand-in for tests that exercises the same reservation semantics
    /// without a database.
    #[derive(Default)]
    pub struct InMemoryNonceLedger {
        reserved: Mutex<HashSet<(NetworkId, Address, Address, HexEncodedNonce)>>,
    }

    #[async_trait]
    impl NonceLedger for InMemoryNonceLedger {
        async fn reserve(
            &self,
            network: NetworkId,
            token_contract: Address,
            from: Address,
            nonce: HexEncodedNonce,
        ) -> Result<bool, NonceLedgerError> {
            let mut guard = self.reserved.lock().unwrap();
            Ok(guard.insert((network, token_contract, from, nonce)))
        }

        async fn is_reserved(
            &self,
            network: NetworkId,
            token_contract: Address,
            from: Address,
            nonce: HexEncodedNonce,
        ) -> Result<bool, NonceLedgerError> {
            let guard = self.reserved.lock().unwrap();
            Ok(guard.contains(&(network, token_contract, from, nonce)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::InMemoryNonceLedger;
    use super::*;
    use alloy_primitives::address;

    #[tokio::test]
    async fn second_reservation_of_the_same_nonce_is_rejected() {
        let ledger = InMemoryNonceLedger::default();
        let token = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");
        let from = address!("1111111111111111111111111111111111111111");
        let nonce = HexEncodedNonce([9u8; 32]);

        assert!(ledger
            .reserve(NetworkId::BaseMainnet, token, from, nonce)
            .await
            .unwrap());
        assert!(!ledger
            .reserve(NetworkId::BaseMainnet, token, from, nonce)
            .await
            .unwrap());
        assert!(ledger
            .is_reserved(NetworkId::BaseMainnet, token, from, nonce)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn same_nonce_on_a_different_network_is_independent() {
        let ledger = InMemoryNonceLedger::default();
        let token = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");
        let from = address!("1111111111111111111111111111111111111111");
        let nonce = HexEncodedNonce([9u8; 32]);

        assert!(ledger
            .reserve(NetworkId::BaseMainnet, token, from, nonce)
            .await
            .unwrap());
        assert!(ledger
            .reserve(NetworkId::BaseSepolia, token, from, nonce)
            .await
            .unwrap());
    }
}
