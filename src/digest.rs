//! C3 DigestBuilder: the EIP-712 signing hash a client must have signed over.
//!
//! Grounded on the teacher's `scheme/v1_eip155_exact/mod.rs`, which builds the same
//! `eip712_domain!` + `TransferWithAuthorization` + `eip712_signing_hash` chain for a
//! single network; generalized here to read the domain (name/version/verifyingContract/
//! chainId) from the DomainRegistry instead of a hardcoded constant.

use alloy_primitives::{FixedBytes, U256};
use alloy_sol_types::{eip712_domain, SolStruct};

use crate::domain::NetworkDescriptor;
use crate::types::{ExactEvmPayloadAuthorization, TransferWithAuthorization};

/// Builds the final EIP-712 digest (`0x19 0x01 || domainSeparator || structHash`) for an
/// authorization, scoped to one network's USDC deployment.
pub fn authorization_digest(
    network: &NetworkDescriptor,
    authorization: &ExactEvmPayloadAuthorization,
) -> FixedBytes<32> {
    let domain = eip712_domain! {
        name: network.token_name.to_string(),
        version: network.token_version.to_string(),
        chain_id: network.chain_id,
        verifying_contract: network.token_contract,
    };

    let message = TransferWithAuthorization {
        from: authorization.from.0,
        to: authorization.to.0,
        value: authorization
            .value
            .as_u256()
            .unwrap_or(U256::ZERO),
        validAfter: U256::from(authorization.valid_after.seconds_since_epoch()),
        validBefore: U256::from(authorization.valid_before.seconds_since_epoch()),
        nonce: FixedBytes::from(authorization.nonce.0),
    };

    message.eip712_signing_hash(&domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{self, NetworkId};
    use crate::types::{AmountString, EvmAddress, HexEncodedNonce};
    use crate::timestamp::UnixTimestamp;
    use alloy_primitives::Address;

    #[test]
    fn digest_is_deterministic_for_identical_inputs() {
        let network = domain::descriptor(NetworkId::BaseSepolia).unwrap();
        let authorization = ExactEvmPayloadAuthorization {
            from: EvmAddress(Address::ZERO),
            to: EvmAddress(Address::ZERO),
            value: AmountString::new(U256::from(1000u64)),
            valid_after: UnixTimestamp(0),
            valid_before: UnixTimestamp(1_000_000_000),
            nonce: HexEncodedNonce([7u8; 32]),
        };

        let a = authorization_digest(network, &authorization);
        let b = authorization_digest(network, &authorization);
        assert_eq!(a, b);
    }

    #[test]
    fn digest_differs_across_networks_despite_identical_message() {
        let base_sepolia = domain::descriptor(NetworkId::BaseSepolia).unwrap();
        let base = domain::descriptor(NetworkId::BaseMainnet).unwrap();
        let authorization = ExactEvmPayloadAuthorization {
            from: EvmAddress(Address::ZERO),
            to: EvmAddress(Address::ZERO),
            value: AmountString::new(U256::from(1u64)),
            valid_after: UnixTimestamp(0),
            valid_before: UnixTimestamp(1),
            nonce: HexEncodedNonce([1u8; 32]),
        };

        let a = authorization_digest(base_sepolia, &authorization);
        let b = authorization_digest(base, &authorization);
        assert_ne!(a, b, "chain id must be part of the domain separator");
    }
}
