//! C4 SignatureVerifier: recovers and checks an ECDSA signature over a digest.
//!
//! Grounded on the teacher's `scheme/v1_eip155_exact/mod.rs`, which builds an
//! `alloy_primitives::Signature` from the raw 65 bytes, rejects malleable (high-s)
//! signatures via `.normalized_s()`, then recovers the signer with
//! `.recover_address_from_prehash()`.

use alloy_primitives::{Address, FixedBytes, Signature};

use crate::types::{EvmSignature, ReasonToken};

/// Recovers the signer address from a digest and raw signature, rejecting any signature
/// whose `s` component is not already normalized (EIP-2 low-s) — a non-canonical
/// signature is treated as malleable rather than silently re-normalized.
pub fn recover_signer(
    digest: FixedBytes<32>,
    signature: &EvmSignature,
) -> Result<Address, ReasonToken> {
    let sig = Signature::from_raw(&signature.0).map_err(|_| ReasonToken::InvalidSignature)?;

    if sig.normalized_s().is_some() {
        return Err(ReasonToken::MalleableSignature);
    }

    sig.recover_address_from_prehash(&digest)
        .map_err(|_| ReasonToken::InvalidSignature)
}

/// Recovers the signer and checks it matches the authorization's claimed `from` address.
pub fn verify_signer_matches(
    digest: FixedBytes<32>,
    signature: &EvmSignature,
    claimed_from: Address,
) -> Result<(), ReasonToken> {
    let recovered = recover_signer(digest, signature)?;
    if recovered != claimed_from {
        return Err(ReasonToken::SignerMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, keccak256};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    // Anvil/Hardhat default account #0.
    fn test_signer() -> PrivateKeySigner {
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
            .parse()
            .unwrap()
    }

    #[test]
    fn recovers_the_correct_signer_for_a_valid_signature() {
        let signer = test_signer();
        let digest = keccak256(b"hello world");
        let sig = signer.sign_hash_sync(&digest).unwrap();
        let raw: [u8; 65] = sig.as_bytes();
        let wrapped = EvmSignature(raw);

        let recovered = recover_signer(digest, &wrapped).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn rejects_signer_mismatch() {
        let signer = test_signer();
        let digest = keccak256(b"hello world");
        let sig = signer.sign_hash_sync(&digest).unwrap();
        let wrapped = EvmSignature(sig.as_bytes());

        let wrong_address = address!("1111111111111111111111111111111111111111");
        let result = verify_signer_matches(digest, &wrapped, wrong_address);
        assert_eq!(result, Err(ReasonToken::SignerMismatch));
    }

    #[test]
    fn rejects_malleable_high_s_signature() {
        let signer = test_signer();
        let digest = keccak256(b"hello world");
        let sig = signer.sign_hash_sync(&digest).unwrap();
        let mut raw = sig.as_bytes();

        // Flip s to its high-s counterpart: s' = N - s. N is the secp256k1 curve order.
        let n = alloy_primitives::U256::from_str_radix(
            "fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141",
            16,
        )
        .unwrap();
        let s = alloy_primitives::U256::from_be_slice(&raw[32..64]);
        let high_s = n - s;
        raw[32..64].copy_from_slice(&high_s.to_be_bytes::<32>());

        let wrapped = EvmSignature(raw);
        let result = recover_signer(digest, &wrapped);
        assert_eq!(result, Err(ReasonToken::MalleableSignature));
    }
}
