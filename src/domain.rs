//! C2 DomainRegistry: the closed set of supported networks and their EIP-712 domains.
//!
//! Grounded on the static per-network deployment constants in the teacher's legacy
//! `known.rs`/`network.rs` (a `Lazy<HashMap>` keyed registry), generalized here to the
//! six-network closed set this facilitator accepts (`arc-testnet`, `arc-mainnet`,
//! `base-sepolia`, `base-mainnet`, `ethereum-sepolia`, `ethereum-mainnet`) and enriched
//! with each network's USDC `transferWithAuthorization` domain (name/version/
//! verifyingContract) needed by the DigestBuilder. Arc is Circle's settlement chain; it
//! has no public RPC/explorer this registry can cite, so its chain id and USDC contract
//! below are placeholders pending a real deployment (see DESIGN.md).

use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use alloy_primitives::{address, Address};
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One of the six EVM networks this facilitator accepts payments on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkId {
    ArcTestnet,
    ArcMainnet,
    BaseSepolia,
    BaseMainnet,
    EthereumSepolia,
    EthereumMainnet,
}

impl NetworkId {
    pub const ALL: [NetworkId; 6] = [
        NetworkId::ArcTestnet,
        NetworkId::ArcMainnet,
        NetworkId::BaseSepolia,
        NetworkId::BaseMainnet,
        NetworkId::EthereumSepolia,
        NetworkId::EthereumMainnet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkId::ArcTestnet => "arc-testnet",
            NetworkId::ArcMainnet => "arc-mainnet",
            NetworkId::BaseSepolia => "base-sepolia",
            NetworkId::BaseMainnet => "base-mainnet",
            NetworkId::EthereumSepolia => "ethereum-sepolia",
            NetworkId::EthereumMainnet => "ethereum-mainnet",
        }
    }
}

impl Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
pub struct UnknownNetworkError(pub String);

impl Display for UnknownNetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown network id: {}", self.0)
    }
}

impl std::error::Error for UnknownNetworkError {}

impl FromStr for NetworkId {
    type Err = UnknownNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NetworkId::ALL
            .into_iter()
            .find(|n| n.as_str() == s)
            .ok_or_else(|| UnknownNetworkError(s.to_string()))
    }
}

impl Serialize for NetworkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NetworkId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NetworkId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// The EIP-3009 USDC deployment and EIP-712 domain this facilitator knows for a network.
#[derive(Debug, Clone, Copy)]
pub struct NetworkDescriptor {
    pub id: NetworkId,
    pub chain_id: u64,
    pub token_contract: Address,
    pub token_name: &'static str,
    pub token_version: &'static str,
    pub usdc_decimals: u8,
}

static REGISTRY: Lazy<HashMap<NetworkId, NetworkDescriptor>> = Lazy::new(|| {
    let entries = [
        // Placeholder chain id / contract: Arc has no public deployment to cite yet.
        NetworkDescriptor {
            id: NetworkId::ArcTestnet,
            chain_id: 5_042,
            token_contract: address!("00000000000000000000000000000000000A1C"),
            token_name: "USD Coin",
            token_version: "2",
            usdc_decimals: 6,
        },
        NetworkDescriptor {
            id: NetworkId::ArcMainnet,
            chain_id: 5_040,
            token_contract: address!("00000000000000000000000000000000000A1D"),
            token_name: "USD Coin",
            token_version: "2",
            usdc_decimals: 6,
        },
        NetworkDescriptor {
            id: NetworkId::BaseSepolia,
            chain_id: 84_532,
            token_contract: address!("036CbD53842c5426634e7929541eC2318f3dCF7e"),
            token_name: "USD Coin",
            token_version: "2",
            usdc_decimals: 6,
        },
        NetworkDescriptor {
            id: NetworkId::BaseMainnet,
            chain_id: 8_453,
            token_contract: address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            token_name: "USD Coin",
            token_version: "2",
            usdc_decimals: 6,
        },
        NetworkDescriptor {
            id: NetworkId::EthereumSepolia,
            chain_id: 11_155_111,
            token_contract: address!("1c7D4B196Cb0C7B01d743Fbc6116a902379C7238"),
            token_name: "USD Coin",
            token_version: "2",
            usdc_decimals: 6,
        },
        NetworkDescriptor {
            id: NetworkId::EthereumMainnet,
            chain_id: 1,
            token_contract: address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
            token_name: "USD Coin",
            token_version: "2",
            usdc_decimals: 6,
        },
    ];
    entries.into_iter().map(|d| (d.id, d)).collect()
});

/// Looks up the static descriptor for a network. Returns `None` for a syntactically valid
/// but unsupported network id, which callers map to `ReasonToken::UnknownNetwork`.
pub fn descriptor(network: NetworkId) -> Option<&'static NetworkDescriptor> {
    REGISTRY.get(&network)
}

/// Looks up a network by its EIP-3009 token contract address, scoped to a specific chain.
/// Used by the Verifier to check a requirement's `asset` resolves to a known deployment.
pub fn by_token_contract(chain_id: u64, token_contract: Address) -> Option<&'static NetworkDescriptor> {
    REGISTRY
        .values()
        .find(|d| d.chain_id == chain_id && d.token_contract == token_contract)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_network_id_has_a_descriptor() {
        for network in NetworkId::ALL {
            assert!(descriptor(network).is_some(), "missing descriptor for {network}");
        }
    }

    #[test]
    fn network_id_roundtrips_through_wire_format() {
        for network in NetworkId::ALL {
            let parsed = NetworkId::from_str(network.as_str()).unwrap();
            assert_eq!(parsed, network);
        }
    }

    #[test]
    fn unknown_network_name_is_rejected() {
        assert!(NetworkId::from_str("solana-mainnet").is_err());
    }
}
