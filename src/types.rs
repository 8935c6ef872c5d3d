//! Type definitions for the x402 V2 `exact` scheme over EIP-3009.
//!
//! Every byte-string field (addresses, nonces, signatures) is a lowercase `0x`-prefixed
//! hex string on the wire. Decimal amounts and Unix timestamps are JSON strings, never
//! numbers, so a `u64`-capped or float-based client never silently truncates a value.

use std::fmt;
use std::fmt::Display;

use alloy_primitives::{Address, FixedBytes, U256};
use alloy_sol_types::sol;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::domain::NetworkId;
use crate::timestamp::UnixTimestamp;

/// Protocol version. This facilitator speaks x402 V2 exclusively; the field is still
/// carried on the wire (as the bare integer `2`) for forward compatibility with payloads
/// that name a different version.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct X402Version2;

impl Serialize for X402Version2 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(2)
    }
}

#[derive(Debug)]
pub struct X402VersionError(pub u8);

impl Display for X402VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported x402Version {}, expected 2", self.0)
    }
}

impl std::error::Error for X402VersionError {}

impl<'de> Deserialize<'de> for X402Version2 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let num = u8::deserialize(deserializer)?;
        if num == 2 {
            Ok(X402Version2)
        } else {
            Err(Error::custom(X402VersionError(num)))
        }
    }
}

/// Payment scheme. Only `exact` is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Exact,
}

impl Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exact")
    }
}

/// A 65-byte `(r, s, v)` ECDSA signature. Serialized as a 0x-prefixed, 130-hex-char string.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EvmSignature(pub [u8; 65]);

impl<'de> Deserialize<'de> for EvmSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        static SIG_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{130}$").expect("valid regex"));

        if !SIG_REGEX.is_match(&s) {
            return Err(Error::custom(
                "signature must be a 0x-prefixed 65-byte hex string",
            ));
        }
        let bytes = alloy_primitives::hex::decode(s.trim_start_matches("0x"))
            .map_err(|_| Error::custom("failed to decode signature hex"))?;
        let array: [u8; 65] = bytes
            .try_into()
            .map_err(|_| Error::custom("signature must be exactly 65 bytes"))?;
        Ok(EvmSignature(array))
    }
}

impl Serialize for EvmSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", alloy_primitives::hex::encode(self.0)))
    }
}

/// A 20-byte EVM address, lowercase `0x`-prefixed hex on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvmAddress(pub Address);

impl Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Address> for EvmAddress {
    fn from(address: Address) -> Self {
        EvmAddress(address)
    }
}

impl From<EvmAddress> for Address {
    fn from(address: EvmAddress) -> Self {
        address.0
    }
}

/// A 32-byte EIP-3009 authorization nonce, 0x-prefixed, 64 hex chars.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HexEncodedNonce(pub [u8; 32]);

impl<'de> Deserialize<'de> for HexEncodedNonce {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        static NONCE_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("valid regex"));

        if !NONCE_REGEX.is_match(&s) {
            return Err(Error::custom("nonce must be a 0x-prefixed 32-byte hex string"));
        }
        let bytes = alloy_primitives::hex::decode(&s[2..])
            .map_err(|_| Error::custom("invalid hex in nonce"))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::custom("nonce must be exactly 32 bytes"))?;
        Ok(HexEncodedNonce(array))
    }
}

impl Serialize for HexEncodedNonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", alloy_primitives::hex::encode(self.0)))
    }
}

impl From<HexEncodedNonce> for FixedBytes<32> {
    fn from(value: HexEncodedNonce) -> Self {
        FixedBytes::from(value.0)
    }
}

/// A base-10, non-negative integer amount in token smallest units, bounded only by
/// `2^256-1`. Carried as a JSON string; parsed into [`U256`] on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmountString(pub String);

impl<'de> Deserialize<'de> for AmountString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        static AMOUNT_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^(0|[1-9][0-9]*)$").expect("valid regex"));

        if !AMOUNT_REGEX.is_match(&s) {
            return Err(Error::custom(
                "amount must be a non-negative base-10 integer with no leading zeros",
            ));
        }
        if s.parse::<U256>().is_err() {
            return Err(Error::custom("amount exceeds the 256-bit range"));
        }
        Ok(AmountString(s))
    }
}

impl Display for AmountString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AmountString {
    pub fn new(value: U256) -> Self {
        AmountString(value.to_string())
    }

    pub fn as_u256(&self) -> Option<U256> {
        self.0.parse::<U256>().ok()
    }
}

impl From<AmountString> for U256 {
    fn from(value: AmountString) -> Self {
        value.as_u256().expect("validated at deserialization")
    }
}

/// The EIP-3009 `transferWithAuthorization` authorization, as carried in a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactEvmPayloadAuthorization {
    pub from: EvmAddress,
    pub to: EvmAddress,
    pub value: AmountString,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: HexEncodedNonce,
}

/// The `exact` scheme's payload: a signature over the authorization it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactEvmPayload {
    pub signature: EvmSignature,
    pub authorization: ExactEvmPayloadAuthorization,
}

/// A complete `X-PAYMENT` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: X402Version2,
    pub scheme: Scheme,
    pub network: NetworkId,
    pub payload: ExactEvmPayload,
}

/// A 32-byte EVM transaction hash, 0x-prefixed hex on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHash(pub [u8; 32]);

impl<'de> Deserialize<'de> for TransactionHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;

        static TX_HASH_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("valid regex"));

        if !TX_HASH_REGEX.is_match(&s) {
            return Err(Error::custom("transaction hash must be a 0x-prefixed 32-byte hex string"));
        }
        let bytes = alloy_primitives::hex::decode(s.trim_start_matches("0x"))
            .map_err(|_| Error::custom("invalid hex in transaction hash"))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::custom("transaction hash must be exactly 32 bytes"))?;
        Ok(TransactionHash(array))
    }
}

impl Serialize for TransactionHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", alloy_primitives::hex::encode(self.0)))
    }
}

impl Display for TransactionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", alloy_primitives::hex::encode(self.0))
    }
}

impl From<FixedBytes<32>> for TransactionHash {
    fn from(value: FixedBytes<32>) -> Self {
        TransactionHash(value.0)
    }
}

/// Extra, scheme-specific fields a requirement carries for the client's convenience:
/// the EIP-712 domain name/version the client must sign against, and the moment this
/// specific requirement quote expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirementsExtra {
    pub name: String,
    pub version: String,
    pub expires_at: UnixTimestamp,
}

/// A single accepted way to pay for a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: Scheme,
    pub network: NetworkId,
    pub max_amount_required: AmountString,
    pub resource: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    pub pay_to: EvmAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timeout_seconds: Option<u64>,
    pub asset: EvmAddress,
    pub extra: PaymentRequirementsExtra,
}

/// The `402` challenge body: `{ x402Version, accepts }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    pub x402_version: X402Version2,
    pub accepts: Vec<PaymentRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Wrapper for a payload/requirements pair sent to `/verify` or `/settle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub payment_payload: PaymentPayload,
    pub payment_requirements: PaymentRequirements,
}

pub type SettleRequest = VerifyRequest;

/// The finite set of reasons the Verifier, Facilitator, and Gate surface to callers.
///
/// Every rejection carries one of these tokens; servers may log freely but must never
/// leak submitter internals (keys, mempool details) in a reason string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReasonToken {
    VersionMismatch,
    SchemeMismatch,
    NetworkMismatch,
    MalformedPayload,
    UnknownNetwork,
    RecipientMismatch,
    InsufficientAmount,
    NotYetValid,
    Expired,
    MalleableSignature,
    InvalidSignature,
    SignerMismatch,
    NonceReused,
    AmountOutOfRange,
    InProgress,
    SettlementTimeout,
    Backpressure,
    SettlementReverted,
    ChainUnreachable,
    StoreUnavailable,
}

impl Display for ReasonToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_value(self).expect("ReasonToken always serializes");
        write!(f, "{}", json.as_str().expect("ReasonToken serializes to a string"))
    }
}

/// Returned after verifying a `PaymentPayload` against `PaymentRequirements`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<ReasonToken>,
    pub payer: EvmAddress,
}

/// Returned after attempting to settle a payment on-chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<ReasonToken>,
    pub payer: EvmAddress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionHash>,
    pub network: NetworkId,
}

/// A simple error body for unexpected/fatal server errors with no protocol-level shape.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
}

sol!(
    /// EIP-3009 `transferWithAuthorization` struct, used both to reconstruct the EIP-712
    /// signing hash during verification and to build the on-chain call during settlement.
    #[derive(Debug)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
);

sol!(
    #[sol(rpc)]
    interface IERC3009 {
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
    }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_string_rejects_leading_zero() {
        let raw = serde_json::json!("007");
        let parsed: Result<AmountString, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn amount_string_accepts_zero() {
        let raw = serde_json::json!("0");
        let parsed: AmountString = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.as_u256(), Some(U256::ZERO));
    }

    #[test]
    fn reason_token_serializes_as_camel_case_string() {
        assert_eq!(ReasonToken::NonceReused.to_string(), "nonceReused");
    }
}
