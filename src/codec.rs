//! C1 Codec: the base64url-no-pad envelope carried in `X-PAYMENT` and
//! `X-PAYMENT-RESPONSE` headers.
//!
//! Grounded on the teacher's `util/b64.rs`, but deliberately using the URL-safe,
//! unpadded alphabet rather than the teacher's `STANDARD` engine — a header value must
//! never contain `+`, `/` or `=`, which the standard alphabet permits and HTTP header
//! parsers disagree about escaping.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid JSON envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes a value as compact JSON, then base64url-no-pad, for a header value.
pub fn encode<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_vec(value).expect("envelope types always serialize");
    URL_SAFE_NO_PAD.encode(json)
}

/// Decodes a header value previously produced by [`encode`].
pub fn decode<T: DeserializeOwned>(encoded: &str) -> Result<T, CodecError> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded.trim())?;
    let value = serde_json::from_slice(&bytes)?;
    Ok(value)
}
