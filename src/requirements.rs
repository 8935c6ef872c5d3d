//! C11 Requirement Issuer: turns a seller's USD price and an accepted-network list into
//! the `PaymentRequirements` array a `402` response carries.
//!
//! Grounded on the `PriceTag` builder in `crates/x402-types/src/proto/v1.rs` (USD decimal
//! in, smallest-units-per-network out), adapted to this facilitator's flat `NetworkId`
//! set and its `rust_decimal`-based rounding.

use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::domain::{self, NetworkId};
use crate::timestamp::UnixTimestamp;
use crate::types::{AmountString, EvmAddress, PaymentRequirements, PaymentRequirementsExtra};

#[derive(Debug, Clone)]
pub struct PriceTag {
    pub usd_amount: Decimal,
    pub resource: String,
    pub description: String,
    pub mime_type: Option<String>,
    pub pay_to: EvmAddress,
    pub networks: Vec<NetworkId>,
    pub quote_ttl: Duration,
    pub max_timeout_seconds: Option<u64>,
}

/// Converts a USD amount into the token's smallest-unit integer for a given network,
/// rounding half-up at the network's USDC decimal count (always 6 across this
/// facilitator's supported networks, but looked up rather than hardcoded).
fn usd_to_smallest_units(usd_amount: Decimal, decimals: u8) -> Option<AmountString> {
    let scaled = usd_amount.checked_mul(Decimal::from(10u64.pow(decimals as u32)))?;
    let rounded = scaled.round();
    if rounded.is_sign_negative() {
        return None;
    }
    let as_u128 = rounded.to_u128()?;
    Some(AmountString::new(alloy_primitives::U256::from(as_u128)))
}

/// Builds one `PaymentRequirements` entry per requested network, skipping any network
/// whose descriptor is missing from the registry (there are none in the closed set, but
/// the check keeps this function total rather than panicking on a future network typo).
pub fn issue(tag: &PriceTag, now: UnixTimestamp) -> Vec<PaymentRequirements> {
    let expires_at = UnixTimestamp(now.seconds_since_epoch() + tag.quote_ttl.as_secs());

    tag.networks
        .iter()
        .filter_map(|network_id| {
            let network = domain::descriptor(*network_id)?;
            let amount = usd_to_smallest_units(tag.usd_amount, network.usdc_decimals)?;

            Some(PaymentRequirements {
                scheme: crate::types::Scheme::Exact,
                network: *network_id,
                max_amount_required: amount,
                resource: tag.resource.clone(),
                description: tag.description.clone(),
                mime_type: tag.mime_type.clone(),
                output_schema: None,
                pay_to: tag.pay_to,
                max_timeout_seconds: tag.max_timeout_seconds,
                asset: EvmAddress(network.token_contract),
                extra: PaymentRequirementsExtra {
                    name: network.token_name.to_string(),
                    version: network.token_version.to_string(),
                    expires_at,
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use std::str::FromStr;

    #[test]
    fn one_dollar_becomes_one_million_smallest_units_at_six_decimals() {
        let tag = PriceTag {
            usd_amount: Decimal::from_str("1.00").unwrap(),
            resource: "https://example.com/report".to_string(),
            description: "a report".to_string(),
            mime_type: Some("application/json".to_string()),
            pay_to: EvmAddress(address!("2222222222222222222222222222222222222222")),
            networks: vec![NetworkId::BaseMainnet],
            quote_ttl: Duration::from_secs(120),
            max_timeout_seconds: Some(60),
        };

        let requirements = issue(&tag, UnixTimestamp(1_000));
        assert_eq!(requirements.len(), 1);
        assert_eq!(requirements[0].max_amount_required.0, "1000000");
        assert_eq!(requirements[0].extra.expires_at.seconds_since_epoch(), 1_120);
    }

    #[test]
    fn fractional_cent_rounds_half_up() {
        let tag = PriceTag {
            usd_amount: Decimal::from_str("0.0000005").unwrap(),
            resource: "https://example.com/ping".to_string(),
            description: "a ping".to_string(),
            mime_type: None,
            pay_to: EvmAddress(address!("2222222222222222222222222222222222222222")),
            networks: vec![NetworkId::BaseMainnet],
            quote_ttl: Duration::from_secs(60),
            max_timeout_seconds: None,
        };

        let requirements = issue(&tag, UnixTimestamp(0));
        assert_eq!(requirements[0].max_amount_required.0, "1");
    }

    #[test]
    fn one_tag_produces_one_requirement_per_requested_network() {
        let tag = PriceTag {
            usd_amount: Decimal::from_str("2.50").unwrap(),
            resource: "https://example.com/report".to_string(),
            description: "a report".to_string(),
            mime_type: None,
            pay_to: EvmAddress(address!("2222222222222222222222222222222222222222")),
            networks: vec![NetworkId::BaseMainnet, NetworkId::ArcMainnet],
            quote_ttl: Duration::from_secs(60),
            max_timeout_seconds: None,
        };

        let requirements = issue(&tag, UnixTimestamp(0));
        assert_eq!(requirements.len(), 2);
        assert_eq!(requirements[0].network, NetworkId::BaseMainnet);
        assert_eq!(requirements[1].network, NetworkId::ArcMainnet);
    }
}
