//! Configuration: CLI flags, environment variables, and env-var indirection inside
//! string values (`$VAR`/`${VAR}`), following the teacher's `config.rs` layering but
//! flattened to this facilitator's single EVM-only network set — no CAIP-2 chain-family
//! dispatch, no per-chain-family config enum.

use std::collections::HashMap;
use std::str::FromStr;

use clap::Parser;
use thiserror::Error;
use url::Url;

use crate::domain::NetworkId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid RPC URL for network {0}: {1}")]
    InvalidRpcUrl(NetworkId, url::ParseError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("database URL is required when persistence is enabled")]
    MissingDatabaseUrl,
}

/// Resolves `$VAR`/`${VAR}` indirection in a config value, exactly as the teacher's
/// `LiteralOrEnv<T>` does for secrets that should come from the environment rather than
/// be written in a config file or CLI flag.
fn resolve_env_indirection(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    let var_name = if let Some(stripped) = trimmed.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        Some(stripped)
    } else {
        trimmed.strip_prefix('$')
    };

    match var_name {
        Some(name) => {
            std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
        }
        None => Ok(trimmed.to_string()),
    }
}

#[derive(Debug, Parser)]
#[command(name = "x402-facilitator", about = "x402 V2 facilitator over EIP-3009")]
struct CliArgs {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// The facilitator's signing key for `transferWithAuthorization` submission, as a
    /// literal `0x`-prefixed private key or `$ENV_VAR`/`${ENV_VAR}` indirection.
    #[arg(long, env = "FACILITATOR_SIGNER")]
    facilitator_signer: String,

    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "INCLUSION_TIMEOUT_SECONDS", default_value_t = 30)]
    inclusion_timeout_seconds: u64,

    #[arg(long, env = "BROADCAST_TIMEOUT_SECONDS", default_value_t = 15)]
    broadcast_timeout_seconds: u64,

    /// Clock skew tolerance `σ` applied to `validAfter`/`validBefore` checks.
    #[arg(long, env = "CLOCK_SKEW_SECONDS", default_value_t = 5)]
    clock_skew_seconds: u64,

    /// Minimum remaining lifetime `ε` an authorization must still have at `validBefore`.
    #[arg(long, env = "MIN_REMAINING_LIFETIME_SECONDS", default_value_t = 10)]
    min_remaining_lifetime_seconds: u64,

    #[arg(long, env = "QUOTE_LIFETIME_SECONDS", default_value_t = 300)]
    quote_lifetime_seconds: u64,

    #[arg(long, env = "MAX_IN_FLIGHT_SETTLEMENTS", default_value_t = 256)]
    max_in_flight_settlements: usize,

    #[arg(long, env = "RPC_URL_ARC_TESTNET")]
    rpc_url_arc_testnet: Option<String>,
    #[arg(long, env = "RPC_URL_ARC_MAINNET")]
    rpc_url_arc_mainnet: Option<String>,
    #[arg(long, env = "RPC_URL_BASE_SEPOLIA")]
    rpc_url_base_sepolia: Option<String>,
    #[arg(long, env = "RPC_URL_BASE_MAINNET")]
    rpc_url_base_mainnet: Option<String>,
    #[arg(long, env = "RPC_URL_ETHEREUM_SEPOLIA")]
    rpc_url_ethereum_sepolia: Option<String>,
    #[arg(long, env = "RPC_URL_ETHEREUM_MAINNET")]
    rpc_url_ethereum_mainnet: Option<String>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub facilitator_signer: String,
    pub database_url: Option<String>,
    pub inclusion_timeout: std::time::Duration,
    pub broadcast_timeout: std::time::Duration,
    pub clock_skew_seconds: u64,
    pub min_remaining_lifetime_seconds: u64,
    pub quote_lifetime: std::time::Duration,
    pub max_in_flight_settlements: usize,
    pub rpc_urls: HashMap<u64, Url>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let args = CliArgs::parse();
        Self::from_args(args)
    }

    fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let facilitator_signer = resolve_env_indirection(&args.facilitator_signer)?;

        let mut rpc_urls = HashMap::new();
        let raw_by_network: [(NetworkId, Option<String>); 6] = [
            (NetworkId::ArcTestnet, args.rpc_url_arc_testnet),
            (NetworkId::ArcMainnet, args.rpc_url_arc_mainnet),
            (NetworkId::BaseSepolia, args.rpc_url_base_sepolia),
            (NetworkId::BaseMainnet, args.rpc_url_base_mainnet),
            (NetworkId::EthereumSepolia, args.rpc_url_ethereum_sepolia),
            (NetworkId::EthereumMainnet, args.rpc_url_ethereum_mainnet),
        ];

        for (network, raw) in raw_by_network {
            if let Some(raw) = raw {
                let resolved = resolve_env_indirection(&raw)?;
                let url = Url::from_str(&resolved)
                    .map_err(|e| ConfigError::InvalidRpcUrl(network, e))?;
                let descriptor = crate::domain::descriptor(network)
                    .expect("every NetworkId::ALL member has a descriptor");
                rpc_urls.insert(descriptor.chain_id, url);
            }
        }

        Ok(Config {
            port: args.port,
            host: args.host,
            facilitator_signer,
            database_url: args.database_url,
            inclusion_timeout: std::time::Duration::from_secs(args.inclusion_timeout_seconds),
            broadcast_timeout: std::time::Duration::from_secs(args.broadcast_timeout_seconds),
            clock_skew_seconds: args.clock_skew_seconds,
            min_remaining_lifetime_seconds: args.min_remaining_lifetime_seconds,
            quote_lifetime: std::time::Duration::from_secs(args.quote_lifetime_seconds),
            max_in_flight_settlements: args.max_in_flight_settlements,
            rpc_urls,
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or(ConfigError::MissingDatabaseUrl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_literal_values_unchanged() {
        assert_eq!(resolve_env_indirection("0xabc").unwrap(), "0xabc");
    }

    #[test]
    fn resolves_dollar_brace_env_indirection() {
        unsafe { std::env::set_var("X402_TEST_VAR", "resolved-value") };
        assert_eq!(
            resolve_env_indirection("${X402_TEST_VAR}").unwrap(),
            "resolved-value"
        );
        unsafe { std::env::remove_var("X402_TEST_VAR") };
    }

    #[test]
    fn missing_env_var_is_reported() {
        let result = resolve_env_indirection("$X402_DOES_NOT_EXIST");
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(_))));
    }
}
