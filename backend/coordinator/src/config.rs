//! Application configuration loaded from environment variables.

use std::str::FromStr;

use ecotask_protocol::ProtocolConfig;

use crate::errors::{CoordinatorError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Address installed as SuperAdmin on first start
    pub super_admin: Option<String>,
    /// How often (in seconds) the keeper sweeps for overdue tasks and
    /// expired rounds. `0` disables the keeper.
    pub keeper_interval_secs: u64,
    /// Economic and consensus parameters handed to the protocol core
    pub protocol: ProtocolConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Unset protocol
    /// parameters keep their [`ProtocolConfig::default`] values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = ProtocolConfig::default();
        let protocol = ProtocolConfig {
            min_operator_stake: parse_or(
                &lookup,
                "MIN_OPERATOR_STAKE",
                defaults.min_operator_stake,
            )?,
            min_stake_percentage_bps: parse_or(
                &lookup,
                "MIN_STAKE_PERCENTAGE_BPS",
                defaults.min_stake_percentage_bps,
            )?,
            platform_fee_bps: parse_or(&lookup, "PLATFORM_FEE_BPS", defaults.platform_fee_bps)?,
            withdrawal_penalty_bps: parse_or(
                &lookup,
                "WITHDRAWAL_PENALTY_BPS",
                defaults.withdrawal_penalty_bps,
            )?,
            grace_period_secs: parse_or(&lookup, "GRACE_PERIOD_SECS", defaults.grace_period_secs)?,
            required_validators: parse_or(
                &lookup,
                "REQUIRED_VALIDATORS",
                defaults.required_validators,
            )?,
            verification_period_secs: parse_or(
                &lookup,
                "VERIFICATION_PERIOD_SECS",
                defaults.verification_period_secs,
            )?,
            consensus_threshold_bps: parse_or(
                &lookup,
                "CONSENSUS_THRESHOLD_BPS",
                defaults.consensus_threshold_bps,
            )?,
        };
        protocol
            .validate()
            .map_err(|e| CoordinatorError::Config(e.to_string()))?;

        Ok(Config {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:./ecotask.db".to_string()),
            api_port: parse_or(&lookup, "API_PORT", 3001)?,
            super_admin: lookup("SUPER_ADMIN").filter(|s| !s.trim().is_empty()),
            keeper_interval_secs: parse_or(&lookup, "KEEPER_INTERVAL_SECS", 60)?,
            protocol,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CoordinatorError::Config(format!("Invalid {key}"))),
        None => Ok(default),
    }
}
