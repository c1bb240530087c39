//! Economic and consensus parameters.

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::types::BPS_DENOMINATOR;

const DAY_IN_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Absolute minimum an operator must keep staked while registered.
    pub min_operator_stake: i128,
    /// Share of a task's cost locked when an operator accepts it.
    pub min_stake_percentage_bps: u32,
    /// Share of the funding target sent to the treasury on payment release.
    pub platform_fee_bps: u32,
    /// Share of a pre-funding withdrawal sent to the treasury.
    pub withdrawal_penalty_bps: u32,
    /// Extra time after a task deadline before abandonment can be declared.
    pub grace_period_secs: u64,
    pub required_validators: u32,
    pub verification_period_secs: u64,
    pub consensus_threshold_bps: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            min_operator_stake: 10,
            min_stake_percentage_bps: 1_000,
            platform_fee_bps: 200,
            withdrawal_penalty_bps: 500,
            grace_period_secs: 3 * DAY_IN_SECS,
            required_validators: 3,
            verification_period_secs: 7 * DAY_IN_SECS,
            consensus_threshold_bps: 6_600,
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_operator_stake <= 0 {
            return Err(Error::Validation(
                "min_operator_stake must be positive".to_string(),
            ));
        }
        for (name, bps) in [
            ("min_stake_percentage_bps", self.min_stake_percentage_bps),
            ("platform_fee_bps", self.platform_fee_bps),
            ("withdrawal_penalty_bps", self.withdrawal_penalty_bps),
            ("consensus_threshold_bps", self.consensus_threshold_bps),
        ] {
            if bps > BPS_DENOMINATOR {
                return Err(Error::Validation(format!(
                    "{name} must not exceed {BPS_DENOMINATOR}, got {bps}"
                )));
            }
        }
        if self.consensus_threshold_bps == 0 {
            return Err(Error::Validation(
                "consensus_threshold_bps must be positive".to_string(),
            ));
        }
        if self.required_validators == 0 {
            return Err(Error::Validation(
                "required_validators must be at least 1".to_string(),
            ));
        }
        if self.verification_period_secs == 0 {
            return Err(Error::Validation(
                "verification_period_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// `floor(amount * bps / 10000)` for a non-negative `amount` and `bps` of at
/// most 10000. The full product is never formed.
pub(crate) fn apply_bps(amount: i128, bps: u32) -> i128 {
    let denominator = i128::from(BPS_DENOMINATOR);
    let bps = i128::from(bps);
    amount / denominator * bps + amount % denominator * bps / denominator
}
