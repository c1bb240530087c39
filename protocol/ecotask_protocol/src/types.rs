//! # Types
//!
//! Shared records used across all modules of the EcoTask protocol.
//!
//! ## Design decisions
//!
//! ### Status as a Finite-State Machine
//!
//! [`TaskStatus`] enforces a strict forward-only lifecycle:
//!
//! ```text
//! Proposed ──► Funded ──► InProgress ──► UnderReview ──► Verified
//!                              │               └───────► Rejected
//!                              └──(abandoned)──────────► Rejected
//! ```
//!
//! `Proposed` and `Funded` tasks can also be forced to `Rejected` once the
//! task deadline plus the grace period has passed, so escrowed funds never
//! get stuck. Transitions out of the terminal states (`Verified`,
//! `Rejected`) are always rejected.
//!
//! ### Amounts
//!
//! All amounts are `i128`, mirroring the token amounts of the ledger this
//! protocol settles against. Percentages are expressed in basis points.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Task identifier, assigned sequentially from zero.
pub type TaskId = u64;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

/// Denominator for all basis-point parameters.
pub const BPS_DENOMINATOR: u32 = 10_000;

/// Upper bound for a task cost and for an operator's total stake. Any amount
/// at or below it can be scaled by a basis-point rate inside `i128`.
pub const MAX_AMOUNT: i128 = i128::MAX / BPS_DENOMINATOR as i128;

/// Opaque identity of a proposer, funder, operator, validator or admin.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle status of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepting contributions.
    Proposed,
    /// Fully funded; waiting for an operator to lock collateral.
    Funded,
    /// An operator has staked and is executing the work.
    InProgress,
    /// Proof submitted; waiting for validator consensus.
    UnderReview,
    /// Proof accepted; payment released to the operator.
    Verified,
    /// Proof rejected or task abandoned; funders may reclaim.
    Rejected,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::Rejected)
    }

    /// Forward-only transition table.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Proposed, Self::Funded)
                | (Self::Funded, Self::InProgress)
                | (Self::InProgress, Self::UnderReview)
                | (Self::UnderReview, Self::Verified)
                | (Self::UnderReview, Self::Rejected)
                | (Self::InProgress, Self::Rejected)
                | (Self::Funded, Self::Rejected)
                | (Self::Proposed, Self::Rejected)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Funded => "funded",
            Self::InProgress => "in_progress",
            Self::UnderReview => "under_review",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters supplied by a proposer when creating a task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub description: String,
    /// Funding target.
    pub estimated_cost: i128,
    /// Declared outcome magnitude (tonnes of CO2).
    pub expected_co2: i128,
    pub location: String,
    /// Absolute completion deadline.
    pub deadline: Timestamp,
    pub proof_requirements: String,
    /// Content hash of the off-ledger task document.
    pub external_doc_ref: String,
}

/// Canonical task record owned by the task registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub proposer: Address,
    pub description: String,
    pub estimated_cost: i128,
    pub expected_co2: i128,
    pub location: String,
    pub deadline: Timestamp,
    pub proof_requirements: String,
    pub external_doc_ref: String,
    pub status: TaskStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Set once, on `Funded -> InProgress`.
    pub assigned_operator: Option<Address>,
    /// Set once, on `InProgress -> UnderReview`.
    pub actual_outcome: Option<i128>,
    /// Set once, on `InProgress -> UnderReview`.
    pub proof_ref: Option<String>,
}

/// Escrow pool backing one task.
///
/// `shares` only holds funders with a non-zero stake in the pool, so the sum
/// of its values always equals `total_funded`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub task_id: TaskId,
    pub target: i128,
    pub total_funded: i128,
    pub funders_count: u32,
    pub payment_released: bool,
    pub refunds_enabled: bool,
    /// Running total returned through `claim_refund`.
    pub total_refunded: i128,
    pub shares: BTreeMap<Address, i128>,
    /// Funders that already claimed their refund.
    pub refunded: BTreeSet<Address>,
}

/// Collateral account of a registered operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorAccount {
    pub address: Address,
    pub available_stake: i128,
    /// Sum of all open stake locks.
    pub locked_stake: i128,
    pub is_approved: bool,
    /// Set by a full slash. Banned operators can never be approved again.
    pub is_banned: bool,
    pub total_deposited: i128,
    pub total_withdrawn: i128,
    pub total_slashed: i128,
    pub registered_at: Timestamp,
}

impl OperatorAccount {
    pub fn total_stake(&self) -> i128 {
        self.available_stake + self.locked_stake
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeLockStatus {
    Locked,
    Released,
    Slashed,
}

/// Collateral an operator locked for one task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeLock {
    pub task_id: TaskId,
    pub operator: Address,
    pub locked_amount: i128,
    pub locked_at: Timestamp,
    pub status: StakeLockStatus,
    /// Portion sent to the treasury when slashed.
    pub slashed_amount: i128,
    pub settled_at: Option<Timestamp>,
}

/// Result of a verification round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Approved,
    Rejected,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

/// One assigned validator's ballot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub validator: Address,
    pub has_voted: bool,
    pub approve: bool,
    /// 0..=100
    pub confidence_score: u8,
    pub justification: String,
    pub voted_at: Option<Timestamp>,
}

impl Vote {
    pub(crate) fn pending(validator: Address) -> Self {
        Self {
            validator,
            has_voted: false,
            approve: false,
            confidence_score: 0,
            justification: String::new(),
            voted_at: None,
        }
    }
}

/// Quorum of validators fixed for one task and the ballots they cast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRound {
    pub task_id: TaskId,
    /// One entry per assigned validator, in selection order.
    pub votes: Vec<Vote>,
    pub approve_count: u32,
    pub reject_count: u32,
    pub started_at: Timestamp,
    pub round_deadline: Timestamp,
    pub is_finalized: bool,
    pub outcome: Option<Outcome>,
    pub finalized_at: Option<Timestamp>,
}

impl VerificationRound {
    pub fn validators(&self) -> impl Iterator<Item = &Address> {
        self.votes.iter().map(|v| &v.validator)
    }

    pub fn votes_cast(&self) -> u32 {
        self.approve_count + self.reject_count
    }
}
