//! Events emitted by successful protocol mutations.
//!
//! Every entry point that changes state pushes one or more
//! [`ProtocolEvent`]s into the [`EventLog`] after all of its mutations are
//! applied. Failed calls emit nothing. The embedding service drains the log
//! and journals it; downstream consumers (credit issuance, outcome markets,
//! metadata indexes) key off `verification_finalized` and `task_abandoned`.

use serde::{Deserialize, Serialize};

use crate::rbac::Role;
use crate::types::{Address, Outcome, TaskId, TaskStatus, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolEvent {
    TaskCreated {
        task_id: TaskId,
        proposer: Address,
        estimated_cost: i128,
        deadline: Timestamp,
    },
    FundingAdded {
        task_id: TaskId,
        funder: Address,
        amount: i128,
        total_funded: i128,
    },
    TaskFunded {
        task_id: TaskId,
        total_funded: i128,
    },
    FundingWithdrawn {
        task_id: TaskId,
        funder: Address,
        refunded: i128,
        penalty: i128,
    },
    OperatorRegistered {
        operator: Address,
        deposit: i128,
    },
    StakeAdded {
        operator: Address,
        amount: i128,
    },
    StakeWithdrawn {
        operator: Address,
        amount: i128,
        deregistered: bool,
    },
    StakeLocked {
        task_id: TaskId,
        operator: Address,
        amount: i128,
    },
    OperatorAssigned {
        task_id: TaskId,
        operator: Address,
    },
    ProofSubmitted {
        task_id: TaskId,
        operator: Address,
        proof_ref: String,
        actual_outcome: i128,
    },
    VerificationStarted {
        task_id: TaskId,
        validators: Vec<Address>,
        round_deadline: Timestamp,
    },
    VoteCast {
        task_id: TaskId,
        validator: Address,
        approve: bool,
        confidence_score: u8,
    },
    VerificationFinalized {
        task_id: TaskId,
        outcome: Outcome,
        approve_count: u32,
        reject_count: u32,
    },
    StakeReleased {
        task_id: TaskId,
        operator: Address,
        amount: i128,
    },
    StakeSlashed {
        task_id: TaskId,
        operator: Address,
        slashed: i128,
        returned: i128,
        reason: String,
    },
    OperatorBanned {
        operator: Address,
    },
    PaymentReleased {
        task_id: TaskId,
        operator: Address,
        amount: i128,
        fee: i128,
    },
    RefundsEnabled {
        task_id: TaskId,
    },
    RefundClaimed {
        task_id: TaskId,
        funder: Address,
        amount: i128,
    },
    TaskAbandoned {
        task_id: TaskId,
        previous_status: TaskStatus,
    },
    RoleGranted {
        target: Address,
        role: Role,
        by: Address,
    },
    RoleRevoked {
        target: Address,
        by: Address,
    },
    ProtocolPaused {
        by: Address,
    },
    ProtocolUnpaused {
        by: Address,
    },
}

impl ProtocolEvent {
    /// Stable identifier used as the journal's `event_type` column.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task_created",
            Self::FundingAdded { .. } => "funding_added",
            Self::TaskFunded { .. } => "task_funded",
            Self::FundingWithdrawn { .. } => "funding_withdrawn",
            Self::OperatorRegistered { .. } => "operator_registered",
            Self::StakeAdded { .. } => "stake_added",
            Self::StakeWithdrawn { .. } => "stake_withdrawn",
            Self::StakeLocked { .. } => "stake_locked",
            Self::OperatorAssigned { .. } => "operator_assigned",
            Self::ProofSubmitted { .. } => "proof_submitted",
            Self::VerificationStarted { .. } => "verification_started",
            Self::VoteCast { .. } => "vote_cast",
            Self::VerificationFinalized { .. } => "verification_finalized",
            Self::StakeReleased { .. } => "stake_released",
            Self::StakeSlashed { .. } => "stake_slashed",
            Self::OperatorBanned { .. } => "operator_banned",
            Self::PaymentReleased { .. } => "payment_released",
            Self::RefundsEnabled { .. } => "refunds_enabled",
            Self::RefundClaimed { .. } => "refund_claimed",
            Self::TaskAbandoned { .. } => "task_abandoned",
            Self::RoleGranted { .. } => "role_granted",
            Self::RoleRevoked { .. } => "role_revoked",
            Self::ProtocolPaused { .. } => "protocol_paused",
            Self::ProtocolUnpaused { .. } => "protocol_unpaused",
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskCreated { task_id, .. }
            | Self::FundingAdded { task_id, .. }
            | Self::TaskFunded { task_id, .. }
            | Self::FundingWithdrawn { task_id, .. }
            | Self::StakeLocked { task_id, .. }
            | Self::OperatorAssigned { task_id, .. }
            | Self::ProofSubmitted { task_id, .. }
            | Self::VerificationStarted { task_id, .. }
            | Self::VoteCast { task_id, .. }
            | Self::VerificationFinalized { task_id, .. }
            | Self::StakeReleased { task_id, .. }
            | Self::StakeSlashed { task_id, .. }
            | Self::PaymentReleased { task_id, .. }
            | Self::RefundsEnabled { task_id }
            | Self::RefundClaimed { task_id, .. }
            | Self::TaskAbandoned { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }

    /// The identity the event is about, if any.
    pub fn actor(&self) -> Option<&Address> {
        match self {
            Self::TaskCreated { proposer, .. } => Some(proposer),
            Self::FundingAdded { funder, .. }
            | Self::FundingWithdrawn { funder, .. }
            | Self::RefundClaimed { funder, .. } => Some(funder),
            Self::OperatorRegistered { operator, .. }
            | Self::StakeAdded { operator, .. }
            | Self::StakeWithdrawn { operator, .. }
            | Self::StakeLocked { operator, .. }
            | Self::OperatorAssigned { operator, .. }
            | Self::ProofSubmitted { operator, .. }
            | Self::StakeReleased { operator, .. }
            | Self::StakeSlashed { operator, .. }
            | Self::OperatorBanned { operator }
            | Self::PaymentReleased { operator, .. } => Some(operator),
            Self::VoteCast { validator, .. } => Some(validator),
            Self::RoleGranted { target, .. } | Self::RoleRevoked { target, .. } => Some(target),
            Self::ProtocolPaused { by } | Self::ProtocolUnpaused { by } => Some(by),
            Self::TaskFunded { .. }
            | Self::VerificationStarted { .. }
            | Self::VerificationFinalized { .. }
            | Self::RefundsEnabled { .. }
            | Self::TaskAbandoned { .. } => None,
        }
    }

    /// The amount moved by the event, if any.
    pub fn amount(&self) -> Option<i128> {
        match self {
            Self::TaskCreated { estimated_cost, .. } => Some(*estimated_cost),
            Self::FundingAdded { amount, .. }
            | Self::StakeAdded { amount, .. }
            | Self::StakeWithdrawn { amount, .. }
            | Self::StakeLocked { amount, .. }
            | Self::StakeReleased { amount, .. }
            | Self::PaymentReleased { amount, .. }
            | Self::RefundClaimed { amount, .. } => Some(*amount),
            Self::TaskFunded { total_funded, .. } => Some(*total_funded),
            Self::FundingWithdrawn { refunded, .. } => Some(*refunded),
            Self::OperatorRegistered { deposit, .. } => Some(*deposit),
            Self::StakeSlashed { slashed, .. } => Some(*slashed),
            _ => None,
        }
    }
}

/// An emitted event stamped with its position in the global operation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub seq: u64,
    pub timestamp: Timestamp,
    pub event: ProtocolEvent,
}

/// Pending events not yet handed to the embedding service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLog {
    next_seq: u64,
    pending: Vec<RecordedEvent>,
}

impl EventLog {
    /// A log whose first event will carry `next_seq`, for resuming a journal.
    pub fn starting_at(next_seq: u64) -> Self {
        Self {
            next_seq,
            pending: Vec::new(),
        }
    }

    pub(crate) fn emit(&mut self, timestamp: Timestamp, event: ProtocolEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(RecordedEvent {
            seq,
            timestamp,
            event,
        });
    }

    pub fn pending(&self) -> &[RecordedEvent] {
        &self.pending
    }

    pub fn drain(&mut self) -> Vec<RecordedEvent> {
        std::mem::take(&mut self.pending)
    }

    /// Sequence number the next event will carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}
