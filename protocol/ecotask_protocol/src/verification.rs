//! # Verification Manager
//!
//! Runs one validator round per task under review and commits its outcome
//! across the registry, the collateral manager and the funding pool.
//!
//! ## Round lifecycle
//!
//! ```text
//! (no round) ──initiate──► open ──eager consensus / deadline──► finalized
//! ```
//!
//! The assigned validators are chosen once, at initiation, round-robin over
//! the active roster (skipping the task's proposer and operator) and never
//! change afterwards.
//!
//! ## Consensus
//!
//! With `n` assigned validators and threshold `t` (bps):
//!
//! - **Eager**, after every vote: `approve * 10000 >= t * n` finalizes
//!   `Approved`; otherwise `reject * 10000 >= t * n` finalizes `Rejected`.
//! - **At the deadline**, over the votes actually cast:
//!   `approve * 10000 >= t * cast` is `Approved`, anything else (including
//!   no votes at all) is `Rejected`.
//!
//! ## Commit
//!
//! | Outcome  | Registry        | Collateral       | Funding            |
//! |----------|-----------------|------------------|--------------------|
//! | Approved | `mark_verified` | `release_stake`  | `release_payment`  |
//! | Rejected | `mark_rejected` | full slash + ban | `enable_refunds`   |
//!
//! All three sides are checked before any of them is applied.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::collateral::CollateralManager;
use crate::env::Env;
use crate::errors::{Error, Result};
use crate::events::ProtocolEvent;
use crate::funding::FundingPool;
use crate::rbac::Capability;
use crate::registry::TaskRegistry;
use crate::types::{
    Address, Outcome, TaskId, TaskStatus, Timestamp, VerificationRound, Vote, BPS_DENOMINATOR,
};

const REJECTION_REASON: &str = "proof rejected by validators";
const ABANDONMENT_REASON: &str = "task abandoned past deadline";

/// The components a verification outcome is committed to.
pub struct Components<'a> {
    pub registry: &'a mut TaskRegistry,
    pub funding: &'a mut FundingPool,
    pub collateral: &'a mut CollateralManager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReceipt {
    pub approve_count: u32,
    pub reject_count: u32,
    /// Set when this vote reached eager consensus.
    pub finalized: Option<Outcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    Ready,
    NoRound,
    AlreadyFinalized,
    DeadlineNotReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeCheck {
    pub ready: bool,
    pub reason: FinalizeReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingProgress {
    pub received: u32,
    pub required: u32,
    pub percentage_bps: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationManager {
    rounds: BTreeMap<TaskId, VerificationRound>,
    reputation: BTreeMap<Address, u64>,
    /// Roster position the next selection starts from.
    selection_cursor: usize,
}

impl VerificationManager {
    // ─────────────────────────────────────────────────────────
    // Rounds
    // ─────────────────────────────────────────────────────────

    pub fn initiate_verification(
        &mut self,
        env: &mut Env<'_>,
        registry: &TaskRegistry,
        roster: &[Address],
        id: TaskId,
    ) -> Result<VerificationRound> {
        let task = registry.ensure_status(id, TaskStatus::UnderReview)?;
        if self.rounds.contains_key(&id) {
            return Err(Error::AlreadyDone(format!(
                "task {id} already has a verification round"
            )));
        }

        let mut excluded = vec![&task.proposer];
        if let Some(operator) = task.assigned_operator.as_ref() {
            excluded.push(operator);
        }
        let required = env.config.required_validators as usize;
        let (validators, next_cursor) = self.select_validators(roster, &excluded, required)?;

        let round = VerificationRound {
            task_id: id,
            votes: validators.iter().cloned().map(Vote::pending).collect(),
            approve_count: 0,
            reject_count: 0,
            started_at: env.now,
            round_deadline: env.now.saturating_add(env.config.verification_period_secs),
            is_finalized: false,
            outcome: None,
            finalized_at: None,
        };
        self.selection_cursor = next_cursor;
        self.rounds.insert(id, round.clone());

        info!(
            task_id = id,
            validators = ?validators,
            deadline = round.round_deadline,
            "verification started"
        );
        env.emit(ProtocolEvent::VerificationStarted {
            task_id: id,
            validators,
            round_deadline: round.round_deadline,
        });
        Ok(round)
    }

    /// Pick `required` validators round-robin from `roster`, starting at the
    /// selection cursor. Returns the picks and the cursor to store.
    fn select_validators(
        &self,
        roster: &[Address],
        excluded: &[&Address],
        required: usize,
    ) -> Result<(Vec<Address>, usize)> {
        let len = roster.len();
        let start = if len == 0 { 0 } else { self.selection_cursor % len };
        let mut picked = Vec::with_capacity(required);
        let mut next_cursor = start;

        for offset in 0..len {
            if picked.len() == required {
                break;
            }
            let index = (start + offset) % len;
            let candidate = &roster[index];
            if excluded.contains(&candidate) {
                continue;
            }
            picked.push(candidate.clone());
            next_cursor = index + 1;
        }

        if picked.len() < required {
            return Err(Error::State(format!(
                "{required} validators required, only {} eligible",
                picked.len()
            )));
        }
        Ok((picked, next_cursor))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn submit_vote(
        &mut self,
        env: &mut Env<'_>,
        components: &mut Components<'_>,
        validator: &Address,
        id: TaskId,
        approve: bool,
        confidence_score: u32,
        justification: &str,
    ) -> Result<VoteReceipt> {
        let round = self.round(id)?;
        if round.is_finalized {
            return Err(Error::State(format!(
                "verification of task {id} is already finalized"
            )));
        }
        let slot = round
            .votes
            .iter()
            .position(|v| &v.validator == validator)
            .ok_or_else(|| {
                Error::Authorization(format!("{validator} is not assigned to task {id}"))
            })?;
        if confidence_score > 100 {
            return Err(Error::Validation(format!(
                "confidence score must be within 0..=100, got {confidence_score}"
            )));
        }
        if env.now > round.round_deadline {
            return Err(Error::Deadline(format!(
                "voting on task {id} closed at {}",
                round.round_deadline
            )));
        }
        if round.votes[slot].has_voted {
            return Err(Error::AlreadyDone(format!(
                "{validator} already voted on task {id}"
            )));
        }

        let (approve_count, reject_count) = if approve {
            (round.approve_count + 1, round.reject_count)
        } else {
            (round.approve_count, round.reject_count + 1)
        };
        let assigned = round.votes.len() as u32;
        let finalized = eager_outcome(
            approve_count,
            reject_count,
            assigned,
            env.config.consensus_threshold_bps,
        );
        if let Some(outcome) = finalized {
            ensure_committable(components, id, outcome)?;
        }

        let round = self.round_mut(id)?;
        round.votes[slot] = Vote {
            validator: validator.clone(),
            has_voted: true,
            approve,
            confidence_score: confidence_score as u8,
            justification: justification.to_string(),
            voted_at: Some(env.now),
        };
        round.approve_count = approve_count;
        round.reject_count = reject_count;

        debug!(task_id = id, validator = %validator, approve, "vote recorded");
        env.emit(ProtocolEvent::VoteCast {
            task_id: id,
            validator: validator.clone(),
            approve,
            confidence_score: confidence_score as u8,
        });

        if let Some(outcome) = finalized {
            self.commit(env, components, id, outcome)?;
        }
        Ok(VoteReceipt {
            approve_count,
            reject_count,
            finalized,
        })
    }

    /// Settle a round that did not reach eager consensus before its deadline.
    ///
    /// Eager consensus counts votes against the whole assigned set, so with
    /// three validators and a 6600 bps threshold any two matching votes close
    /// the round and a later call here fails `AlreadyDone`. Only rounds left
    /// short of that (silent or split validators, or a larger quorum) reach
    /// the votes-cast rule below.
    pub fn finalize_verification(
        &mut self,
        env: &mut Env<'_>,
        components: &mut Components<'_>,
        id: TaskId,
    ) -> Result<Outcome> {
        let round = self.round(id)?;
        if round.is_finalized {
            return Err(Error::AlreadyDone(format!(
                "verification of task {id} is already finalized"
            )));
        }
        if env.now <= round.round_deadline {
            return Err(Error::Deadline(format!(
                "round for task {id} can be finalized after {}",
                round.round_deadline
            )));
        }
        let outcome = deadline_outcome(
            round.approve_count,
            round.reject_count,
            env.config.consensus_threshold_bps,
        );
        ensure_committable(components, id, outcome)?;
        self.commit(env, components, id, outcome)?;
        Ok(outcome)
    }

    /// Apply a finalized outcome. Callers have run [`ensure_committable`].
    fn commit(
        &mut self,
        env: &mut Env<'_>,
        components: &mut Components<'_>,
        id: TaskId,
        outcome: Outcome,
    ) -> Result<()> {
        let now = env.now;
        let round = self.round_mut(id)?;
        round.is_finalized = true;
        round.outcome = Some(outcome);
        round.finalized_at = Some(now);
        let (approve_count, reject_count) = (round.approve_count, round.reject_count);
        let agreeing: Vec<Address> = round
            .votes
            .iter()
            .filter(|v| v.has_voted && v.approve == (outcome == Outcome::Approved))
            .map(|v| v.validator.clone())
            .collect();
        for validator in agreeing {
            *self.reputation.entry(validator).or_insert(0) += 1;
        }

        info!(
            task_id = id,
            outcome = outcome.as_str(),
            approve_count,
            reject_count,
            "verification finalized"
        );
        env.emit(ProtocolEvent::VerificationFinalized {
            task_id: id,
            outcome,
            approve_count,
            reject_count,
        });

        let cap = Capability::VerificationManager;
        match outcome {
            Outcome::Approved => {
                components.registry.mark_verified(cap, id, now)?;
                components.collateral.release_stake(env, cap, id)?;
                components
                    .funding
                    .release_payment(env, components.registry, id)?;
            }
            Outcome::Rejected => {
                components.registry.mark_rejected(cap, id, now)?;
                components
                    .collateral
                    .slash_stake(env, cap, id, BPS_DENOMINATOR, REJECTION_REASON)?;
                components
                    .funding
                    .enable_refunds(env, components.registry, id)?;
            }
        }
        Ok(())
    }

    /// Declare a task abandoned once its deadline and grace period passed.
    ///
    /// An operator that never submitted proof loses its whole lock and is
    /// banned; an operator whose proof was never put to a vote gets its lock
    /// back. Refunds are enabled in every case. Tasks with an open round are
    /// settled by that round instead.
    pub fn settle_abandoned(
        &mut self,
        env: &mut Env<'_>,
        components: &mut Components<'_>,
        id: TaskId,
    ) -> Result<TaskStatus> {
        if self.has_open_round(id) {
            return Err(Error::State(format!(
                "task {id} has an open verification round; finalize it after its deadline"
            )));
        }
        let previous =
            components
                .registry
                .ensure_abandonable(id, env.now, env.config.grace_period_secs)?;
        let holds_collateral = matches!(previous, TaskStatus::InProgress | TaskStatus::UnderReview);
        if holds_collateral {
            components.collateral.ensure_lock_open(id)?;
        }
        components.funding.ensure_refunds_enableable(id)?;

        components.registry.check_deadline(env, id)?;
        let cap = Capability::VerificationManager;
        match previous {
            TaskStatus::InProgress => {
                components
                    .collateral
                    .slash_stake(env, cap, id, BPS_DENOMINATOR, ABANDONMENT_REASON)?;
            }
            TaskStatus::UnderReview => {
                components.collateral.release_stake(env, cap, id)?;
            }
            _ => {}
        }
        components
            .funding
            .enable_refunds(env, components.registry, id)?;
        Ok(previous)
    }

    // ─────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────

    pub fn round(&self, id: TaskId) -> Result<&VerificationRound> {
        self.rounds
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("verification round for task {id}")))
    }

    pub fn vote(&self, id: TaskId, validator: &Address) -> Result<&Vote> {
        self.round(id)?
            .votes
            .iter()
            .find(|v| &v.validator == validator)
            .ok_or_else(|| Error::NotFound(format!("{validator} is not assigned to task {id}")))
    }

    pub fn has_open_round(&self, id: TaskId) -> bool {
        self.rounds.get(&id).is_some_and(|r| !r.is_finalized)
    }

    pub fn can_finalize(&self, id: TaskId, now: Timestamp) -> FinalizeCheck {
        let reason = match self.rounds.get(&id) {
            None => FinalizeReason::NoRound,
            Some(r) if r.is_finalized => FinalizeReason::AlreadyFinalized,
            Some(r) if now <= r.round_deadline => FinalizeReason::DeadlineNotReached,
            Some(_) => FinalizeReason::Ready,
        };
        FinalizeCheck {
            ready: reason == FinalizeReason::Ready,
            reason,
        }
    }

    pub fn voting_progress(&self, id: TaskId) -> Result<VotingProgress> {
        let round = self.round(id)?;
        let received = round.votes_cast();
        let required = round.votes.len() as u32;
        let percentage_bps = if required == 0 {
            0
        } else {
            (u64::from(received) * u64::from(BPS_DENOMINATOR) / u64::from(required)) as u32
        };
        Ok(VotingProgress {
            received,
            required,
            percentage_bps,
        })
    }

    pub fn reputation(&self, validator: &Address) -> u64 {
        self.reputation.get(validator).copied().unwrap_or(0)
    }

    /// Open rounds whose deadline has passed.
    pub fn expired_rounds(&self, now: Timestamp) -> Vec<TaskId> {
        self.rounds
            .values()
            .filter(|r| !r.is_finalized && now > r.round_deadline)
            .map(|r| r.task_id)
            .collect()
    }

    fn round_mut(&mut self, id: TaskId) -> Result<&mut VerificationRound> {
        self.rounds
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("verification round for task {id}")))
    }
}

/// Check every side of a commit before any side is applied.
fn ensure_committable(components: &Components<'_>, id: TaskId, outcome: Outcome) -> Result<()> {
    let task = components.registry.ensure_status(id, TaskStatus::UnderReview)?;
    components.collateral.ensure_lock_open(id)?;
    match outcome {
        Outcome::Approved => {
            if task.assigned_operator.is_none() {
                return Err(Error::State(format!("task {id} has no assigned operator")));
            }
            components.funding.ensure_payment_releasable(id)
        }
        Outcome::Rejected => components.funding.ensure_refunds_enableable(id),
    }
}

/// Consensus reached mid-round, relative to the full assigned set.
pub fn eager_outcome(
    approve_count: u32,
    reject_count: u32,
    assigned: u32,
    threshold_bps: u32,
) -> Option<Outcome> {
    let quorum = u64::from(threshold_bps) * u64::from(assigned);
    let denominator = u64::from(BPS_DENOMINATOR);
    if u64::from(approve_count) * denominator >= quorum {
        Some(Outcome::Approved)
    } else if u64::from(reject_count) * denominator >= quorum {
        Some(Outcome::Rejected)
    } else {
        None
    }
}

/// Outcome of a round closed at its deadline, over the votes cast.
pub fn deadline_outcome(approve_count: u32, reject_count: u32, threshold_bps: u32) -> Outcome {
    let cast = u64::from(approve_count) + u64::from(reject_count);
    if cast == 0 {
        return Outcome::Rejected;
    }
    if u64::from(approve_count) * u64::from(BPS_DENOMINATOR) >= u64::from(threshold_bps) * cast {
        Outcome::Approved
    } else {
        Outcome::Rejected
    }
}
