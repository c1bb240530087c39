//! # EcoTask Protocol
//!
//! This is the root crate of the **EcoTask** coordination core: tasks are
//! proposed, crowdfunded into escrow, taken by a collateralised operator,
//! proven, and judged by a validator quorum whose outcome either pays the
//! operator or slashes it and refunds the funders.
//!
//! [`EcoTaskProtocol`] owns every table and exposes the entry points:
//!
//! | Phase        | Entry Point(s)                                                   |
//! |--------------|------------------------------------------------------------------|
//! | Bootstrap    | [`EcoTaskProtocol::init`]                                        |
//! | Role admin   | `grant_role`, `revoke_role`, `transfer_super_admin`              |
//! | Emergency    | `pause`, `unpause`                                               |
//! | Registration | [`EcoTaskProtocol::create_task`]                                 |
//! | Funding      | `fund_task`, `withdraw_funding`                                  |
//! | Collateral   | `register_operator`, `add_stake`, `withdraw_stake`, `stake_for_task` |
//! | Delivery     | `submit_proof`                                                   |
//! | Verification | `initiate_verification`, `submit_vote`, `finalize_verification`  |
//! | Settlement   | `claim_refund`, `check_deadline`, `release_payment`, `enable_refunds` |
//! | Queries      | `task`, `pool`, `operator`, `round`, `can_finalize`, ...         |
//!
//! ## Architecture
//!
//! The four components ([`TaskRegistry`], [`FundingPool`],
//! [`CollateralManager`], [`VerificationManager`]) are plain tables inside a
//! serialisable [`Store`]. Each mutating entry point takes `&mut self`, so
//! calls are applied one at a time in a total order; the embedding service
//! decides how callers are serialised onto it.
//!
//! Every entry point validates all of its preconditions before the first
//! mutation, and cross-component effects are checked on every side before
//! any side is applied. A failed call leaves the store untouched and emits
//! no events.
//!
//! Deadlines are never enforced by a timer. They are compared against the
//! injected [`Clock`] inside `check_deadline` and `finalize_verification`,
//! which some external actor has to call.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod clock;
pub mod collateral;
pub mod config;
mod env;
pub mod errors;
pub mod events;
pub mod funding;
pub mod rbac;
pub mod registry;
pub mod treasury;
pub mod types;
pub mod verification;

#[cfg(test)]
mod test_funding;
#[cfg(test)]
mod test_lifecycle;
#[cfg(test)]
mod test_verification;
#[cfg(test)]
mod testutils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collateral::{
    CollateralManager, Eligibility, EligibilityReason, OperatorSnapshot, SlashOutcome,
};
pub use config::ProtocolConfig;
pub use errors::{Error, ErrorKind, Result};
pub use events::{EventLog, ProtocolEvent, RecordedEvent};
pub use funding::{
    ContributionReceipt, CreditAllocation, FundingPool, FundingProgress, PaymentReceipt,
    WithdrawalReceipt,
};
pub use rbac::{AccessControl, Capability, Role, ValidatorEntry};
pub use registry::TaskRegistry;
pub use treasury::{Recipient, Transfer, TransferReason, Treasury};
pub use types::{
    Address, NewTask, Outcome, Pool, StakeLock, StakeLockStatus, Task, TaskId, TaskStatus,
    Timestamp, VerificationRound, Vote, BPS_DENOMINATOR, MAX_AMOUNT,
};
pub use verification::{
    Components, FinalizeCheck, FinalizeReason, VerificationManager, VoteReceipt, VotingProgress,
};

use env::Env;

/// Every persistent table of the protocol.
///
/// The embedding service snapshots this after each successful mutation and
/// restores it with [`EcoTaskProtocol::from_store`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Store {
    pub access: AccessControl,
    pub registry: TaskRegistry,
    pub funding: FundingPool,
    pub collateral: CollateralManager,
    pub verification: VerificationManager,
    pub treasury: Treasury,
    pub paused: bool,
}

/// Saved state returned by [`EcoTaskProtocol::checkpoint`].
#[derive(Debug, Clone)]
pub struct Checkpoint {
    store: Store,
    next_event_seq: u64,
}

/// Mutable view of the store handed to one command.
struct Tables<'a> {
    access: &'a mut AccessControl,
    paused: &'a mut bool,
    verification: &'a mut VerificationManager,
    components: Components<'a>,
}

pub struct EcoTaskProtocol {
    config: ProtocolConfig,
    clock: Arc<dyn Clock>,
    store: Store,
    events: EventLog,
}

impl EcoTaskProtocol {
    pub fn new(config: ProtocolConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::from_store(config, clock, Store::default(), 0)
    }

    /// Resume from a snapshot. `next_event_seq` continues the event numbering
    /// of whatever journal the previous instance fed.
    pub fn from_store(
        config: ProtocolConfig,
        clock: Arc<dyn Clock>,
        store: Store,
        next_event_seq: u64,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            store,
            events: EventLog::starting_at(next_event_seq),
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Events emitted since the last drain, in emission order.
    pub fn pending_events(&self) -> &[RecordedEvent] {
        self.events.pending()
    }

    pub fn drain_events(&mut self) -> Vec<RecordedEvent> {
        self.events.drain()
    }

    /// Sequence number the next emitted event will carry.
    pub fn next_event_seq(&self) -> u64 {
        self.events.next_seq()
    }

    /// Capture the store and event numbering so a command whose effects
    /// could not be persisted can be undone with [`Self::rollback`].
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            store: self.store.clone(),
            next_event_seq: self.events.next_seq(),
        }
    }

    /// Return to `checkpoint`, discarding pending events.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.store = checkpoint.store;
        self.events = EventLog::starting_at(checkpoint.next_event_seq);
    }

    // ─────────────────────────────────────────────────────────
    // Initialisation
    // ─────────────────────────────────────────────────────────

    /// Set the first SuperAdmin. Fails with `AlreadyDone` on any later call.
    pub fn init(&mut self, super_admin: &Address) -> Result<()> {
        self.administer("init", |env, t| {
            t.access.init_super_admin(super_admin)?;
            info!(super_admin = %super_admin, "access control initialised");
            env.emit(ProtocolEvent::RoleGranted {
                target: super_admin.clone(),
                role: Role::SuperAdmin,
                by: super_admin.clone(),
            });
            Ok(())
        })
    }

    // ─────────────────────────────────────────────────────────
    // Role management
    // ─────────────────────────────────────────────────────────

    /// Grant `role` to `target`.
    ///
    /// - `caller` must hold `SuperAdmin` or `Admin`.
    /// - `SuperAdmin` is never granted; use `transfer_super_admin`.
    pub fn grant_role(&mut self, caller: &Address, target: &Address, role: Role) -> Result<()> {
        self.administer("grant_role", |env, t| {
            t.access.grant_role(caller, target, role, env.now)?;
            info!(target = %target, role = ?role, by = %caller, "role granted");
            env.emit(ProtocolEvent::RoleGranted {
                target: target.clone(),
                role,
                by: caller.clone(),
            });
            Ok(())
        })
    }

    /// Revoke whatever role `target` holds.
    ///
    /// A revoked validator stays in rounds it was already assigned to.
    pub fn revoke_role(&mut self, caller: &Address, target: &Address) -> Result<()> {
        self.administer("revoke_role", |env, t| {
            t.access.revoke_role(caller, target)?;
            info!(target = %target, by = %caller, "role revoked");
            env.emit(ProtocolEvent::RoleRevoked {
                target: target.clone(),
                by: caller.clone(),
            });
            Ok(())
        })
    }

    pub fn transfer_super_admin(&mut self, current: &Address, new: &Address) -> Result<()> {
        self.administer("transfer_super_admin", |env, t| {
            t.access.transfer_super_admin(current, new)?;
            info!(from = %current, to = %new, "super admin transferred");
            env.emit(ProtocolEvent::RoleGranted {
                target: new.clone(),
                role: Role::SuperAdmin,
                by: current.clone(),
            });
            Ok(())
        })
    }

    pub fn super_admin(&self) -> Option<&Address> {
        self.store.access.super_admin()
    }

    pub fn role_of(&self, address: &Address) -> Option<Role> {
        self.store.access.role_of(address)
    }

    pub fn has_role(&self, address: &Address, role: Role) -> bool {
        self.store.access.has_role(address, role)
    }

    // ─────────────────────────────────────────────────────────
    // Emergency controls
    // ─────────────────────────────────────────────────────────

    /// Halt every lifecycle and economic operation. Reads and role
    /// administration keep working.
    pub fn pause(&mut self, caller: &Address) -> Result<()> {
        self.administer("pause", |env, t| {
            t.access.require_admin_or_above(caller)?;
            if *t.paused {
                return Err(Error::AlreadyDone("protocol is already paused".to_string()));
            }
            *t.paused = true;
            warn!(by = %caller, "protocol paused");
            env.emit(ProtocolEvent::ProtocolPaused { by: caller.clone() });
            Ok(())
        })
    }

    pub fn unpause(&mut self, caller: &Address) -> Result<()> {
        self.administer("unpause", |env, t| {
            t.access.require_admin_or_above(caller)?;
            if !*t.paused {
                return Err(Error::AlreadyDone("protocol is not paused".to_string()));
            }
            *t.paused = false;
            info!(by = %caller, "protocol unpaused");
            env.emit(ProtocolEvent::ProtocolUnpaused { by: caller.clone() });
            Ok(())
        })
    }

    pub fn is_paused(&self) -> bool {
        self.store.paused
    }

    // ─────────────────────────────────────────────────────────
    // Tasks
    // ─────────────────────────────────────────────────────────

    /// Propose a task and open its (empty) funding pool.
    pub fn create_task(&mut self, proposer: &Address, params: NewTask) -> Result<Task> {
        self.execute("create_task", |env, t| {
            let task = t.components.registry.create_task(env, proposer, params)?;
            t.components.funding.open_pool(task.id, task.estimated_cost);
            Ok(task)
        })
    }

    /// Called by the assigned operator once the work is done.
    pub fn submit_proof(
        &mut self,
        operator: &Address,
        id: TaskId,
        proof_ref: &str,
        actual_outcome: i128,
    ) -> Result<Task> {
        self.execute("submit_proof", |env, t| {
            t.components
                .registry
                .submit_proof(env, operator, id, proof_ref, actual_outcome)
        })
    }

    /// Declare a task abandoned once `deadline + grace_period` has passed,
    /// and settle its collateral and escrow in the same call.
    ///
    /// Returns the status the task was in before it was rejected.
    pub fn check_deadline(&mut self, id: TaskId) -> Result<TaskStatus> {
        self.execute("check_deadline", |env, t| {
            t.verification
                .settle_abandoned(env, &mut t.components, id)
        })
    }

    // ─────────────────────────────────────────────────────────
    // Funding
    // ─────────────────────────────────────────────────────────

    pub fn fund_task(
        &mut self,
        funder: &Address,
        id: TaskId,
        amount: i128,
    ) -> Result<ContributionReceipt> {
        self.execute("fund_task", |env, t| {
            let c = &mut t.components;
            c.funding.fund_task(env, c.registry, funder, id, amount)
        })
    }

    pub fn withdraw_funding(&mut self, funder: &Address, id: TaskId) -> Result<WithdrawalReceipt> {
        self.execute("withdraw_funding", |env, t| {
            let c = &mut t.components;
            c.funding.withdraw_funding(env, c.registry, funder, id)
        })
    }

    pub fn claim_refund(&mut self, funder: &Address, id: TaskId) -> Result<i128> {
        self.execute("claim_refund", |env, t| {
            t.components.funding.claim_refund(env, funder, id)
        })
    }

    /// Release a verified task's escrow. Verification already does this as
    /// part of its commit, so a direct call only succeeds if it never ran.
    pub fn release_payment(&mut self, id: TaskId) -> Result<PaymentReceipt> {
        self.execute("release_payment", |env, t| {
            let c = &mut t.components;
            c.funding.release_payment(env, c.registry, id)
        })
    }

    pub fn enable_refunds(&mut self, id: TaskId) -> Result<()> {
        self.execute("enable_refunds", |env, t| {
            let c = &mut t.components;
            c.funding.enable_refunds(env, c.registry, id)
        })
    }

    // ─────────────────────────────────────────────────────────
    // Collateral
    // ─────────────────────────────────────────────────────────

    pub fn register_operator(
        &mut self,
        operator: &Address,
        deposit: i128,
    ) -> Result<OperatorSnapshot> {
        self.execute("register_operator", |env, t| {
            t.components.collateral.register_operator(env, operator, deposit)
        })
    }

    pub fn add_stake(&mut self, operator: &Address, amount: i128) -> Result<OperatorSnapshot> {
        self.execute("add_stake", |env, t| {
            t.components.collateral.add_stake(env, operator, amount)
        })
    }

    pub fn withdraw_stake(&mut self, operator: &Address, amount: i128) -> Result<OperatorSnapshot> {
        self.execute("withdraw_stake", |env, t| {
            t.components.collateral.withdraw_stake(env, operator, amount)
        })
    }

    pub fn stake_for_task(&mut self, operator: &Address, id: TaskId) -> Result<StakeLock> {
        self.execute("stake_for_task", |env, t| {
            let c = &mut t.components;
            c.collateral.stake_for_task(env, c.registry, operator, id)
        })
    }

    // ─────────────────────────────────────────────────────────
    // Verification
    // ─────────────────────────────────────────────────────────

    /// Open a round for a task under review, drawing validators from the
    /// active roster.
    pub fn initiate_verification(&mut self, id: TaskId) -> Result<VerificationRound> {
        self.execute("initiate_verification", |env, t| {
            let roster = t.access.active_validators();
            t.verification
                .initiate_verification(env, t.components.registry, &roster, id)
        })
    }

    pub fn submit_vote(
        &mut self,
        validator: &Address,
        id: TaskId,
        approve: bool,
        confidence_score: u32,
        justification: &str,
    ) -> Result<VoteReceipt> {
        self.execute("submit_vote", |env, t| {
            t.verification.submit_vote(
                env,
                &mut t.components,
                validator,
                id,
                approve,
                confidence_score,
                justification,
            )
        })
    }

    /// See [`VerificationManager::finalize_verification`] for when a round
    /// can still be open at this point.
    pub fn finalize_verification(&mut self, id: TaskId) -> Result<Outcome> {
        self.execute("finalize_verification", |env, t| {
            t.verification
                .finalize_verification(env, &mut t.components, id)
        })
    }

    // ─────────────────────────────────────────────────────────
    // Queries: tasks
    // ─────────────────────────────────────────────────────────

    pub fn task(&self, id: TaskId) -> Result<&Task> {
        self.store.registry.get_task(id)
    }

    pub fn tasks(&self, ids: &[TaskId]) -> Vec<Task> {
        self.store.registry.get_tasks(ids)
    }

    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.store.registry.tasks_by_status(status)
    }

    pub fn tasks_by_proposer(&self, proposer: &Address) -> Vec<Task> {
        self.store.registry.tasks_by_proposer(proposer)
    }

    pub fn tasks_by_operator(&self, operator: &Address) -> Vec<Task> {
        self.store.registry.tasks_by_operator(operator)
    }

    pub fn task_exists(&self, id: TaskId) -> bool {
        self.store.registry.task_exists(id)
    }

    pub fn task_count(&self) -> u64 {
        self.store.registry.task_count()
    }

    /// Non-terminal tasks past `deadline + grace_period` that
    /// [`check_deadline`](Self::check_deadline) would accept right now.
    pub fn overdue_tasks(&self) -> Vec<TaskId> {
        let now = self.now();
        let grace = self.config.grace_period_secs;
        self.store
            .registry
            .all_tasks()
            .filter(|t| !t.status.is_terminal())
            .filter(|t| now > t.deadline.saturating_add(grace))
            .filter(|t| !self.store.verification.has_open_round(t.id))
            .map(|t| t.id)
            .collect()
    }

    // ─────────────────────────────────────────────────────────
    // Queries: funding
    // ─────────────────────────────────────────────────────────

    pub fn pool(&self, id: TaskId) -> Result<&Pool> {
        self.store.funding.get_pool(id)
    }

    pub fn share_of(&self, id: TaskId, funder: &Address) -> Result<i128> {
        self.store.funding.share_of(id, funder)
    }

    pub fn funders(&self, id: TaskId) -> Result<Vec<(Address, i128)>> {
        self.store.funding.funders(id)
    }

    pub fn funding_progress(&self, id: TaskId) -> Result<FundingProgress> {
        self.store.funding.funding_progress(id)
    }

    pub fn share_percentage_bps(&self, id: TaskId, funder: &Address) -> Result<u32> {
        self.store.funding.share_percentage_bps(id, funder)
    }

    /// Outcome-proportional credit split of a verified task, for the credit
    /// issuance service.
    pub fn credit_allocation(&self, id: TaskId) -> Result<Vec<CreditAllocation>> {
        let task = self.store.registry.ensure_status(id, TaskStatus::Verified)?;
        let units = task.actual_outcome.unwrap_or(0);
        self.store.funding.credit_allocation(id, units)
    }

    // ─────────────────────────────────────────────────────────
    // Queries: collateral
    // ─────────────────────────────────────────────────────────

    pub fn operator(&self, operator: &Address) -> Result<OperatorSnapshot> {
        self.store.collateral.operator(operator)
    }

    pub fn stake_lock(&self, id: TaskId) -> Result<&StakeLock> {
        self.store.collateral.stake_lock(id)
    }

    pub fn required_stake(&self, id: TaskId) -> Result<i128> {
        self.store.collateral.required_stake(
            &self.store.registry,
            self.config.min_stake_percentage_bps,
            id,
        )
    }

    pub fn can_accept_task(&self, operator: &Address, id: TaskId) -> Eligibility {
        self.store.collateral.can_accept_task(
            &self.store.registry,
            self.config.min_stake_percentage_bps,
            operator,
            id,
        )
    }

    pub fn locked_stake_of(&self, operator: &Address) -> i128 {
        self.store.collateral.locked_stake_of(operator)
    }

    // ─────────────────────────────────────────────────────────
    // Queries: verification
    // ─────────────────────────────────────────────────────────

    pub fn round(&self, id: TaskId) -> Result<&VerificationRound> {
        self.store.verification.round(id)
    }

    pub fn vote(&self, id: TaskId, validator: &Address) -> Result<&Vote> {
        self.store.verification.vote(id, validator)
    }

    pub fn can_finalize(&self, id: TaskId) -> FinalizeCheck {
        self.store.verification.can_finalize(id, self.now())
    }

    pub fn voting_progress(&self, id: TaskId) -> Result<VotingProgress> {
        self.store.verification.voting_progress(id)
    }

    pub fn validator_reputation(&self, validator: &Address) -> u64 {
        self.store.verification.reputation(validator)
    }

    pub fn active_validators(&self) -> Vec<Address> {
        self.store.access.active_validators()
    }

    pub fn validators(&self) -> &[ValidatorEntry] {
        self.store.access.validators()
    }

    /// Open rounds past their deadline, ready for `finalize_verification`.
    pub fn expired_rounds(&self) -> Vec<TaskId> {
        self.store.verification.expired_rounds(self.now())
    }

    // ─────────────────────────────────────────────────────────
    // Queries: treasury
    // ─────────────────────────────────────────────────────────

    pub fn treasury_balance(&self) -> i128 {
        self.store.treasury.balance()
    }

    pub fn credited(&self, address: &Address) -> i128 {
        self.store.treasury.credited(address)
    }

    // ─────────────────────────────────────────────────────────
    // Internal helpers
    // ─────────────────────────────────────────────────────────

    /// Run a lifecycle command. Fails with `Paused` while the switch is on.
    fn execute<T>(
        &mut self,
        operation: &'static str,
        command: impl FnOnce(&mut Env<'_>, &mut Tables<'_>) -> Result<T>,
    ) -> Result<T> {
        let result = if self.store.paused {
            Err(Error::Paused)
        } else {
            self.apply(command)
        };
        if let Err(err) = &result {
            debug!(operation, error = %err, "command rejected");
        }
        result
    }

    /// Run an administrative command, which the pause switch does not gate.
    fn administer<T>(
        &mut self,
        operation: &'static str,
        command: impl FnOnce(&mut Env<'_>, &mut Tables<'_>) -> Result<T>,
    ) -> Result<T> {
        let result = self.apply(command);
        if let Err(err) = &result {
            debug!(operation, error = %err, "command rejected");
        }
        result
    }

    fn apply<T>(
        &mut self,
        command: impl FnOnce(&mut Env<'_>, &mut Tables<'_>) -> Result<T>,
    ) -> Result<T> {
        let now = self.clock.now();
        let Store {
            access,
            registry,
            funding,
            collateral,
            verification,
            treasury,
            paused,
        } = &mut self.store;
        let mut env = Env {
            now,
            config: &self.config,
            events: &mut self.events,
            treasury,
        };
        let mut tables = Tables {
            access,
            paused,
            verification,
            components: Components {
                registry,
                funding,
                collateral,
            },
        };
        command(&mut env, &mut tables)
    }
}
