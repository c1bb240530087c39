//! # Collateral Manager
//!
//! Operator accounts, per-task stake locks, release and slashing.
//!
//! ## Accounting
//!
//! For every operator, at all times:
//!
//! ```text
//! available + locked == deposited - withdrawn - slashed
//! ```
//!
//! `locked` is the sum of the operator's open ([`StakeLockStatus::Locked`])
//! locks. A lock is created by [`CollateralManager::stake_for_task`] and is
//! settled exactly once, by release or by slash, on behalf of the
//! verification manager.
//!
//! ## Approval
//!
//! An operator is approved from registration until it either withdraws its
//! whole stake (deregistration, reversible by registering again) or is fully
//! slashed (ban, permanent).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::apply_bps;
use crate::env::Env;
use crate::errors::{Error, Result};
use crate::events::ProtocolEvent;
use crate::rbac::Capability;
use crate::registry::TaskRegistry;
use crate::types::{
    Address, OperatorAccount, StakeLock, StakeLockStatus, TaskId, TaskStatus, BPS_DENOMINATOR,
    MAX_AMOUNT,
};

/// Read-only view of an operator account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSnapshot {
    pub address: Address,
    pub approved: bool,
    pub banned: bool,
    pub available: i128,
    pub locked: i128,
    pub total: i128,
}

/// Why an operator can or cannot accept a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityReason {
    Eligible,
    NotRegistered,
    Banned,
    TaskNotFound,
    TaskNotFunded,
    InsufficientStake,
}

impl EligibilityReason {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Eligible => "operator can accept this task",
            Self::NotRegistered => "operator is not registered",
            Self::Banned => "operator is banned",
            Self::TaskNotFound => "task does not exist",
            Self::TaskNotFunded => "task is not open for operators",
            Self::InsufficientStake => "available stake is below the required lock",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: EligibilityReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashOutcome {
    pub slashed: i128,
    pub returned: i128,
    pub banned: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollateralManager {
    operators: BTreeMap<Address, OperatorAccount>,
    locks: BTreeMap<TaskId, StakeLock>,
}

impl CollateralManager {
    // ─────────────────────────────────────────────────────────
    // Operator accounts
    // ─────────────────────────────────────────────────────────

    pub fn register_operator(
        &mut self,
        env: &mut Env<'_>,
        operator: &Address,
        deposit: i128,
    ) -> Result<OperatorSnapshot> {
        if let Some(account) = self.operators.get(operator) {
            if account.is_banned {
                return Err(Error::Authorization(format!("{operator} is banned")));
            }
            if account.is_approved {
                return Err(Error::AlreadyDone(format!("{operator} is already registered")));
            }
        }
        let minimum = env.config.min_operator_stake;
        if deposit < minimum {
            return Err(Error::Validation(format!(
                "deposit {deposit} is below the minimum operator stake {minimum}"
            )));
        }
        check_stake_cap(self.operators.get(operator), operator, deposit)?;

        let now = env.now;
        let account = self
            .operators
            .entry(operator.clone())
            .or_insert_with(|| OperatorAccount {
                address: operator.clone(),
                available_stake: 0,
                locked_stake: 0,
                is_approved: false,
                is_banned: false,
                total_deposited: 0,
                total_withdrawn: 0,
                total_slashed: 0,
                registered_at: now,
            });
        account.available_stake += deposit;
        account.total_deposited += deposit;
        account.is_approved = true;
        account.registered_at = now;
        let snapshot = snapshot_of(account);

        info!(operator = %operator, deposit = %deposit, "operator registered");
        env.emit(ProtocolEvent::OperatorRegistered {
            operator: operator.clone(),
            deposit,
        });
        Ok(snapshot)
    }

    pub fn add_stake(
        &mut self,
        env: &mut Env<'_>,
        operator: &Address,
        amount: i128,
    ) -> Result<OperatorSnapshot> {
        if amount <= 0 {
            return Err(Error::Validation(format!("stake must be positive, got {amount}")));
        }
        let account = self.account(operator)?;
        if account.is_banned {
            return Err(Error::Authorization(format!("{operator} is banned")));
        }
        if !account.is_approved {
            return Err(Error::State(format!(
                "{operator} is deregistered; register again to stake"
            )));
        }
        check_stake_cap(Some(account), operator, amount)?;

        let account = self.account_mut(operator)?;
        account.available_stake += amount;
        account.total_deposited += amount;
        let snapshot = snapshot_of(account);

        info!(operator = %operator, amount = %amount, "stake added");
        env.emit(ProtocolEvent::StakeAdded {
            operator: operator.clone(),
            amount,
        });
        Ok(snapshot)
    }

    /// Withdraw available stake.
    ///
    /// A partial withdrawal must leave at least the minimum stake behind. A
    /// withdrawal of everything (with no open locks) deregisters the operator.
    /// Banned operators may withdraw whatever is left after the slash.
    pub fn withdraw_stake(
        &mut self,
        env: &mut Env<'_>,
        operator: &Address,
        amount: i128,
    ) -> Result<OperatorSnapshot> {
        if amount <= 0 {
            return Err(Error::Validation(format!(
                "withdrawal must be positive, got {amount}"
            )));
        }
        let minimum = env.config.min_operator_stake;
        let account = self.account_mut(operator)?;
        if amount > account.available_stake {
            return Err(Error::InsufficientFunds(format!(
                "{operator} has {} available, asked for {amount}",
                account.available_stake
            )));
        }
        let remaining = account.total_stake() - amount;
        let full_exit = remaining == 0;
        if account.is_approved && !full_exit && remaining < minimum {
            return Err(Error::Validation(format!(
                "withdrawal would leave {remaining}, below the minimum stake {minimum}; \
                 withdraw everything to deregister"
            )));
        }

        account.available_stake -= amount;
        account.total_withdrawn += amount;
        if full_exit {
            account.is_approved = false;
        }
        let snapshot = snapshot_of(account);

        env.treasury.pay(operator, amount);
        info!(operator = %operator, amount = %amount, deregistered = full_exit, "stake withdrawn");
        env.emit(ProtocolEvent::StakeWithdrawn {
            operator: operator.clone(),
            amount,
            deregistered: full_exit,
        });
        Ok(snapshot)
    }

    // ─────────────────────────────────────────────────────────
    // Task collateral
    // ─────────────────────────────────────────────────────────

    /// Lock the required collateral and take the task.
    ///
    /// The registry's `Funded -> InProgress` compare-and-set runs before any
    /// collateral moves, so of two operators racing for one task exactly one
    /// succeeds and the loser's account is untouched.
    pub fn stake_for_task(
        &mut self,
        env: &mut Env<'_>,
        registry: &mut TaskRegistry,
        operator: &Address,
        id: TaskId,
    ) -> Result<StakeLock> {
        let account = self
            .operators
            .get(operator)
            .filter(|a| a.is_approved && !a.is_banned)
            .ok_or_else(|| {
                Error::Authorization(format!("{operator} is not an approved operator"))
            })?;
        let task = registry.ensure_status(id, TaskStatus::Funded)?;
        let required = required_stake_for(task.estimated_cost, env.config.min_stake_percentage_bps);
        if account.available_stake < required {
            return Err(Error::InsufficientFunds(format!(
                "task {id} requires {required} locked stake, {operator} has {} available",
                account.available_stake
            )));
        }
        if self.locks.contains_key(&id) {
            return Err(Error::AlreadyDone(format!("task {id} already has a stake lock")));
        }

        registry.assign_operator(Capability::CollateralManager, id, operator, env.now)?;

        let account = self.account_mut(operator)?;
        account.available_stake -= required;
        account.locked_stake += required;
        let lock = StakeLock {
            task_id: id,
            operator: operator.clone(),
            locked_amount: required,
            locked_at: env.now,
            status: StakeLockStatus::Locked,
            slashed_amount: 0,
            settled_at: None,
        };
        self.locks.insert(id, lock.clone());

        info!(task_id = id, operator = %operator, locked = %required, "stake locked");
        env.emit(ProtocolEvent::StakeLocked {
            task_id: id,
            operator: operator.clone(),
            amount: required,
        });
        env.emit(ProtocolEvent::OperatorAssigned {
            task_id: id,
            operator: operator.clone(),
        });
        Ok(lock)
    }

    /// Fail unless task `id` has a lock that is still `Locked`.
    pub(crate) fn ensure_lock_open(&self, id: TaskId) -> Result<&StakeLock> {
        let lock = self.stake_lock(id)?;
        if lock.status != StakeLockStatus::Locked {
            return Err(Error::AlreadyDone(format!(
                "stake lock of task {id} is already {:?}",
                lock.status
            )));
        }
        Ok(lock)
    }

    pub fn release_stake(
        &mut self,
        env: &mut Env<'_>,
        caller: Capability,
        id: TaskId,
    ) -> Result<i128> {
        caller.require(Capability::VerificationManager, "release_stake")?;
        let operator = self.ensure_lock_open(id)?.operator.clone();
        self.account(&operator)?;

        let lock = self.lock_mut(id)?;
        lock.status = StakeLockStatus::Released;
        lock.settled_at = Some(env.now);
        let amount = lock.locked_amount;

        let account = self.account_mut(&operator)?;
        account.locked_stake -= amount;
        account.available_stake += amount;

        info!(task_id = id, operator = %operator, amount = %amount, "stake released");
        env.emit(ProtocolEvent::StakeReleased {
            task_id: id,
            operator,
            amount,
        });
        Ok(amount)
    }

    /// Send `percentage_bps` of the task's lock to the treasury and return
    /// the rest to the operator's available stake. A full slash bans.
    pub fn slash_stake(
        &mut self,
        env: &mut Env<'_>,
        caller: Capability,
        id: TaskId,
        percentage_bps: u32,
        reason: &str,
    ) -> Result<SlashOutcome> {
        caller.require(Capability::VerificationManager, "slash_stake")?;
        if percentage_bps > BPS_DENOMINATOR {
            return Err(Error::Validation(format!(
                "slash percentage {percentage_bps} exceeds {BPS_DENOMINATOR} bps"
            )));
        }
        let operator = self.ensure_lock_open(id)?.operator.clone();
        self.account(&operator)?;

        let now = env.now;
        let lock = self.lock_mut(id)?;
        let locked = lock.locked_amount;
        let slashed = apply_bps(locked, percentage_bps);
        let returned = locked - slashed;
        lock.status = StakeLockStatus::Slashed;
        lock.slashed_amount = slashed;
        lock.settled_at = Some(now);

        let banned = percentage_bps == BPS_DENOMINATOR;
        let account = self.account_mut(&operator)?;
        account.locked_stake -= locked;
        account.available_stake += returned;
        account.total_slashed += slashed;
        if banned {
            account.is_banned = true;
            account.is_approved = false;
        } else if account.total_stake() == 0 {
            account.is_approved = false;
        }

        env.treasury.collect(slashed);

        warn!(task_id = id, operator = %operator, slashed = %slashed, reason, "stake slashed");
        env.emit(ProtocolEvent::StakeSlashed {
            task_id: id,
            operator: operator.clone(),
            slashed,
            returned,
            reason: reason.to_string(),
        });
        if banned {
            warn!(operator = %operator, "operator banned");
            env.emit(ProtocolEvent::OperatorBanned { operator });
        }
        Ok(SlashOutcome {
            slashed,
            returned,
            banned,
        })
    }

    // ─────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────

    pub fn operator(&self, operator: &Address) -> Result<OperatorSnapshot> {
        self.account(operator).map(snapshot_of)
    }

    pub fn stake_lock(&self, id: TaskId) -> Result<&StakeLock> {
        self.locks
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("stake lock for task {id}")))
    }

    /// `floor(cost * min_stake_percentage_bps / 10000)` for task `id`.
    pub fn required_stake(
        &self,
        registry: &TaskRegistry,
        min_stake_percentage_bps: u32,
        id: TaskId,
    ) -> Result<i128> {
        let task = registry.get_task(id)?;
        Ok(required_stake_for(task.estimated_cost, min_stake_percentage_bps))
    }

    pub fn can_accept_task(
        &self,
        registry: &TaskRegistry,
        min_stake_percentage_bps: u32,
        operator: &Address,
        id: TaskId,
    ) -> Eligibility {
        let reason = match self.operators.get(operator) {
            None => EligibilityReason::NotRegistered,
            Some(a) if a.is_banned => EligibilityReason::Banned,
            Some(a) if !a.is_approved => EligibilityReason::NotRegistered,
            Some(a) => match registry.get_task(id) {
                Err(_) => EligibilityReason::TaskNotFound,
                Ok(t) if t.status != TaskStatus::Funded => EligibilityReason::TaskNotFunded,
                Ok(t) => {
                    let required = required_stake_for(t.estimated_cost, min_stake_percentage_bps);
                    if a.available_stake < required {
                        EligibilityReason::InsufficientStake
                    } else {
                        EligibilityReason::Eligible
                    }
                }
            },
        };
        Eligibility {
            eligible: reason == EligibilityReason::Eligible,
            reason,
        }
    }

    pub fn locked_stake_of(&self, operator: &Address) -> i128 {
        self.operators
            .get(operator)
            .map(|a| a.locked_stake)
            .unwrap_or(0)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &OperatorAccount> {
        self.operators.values()
    }

    pub fn locks(&self) -> impl Iterator<Item = &StakeLock> {
        self.locks.values()
    }

    fn account(&self, operator: &Address) -> Result<&OperatorAccount> {
        self.operators
            .get(operator)
            .ok_or_else(|| Error::NotFound(format!("operator {operator}")))
    }

    fn account_mut(&mut self, operator: &Address) -> Result<&mut OperatorAccount> {
        self.operators
            .get_mut(operator)
            .ok_or_else(|| Error::NotFound(format!("operator {operator}")))
    }

    fn lock_mut(&mut self, id: TaskId) -> Result<&mut StakeLock> {
        self.locks
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("stake lock for task {id}")))
    }
}

/// Fail unless `operator` can take `amount` more stake without its total
/// passing [`MAX_AMOUNT`].
fn check_stake_cap(
    account: Option<&OperatorAccount>,
    operator: &Address,
    amount: i128,
) -> Result<()> {
    let (total, deposited) = account.map_or((0, 0), |a| (a.total_stake(), a.total_deposited));
    let within_cap = total
        .checked_add(amount)
        .is_some_and(|new_total| new_total <= MAX_AMOUNT);
    if !within_cap || deposited.checked_add(amount).is_none() {
        return Err(Error::Validation(format!(
            "stake of {operator} would exceed the maximum of {MAX_AMOUNT}"
        )));
    }
    Ok(())
}

pub(crate) fn required_stake_for(cost: i128, min_stake_percentage_bps: u32) -> i128 {
    apply_bps(cost, min_stake_percentage_bps)
}

fn snapshot_of(account: &OperatorAccount) -> OperatorSnapshot {
    OperatorSnapshot {
        address: account.address.clone(),
        approved: account.is_approved,
        banned: account.is_banned,
        available: account.available_stake,
        locked: account.locked_stake,
        total: account.total_stake(),
    }
}
