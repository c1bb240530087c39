//! # Funding Pool
//!
//! Escrows funder contributions per task and settles them once the task
//! reaches a terminal status.
//!
//! - Contributions and penalised withdrawals are only possible while the
//!   task is `Proposed`.
//! - The contribution that makes `total_funded == target` marks the task
//!   `Funded` in the same call.
//! - `Verified` tasks pay the operator (minus the platform fee) exactly once.
//! - `Rejected` tasks enable refunds; every funder reclaims its full share
//!   exactly once, with no penalty.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::apply_bps;
use crate::env::Env;
use crate::errors::{Error, Result};
use crate::events::ProtocolEvent;
use crate::rbac::Capability;
use crate::registry::TaskRegistry;
use crate::types::{Address, Pool, TaskId, TaskStatus, BPS_DENOMINATOR};

/// `(funded, target, percentage)` view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingProgress {
    pub funded: i128,
    pub target: i128,
    pub percentage_bps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionReceipt {
    pub total_funded: i128,
    pub target_reached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalReceipt {
    pub share: i128,
    pub penalty: i128,
    pub refunded: i128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub operator: Address,
    pub operator_amount: i128,
    pub fee: i128,
}

/// One funder's slice of the credits minted for a verified task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAllocation {
    pub funder: Address,
    pub share: i128,
    pub credits: i128,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FundingPool {
    pools: BTreeMap<TaskId, Pool>,
}

impl FundingPool {
    /// Open the (empty) pool for a freshly created task.
    pub(crate) fn open_pool(&mut self, task_id: TaskId, target: i128) {
        self.pools.insert(
            task_id,
            Pool {
                task_id,
                target,
                ..Pool::default()
            },
        );
    }

    // ─────────────────────────────────────────────────────────
    // Contributions
    // ─────────────────────────────────────────────────────────

    pub fn fund_task(
        &mut self,
        env: &mut Env<'_>,
        registry: &mut TaskRegistry,
        funder: &Address,
        id: TaskId,
        amount: i128,
    ) -> Result<ContributionReceipt> {
        if amount <= 0 {
            return Err(Error::Validation(format!(
                "contribution must be positive, got {amount}"
            )));
        }
        registry.ensure_status(id, TaskStatus::Proposed)?;
        let pool = self.get_pool(id)?;
        let total = pool
            .total_funded
            .checked_add(amount)
            .ok_or_else(|| Error::Validation("contribution overflows the pool".to_string()))?;
        if total > pool.target {
            return Err(Error::Validation(format!(
                "contribution of {amount} exceeds the remaining {} of task {id}",
                pool.target - pool.total_funded
            )));
        }
        let target_reached = total == pool.target;

        // The status flip is the only fallible step left, so it goes first.
        if target_reached {
            registry.mark_funded(Capability::FundingPool, id, env.now)?;
        }

        let pool = self.get_pool_mut(id)?;
        let share = pool.shares.entry(funder.clone()).or_insert(0);
        if *share == 0 {
            pool.funders_count += 1;
        }
        *share += amount;
        pool.total_funded = total;

        info!(task_id = id, funder = %funder, amount = %amount, total = %total, "funding added");
        env.emit(ProtocolEvent::FundingAdded {
            task_id: id,
            funder: funder.clone(),
            amount,
            total_funded: total,
        });
        if target_reached {
            env.emit(ProtocolEvent::TaskFunded {
                task_id: id,
                total_funded: total,
            });
        }
        Ok(ContributionReceipt {
            total_funded: total,
            target_reached,
        })
    }

    /// Pull a contribution back before the task is funded, minus the penalty.
    pub fn withdraw_funding(
        &mut self,
        env: &mut Env<'_>,
        registry: &TaskRegistry,
        funder: &Address,
        id: TaskId,
    ) -> Result<WithdrawalReceipt> {
        registry.ensure_status(id, TaskStatus::Proposed)?;
        let share = self.share_of(id, funder)?;
        if share == 0 {
            return Err(Error::Validation(format!(
                "{funder} has no contribution in task {id}"
            )));
        }

        let penalty = apply_bps(share, env.config.withdrawal_penalty_bps);
        let refunded = share - penalty;

        let pool = self.get_pool_mut(id)?;
        pool.shares.remove(funder);
        pool.total_funded -= share;
        pool.funders_count -= 1;

        env.treasury.collect(penalty);
        env.treasury.pay(funder, refunded);

        info!(
            task_id = id,
            funder = %funder,
            refunded = %refunded,
            penalty = %penalty,
            "funding withdrawn"
        );
        env.emit(ProtocolEvent::FundingWithdrawn {
            task_id: id,
            funder: funder.clone(),
            refunded,
            penalty,
        });
        Ok(WithdrawalReceipt {
            share,
            penalty,
            refunded,
        })
    }

    // ─────────────────────────────────────────────────────────
    // Settlement
    // ─────────────────────────────────────────────────────────

    /// Pool-side preconditions of [`release_payment`](Self::release_payment).
    pub(crate) fn ensure_payment_releasable(&self, id: TaskId) -> Result<()> {
        if self.get_pool(id)?.payment_released {
            return Err(Error::AlreadyDone(format!(
                "payment for task {id} was already released"
            )));
        }
        Ok(())
    }

    pub fn release_payment(
        &mut self,
        env: &mut Env<'_>,
        registry: &TaskRegistry,
        id: TaskId,
    ) -> Result<PaymentReceipt> {
        let task = registry.ensure_status(id, TaskStatus::Verified)?;
        self.ensure_payment_releasable(id)?;
        let operator = task.assigned_operator.clone().ok_or_else(|| {
            Error::State(format!("verified task {id} has no assigned operator"))
        })?;

        let pool = self.get_pool_mut(id)?;
        let fee = apply_bps(pool.target, env.config.platform_fee_bps);
        let operator_amount = pool.total_funded - fee;
        pool.payment_released = true;

        env.treasury.collect(fee);
        env.treasury.pay(&operator, operator_amount);

        info!(
            task_id = id,
            operator = %operator,
            amount = %operator_amount,
            fee = %fee,
            "payment released"
        );
        env.emit(ProtocolEvent::PaymentReleased {
            task_id: id,
            operator: operator.clone(),
            amount: operator_amount,
            fee,
        });
        Ok(PaymentReceipt {
            operator,
            operator_amount,
            fee,
        })
    }

    /// Pool-side preconditions of [`enable_refunds`](Self::enable_refunds).
    pub(crate) fn ensure_refunds_enableable(&self, id: TaskId) -> Result<()> {
        if self.get_pool(id)?.refunds_enabled {
            return Err(Error::AlreadyDone(format!(
                "refunds for task {id} are already enabled"
            )));
        }
        Ok(())
    }

    pub fn enable_refunds(
        &mut self,
        env: &mut Env<'_>,
        registry: &TaskRegistry,
        id: TaskId,
    ) -> Result<()> {
        registry.ensure_status(id, TaskStatus::Rejected)?;
        self.ensure_refunds_enableable(id)?;
        self.get_pool_mut(id)?.refunds_enabled = true;

        info!(task_id = id, "refunds enabled");
        env.emit(ProtocolEvent::RefundsEnabled { task_id: id });
        Ok(())
    }

    /// Return the caller's full original share. No penalty applies.
    pub fn claim_refund(
        &mut self,
        env: &mut Env<'_>,
        funder: &Address,
        id: TaskId,
    ) -> Result<i128> {
        let pool = self.get_pool(id)?;
        if !pool.refunds_enabled {
            return Err(Error::State(format!("refunds are not enabled for task {id}")));
        }
        if pool.refunded.contains(funder) {
            return Err(Error::AlreadyDone(format!(
                "{funder} already claimed the refund for task {id}"
            )));
        }
        let amount = pool.shares.get(funder).copied().unwrap_or(0);
        if amount == 0 {
            return Err(Error::Validation(format!(
                "{funder} has no contribution in task {id}"
            )));
        }

        let pool = self.get_pool_mut(id)?;
        pool.shares.remove(funder);
        pool.refunded.insert(funder.clone());
        pool.total_funded -= amount;
        pool.total_refunded += amount;
        pool.funders_count -= 1;

        env.treasury.pay(funder, amount);

        info!(task_id = id, funder = %funder, amount = %amount, "refund claimed");
        env.emit(ProtocolEvent::RefundClaimed {
            task_id: id,
            funder: funder.clone(),
            amount,
        });
        Ok(amount)
    }

    // ─────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────

    pub fn get_pool(&self, id: TaskId) -> Result<&Pool> {
        self.pools
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("pool for task {id}")))
    }

    pub fn share_of(&self, id: TaskId, funder: &Address) -> Result<i128> {
        Ok(self.get_pool(id)?.shares.get(funder).copied().unwrap_or(0))
    }

    pub fn funders(&self, id: TaskId) -> Result<Vec<(Address, i128)>> {
        Ok(self
            .get_pool(id)?
            .shares
            .iter()
            .map(|(funder, share)| (funder.clone(), *share))
            .collect())
    }

    pub fn funding_progress(&self, id: TaskId) -> Result<FundingProgress> {
        let pool = self.get_pool(id)?;
        Ok(FundingProgress {
            funded: pool.total_funded,
            target: pool.target,
            percentage_bps: ratio_bps(pool.total_funded, pool.target),
        })
    }

    /// Funder's share of the pool, in basis points of `total_funded`.
    pub fn share_percentage_bps(&self, id: TaskId, funder: &Address) -> Result<u32> {
        let pool = self.get_pool(id)?;
        let share = pool.shares.get(funder).copied().unwrap_or(0);
        Ok(ratio_bps(share, pool.total_funded))
    }

    /// Split `outcome_units` across funders by share of `total_funded`.
    ///
    /// Each funder gets `floor(units * share / total)`; the rounding remainder
    /// goes to the largest share holder (first in address order on ties).
    pub fn credit_allocation(
        &self,
        id: TaskId,
        outcome_units: i128,
    ) -> Result<Vec<CreditAllocation>> {
        let pool = self.get_pool(id)?;
        if pool.total_funded <= 0 {
            return Ok(Vec::new());
        }

        let mut allocations = pool
            .shares
            .iter()
            .map(|(funder, share)| {
                Ok(CreditAllocation {
                    funder: funder.clone(),
                    share: *share,
                    credits: pro_rata(outcome_units, *share, pool.total_funded)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let distributed: i128 = allocations.iter().map(|a| a.credits).sum();
        let remainder = outcome_units - distributed;
        if remainder > 0 {
            let largest = allocations
                .iter()
                .enumerate()
                .max_by(|(ia, a), (ib, b)| a.share.cmp(&b.share).then(ib.cmp(ia)))
                .map(|(i, _)| i);
            if let Some(i) = largest {
                allocations[i].credits += remainder;
            }
        }
        Ok(allocations)
    }

    fn get_pool_mut(&mut self, id: TaskId) -> Result<&mut Pool> {
        self.pools
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("pool for task {id}")))
    }
}

/// `floor(units * share / total)` for `0 <= share <= total`.
fn pro_rata(units: i128, share: i128, total: i128) -> Result<i128> {
    let rest = (units % total)
        .checked_mul(share)
        .ok_or_else(|| Error::Validation(format!("credit split of {units} units overflows")))?;
    Ok(units / total * share + rest / total)
}

/// `part / whole` in basis points, for `0 <= part <= whole`.
fn ratio_bps(part: i128, whole: i128) -> u32 {
    if whole <= 0 {
        return 0;
    }
    let denominator = i128::from(BPS_DENOMINATOR);
    let bps = match part.checked_mul(denominator) {
        Some(scaled) => scaled / whole,
        None => part / (whole / denominator),
    };
    bps.clamp(0, denominator) as u32
}
