//! # Task Registry
//!
//! Owns the canonical [`Task`] records and the status state machine.
//!
//! | Transition                  | Owner                                  |
//! |-----------------------------|----------------------------------------|
//! | `Proposed -> Funded`        | [`Capability::FundingPool`]            |
//! | `Funded -> InProgress`      | [`Capability::CollateralManager`]      |
//! | `InProgress -> UnderReview` | the assigned operator (`submit_proof`) |
//! | `UnderReview -> Verified`   | [`Capability::VerificationManager`]    |
//! | `UnderReview -> Rejected`   | [`Capability::VerificationManager`]    |
//! | `* -> Rejected` (abandoned) | anyone, after deadline + grace period  |
//!
//! Every transition is a compare-and-set on the current status: it names
//! the status it expects to leave and fails with `State` otherwise. This is
//! what makes `Funded -> InProgress` exclusive between competing operators.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{Error, Result};
use crate::env::Env;
use crate::events::ProtocolEvent;
use crate::rbac::Capability;
use crate::types::{Address, NewTask, Task, TaskId, TaskStatus, Timestamp, MAX_AMOUNT};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRegistry {
    tasks: BTreeMap<TaskId, Task>,
    next_id: TaskId,
    by_proposer: BTreeMap<Address, Vec<TaskId>>,
    by_operator: BTreeMap<Address, Vec<TaskId>>,
}

impl TaskRegistry {
    // ─────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────

    pub fn create_task(
        &mut self,
        env: &mut Env<'_>,
        proposer: &Address,
        params: NewTask,
    ) -> Result<Task> {
        let now = env.now;
        if params.description.trim().is_empty() {
            return Err(Error::Validation("description must not be empty".to_string()));
        }
        if params.estimated_cost <= 0 {
            return Err(Error::Validation(format!(
                "estimated cost must be positive, got {}",
                params.estimated_cost
            )));
        }
        if params.estimated_cost > MAX_AMOUNT {
            return Err(Error::Validation(format!(
                "estimated cost {} exceeds the maximum of {MAX_AMOUNT}",
                params.estimated_cost
            )));
        }
        if params.expected_co2 <= 0 {
            return Err(Error::Validation(format!(
                "expected outcome must be positive, got {}",
                params.expected_co2
            )));
        }
        if params.deadline <= now {
            return Err(Error::Validation(format!(
                "deadline {} is not in the future (now {now})",
                params.deadline
            )));
        }

        let id = self.next_task_id();
        let task = Task {
            id,
            proposer: proposer.clone(),
            description: params.description,
            estimated_cost: params.estimated_cost,
            expected_co2: params.expected_co2,
            location: params.location,
            deadline: params.deadline,
            proof_requirements: params.proof_requirements,
            external_doc_ref: params.external_doc_ref,
            status: TaskStatus::Proposed,
            created_at: now,
            updated_at: now,
            assigned_operator: None,
            actual_outcome: None,
            proof_ref: None,
        };

        self.tasks.insert(id, task.clone());
        self.by_proposer.entry(proposer.clone()).or_default().push(id);

        info!(task_id = id, proposer = %proposer, cost = %task.estimated_cost, "task created");
        env.emit(ProtocolEvent::TaskCreated {
            task_id: id,
            proposer: proposer.clone(),
            estimated_cost: task.estimated_cost,
            deadline: task.deadline,
        });
        Ok(task)
    }

    pub fn mark_funded(&mut self, caller: Capability, id: TaskId, now: Timestamp) -> Result<()> {
        caller.require(Capability::FundingPool, "mark_funded")?;
        self.transition(id, TaskStatus::Proposed, TaskStatus::Funded, now)?;
        info!(task_id = id, "task funded");
        Ok(())
    }

    pub fn assign_operator(
        &mut self,
        caller: Capability,
        id: TaskId,
        operator: &Address,
        now: Timestamp,
    ) -> Result<()> {
        caller.require(Capability::CollateralManager, "assign_operator")?;
        self.transition(id, TaskStatus::Funded, TaskStatus::InProgress, now)?;

        if let Some(task) = self.tasks.get_mut(&id) {
            task.assigned_operator = Some(operator.clone());
        }
        self.by_operator.entry(operator.clone()).or_default().push(id);
        info!(task_id = id, operator = %operator, "operator assigned");
        Ok(())
    }

    /// Record the operator's proof and move the task to `UnderReview`.
    ///
    /// Proof is accepted until the task deadline plus the grace period; after
    /// that the task can only be declared abandoned.
    pub fn submit_proof(
        &mut self,
        env: &mut Env<'_>,
        caller: &Address,
        id: TaskId,
        proof_ref: &str,
        actual_outcome: i128,
    ) -> Result<Task> {
        let now = env.now;
        let task = self.get_task(id)?;
        if task.assigned_operator.as_ref() != Some(caller) {
            return Err(Error::Authorization(format!(
                "{caller} is not the assigned operator of task {id}"
            )));
        }
        if proof_ref.trim().is_empty() {
            return Err(Error::Validation("proof reference must not be empty".to_string()));
        }
        if actual_outcome <= 0 {
            return Err(Error::Validation(format!(
                "actual outcome must be positive, got {actual_outcome}"
            )));
        }
        if task.status != TaskStatus::InProgress {
            return Err(Error::State(format!(
                "task {id} is {}, proof requires in_progress",
                task.status
            )));
        }
        if now > task.deadline.saturating_add(env.config.grace_period_secs) {
            return Err(Error::Deadline(format!(
                "task {id} passed its deadline and grace period"
            )));
        }

        self.transition(id, TaskStatus::InProgress, TaskStatus::UnderReview, now)?;
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or_else(|| Error::task_not_found(id))?;
        task.proof_ref = Some(proof_ref.to_string());
        task.actual_outcome = Some(actual_outcome);
        let task = task.clone();

        info!(task_id = id, operator = %caller, outcome = %actual_outcome, "proof submitted");
        env.emit(ProtocolEvent::ProofSubmitted {
            task_id: id,
            operator: caller.clone(),
            proof_ref: proof_ref.to_string(),
            actual_outcome,
        });
        Ok(task)
    }

    pub fn mark_verified(&mut self, caller: Capability, id: TaskId, now: Timestamp) -> Result<()> {
        caller.require(Capability::VerificationManager, "mark_verified")?;
        self.transition(id, TaskStatus::UnderReview, TaskStatus::Verified, now)?;
        info!(task_id = id, "task verified");
        Ok(())
    }

    pub fn mark_rejected(&mut self, caller: Capability, id: TaskId, now: Timestamp) -> Result<()> {
        caller.require(Capability::VerificationManager, "mark_rejected")?;
        self.transition(id, TaskStatus::UnderReview, TaskStatus::Rejected, now)?;
        info!(task_id = id, "task rejected");
        Ok(())
    }

    /// Preconditions of [`check_deadline`](Self::check_deadline), without
    /// mutating. Returns the status the task would be rejected from.
    pub fn ensure_abandonable(
        &self,
        id: TaskId,
        now: Timestamp,
        grace_period_secs: u64,
    ) -> Result<TaskStatus> {
        let task = self.get_task(id)?;
        if task.status.is_terminal() {
            return Err(Error::State(format!(
                "task {id} is already {}",
                task.status
            )));
        }
        let cutoff = task.deadline.saturating_add(grace_period_secs);
        if now <= cutoff {
            return Err(Error::Deadline(format!(
                "task {id} can be declared abandoned after {cutoff} (now {now})"
            )));
        }
        Ok(task.status)
    }

    /// Force a task past its deadline and grace period into `Rejected`.
    pub fn check_deadline(&mut self, env: &mut Env<'_>, id: TaskId) -> Result<TaskStatus> {
        let previous = self.ensure_abandonable(id, env.now, env.config.grace_period_secs)?;
        self.transition(id, previous, TaskStatus::Rejected, env.now)?;

        info!(task_id = id, from = %previous, "task abandoned");
        env.emit(ProtocolEvent::TaskAbandoned {
            task_id: id,
            previous_status: previous,
        });
        Ok(previous)
    }

    /// Fail with `State` unless task `id` currently has `status`.
    pub fn ensure_status(&self, id: TaskId, status: TaskStatus) -> Result<&Task> {
        let task = self.get_task(id)?;
        if task.status != status {
            return Err(Error::State(format!(
                "task {id} is {}, expected {status}",
                task.status
            )));
        }
        Ok(task)
    }

    // ─────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────

    pub fn get_task(&self, id: TaskId) -> Result<&Task> {
        self.tasks.get(&id).ok_or_else(|| Error::task_not_found(id))
    }

    /// Fetch several tasks at once; unknown ids are skipped.
    pub fn get_tasks(&self, ids: &[TaskId]) -> Vec<Task> {
        ids.iter().filter_map(|id| self.tasks.get(id)).cloned().collect()
    }

    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    pub fn tasks_by_proposer(&self, proposer: &Address) -> Vec<Task> {
        self.by_proposer
            .get(proposer)
            .map(|ids| self.get_tasks(ids))
            .unwrap_or_default()
    }

    pub fn tasks_by_operator(&self, operator: &Address) -> Vec<Task> {
        self.by_operator
            .get(operator)
            .map(|ids| self.get_tasks(ids))
            .unwrap_or_default()
    }

    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_exists(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn task_count(&self) -> u64 {
        self.tasks.len() as u64
    }

    // ─────────────────────────────────────────────────────────
    // Internal helpers
    // ─────────────────────────────────────────────────────────

    /// Returns the id for the task being created and advances the counter.
    fn next_task_id(&mut self) -> TaskId {
        let current = self.next_id;
        self.next_id += 1;
        current
    }

    fn transition(
        &mut self,
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        now: Timestamp,
    ) -> Result<()> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or_else(|| Error::task_not_found(id))?;
        if task.status != from {
            return Err(Error::State(format!(
                "task {id} is {}, expected {from}",
                task.status
            )));
        }
        debug_assert!(from.can_transition_to(to));
        task.status = to;
        task.updated_at = now;
        Ok(())
    }
}
