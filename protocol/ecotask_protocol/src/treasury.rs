//! Settlement ledger: where value goes when it leaves escrow or collateral.
//!
//! Inbound value (contributions, stake deposits) arrives through wallet
//! plumbing outside the protocol. Outbound value is either credited to an
//! identity or retained by the treasury sink. The [`Treasury`] only keeps the
//! running balances; the itemised [`Transfer`] history is carried by the
//! events that moved the value and is rebuilt from them with
//! [`RecordedEvent::transfers`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::events::{ProtocolEvent, RecordedEvent};
use crate::types::{Address, TaskId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferReason {
    WithdrawalPenalty,
    WithdrawalRefund,
    PlatformFee,
    OperatorPayment,
    Refund,
    StakeSlashed,
    StakeWithdrawn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Treasury,
    Account(Address),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub task_id: Option<TaskId>,
    pub to: Recipient,
    pub amount: i128,
    pub reason: TransferReason,
    pub at: Timestamp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Treasury {
    balance: i128,
    credits: BTreeMap<Address, i128>,
}

impl Treasury {
    pub(crate) fn pay(&mut self, to: &Address, amount: i128) {
        if amount <= 0 {
            return;
        }
        let credited = self.credits.entry(to.clone()).or_insert(0);
        *credited = credited.saturating_add(amount);
    }

    pub(crate) fn collect(&mut self, amount: i128) {
        if amount <= 0 {
            return;
        }
        self.balance = self.balance.saturating_add(amount);
    }

    /// Fees, penalties and slashed stake retained so far.
    pub fn balance(&self) -> i128 {
        self.balance
    }

    /// Everything paid out to `address` so far.
    pub fn credited(&self, address: &Address) -> i128 {
        self.credits.get(address).copied().unwrap_or(0)
    }
}

impl RecordedEvent {
    /// Value movements caused by this event, in the order they were applied.
    pub fn transfers(&self) -> Vec<Transfer> {
        let at = self.timestamp;
        let transfer = |task_id, to, amount, reason| Transfer {
            task_id,
            to,
            amount,
            reason,
            at,
        };
        let mut transfers = match &self.event {
            ProtocolEvent::FundingWithdrawn {
                task_id,
                funder,
                refunded,
                penalty,
            } => vec![
                transfer(
                    Some(*task_id),
                    Recipient::Treasury,
                    *penalty,
                    TransferReason::WithdrawalPenalty,
                ),
                transfer(
                    Some(*task_id),
                    Recipient::Account(funder.clone()),
                    *refunded,
                    TransferReason::WithdrawalRefund,
                ),
            ],
            ProtocolEvent::PaymentReleased {
                task_id,
                operator,
                amount,
                fee,
            } => vec![
                transfer(
                    Some(*task_id),
                    Recipient::Treasury,
                    *fee,
                    TransferReason::PlatformFee,
                ),
                transfer(
                    Some(*task_id),
                    Recipient::Account(operator.clone()),
                    *amount,
                    TransferReason::OperatorPayment,
                ),
            ],
            ProtocolEvent::RefundClaimed {
                task_id,
                funder,
                amount,
            } => vec![transfer(
                Some(*task_id),
                Recipient::Account(funder.clone()),
                *amount,
                TransferReason::Refund,
            )],
            ProtocolEvent::StakeSlashed {
                task_id, slashed, ..
            } => vec![transfer(
                Some(*task_id),
                Recipient::Treasury,
                *slashed,
                TransferReason::StakeSlashed,
            )],
            ProtocolEvent::StakeWithdrawn {
                operator, amount, ..
            } => vec![transfer(
                None,
                Recipient::Account(operator.clone()),
                *amount,
                TransferReason::StakeWithdrawn,
            )],
            _ => Vec::new(),
        };
        transfers.retain(|t| t.amount > 0);
        transfers
    }
}
