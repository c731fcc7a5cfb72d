//! Balance Engine
//!
//! Pure accounting: turns a batch of operations plus a requested transaction
//! status into per-account deltas on `balance` and `balance_accepted`, and
//! advances each operation's status. Persistence belongs to the caller.
//!
//! | strategy        | hold | auth                    | accepted (from hold)            | rejected (from hold) |
//! |-----------------|------|-------------------------|---------------------------------|----------------------|
//! | simple_transfer | no   | src -/-A, dst +/+A      |                                 |                      |
//! | simple_transfer | yes  | src -, hold +           | src -A, dst +/+A, hold -        | src +, hold -        |
//! | recharge        | no   | src +/+A, dst +/+A      |                                 |                      |
//! | recharge        | yes  | hold +                  | src +/+A, dst +/+A, hold -      | hold -               |
//! | withdraw        | no   | src -/-A, dst -/-A      |                                 |                      |
//! | withdraw        | yes  | src -, hold +           | src -A, dst -/-A, hold -        | src +, hold -        |

use std::collections::BTreeMap;

use super::chart::OPERATION_CHART;
use super::error::LedgerError;
use super::models::Operation;
use super::status::{OperationStatus, OperationStrategy, TransactionStatus};
use super::types::{AccountId, Amount};

/// Cumulative per-account deltas of one batch
///
/// BTreeMap keeps accounts in ascending id order, which is the order they
/// must be locked and written in.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BalanceDeltas {
    pub balance: BTreeMap<AccountId, Amount>,
    pub accepted: BTreeMap<AccountId, Amount>,
}

impl BalanceDeltas {
    fn add_balance(&mut self, account: AccountId, delta: Amount) -> Result<(), LedgerError> {
        Self::accumulate(&mut self.balance, account, delta)
    }

    fn add_accepted(&mut self, account: AccountId, delta: Amount) -> Result<(), LedgerError> {
        Self::accumulate(&mut self.accepted, account, delta)
    }

    fn add_both(&mut self, account: AccountId, delta: Amount) -> Result<(), LedgerError> {
        self.add_balance(account, delta)?;
        self.add_accepted(account, delta)
    }

    fn accumulate(
        map: &mut BTreeMap<AccountId, Amount>,
        account: AccountId,
        delta: Amount,
    ) -> Result<(), LedgerError> {
        let entry = map.entry(account).or_insert(0);
        *entry = entry.checked_add(delta).ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    /// Balance delta for an account (0 if untouched)
    pub fn balance_of(&self, account: AccountId) -> Amount {
        self.balance.get(&account).copied().unwrap_or(0)
    }

    /// Accepted-balance delta for an account (0 if untouched)
    pub fn accepted_of(&self, account: AccountId) -> Amount {
        self.accepted.get(&account).copied().unwrap_or(0)
    }

    /// Accounts with a non-zero delta on either counter, ascending
    pub fn touched_accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<AccountId> = self
            .balance
            .iter()
            .chain(self.accepted.iter())
            .filter(|(_, delta)| **delta != 0)
            .map(|(account, _)| *account)
            .collect();
        accounts.sort_unstable();
        accounts.dedup();
        accounts
    }

    /// True if applying these deltas is a no-op
    pub fn is_empty(&self) -> bool {
        self.touched_accounts().is_empty()
    }

    /// Sum of all balance deltas
    pub fn balance_sum(&self) -> i128 {
        self.balance.values().map(|v| *v as i128).sum()
    }
}

/// Low-level transfer strategy
#[derive(Debug, Default)]
pub struct BalanceEngine {
    deltas: BalanceDeltas,
    frozen: bool,
}

impl BalanceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounting only: operation statuses are left untouched for callers that
    /// set them after an external round trip.
    pub fn status_frozen() -> Self {
        Self {
            deltas: BalanceDeltas::default(),
            frozen: true,
        }
    }

    pub fn deltas(&self) -> &BalanceDeltas {
        &self.deltas
    }

    pub fn into_deltas(self) -> BalanceDeltas {
        self.deltas
    }

    /// Process a batch sequentially, accumulating deltas. Stops at the first
    /// failing operation; the caller discards the whole batch.
    pub fn process_all(
        &mut self,
        operations: &mut [Operation],
        target: TransactionStatus,
    ) -> Result<(), LedgerError> {
        for op in operations.iter_mut() {
            self.process(op, target)?;
        }
        Ok(())
    }

    /// Apply one operation's effect for the requested transaction status.
    pub fn process(
        &mut self,
        op: &mut Operation,
        target: TransactionStatus,
    ) -> Result<(), LedgerError> {
        let required = match target {
            TransactionStatus::Auth => OperationStatus::Draft,
            TransactionStatus::Accepted | TransactionStatus::Rejected => OperationStatus::Hold,
            other => return Err(LedgerError::TargetNotAllowed(other.to_string())),
        };
        if op.status != required {
            return Err(LedgerError::OperationNotInAllowedStatus {
                operation_id: op.operation_id,
                status: op.status.to_string(),
            });
        }

        let next = match target {
            TransactionStatus::Auth if op.hold => OperationStatus::Hold,
            TransactionStatus::Rejected => OperationStatus::Rejected,
            _ => OperationStatus::Accepted,
        };
        if !self.frozen {
            OPERATION_CHART.ensure(op.status, next)?;
        }

        self.apply_effect(op, target)?;

        if !self.frozen {
            op.status = next;
        }
        Ok(())
    }

    fn apply_effect(&mut self, op: &Operation, target: TransactionStatus) -> Result<(), LedgerError> {
        use OperationStrategy::*;
        use TransactionStatus::{Accepted, Auth, Rejected};

        let amt = op.amount;
        let (src, dst) = (op.src_account_id, op.dst_account_id);
        let d = &mut self.deltas;

        match (op.strategy, op.hold, target) {
            (SimpleTransfer, false, Auth) => {
                d.add_both(src, -amt)?;
                d.add_both(dst, amt)?;
            }
            (SimpleTransfer, true, Auth) => {
                d.add_balance(src, -amt)?;
                d.add_balance(op.hold_account()?, amt)?;
            }
            (SimpleTransfer, true, Accepted) => {
                d.add_accepted(src, -amt)?;
                d.add_both(dst, amt)?;
                d.add_balance(op.hold_account()?, -amt)?;
            }
            (SimpleTransfer, true, Rejected) => {
                d.add_balance(src, amt)?;
                d.add_balance(op.hold_account()?, -amt)?;
            }

            (Recharge, false, Auth) => {
                d.add_both(src, amt)?;
                d.add_both(dst, amt)?;
            }
            (Recharge, true, Auth) => {
                d.add_balance(op.hold_account()?, amt)?;
            }
            (Recharge, true, Accepted) => {
                d.add_both(src, amt)?;
                d.add_both(dst, amt)?;
                d.add_balance(op.hold_account()?, -amt)?;
            }
            (Recharge, true, Rejected) => {
                d.add_balance(op.hold_account()?, -amt)?;
            }

            (Withdraw, false, Auth) => {
                d.add_both(src, -amt)?;
                d.add_both(dst, -amt)?;
            }
            (Withdraw, true, Auth) => {
                d.add_balance(src, -amt)?;
                d.add_balance(op.hold_account()?, amt)?;
            }
            (Withdraw, true, Accepted) => {
                d.add_accepted(src, -amt)?;
                d.add_both(dst, -amt)?;
                d.add_balance(op.hold_account()?, -amt)?;
            }
            (Withdraw, true, Rejected) => {
                d.add_balance(src, amt)?;
                d.add_balance(op.hold_account()?, -amt)?;
            }

            (strategy, _, target) => {
                return Err(LedgerError::UnsupportedPair {
                    strategy: strategy.to_string(),
                    target: target.to_string(),
                });
            }
        }
        Ok(())
    }
}
