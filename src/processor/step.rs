//! Balance steps inside one database transaction
//!
//! Shared by the Transaction Processor and the strategy handlers. Every path
//! that touches operations goes through `apply_balance_step`, which locks
//! them in ascending operation id order.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::ledger::{
    BalanceDeltas, BalanceEngine, LedgerError, Operation, OperationStatus, TRANSACTION_CHART,
    Transaction, TransactionId, TransactionStatus,
};
use crate::store::{LedgerTx, Store};

/// Result of one balance step
#[derive(Debug)]
pub struct StepOutcome {
    /// Operations with their new statuses, ascending id
    pub operations: Vec<Operation>,
    pub deltas: BalanceDeltas,
}

impl StepOutcome {
    /// Every operation settled (vacuously true for none)
    pub fn all_accepted(&self) -> bool {
        self.operations
            .iter()
            .all(|op| op.status == OperationStatus::Accepted)
    }
}

/// Lock operations, run the engine for `target`, persist operation statuses
/// and balance deltas.
///
/// `settle_holds` runs a second `accepted` pass over the operations the
/// first pass left in `hold` (auth and capture in a single step).
pub async fn apply_balance_step(
    tx: &mut dyn LedgerTx,
    transaction_id: TransactionId,
    target: TransactionStatus,
    settle_holds: bool,
) -> Result<StepOutcome, LedgerError> {
    let mut operations = tx.lock_operations(transaction_id).await?;
    let mut engine = BalanceEngine::new();
    engine.process_all(&mut operations, target)?;
    if settle_holds {
        for op in operations
            .iter_mut()
            .filter(|op| op.status == OperationStatus::Hold)
        {
            engine.process(op, TransactionStatus::Accepted)?;
        }
    }

    for op in &operations {
        tx.update_operation_status(op.operation_id, op.status).await?;
    }

    let deltas = engine.into_deltas();
    apply_deltas(tx, &deltas).await?;

    debug!(
        transaction_id = %transaction_id,
        target = %target,
        operations = operations.len(),
        accounts = deltas.touched_accounts().len(),
        "Balance step applied"
    );
    Ok(StepOutcome { operations, deltas })
}

/// Write deltas account by account in ascending id order, skipping zero
/// deltas. A counter pushed below zero by a debit fails the step.
pub async fn apply_deltas(tx: &mut dyn LedgerTx, deltas: &BalanceDeltas) -> Result<(), LedgerError> {
    for account in deltas.touched_accounts() {
        let delta = deltas.balance_of(account);
        if delta != 0 {
            let balance = tx.add_balance(account, delta).await?;
            if delta < 0 && balance < 0 {
                return Err(LedgerError::InsufficientBalance(account));
            }
        }

        let delta = deltas.accepted_of(account);
        if delta != 0 {
            let accepted = tx.add_balance_accepted(account, delta).await?;
            if delta < 0 && accepted < 0 {
                return Err(LedgerError::InsufficientBalance(account));
            }
        }
    }
    Ok(())
}

/// Whether a failed `expected → requested` attempt may end in `failed`:
/// directly, or through the requested status.
pub fn can_mark_failed(expected: TransactionStatus, requested: TransactionStatus) -> bool {
    TRANSACTION_CHART.allowed(expected, TransactionStatus::Failed)
        || (TRANSACTION_CHART.allowed(expected, requested)
            && TRANSACTION_CHART.allowed(requested, TransactionStatus::Failed))
}

/// Move a transaction to `failed` in its own database transaction, guarded
/// by the same optimistic version as the failed attempt.
///
/// Returns `None` when the chart does not allow it.
pub async fn mark_failed(
    store: &dyn Store,
    transaction_id: TransactionId,
    expected_status: TransactionStatus,
    expected_updated_at: DateTime<Utc>,
    requested: TransactionStatus,
) -> Result<Option<Transaction>, LedgerError> {
    if !can_mark_failed(expected_status, requested) {
        return Ok(None);
    }

    let mut tx = store.begin().await?;
    let mut transaction = tx
        .claim_transaction(
            transaction_id,
            expected_status,
            expected_updated_at,
            TransactionStatus::Failed,
        )
        .await?;
    transaction.status = TransactionStatus::Failed;
    transaction.next_status = None;
    let transaction = tx.update_transaction(&transaction).await?;
    tx.commit().await?;

    warn!(transaction_id = %transaction_id, from = %expected_status, "Transaction marked failed");
    Ok(Some(transaction))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_mark_failed() {
        use TransactionStatus::*;
        assert!(can_mark_failed(Draft, Auth));
        assert!(can_mark_failed(Auth, Accepted));
        assert!(!can_mark_failed(Draft, Accepted));
        assert!(!can_mark_failed(Accepted, Rejected));
        assert!(!can_mark_failed(Hold, Accepted));
    }
}
