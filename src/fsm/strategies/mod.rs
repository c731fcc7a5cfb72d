//! Built-in strategies
//!
//! - invoice `simple`: aggregates its child transactions
//! - transaction `internal`: balance engine only
//! - transaction `card`: external provider round trips through `*_wait`

pub mod invoice;
pub mod transaction;

use tracing::debug;

use crate::ledger::{
    Invoice, InvoiceId, InvoiceStatus, LedgerError, Transaction, TransactionId, TransactionStatus,
};
use crate::store::{LedgerTx, QueueMessage};

/// Child holds funds, waiting for the parent decision
pub(crate) fn is_holding(transaction: &Transaction) -> bool {
    matches!(
        transaction.status,
        TransactionStatus::Auth | TransactionStatus::Hold
    )
}

/// Child authorized: holding or already settled
pub(crate) fn is_authorized(transaction: &Transaction) -> bool {
    is_holding(transaction) || transaction.status == TransactionStatus::Accepted
}

pub(crate) fn is_declined(transaction: &Transaction) -> bool {
    matches!(
        transaction.status,
        TransactionStatus::Rejected | TransactionStatus::Failed
    )
}

/// Status an `auth` invoice should move to given its children, if any:
/// any child declined → `rejected`, every child settled → `accepted`,
/// every child authorized with some still holding → `wait`.
pub(crate) fn aggregate(children: &[Transaction]) -> Option<InvoiceStatus> {
    if children.is_empty() {
        None
    } else if children.iter().any(is_declined) {
        Some(InvoiceStatus::Rejected)
    } else if children
        .iter()
        .all(|t| t.status == TransactionStatus::Accepted)
    {
        Some(InvoiceStatus::Accepted)
    } else if children.iter().all(is_authorized) {
        Some(InvoiceStatus::Wait)
    } else {
        None
    }
}

/// Lock the transaction and check it is still where the dispatcher saw it
pub(crate) async fn lock_transaction(
    tx: &mut dyn LedgerTx,
    snapshot: &Transaction,
) -> Result<Transaction, LedgerError> {
    let current = tx.lock_transaction(snapshot.transaction_id).await?;
    if current.strategy != snapshot.strategy {
        return Err(LedgerError::StrategyMismatch {
            expected: snapshot.strategy.clone(),
            actual: current.strategy,
        });
    }
    if current.status != snapshot.status {
        return Err(LedgerError::unexpected_status(snapshot.status, current.status));
    }
    Ok(current)
}

/// Lock the invoice and check it is still where the dispatcher saw it
pub(crate) async fn lock_invoice(
    tx: &mut dyn LedgerTx,
    snapshot: &Invoice,
) -> Result<Invoice, LedgerError> {
    let current = tx.lock_invoice(snapshot.invoice_id).await?;
    if current.strategy != snapshot.strategy {
        return Err(LedgerError::StrategyMismatch {
            expected: snapshot.strategy.clone(),
            actual: current.strategy,
        });
    }
    if current.status != snapshot.status {
        return Err(LedgerError::unexpected_status(snapshot.status, current.status));
    }
    Ok(current)
}

/// Re-trigger the parent invoice after a child transition, through the
/// outbox of the child's db tx.
///
/// - invoice `auth`: ask for the aggregate of all children, this one included
/// - invoice `wait` with `next_status`: ask for that status again
/// - invoice already `rejected`: a child still holding funds is told to
///   release them
pub(crate) async fn notify_invoice(
    tx: &mut dyn LedgerTx,
    transaction: &Transaction,
) -> Result<(), LedgerError> {
    let invoice = tx.lock_invoice(transaction.invoice_id).await?;
    let target = match (invoice.status, invoice.next_status) {
        (InvoiceStatus::Auth, _) => {
            let children = tx.list_transactions(invoice.invoice_id).await?;
            aggregate(&children)
        }
        (InvoiceStatus::Wait, Some(next)) => Some(next),
        (InvoiceStatus::Rejected, _) if is_holding(transaction) => {
            tx.enqueue(&QueueMessage::transaction(
                transaction,
                TransactionStatus::Rejected,
            ))
            .await?;
            None
        }
        _ => None,
    };

    if let Some(target) = target {
        tx.enqueue(&QueueMessage::invoice(&invoice, target)).await?;
        debug!(
            invoice_id = %invoice.invoice_id,
            transaction_id = %transaction.transaction_id,
            target = %target,
            "Invoice re-triggered"
        );
    }
    Ok(())
}

/// Fan a transaction target out to children, skipping the rest
pub(crate) async fn fan_out(
    tx: &mut dyn LedgerTx,
    invoice_id: InvoiceId,
    children: &[Transaction],
    filter: fn(&Transaction) -> bool,
    target: TransactionStatus,
) -> Result<Vec<TransactionId>, LedgerError> {
    let mut sent = Vec::new();
    for child in children.iter().filter(|t| filter(t)) {
        tx.enqueue(&QueueMessage::transaction(child, target)).await?;
        sent.push(child.transaction_id);
    }
    debug!(invoice_id = %invoice_id, target = %target, children = sent.len(), "Fan-out");
    Ok(sent)
}
