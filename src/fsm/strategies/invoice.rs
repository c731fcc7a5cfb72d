//! Invoice strategy `simple`
//!
//! ```text
//! draft ──► auth ──► wait ──► accepted
//!            │  │      └────► rejected
//!            │  └───────────► accepted   (every child settled)
//!            └──────────────► rejected   (any child declined)
//! ```
//!
//! Aggregate transitions are re-fired by every child transition; a call whose
//! children don't match yet writes nothing.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{aggregate, fan_out, is_holding, lock_invoice};
use crate::fsm::{StateMachine, TransitionHandler};
use crate::ledger::{
    INVOICE_CHART, Invoice, InvoiceStatus, LedgerError, Transaction, TransactionStatus,
};
use crate::store::Store;

pub const SIMPLE: &str = "simple";

pub fn simple() -> StateMachine<Invoice> {
    use InvoiceStatus::*;
    StateMachine::new(SIMPLE)
        .on(Draft, Auth, Authorize)
        .on(Auth, Wait, Aggregate)
        .on(Auth, Accepted, Aggregate)
        .on(Auth, Rejected, Aggregate)
        .on(Wait, Accepted, Settle)
        .on(Wait, Rejected, Settle)
}

/// `draft → auth`: fan `auth` out to every draft child
struct Authorize;

#[async_trait]
impl TransitionHandler<Invoice> for Authorize {
    async fn handle(
        &self,
        store: &dyn Store,
        snapshot: &Invoice,
        target: InvoiceStatus,
    ) -> Result<(), LedgerError> {
        let mut tx = store.begin().await?;
        let mut invoice = lock_invoice(tx.as_mut(), snapshot).await?;
        let children = tx.list_transactions(invoice.invoice_id).await?;
        if children.is_empty() {
            return Err(LedgerError::EmptyInvoice(invoice.invoice_id));
        }

        let sent = fan_out(
            tx.as_mut(),
            invoice.invoice_id,
            &children,
            |t| t.status == TransactionStatus::Draft,
            TransactionStatus::Auth,
        )
        .await?;

        invoice.status = target;
        invoice.next_status = None;
        let invoice = tx.update_invoice(&invoice).await?;
        tx.commit().await?;

        info!(
            invoice_id = %invoice.invoice_id,
            status = %invoice.status,
            children = sent.len(),
            "Invoice authorizing"
        );
        Ok(())
    }
}

/// `auth → wait | accepted | rejected`, once the children agree
struct Aggregate;

impl Aggregate {
    fn ready(target: InvoiceStatus, children: &[Transaction]) -> bool {
        aggregate(children) == Some(target)
    }
}

#[async_trait]
impl TransitionHandler<Invoice> for Aggregate {
    async fn handle(
        &self,
        store: &dyn Store,
        snapshot: &Invoice,
        target: InvoiceStatus,
    ) -> Result<(), LedgerError> {
        let mut tx = store.begin().await?;
        let mut invoice = lock_invoice(tx.as_mut(), snapshot).await?;
        INVOICE_CHART.ensure(invoice.status, target)?;
        let children = tx.list_transactions(invoice.invoice_id).await?;
        if !Self::ready(target, &children) {
            debug!(
                invoice_id = %invoice.invoice_id,
                target = %target,
                "Children not there yet"
            );
            return Ok(());
        }

        if target == InvoiceStatus::Rejected {
            // siblings that already hold funds must release them
            fan_out(
                tx.as_mut(),
                invoice.invoice_id,
                &children,
                is_holding,
                TransactionStatus::Rejected,
            )
            .await?;
        }

        invoice.status = target;
        invoice.next_status = None;
        let invoice = tx.update_invoice(&invoice).await?;
        tx.commit().await?;

        info!(invoice_id = %invoice.invoice_id, status = %invoice.status, "Invoice transitioned");
        Ok(())
    }
}

/// `wait → accepted | rejected`
///
/// First call records `next_status` and fans the decision out to holding
/// children. Completes once every child reached a matching terminal status.
struct Settle;

#[async_trait]
impl TransitionHandler<Invoice> for Settle {
    async fn handle(
        &self,
        store: &dyn Store,
        snapshot: &Invoice,
        target: InvoiceStatus,
    ) -> Result<(), LedgerError> {
        let mut tx = store.begin().await?;
        let mut invoice = lock_invoice(tx.as_mut(), snapshot).await?;
        INVOICE_CHART.ensure(invoice.status, target)?;
        let children = tx.list_transactions(invoice.invoice_id).await?;

        let done = match target {
            InvoiceStatus::Accepted => children
                .iter()
                .all(|t| t.status == TransactionStatus::Accepted),
            _ => children.iter().all(|t| t.status.is_terminal()),
        };

        if done {
            invoice.status = target;
            invoice.next_status = None;
            let invoice = tx.update_invoice(&invoice).await?;
            tx.commit().await?;
            info!(invoice_id = %invoice.invoice_id, status = %invoice.status, "Invoice settled");
            return Ok(());
        }

        match invoice.next_status {
            None => {
                let child_target = match target {
                    InvoiceStatus::Accepted => TransactionStatus::Accepted,
                    _ => TransactionStatus::Rejected,
                };
                invoice.next_status = Some(target);
                tx.update_invoice(&invoice).await?;
                let sent = fan_out(
                    tx.as_mut(),
                    invoice.invoice_id,
                    &children,
                    is_holding,
                    child_target,
                )
                .await?;
                tx.commit().await?;
                info!(
                    invoice_id = %invoice.invoice_id,
                    next_status = %target,
                    children = sent.len(),
                    "Invoice settling"
                );
                Ok(())
            }
            Some(next) if next == target => {
                debug!(invoice_id = %invoice.invoice_id, target = %target, "Still settling");
                Ok(())
            }
            Some(next) => {
                warn!(
                    invoice_id = %invoice.invoice_id,
                    next_status = %next,
                    requested = %target,
                    "Invoice already settling the other way"
                );
                Err(LedgerError::unexpected_status(next, target))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InvoiceId, Provider, TransactionId, db_now};

    fn child(status: TransactionStatus) -> Transaction {
        let now = db_now();
        Transaction {
            transaction_id: TransactionId(1),
            invoice_id: InvoiceId(1),
            amount: 1,
            strategy: "internal".to_string(),
            provider: Provider::Internal,
            provider_oper_id: None,
            provider_oper_status: None,
            provider_oper_url: None,
            status,
            next_status: None,
            meta: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_simple_table() {
        let machine = simple();
        assert_eq!(machine.name(), SIMPLE);
        assert_eq!(machine.transitions().len(), 6);
        assert!(!machine.handles(InvoiceStatus::Draft, InvoiceStatus::ManualAccepted));
    }

    #[test]
    fn test_aggregate_readiness() {
        use TransactionStatus::*;
        let wait = [child(Hold), child(Accepted)];
        assert!(Aggregate::ready(InvoiceStatus::Wait, &wait));
        assert!(!Aggregate::ready(InvoiceStatus::Accepted, &wait));

        let settled = [child(Accepted), child(Accepted)];
        assert!(!Aggregate::ready(InvoiceStatus::Wait, &settled));
        assert!(Aggregate::ready(InvoiceStatus::Accepted, &settled));

        let pending = [child(Auth), child(AuthWait)];
        assert!(!Aggregate::ready(InvoiceStatus::Wait, &pending));

        let declined = [child(Auth), child(Failed)];
        assert!(Aggregate::ready(InvoiceStatus::Rejected, &declined));
        assert!(!Aggregate::ready(InvoiceStatus::Accepted, &[]));
    }
}
