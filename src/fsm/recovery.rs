//! Recovery Worker
//!
//! Background worker that re-publishes the work stuck entities were driving.
//! An entity is stuck when its `next_status` is set and it has not been
//! written for longer than the stale threshold. Transactions waiting on a
//! `pending` provider answer are not stuck.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::strategies::is_holding;
use crate::ledger::{Invoice, InvoiceStatus, LedgerError, Transaction, TransactionStatus, db_now};
use crate::provider::awaits_callback;
use crate::shutdown::ShutdownSignal;
use crate::store::{QueueMessage, Store};

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan for stale entities
    pub scan_interval: Duration,
    /// How long an entity must be untouched to be considered stale
    pub stale_threshold: Duration,
    /// Maximum entities of each kind per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

pub struct RecoveryWorker {
    store: Arc<dyn Store>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(store: Arc<dyn Store>, config: WorkerConfig) -> Self {
        Self { store, config }
    }

    pub fn with_defaults(store: Arc<dyn Store>) -> Self {
        Self::new(store, WorkerConfig::default())
    }

    /// Run until shutdown, scanning every `scan_interval`
    pub async fn run(&self, shutdown: Arc<ShutdownSignal>) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Starting recovery worker"
        );

        loop {
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }
            if shutdown.sleep(self.config.scan_interval).await {
                break;
            }
        }
        info!("Recovery worker stopped");
    }

    /// Run a single scan. Returns the number of messages re-published.
    pub async fn scan_and_recover(&self) -> Result<usize, LedgerError> {
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .map_err(|e| LedgerError::Serialization(e.to_string()))?;
        let older_than = db_now() - threshold;

        let transactions = self
            .store
            .find_stale_transactions(older_than, self.config.batch_size)
            .await?;
        let invoices = self
            .store
            .find_stale_invoices(older_than, self.config.batch_size)
            .await?;

        if transactions.is_empty() && invoices.is_empty() {
            debug!("No stale entities found");
            return Ok(0);
        }
        info!(
            transactions = transactions.len(),
            invoices = invoices.len(),
            "Found stale entities to recover"
        );

        let mut published = 0;
        for transaction in &transactions {
            match self.recover_transaction(transaction).await {
                Ok(true) => published += 1,
                Ok(false) => {}
                Err(e) => error!(
                    transaction_id = %transaction.transaction_id,
                    error = %e,
                    "Failed to recover transaction"
                ),
            }
        }
        for invoice in &invoices {
            match self.recover_invoice(invoice).await {
                Ok(count) => published += count,
                Err(e) => error!(
                    invoice_id = %invoice.invoice_id,
                    error = %e,
                    "Failed to recover invoice"
                ),
            }
        }

        if published > 0 {
            info!(count = published, "Recovery messages published");
        }
        Ok(published)
    }

    /// Re-publish through the outbox and bump `updated_at` in the same db tx,
    /// so one stuck entity yields at most one message per stale threshold.
    async fn recover_transaction(&self, snapshot: &Transaction) -> Result<bool, LedgerError> {
        let mut tx = self.store.begin().await?;
        let transaction = tx.lock_transaction(snapshot.transaction_id).await?;
        if transaction.updated_at != snapshot.updated_at || awaits_callback(&transaction) {
            debug!(transaction_id = %transaction.transaction_id, "Transaction moved on, not recovering");
            return Ok(false);
        }
        let Some(next) = transaction.next_status else {
            return Ok(false);
        };

        let message = match transaction.status {
            TransactionStatus::AuthWait => QueueMessage::provider(&transaction, TransactionStatus::Auth),
            TransactionStatus::AcceptedWait => {
                QueueMessage::provider(&transaction, TransactionStatus::Accepted)
            }
            TransactionStatus::RejectedWait => {
                QueueMessage::provider(&transaction, TransactionStatus::Rejected)
            }
            _ => QueueMessage::transaction(&transaction, next),
        };

        tx.update_transaction(&transaction).await?;
        tx.enqueue(&message).await?;
        tx.commit().await?;

        debug!(
            transaction_id = %transaction.transaction_id,
            status = %transaction.status,
            topic = %message.topic,
            target = %message.payload.target,
            "Recovering transaction"
        );
        Ok(true)
    }

    /// Re-publish the invoice decision and the fan-out to children still
    /// holding funds
    async fn recover_invoice(&self, snapshot: &Invoice) -> Result<usize, LedgerError> {
        let mut tx = self.store.begin().await?;
        let invoice = tx.lock_invoice(snapshot.invoice_id).await?;
        if invoice.updated_at != snapshot.updated_at {
            debug!(invoice_id = %invoice.invoice_id, "Invoice moved on, not recovering");
            return Ok(0);
        }
        let Some(next) = invoice.next_status else {
            return Ok(0);
        };

        let child_target = match next {
            InvoiceStatus::Accepted => Some(TransactionStatus::Accepted),
            InvoiceStatus::Rejected => Some(TransactionStatus::Rejected),
            _ => None,
        };

        let mut published = 0;
        if let Some(child_target) = child_target {
            for child in tx.list_transactions(invoice.invoice_id).await? {
                if is_holding(&child) {
                    tx.enqueue(&QueueMessage::transaction(&child, child_target))
                        .await?;
                    published += 1;
                }
            }
        }
        tx.enqueue(&QueueMessage::invoice(&invoice, next)).await?;
        published += 1;
        tx.update_invoice(&invoice).await?;
        tx.commit().await?;

        debug!(invoice_id = %invoice.invoice_id, next_status = %next, published, "Recovering invoice");
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.scan_interval, Duration::from_secs(30));
        assert_eq!(config.stale_threshold, Duration::from_secs(60));
        assert_eq!(config.batch_size, 100);
    }
}
