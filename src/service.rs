//! Ledger Service
//!
//! Entry points consumed by an API layer. Creation calls validate and write
//! directly; lifecycle calls go through the dispatcher, or through the
//! transaction processor for `submit_transition`.

use std::sync::Arc;
use tracing::info;

use crate::fsm::{Dispatcher, StrategyRegistry};
use crate::ledger::{
    Account, AccountId, Currency, Invoice, InvoiceId, InvoiceStatus, LedgerError, Meta,
    NewAccount, NewInvoice, NewTransaction, Operation, Transaction, TransactionId,
    TransactionStatus, normalize_key,
};
use crate::processor::{TransactionProcessor, TransitionRequest};
use crate::provider::ProviderOperStatus;
use crate::store::{DeadLetter, Store};

pub struct LedgerService {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    processor: Arc<TransactionProcessor>,
}

impl LedgerService {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<Dispatcher>,
        processor: Arc<TransactionProcessor>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            processor,
        }
    }

    fn registry(&self) -> &StrategyRegistry {
        self.dispatcher.registry()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn processor(&self) -> &Arc<TransactionProcessor> {
        &self.processor
    }

    // ============================================================
    // CREATION
    // ============================================================

    pub async fn upsert_currency(&self, key: &str, meta: Option<Meta>) -> Result<Currency, LedgerError> {
        let key = normalize_key(key);
        if key.is_empty() {
            return Err(LedgerError::EmptyKey);
        }
        let currency = self.store.upsert_currency(&key, meta).await?;
        info!(currency_id = %currency.currency_id, key = %currency.key, "Currency upserted");
        Ok(currency)
    }

    pub async fn create_account(&self, mut new: NewAccount) -> Result<Account, LedgerError> {
        new.validate()?;
        let account = self.store.create_account(&new).await?;
        info!(
            account_id = %account.account_id,
            currency_id = %account.currency_id,
            key = %account.key,
            "Account created"
        );
        Ok(account)
    }

    pub async fn new_invoice(&self, mut new: NewInvoice) -> Result<Invoice, LedgerError> {
        new.validate()?;
        self.registry().invoice(&new.strategy)?;
        let invoice = self.store.create_invoice(&new).await?;
        info!(invoice_id = %invoice.invoice_id, strategy = %invoice.strategy, "Invoice created");
        Ok(invoice)
    }

    /// Insert a draft transaction with its operations and grow the invoice
    /// total, atomically.
    pub async fn add_transaction_to_invoice(
        &self,
        invoice_id: InvoiceId,
        new: NewTransaction,
    ) -> Result<(Transaction, Vec<Operation>), LedgerError> {
        new.validate()?;
        self.registry().transaction(&new.strategy)?;

        let mut tx = self.store.begin().await?;
        let mut invoice = tx.lock_invoice(invoice_id).await?;
        if invoice.status != InvoiceStatus::Draft {
            return Err(LedgerError::InvoiceNotDraft(invoice_id));
        }

        let mut currency = None;
        for account_id in new.operations.iter().flat_map(|op| op.accounts()) {
            let account = tx
                .get_account(account_id)
                .await?
                .ok_or(LedgerError::AccountNotFound(account_id))?;
            match currency {
                None => currency = Some(account.currency_id),
                Some(currency_id) if currency_id != account.currency_id => {
                    return Err(LedgerError::CurrencyMismatch);
                }
                Some(_) => {}
            }
        }

        let transaction = tx.insert_transaction(invoice_id, &new).await?;
        let mut operations = Vec::with_capacity(new.operations.len());
        for op in &new.operations {
            operations.push(tx.insert_operation(&transaction, op).await?);
        }
        invoice.total_amount = invoice
            .total_amount
            .checked_add(new.amount)
            .ok_or(LedgerError::Overflow)?;
        tx.update_invoice(&invoice).await?;
        tx.commit().await?;

        info!(
            invoice_id = %invoice_id,
            transaction_id = %transaction.transaction_id,
            strategy = %transaction.strategy,
            amount = transaction.amount,
            operations = operations.len(),
            "Transaction added to invoice"
        );
        Ok((transaction, operations))
    }

    // ============================================================
    // LIFECYCLE
    // ============================================================

    pub async fn auth_invoice(&self, id: InvoiceId) -> Result<(), LedgerError> {
        self.dispatcher.dispatch_invoice(id, InvoiceStatus::Auth).await
    }

    pub async fn accept_invoice(&self, id: InvoiceId) -> Result<(), LedgerError> {
        self.dispatcher
            .dispatch_invoice(id, InvoiceStatus::Accepted)
            .await
    }

    pub async fn reject_invoice(&self, id: InvoiceId) -> Result<(), LedgerError> {
        self.dispatcher
            .dispatch_invoice(id, InvoiceStatus::Rejected)
            .await
    }

    pub async fn auth_transaction(&self, id: TransactionId) -> Result<(), LedgerError> {
        self.dispatcher
            .dispatch_transaction(id, TransactionStatus::Auth)
            .await
    }

    pub async fn accept_transaction(&self, id: TransactionId) -> Result<(), LedgerError> {
        self.dispatcher
            .dispatch_transaction(id, TransactionStatus::Accepted)
            .await
    }

    pub async fn reject_transaction(&self, id: TransactionId) -> Result<(), LedgerError> {
        self.dispatcher
            .dispatch_transaction(id, TransactionStatus::Rejected)
            .await
    }

    /// Inbound provider notification for a transaction parked in `*_wait`.
    /// The reported status is stored first, then the callback is dispatched.
    pub async fn provider_callback(
        &self,
        id: TransactionId,
        target: TransactionStatus,
    ) -> Result<(), LedgerError> {
        let reported = ProviderOperStatus::from_target(target)?;

        let mut tx = self.store.begin().await?;
        let mut transaction = tx.lock_transaction(id).await?;
        if !transaction.status.is_waiting() {
            return Err(LedgerError::unexpected_status("*_wait", transaction.status));
        }
        let machine = self.registry().transaction(&transaction.strategy)?;
        if !machine.handles(transaction.status, target) {
            return Err(LedgerError::NoTransitionHandler {
                strategy: transaction.strategy,
                from: transaction.status.to_string(),
                to: target.to_string(),
            });
        }
        transaction.provider_oper_status = Some(reported.as_str().to_string());
        tx.update_transaction(&transaction).await?;
        tx.commit().await?;

        info!(transaction_id = %id, reported = %reported, "Provider callback received");
        self.dispatcher.dispatch_transaction(id, target).await
    }

    /// Snapshot the transaction and queue `next_status` on the processor
    pub async fn submit_transition(
        &self,
        id: TransactionId,
        next_status: TransactionStatus,
    ) -> Result<TransitionRequest, LedgerError> {
        let transaction = self.transaction(id).await?;
        let request = TransitionRequest::from_snapshot(&transaction, next_status);
        self.processor.submit(request.clone())?;
        Ok(request)
    }

    // ============================================================
    // READS
    // ============================================================

    pub async fn account(&self, id: AccountId) -> Result<Account, LedgerError> {
        self.store
            .get_account(id)
            .await?
            .ok_or(LedgerError::AccountNotFound(id))
    }

    pub async fn invoice(&self, id: InvoiceId) -> Result<Invoice, LedgerError> {
        self.store
            .get_invoice(id)
            .await?
            .ok_or(LedgerError::InvoiceNotFound(id))
    }

    pub async fn transaction(&self, id: TransactionId) -> Result<Transaction, LedgerError> {
        self.store
            .get_transaction(id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(id))
    }

    pub async fn transactions(&self, invoice_id: InvoiceId) -> Result<Vec<Transaction>, LedgerError> {
        self.store.list_transactions(invoice_id).await
    }

    pub async fn operations(&self, id: TransactionId) -> Result<Vec<Operation>, LedgerError> {
        self.store.list_operations(id).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, LedgerError> {
        self.store.list_dead_letters().await
    }
}
