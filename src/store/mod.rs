//! Ledger Storage
//!
//! Storage seams for the ledger, split the way the database is used:
//! - [`LedgerStore`]: autocommit reads and entity creation
//! - [`LedgerTx`]: one database transaction; row locks, CAS claims, balance
//!   writes and the outbox. Dropping it without `commit` rolls back.
//! - [`WorkQueue`]: the durable queue consumed by the pollers
//!
//! A `LedgerTx` must be the only store handle used while it is open.

pub mod memory;
pub mod postgres;
pub mod queue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ledger::{
    Account, AccountId, Amount, Currency, CurrencyId, Invoice, InvoiceId, LedgerError, Meta,
    NewAccount, NewInvoice, NewOperation, NewTransaction, Operation, OperationId, OperationStatus,
    Transaction, TransactionId, TransactionStatus,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use queue::{
    ClaimedMessage, DeadLetter, EntityKind, EntityRef, MessagePayload, MessageStatus,
    QueueMessage, TOPIC_INVOICE, TOPIC_TRANSACTION,
};

/// Autocommit access to ledger entities
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a currency, or replace only `meta` when the key exists.
    /// `key` must already be normalized.
    async fn upsert_currency(&self, key: &str, meta: Option<Meta>) -> Result<Currency, LedgerError>;

    async fn get_currency(&self, id: CurrencyId) -> Result<Option<Currency>, LedgerError>;

    async fn get_currency_by_key(&self, key: &str) -> Result<Option<Currency>, LedgerError>;

    /// Fails with `CurrencyNotFound` or `Duplicate`
    async fn create_account(&self, new: &NewAccount) -> Result<Account, LedgerError>;

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError>;

    /// Created in `draft` with `total_amount = 0`. Fails with `Duplicate`.
    async fn create_invoice(&self, new: &NewInvoice) -> Result<Invoice, LedgerError>;

    async fn get_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, LedgerError>;

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, LedgerError>;

    async fn list_transactions(&self, invoice_id: InvoiceId) -> Result<Vec<Transaction>, LedgerError>;

    /// Ascending operation id
    async fn list_operations(&self, transaction_id: TransactionId) -> Result<Vec<Operation>, LedgerError>;

    /// Transactions with `next_status` set and `updated_at < older_than`, oldest first
    async fn find_stale_transactions(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError>;

    /// Invoices with `next_status` set and `updated_at < older_than`, oldest first
    async fn find_stale_invoices(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Invoice>, LedgerError>;

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), LedgerError>;

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, LedgerError>;

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError>;
}

/// One database transaction
#[async_trait]
pub trait LedgerTx: Send {
    /// Compare-and-swap claim in one conditional update: succeeds only if the
    /// row still has `expected_status` and exactly `expected_updated_at`.
    /// Sets `next_status`, bumps `updated_at` and keeps the row locked.
    ///
    /// Errors: `TransactionNotFound`, `StaleVersion`, `UnexpectedStatus`.
    async fn claim_transaction(
        &mut self,
        id: TransactionId,
        expected_status: TransactionStatus,
        expected_updated_at: DateTime<Utc>,
        next_status: TransactionStatus,
    ) -> Result<Transaction, LedgerError>;

    /// `SELECT ... FOR UPDATE`
    async fn lock_transaction(&mut self, id: TransactionId) -> Result<Transaction, LedgerError>;

    /// `SELECT ... FOR UPDATE`
    async fn lock_invoice(&mut self, id: InvoiceId) -> Result<Invoice, LedgerError>;

    async fn get_account(&mut self, id: AccountId) -> Result<Option<Account>, LedgerError>;

    /// Every operation of the transaction, write-locked in ascending id order
    async fn lock_operations(
        &mut self,
        transaction_id: TransactionId,
    ) -> Result<Vec<Operation>, LedgerError>;

    async fn list_transactions(&mut self, invoice_id: InvoiceId) -> Result<Vec<Transaction>, LedgerError>;

    /// New `draft` transaction
    async fn insert_transaction(
        &mut self,
        invoice_id: InvoiceId,
        new: &NewTransaction,
    ) -> Result<Transaction, LedgerError>;

    /// New `draft` operation
    async fn insert_operation(
        &mut self,
        transaction: &Transaction,
        new: &NewOperation,
    ) -> Result<Operation, LedgerError>;

    async fn update_operation_status(
        &mut self,
        id: OperationId,
        status: OperationStatus,
    ) -> Result<(), LedgerError>;

    /// Add to `balance`, returning the new value
    async fn add_balance(&mut self, account: AccountId, delta: Amount) -> Result<Amount, LedgerError>;

    /// Add to `balance_accepted`, returning the new value
    async fn add_balance_accepted(
        &mut self,
        account: AccountId,
        delta: Amount,
    ) -> Result<Amount, LedgerError>;

    /// Write status, `next_status` and provider fields; bumps `updated_at`
    async fn update_transaction(&mut self, transaction: &Transaction) -> Result<Transaction, LedgerError>;

    /// Write status, `next_status` and `total_amount`; bumps `updated_at`
    async fn update_invoice(&mut self, invoice: &Invoice) -> Result<Invoice, LedgerError>;

    /// Outbox publish: visible to consumers only after commit
    async fn enqueue(&mut self, message: &QueueMessage) -> Result<i64, LedgerError>;

    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;
}

/// Durable, ordered-per-topic, at-least-once work queue
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, message: &QueueMessage) -> Result<i64, LedgerError>;

    /// Oldest pending message of the topic, marked claimed
    async fn claim(&self, topic: &str) -> Result<Option<ClaimedMessage>, LedgerError>;

    async fn complete(&self, message_id: i64) -> Result<(), LedgerError>;

    async fn fail(&self, message_id: i64, error: &str) -> Result<(), LedgerError>;

    async fn pending_count(&self, topic: &str) -> Result<usize, LedgerError>;
}

/// Full storage backend
pub trait Store: LedgerStore + WorkQueue {}

impl<T: LedgerStore + WorkQueue> Store for T {}
