//! In-memory Store
//!
//! Whole-state snapshot isolation: `begin` takes the state lock and works on
//! a copy, `commit` swaps the copy in. Transactions are therefore fully
//! serialized, which is stricter than the row locks PostgreSQL takes.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::queue::{ClaimedMessage, DeadLetter, MessageStatus, QueueMessage};
use super::{LedgerStore, LedgerTx, WorkQueue};
use crate::ledger::{
    Account, AccountId, Amount, Currency, CurrencyId, Invoice, InvoiceId, InvoiceStatus,
    LedgerError, Meta, NewAccount, NewInvoice, NewOperation, NewTransaction, Operation,
    OperationId, OperationStatus, Transaction, TransactionId, TransactionStatus, db_now,
};
use crate::provider::awaits_callback;

/// Next `updated_at` for a row: never equal to or before the previous one
fn bump(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = db_now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: QueueMessage,
    status: MessageStatus,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
struct Sequences {
    currency: i64,
    account: i64,
    invoice: i64,
    transaction: i64,
    operation: i64,
    message: i64,
}

#[derive(Debug, Default, Clone)]
struct MemoryState {
    seq: Sequences,
    currencies: BTreeMap<CurrencyId, Currency>,
    accounts: BTreeMap<AccountId, Account>,
    invoices: BTreeMap<InvoiceId, Invoice>,
    transactions: BTreeMap<TransactionId, Transaction>,
    operations: BTreeMap<OperationId, Operation>,
    messages: BTreeMap<i64, StoredMessage>,
    dead_letters: Vec<DeadLetter>,
}

impl MemoryState {
    fn transactions_of(&self, invoice_id: InvoiceId) -> Vec<Transaction> {
        self.transactions
            .values()
            .filter(|t| t.invoice_id == invoice_id)
            .cloned()
            .collect()
    }

    fn operations_of(&self, transaction_id: TransactionId) -> Vec<Operation> {
        self.operations
            .values()
            .filter(|op| op.transaction_id == transaction_id)
            .cloned()
            .collect()
    }

    fn push_message(&mut self, message: &QueueMessage) -> i64 {
        self.seq.message += 1;
        let id = self.seq.message;
        self.messages.insert(
            id,
            StoredMessage {
                message: message.clone(),
                status: MessageStatus::Pending,
                error: None,
                created_at: db_now(),
            },
        );
        id
    }

    fn account_mut(&mut self, id: AccountId) -> Result<&mut Account, LedgerError> {
        self.accounts
            .get_mut(&id)
            .ok_or(LedgerError::AccountNotFound(id))
    }
}

/// In-process store for tests and `--in-memory` runs
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/bootstrap helper: overwrite both counters of an account
    pub async fn set_balances(
        &self,
        id: AccountId,
        balance: Amount,
        balance_accepted: Amount,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let account = state.account_mut(id)?;
        account.balance = balance;
        account.balance_accepted = balance_accepted;
        account.updated_at = bump(account.updated_at);
        Ok(())
    }

    /// Backdate a transaction's `updated_at` (recovery tests)
    pub async fn backdate_transaction(
        &self,
        id: TransactionId,
        by: Duration,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let transaction = state
            .transactions
            .get_mut(&id)
            .ok_or(LedgerError::TransactionNotFound(id))?;
        transaction.updated_at -= by;
        Ok(())
    }

    /// Backdate an invoice's `updated_at` (recovery tests)
    pub async fn backdate_invoice(&self, id: InvoiceId, by: Duration) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let invoice = state
            .invoices
            .get_mut(&id)
            .ok_or(LedgerError::InvoiceNotFound(id))?;
        invoice.updated_at -= by;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn upsert_currency(&self, key: &str, meta: Option<Meta>) -> Result<Currency, LedgerError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.currencies.values_mut().find(|c| c.key == key) {
            existing.meta = meta;
            return Ok(existing.clone());
        }
        state.seq.currency += 1;
        let currency = Currency {
            currency_id: CurrencyId(state.seq.currency),
            key: key.to_string(),
            meta,
            created_at: db_now(),
        };
        state.currencies.insert(currency.currency_id, currency.clone());
        Ok(currency)
    }

    async fn get_currency(&self, id: CurrencyId) -> Result<Option<Currency>, LedgerError> {
        Ok(self.state.lock().await.currencies.get(&id).cloned())
    }

    async fn get_currency_by_key(&self, key: &str) -> Result<Option<Currency>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.currencies.values().find(|c| c.key == key).cloned())
    }

    async fn create_account(&self, new: &NewAccount) -> Result<Account, LedgerError> {
        let mut state = self.state.lock().await;
        if !state.currencies.contains_key(&new.currency_id) {
            return Err(LedgerError::CurrencyNotFound(new.currency_id.to_string()));
        }
        if state
            .accounts
            .values()
            .any(|a| a.currency_id == new.currency_id && a.key == new.key)
        {
            return Err(LedgerError::Duplicate(format!(
                "account {} in currency {}",
                new.key, new.currency_id
            )));
        }
        state.seq.account += 1;
        let now = db_now();
        let account = Account {
            account_id: AccountId(state.seq.account),
            currency_id: new.currency_id,
            key: new.key.clone(),
            balance: 0,
            balance_accepted: 0,
            meta: new.meta.clone(),
            created_at: now,
            updated_at: now,
        };
        state.accounts.insert(account.account_id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn create_invoice(&self, new: &NewInvoice) -> Result<Invoice, LedgerError> {
        let mut state = self.state.lock().await;
        if state.invoices.values().any(|i| i.key == new.key) {
            return Err(LedgerError::Duplicate(format!("invoice {}", new.key)));
        }
        state.seq.invoice += 1;
        let now = db_now();
        let invoice = Invoice {
            invoice_id: InvoiceId(state.seq.invoice),
            key: new.key.clone(),
            strategy: new.strategy.clone(),
            total_amount: 0,
            status: InvoiceStatus::Draft,
            next_status: None,
            meta: new.meta.clone(),
            payload: new.payload.clone(),
            created_at: now,
            updated_at: now,
        };
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(invoice)
    }

    async fn get_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, LedgerError> {
        Ok(self.state.lock().await.invoices.get(&id).cloned())
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, LedgerError> {
        Ok(self.state.lock().await.transactions.get(&id).cloned())
    }

    async fn list_transactions(&self, invoice_id: InvoiceId) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.state.lock().await.transactions_of(invoice_id))
    }

    async fn list_operations(&self, transaction_id: TransactionId) -> Result<Vec<Operation>, LedgerError> {
        Ok(self.state.lock().await.operations_of(transaction_id))
    }

    async fn find_stale_transactions(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let state = self.state.lock().await;
        let mut stale: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| {
                t.next_status.is_some() && t.updated_at < older_than && !awaits_callback(t)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn find_stale_invoices(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Invoice>, LedgerError> {
        let state = self.state.lock().await;
        let mut stale: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| i.next_status.is_some() && i.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|i| i.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), LedgerError> {
        self.state.lock().await.dead_letters.push(letter.clone());
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, LedgerError> {
        Ok(self.state.lock().await.dead_letters.clone())
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }
}

/// Snapshot transaction; dropped without commit = rolled back
pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

impl MemoryTx {
    fn transaction_mut(&mut self, id: TransactionId) -> Result<&mut Transaction, LedgerError> {
        self.working
            .transactions
            .get_mut(&id)
            .ok_or(LedgerError::TransactionNotFound(id))
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn claim_transaction(
        &mut self,
        id: TransactionId,
        expected_status: TransactionStatus,
        expected_updated_at: DateTime<Utc>,
        next_status: TransactionStatus,
    ) -> Result<Transaction, LedgerError> {
        let transaction = self.transaction_mut(id)?;
        if transaction.updated_at != expected_updated_at {
            return Err(LedgerError::StaleVersion(id));
        }
        if transaction.status != expected_status {
            return Err(LedgerError::unexpected_status(
                expected_status,
                transaction.status,
            ));
        }
        transaction.next_status = Some(next_status);
        transaction.updated_at = bump(transaction.updated_at);
        Ok(transaction.clone())
    }

    async fn lock_transaction(&mut self, id: TransactionId) -> Result<Transaction, LedgerError> {
        Ok(self.transaction_mut(id)?.clone())
    }

    async fn lock_invoice(&mut self, id: InvoiceId) -> Result<Invoice, LedgerError> {
        self.working
            .invoices
            .get(&id)
            .cloned()
            .ok_or(LedgerError::InvoiceNotFound(id))
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Option<Account>, LedgerError> {
        Ok(self.working.accounts.get(&id).cloned())
    }

    async fn lock_operations(
        &mut self,
        transaction_id: TransactionId,
    ) -> Result<Vec<Operation>, LedgerError> {
        Ok(self.working.operations_of(transaction_id))
    }

    async fn list_transactions(&mut self, invoice_id: InvoiceId) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.working.transactions_of(invoice_id))
    }

    async fn insert_transaction(
        &mut self,
        invoice_id: InvoiceId,
        new: &NewTransaction,
    ) -> Result<Transaction, LedgerError> {
        if !self.working.invoices.contains_key(&invoice_id) {
            return Err(LedgerError::InvoiceNotFound(invoice_id));
        }
        self.working.seq.transaction += 1;
        let now = db_now();
        let transaction = Transaction {
            transaction_id: TransactionId(self.working.seq.transaction),
            invoice_id,
            amount: new.amount,
            strategy: new.strategy.clone(),
            provider: new.provider,
            provider_oper_id: None,
            provider_oper_status: None,
            provider_oper_url: None,
            status: TransactionStatus::Draft,
            next_status: None,
            meta: new.meta.clone(),
            created_at: now,
            updated_at: now,
        };
        self.working
            .transactions
            .insert(transaction.transaction_id, transaction.clone());
        Ok(transaction)
    }

    async fn insert_operation(
        &mut self,
        transaction: &Transaction,
        new: &NewOperation,
    ) -> Result<Operation, LedgerError> {
        self.working.seq.operation += 1;
        let now = db_now();
        let operation = Operation {
            operation_id: OperationId(self.working.seq.operation),
            transaction_id: transaction.transaction_id,
            invoice_id: transaction.invoice_id,
            src_account_id: new.src_account_id,
            dst_account_id: new.dst_account_id,
            amount: new.amount,
            strategy: new.strategy,
            hold: new.hold,
            hold_account_id: new.hold_account_id,
            status: OperationStatus::Draft,
            key: new.key.clone(),
            meta: new.meta.clone(),
            created_at: now,
            updated_at: now,
        };
        self.working
            .operations
            .insert(operation.operation_id, operation.clone());
        Ok(operation)
    }

    async fn update_operation_status(
        &mut self,
        id: OperationId,
        status: OperationStatus,
    ) -> Result<(), LedgerError> {
        let operation = self.working.operations.get_mut(&id).ok_or_else(|| {
            LedgerError::Database(format!("operation {id} disappeared"))
        })?;
        operation.status = status;
        operation.updated_at = bump(operation.updated_at);
        Ok(())
    }

    async fn add_balance(&mut self, account: AccountId, delta: Amount) -> Result<Amount, LedgerError> {
        let account = self.working.account_mut(account)?;
        account.balance = account
            .balance
            .checked_add(delta)
            .ok_or(LedgerError::Overflow)?;
        account.updated_at = bump(account.updated_at);
        Ok(account.balance)
    }

    async fn add_balance_accepted(
        &mut self,
        account: AccountId,
        delta: Amount,
    ) -> Result<Amount, LedgerError> {
        let account = self.working.account_mut(account)?;
        account.balance_accepted = account
            .balance_accepted
            .checked_add(delta)
            .ok_or(LedgerError::Overflow)?;
        account.updated_at = bump(account.updated_at);
        Ok(account.balance_accepted)
    }

    async fn update_transaction(&mut self, transaction: &Transaction) -> Result<Transaction, LedgerError> {
        let stored = self.transaction_mut(transaction.transaction_id)?;
        stored.status = transaction.status;
        stored.next_status = transaction.next_status;
        stored.provider_oper_id = transaction.provider_oper_id.clone();
        stored.provider_oper_status = transaction.provider_oper_status.clone();
        stored.provider_oper_url = transaction.provider_oper_url.clone();
        stored.updated_at = bump(stored.updated_at);
        Ok(stored.clone())
    }

    async fn update_invoice(&mut self, invoice: &Invoice) -> Result<Invoice, LedgerError> {
        let stored = self
            .working
            .invoices
            .get_mut(&invoice.invoice_id)
            .ok_or(LedgerError::InvoiceNotFound(invoice.invoice_id))?;
        stored.status = invoice.status;
        stored.next_status = invoice.next_status;
        stored.total_amount = invoice.total_amount;
        stored.updated_at = bump(stored.updated_at);
        Ok(stored.clone())
    }

    async fn enqueue(&mut self, message: &QueueMessage) -> Result<i64, LedgerError> {
        Ok(self.working.push_message(message))
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for MemoryStore {
    async fn publish(&self, message: &QueueMessage) -> Result<i64, LedgerError> {
        Ok(self.state.lock().await.push_message(message))
    }

    async fn claim(&self, topic: &str) -> Result<Option<ClaimedMessage>, LedgerError> {
        let mut state = self.state.lock().await;
        let next = state
            .messages
            .iter_mut()
            .find(|(_, m)| m.status == MessageStatus::Pending && m.message.topic == topic);
        Ok(next.map(|(id, stored)| {
            stored.status = MessageStatus::Claimed;
            ClaimedMessage {
                message_id: *id,
                message: stored.message.clone(),
                created_at: stored.created_at,
            }
        }))
    }

    async fn complete(&self, message_id: i64) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if let Some(stored) = state.messages.get_mut(&message_id) {
            stored.status = MessageStatus::Processed;
        }
        Ok(())
    }

    async fn fail(&self, message_id: i64, error: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if let Some(stored) = state.messages.get_mut(&message_id) {
            stored.status = MessageStatus::Failed;
            stored.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn pending_count(&self, topic: &str) -> Result<usize, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Pending && m.message.topic == topic)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{NewOperation, Provider};
    use crate::store::queue::{EntityRef, TOPIC_INVOICE};

    async fn seeded() -> (MemoryStore, Transaction) {
        let store = MemoryStore::new();
        let currency = store.upsert_currency("usd", None).await.unwrap();
        let a = store
            .create_account(&NewAccount::new(currency.currency_id, "a"))
            .await
            .unwrap();
        let b = store
            .create_account(&NewAccount::new(currency.currency_id, "b"))
            .await
            .unwrap();
        let invoice = store
            .create_invoice(&NewInvoice::new("inv-1", "simple"))
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        let new = NewTransaction::new("internal", Provider::Internal, 5)
            .with_operation(NewOperation::transfer(a.account_id, b.account_id, 5));
        let transaction = tx.insert_transaction(invoice.invoice_id, &new).await.unwrap();
        tx.insert_operation(&transaction, &new.operations[0])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        (store, transaction)
    }

    #[tokio::test]
    async fn test_upsert_currency_replaces_meta_only() {
        let store = MemoryStore::new();
        let first = store.upsert_currency("usd", None).await.unwrap();
        let meta = serde_json::json!({"precision": 2});
        let second = store.upsert_currency("usd", Some(meta.clone())).await.unwrap();
        assert_eq!(first.currency_id, second.currency_id);
        assert_eq!(second.meta, Some(meta));
    }

    #[tokio::test]
    async fn test_duplicate_account_rejected() {
        let store = MemoryStore::new();
        let currency = store.upsert_currency("usd", None).await.unwrap();
        let new = NewAccount::new(currency.currency_id, "main");
        store.create_account(&new).await.unwrap();
        let err = store.create_account(&new).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE");

        let orphan = NewAccount::new(CurrencyId(99), "main");
        let err = store.create_account(&orphan).await.unwrap_err();
        assert_eq!(err.code(), "CURRENCY_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_rollback_on_drop() {
        let (store, transaction) = seeded().await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.add_balance(AccountId(1), 100).await.unwrap();
            tx.enqueue(&QueueMessage::new(
                TOPIC_INVOICE,
                EntityRef::invoice(transaction.invoice_id),
                "auth",
                "simple",
            ))
            .await
            .unwrap();
        }
        let account = store.get_account(AccountId(1)).await.unwrap().unwrap();
        assert_eq!(account.balance, 0);
        assert_eq!(store.pending_count(TOPIC_INVOICE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_is_compare_and_swap() {
        let (store, transaction) = seeded().await;

        let mut tx = store.begin().await.unwrap();
        let claimed = tx
            .claim_transaction(
                transaction.transaction_id,
                TransactionStatus::Draft,
                transaction.updated_at,
                TransactionStatus::Auth,
            )
            .await
            .unwrap();
        assert!(claimed.updated_at > transaction.updated_at);
        assert_eq!(claimed.next_status, Some(TransactionStatus::Auth));
        tx.commit().await.unwrap();

        // Same snapshot again: the version moved on
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .claim_transaction(
                transaction.transaction_id,
                TransactionStatus::Draft,
                transaction.updated_at,
                TransactionStatus::Auth,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::StaleVersion(_)));

        let err = tx
            .claim_transaction(
                transaction.transaction_id,
                TransactionStatus::Auth,
                claimed.updated_at,
                TransactionStatus::Accepted,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnexpectedStatus { .. }));
    }

    #[tokio::test]
    async fn test_queue_claims_oldest_per_topic() {
        let store = MemoryStore::new();
        let first = QueueMessage::new(TOPIC_INVOICE, EntityRef::invoice(InvoiceId(1)), "auth", "simple");
        let second = QueueMessage::new(TOPIC_INVOICE, EntityRef::invoice(InvoiceId(2)), "auth", "simple");
        let other = QueueMessage::new("provider.card", EntityRef::invoice(InvoiceId(3)), "auth", "card");
        store.publish(&first).await.unwrap();
        store.publish(&other).await.unwrap();
        store.publish(&second).await.unwrap();

        let claimed = store.claim(TOPIC_INVOICE).await.unwrap().unwrap();
        assert_eq!(claimed.message, first);
        store.complete(claimed.message_id).await.unwrap();

        let claimed = store.claim(TOPIC_INVOICE).await.unwrap().unwrap();
        assert_eq!(claimed.message, second);
        store.fail(claimed.message_id, "boom").await.unwrap();

        assert!(store.claim(TOPIC_INVOICE).await.unwrap().is_none());
        assert_eq!(store.pending_count("provider.card").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_stale_requires_next_status() {
        let (store, transaction) = seeded().await;
        let later = db_now() + Duration::seconds(1);
        assert!(store.find_stale_transactions(later, 10).await.unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        let mut marked = tx.lock_transaction(transaction.transaction_id).await.unwrap();
        marked.next_status = Some(TransactionStatus::Auth);
        tx.update_transaction(&marked).await.unwrap();
        tx.commit().await.unwrap();

        let later = db_now() + Duration::seconds(1);
        let stale = store.find_stale_transactions(later, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert!(store.find_stale_transactions(transaction.created_at, 10).await.unwrap().is_empty());
    }
}
