//! Invoice and transaction lifecycles driven through the queue

use std::sync::Arc;

use super::*;
use crate::ledger::{
    AccountId, Amount, InvoiceId, NewAccount, NewInvoice, NewOperation, NewTransaction,
    OperationStatus, Provider, TransactionId,
};
use crate::provider::LoopbackProvider;
use crate::store::{LedgerStore, MemoryStore, TOPIC_INVOICE, TOPIC_TRANSACTION, WorkQueue};

struct Harness {
    store: Arc<MemoryStore>,
    dispatcher: Arc<Dispatcher>,
    card: Arc<LoopbackProvider>,
    pollers: Vec<QueuePoller>,
    customer: AccountId,
    merchant: AccountId,
    hold: AccountId,
}

impl Harness {
    async fn new(customer_balance: Amount) -> Self {
        let store = Arc::new(MemoryStore::new());
        let currency = store.upsert_currency("usd", None).await.unwrap();
        let mut accounts = Vec::new();
        for key in ["customer", "merchant", "hold"] {
            let account = store
                .create_account(&NewAccount::new(currency.currency_id, key))
                .await
                .unwrap();
            accounts.push(account.account_id);
        }
        store
            .set_balances(accounts[0], customer_balance, customer_balance)
            .await
            .unwrap();

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::new(StrategyRegistry::standard()),
        ));
        let card = Arc::new(LoopbackProvider::new(Provider::Card));
        let worker = Arc::new(ProviderWorker::new(store.clone()).with_provider(card.clone()));
        let pollers = vec![
            QueuePoller::new(TOPIC_INVOICE, store.clone(), dispatcher.clone()),
            QueuePoller::new(TOPIC_TRANSACTION, store.clone(), dispatcher.clone()),
            QueuePoller::new(Provider::Card.topic(), store.clone(), worker),
        ];

        Self {
            store,
            dispatcher,
            card,
            pollers,
            customer: accounts[0],
            merchant: accounts[1],
            hold: accounts[2],
        }
    }

    async fn invoice(&self, key: &str) -> InvoiceId {
        self.store
            .create_invoice(&NewInvoice::new(key, "simple"))
            .await
            .unwrap()
            .invoice_id
    }

    async fn add(
        &self,
        invoice_id: InvoiceId,
        strategy: &str,
        provider: Provider,
        operation: NewOperation,
    ) -> Transaction {
        let new = NewTransaction::new(strategy, provider, operation.amount).with_operation(operation);
        let mut tx = self.store.begin().await.unwrap();
        let transaction = tx.insert_transaction(invoice_id, &new).await.unwrap();
        for op in &new.operations {
            tx.insert_operation(&transaction, op).await.unwrap();
        }
        tx.commit().await.unwrap();
        transaction
    }

    fn held_transfer(&self, amount: Amount) -> NewOperation {
        NewOperation::transfer(self.customer, self.merchant, amount).with_hold(self.hold)
    }

    async fn settle(&self) -> usize {
        drain_all(&self.pollers).await.unwrap()
    }

    async fn balance(&self, account: AccountId) -> (Amount, Amount) {
        let account = self.store.get_account(account).await.unwrap().unwrap();
        (account.balance, account.balance_accepted)
    }

    async fn invoice_status(&self, id: InvoiceId) -> InvoiceStatus {
        self.store.get_invoice(id).await.unwrap().unwrap().status
    }

    async fn transaction(&self, id: TransactionId) -> Transaction {
        self.store.get_transaction(id).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn test_internal_without_hold_settles_invoice() {
    let h = Harness::new(100).await;
    let invoice = h.invoice("inv-1").await;
    let child = h
        .add(
            invoice,
            "internal",
            Provider::Internal,
            NewOperation::transfer(h.customer, h.merchant, 30),
        )
        .await;

    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Auth)
        .await
        .unwrap();
    assert!(h.settle().await >= 2);

    assert_eq!(h.invoice_status(invoice).await, InvoiceStatus::Accepted);
    assert_eq!(
        h.transaction(child.transaction_id).await.status,
        TransactionStatus::Accepted
    );
    assert_eq!(h.balance(h.customer).await, (70, 70));
    assert_eq!(h.balance(h.merchant).await, (30, 30));
    assert!(h.store.list_dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_internal_hold_waits_then_accepts() {
    let h = Harness::new(100).await;
    let invoice = h.invoice("inv-1").await;
    let child = h
        .add(invoice, "internal", Provider::Internal, h.held_transfer(40))
        .await;

    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Auth)
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.invoice_status(invoice).await, InvoiceStatus::Wait);
    assert_eq!(
        h.transaction(child.transaction_id).await.status,
        TransactionStatus::Auth
    );
    assert_eq!(h.balance(h.customer).await, (60, 100));
    assert_eq!(h.balance(h.hold).await, (40, 0));

    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Accepted)
        .await
        .unwrap();
    let settling = h.store.get_invoice(invoice).await.unwrap().unwrap();
    assert_eq!(settling.status, InvoiceStatus::Wait);
    assert_eq!(settling.next_status, Some(InvoiceStatus::Accepted));

    h.settle().await;
    let settled = h.store.get_invoice(invoice).await.unwrap().unwrap();
    assert_eq!(settled.status, InvoiceStatus::Accepted);
    assert_eq!(settled.next_status, None);
    assert_eq!(h.balance(h.customer).await, (60, 60));
    assert_eq!(h.balance(h.merchant).await, (40, 40));
    assert_eq!(h.balance(h.hold).await, (0, 0));
}

#[tokio::test]
async fn test_internal_hold_rejected_restores_balances() {
    let h = Harness::new(100).await;
    let invoice = h.invoice("inv-1").await;
    let child = h
        .add(invoice, "internal", Provider::Internal, h.held_transfer(40))
        .await;

    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Auth)
        .await
        .unwrap();
    h.settle().await;
    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Rejected)
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(h.invoice_status(invoice).await, InvoiceStatus::Rejected);
    assert_eq!(
        h.transaction(child.transaction_id).await.status,
        TransactionStatus::Rejected
    );
    assert_eq!(h.balance(h.customer).await, (100, 100));
    assert_eq!(h.balance(h.hold).await, (0, 0));
    assert_eq!(h.balance(h.merchant).await, (0, 0));
}

#[tokio::test]
async fn test_card_hold_capture_round_trip() {
    let h = Harness::new(100).await;
    let invoice = h.invoice("inv-1").await;
    let child = h
        .add(invoice, "card", Provider::Card, h.held_transfer(25))
        .await;

    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Auth)
        .await
        .unwrap();
    h.settle().await;

    let held = h.transaction(child.transaction_id).await;
    assert_eq!(held.status, TransactionStatus::Hold);
    assert_eq!(held.next_status, None);
    assert_eq!(held.provider_oper_status.as_deref(), Some("hold"));
    let oper_id = held.provider_oper_id.clone().unwrap();
    assert!(held.provider_oper_url.is_some());
    assert_eq!(h.invoice_status(invoice).await, InvoiceStatus::Wait);
    assert_eq!(h.balance(h.customer).await, (75, 100));

    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Accepted)
        .await
        .unwrap();
    h.settle().await;

    let accepted = h.transaction(child.transaction_id).await;
    assert_eq!(accepted.status, TransactionStatus::Accepted);
    assert_eq!(accepted.provider_oper_id.as_deref(), Some(oper_id.as_str()));
    assert_eq!(h.invoice_status(invoice).await, InvoiceStatus::Accepted);
    assert_eq!(h.card.calls(&oper_id), vec!["submit", "capture"]);
    assert_eq!(h.balance(h.customer).await, (75, 75));
    assert_eq!(h.balance(h.merchant).await, (25, 25));
    assert_eq!(h.balance(h.hold).await, (0, 0));
}

#[tokio::test]
async fn test_card_hold_void_round_trip() {
    let h = Harness::new(100).await;
    let invoice = h.invoice("inv-1").await;
    let child = h
        .add(invoice, "card", Provider::Card, h.held_transfer(25))
        .await;

    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Auth)
        .await
        .unwrap();
    h.settle().await;
    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Rejected)
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(
        h.transaction(child.transaction_id).await.status,
        TransactionStatus::Rejected
    );
    assert_eq!(h.invoice_status(invoice).await, InvoiceStatus::Rejected);
    assert_eq!(h.card.void_count(), 1);
    assert_eq!(h.balance(h.customer).await, (100, 100));
}

#[tokio::test]
async fn test_card_without_hold_settles_in_one_callback() {
    let h = Harness::new(100).await;
    let invoice = h.invoice("inv-1").await;
    let child = h
        .add(
            invoice,
            "card",
            Provider::Card,
            NewOperation::transfer(h.customer, h.merchant, 10),
        )
        .await;

    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Auth)
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(
        h.transaction(child.transaction_id).await.status,
        TransactionStatus::Accepted
    );
    assert_eq!(h.invoice_status(invoice).await, InvoiceStatus::Accepted);
    assert_eq!(h.card.capture_count(), 0);
    assert_eq!(h.balance(h.merchant).await, (10, 10));
}

#[tokio::test]
async fn test_card_declined_rejects_drafts() {
    let h = Harness::new(100).await;
    h.card.set_decline(true);
    let invoice = h.invoice("inv-1").await;
    let child = h
        .add(invoice, "card", Provider::Card, h.held_transfer(25))
        .await;

    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Auth)
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(
        h.transaction(child.transaction_id).await.status,
        TransactionStatus::Rejected
    );
    let ops = h.store.list_operations(child.transaction_id).await.unwrap();
    assert!(ops.iter().all(|op| op.status == OperationStatus::Rejected));
    assert_eq!(h.invoice_status(invoice).await, InvoiceStatus::Rejected);
    assert_eq!(h.balance(h.customer).await, (100, 100));
}

#[tokio::test]
async fn test_failed_child_releases_holding_sibling() {
    let h = Harness::new(100).await;
    let invoice = h.invoice("inv-1").await;
    let holding = h
        .add(invoice, "internal", Provider::Internal, h.held_transfer(50))
        .await;
    // merchant has nothing to withdraw
    let failing = h
        .add(
            invoice,
            "internal",
            Provider::Internal,
            NewOperation::withdraw(h.merchant, h.hold, 10),
        )
        .await;

    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Auth)
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(
        h.transaction(failing.transaction_id).await.status,
        TransactionStatus::Failed
    );
    assert_eq!(
        h.transaction(holding.transaction_id).await.status,
        TransactionStatus::Rejected
    );
    assert_eq!(h.invoice_status(invoice).await, InvoiceStatus::Rejected);
    assert_eq!(h.balance(h.customer).await, (100, 100));
    assert_eq!(h.balance(h.hold).await, (0, 0));

    let letters = h.store.list_dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].source, "poller:transaction");
    assert!(letters[0].error.contains("Insufficient balance"));
}

#[tokio::test]
async fn test_repeated_delivery_is_harmless() {
    let h = Harness::new(100).await;
    let invoice = h.invoice("inv-1").await;
    let child = h
        .add(
            invoice,
            "internal",
            Provider::Internal,
            NewOperation::transfer(h.customer, h.merchant, 30),
        )
        .await;
    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Auth)
        .await
        .unwrap();
    h.settle().await;

    let settled = h.transaction(child.transaction_id).await;
    h.store
        .publish(&QueueMessage::transaction(&settled, TransactionStatus::Accepted))
        .await
        .unwrap();
    h.store
        .publish(&QueueMessage::transaction(&settled, TransactionStatus::Accepted))
        .await
        .unwrap();
    assert_eq!(h.settle().await, 2);

    assert!(h.store.list_dead_letters().await.unwrap().is_empty());
    assert_eq!(h.balance(h.merchant).await, (30, 30));
}

#[tokio::test]
async fn test_empty_invoice_cannot_authorize() {
    let h = Harness::new(0).await;
    let invoice = h.invoice("inv-1").await;
    let err = h
        .dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Auth)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "EMPTY_INVOICE");
    assert_eq!(h.invoice_status(invoice).await, InvoiceStatus::Draft);
}

#[tokio::test]
async fn test_recovery_republishes_lost_provider_command() {
    let h = Harness::new(100).await;
    let invoice = h.invoice("inv-1").await;
    let child = h
        .add(invoice, "card", Provider::Card, h.held_transfer(25))
        .await;

    h.dispatcher
        .dispatch_transaction(child.transaction_id, TransactionStatus::Auth)
        .await
        .unwrap();
    // the provider command is consumed without reaching the provider
    let lost = h.store.claim(&Provider::Card.topic()).await.unwrap().unwrap();
    h.store.complete(lost.message_id).await.unwrap();

    let parked = h.transaction(child.transaction_id).await;
    assert_eq!(parked.status, TransactionStatus::AuthWait);
    assert_eq!(parked.next_status, Some(TransactionStatus::Auth));

    let recovery = RecoveryWorker::with_defaults(h.store.clone());
    assert_eq!(recovery.scan_and_recover().await.unwrap(), 0);

    h.store
        .backdate_transaction(child.transaction_id, chrono::Duration::seconds(120))
        .await
        .unwrap();
    assert_eq!(recovery.scan_and_recover().await.unwrap(), 1);
    h.settle().await;

    let held = h.transaction(child.transaction_id).await;
    assert_eq!(held.status, TransactionStatus::Hold);
    assert_eq!(h.card.submit_count(), 1);
    assert_eq!(h.balance(h.hold).await, (25, 0));
}

#[tokio::test]
async fn test_recovery_publishes_once_per_stale_window() {
    let h = Harness::new(100).await;
    let invoice = h.invoice("inv-1").await;
    let child = h
        .add(invoice, "card", Provider::Card, h.held_transfer(25))
        .await;
    h.dispatcher
        .dispatch_transaction(child.transaction_id, TransactionStatus::Auth)
        .await
        .unwrap();
    let lost = h.store.claim(&Provider::Card.topic()).await.unwrap().unwrap();
    h.store.complete(lost.message_id).await.unwrap();

    let recovery = RecoveryWorker::with_defaults(h.store.clone());
    h.store
        .backdate_transaction(child.transaction_id, chrono::Duration::seconds(120))
        .await
        .unwrap();
    assert_eq!(recovery.scan_and_recover().await.unwrap(), 1);
    let touched = h.transaction(child.transaction_id).await;
    assert_eq!(touched.status, TransactionStatus::AuthWait);

    // freshly touched: not stale again until the threshold passes
    assert_eq!(recovery.scan_and_recover().await.unwrap(), 0);
    assert_eq!(h.store.pending_count(&Provider::Card.topic()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_recovery_leaves_pending_provider_answer_alone() {
    let h = Harness::new(100).await;
    h.card.set_pending(true);
    let invoice = h.invoice("inv-1").await;
    let child = h
        .add(invoice, "card", Provider::Card, h.held_transfer(25))
        .await;
    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Auth)
        .await
        .unwrap();
    h.settle().await;

    let parked = h.transaction(child.transaction_id).await;
    assert_eq!(parked.status, TransactionStatus::AuthWait);
    assert_eq!(parked.provider_oper_status.as_deref(), Some("pending"));

    let recovery = RecoveryWorker::with_defaults(h.store.clone());
    for _ in 0..5 {
        h.store
            .backdate_transaction(child.transaction_id, chrono::Duration::seconds(120))
            .await
            .unwrap();
        assert_eq!(recovery.scan_and_recover().await.unwrap(), 0);
    }
    assert_eq!(h.store.pending_count(&Provider::Card.topic()).await.unwrap(), 0);
    h.settle().await;
    assert_eq!(h.card.submit_count(), 1);
}

#[tokio::test]
async fn test_recovery_resumes_settling_invoice() {
    let h = Harness::new(100).await;
    let invoice = h.invoice("inv-1").await;
    let child = h
        .add(invoice, "internal", Provider::Internal, h.held_transfer(40))
        .await;
    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Auth)
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.invoice_status(invoice).await, InvoiceStatus::Wait);

    h.dispatcher
        .dispatch_invoice(invoice, InvoiceStatus::Accepted)
        .await
        .unwrap();
    // the fan-out to the child is consumed without being handled
    let lost = h.store.claim(TOPIC_TRANSACTION).await.unwrap().unwrap();
    h.store.complete(lost.message_id).await.unwrap();

    let recovery = RecoveryWorker::with_defaults(h.store.clone());
    h.store
        .backdate_invoice(invoice, chrono::Duration::seconds(120))
        .await
        .unwrap();
    // child command plus the invoice decision
    assert_eq!(recovery.scan_and_recover().await.unwrap(), 2);
    assert_eq!(recovery.scan_and_recover().await.unwrap(), 0);

    h.settle().await;
    assert_eq!(h.invoice_status(invoice).await, InvoiceStatus::Accepted);
    assert_eq!(
        h.transaction(child.transaction_id).await.status,
        TransactionStatus::Accepted
    );
    assert_eq!(h.balance(h.merchant).await, (40, 40));
}

#[tokio::test]
async fn test_stale_callback_is_refused() {
    let h = Harness::new(100).await;
    let invoice = h.invoice("inv-1").await;
    let child = h
        .add(invoice, "card", Provider::Card, h.held_transfer(25))
        .await;
    h.dispatcher
        .dispatch_transaction(child.transaction_id, TransactionStatus::Auth)
        .await
        .unwrap();

    // no receipt stored yet
    let err = h
        .dispatcher
        .dispatch_transaction(child.transaction_id, TransactionStatus::Hold)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(
        h.transaction(child.transaction_id).await.status,
        TransactionStatus::AuthWait
    );
    assert_eq!(h.balance(h.customer).await, (100, 100));
}
