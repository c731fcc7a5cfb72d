//! End-to-end ledger scenarios through the public service API, on the
//! in-memory store.

use std::sync::Arc;

use ledger_engine::fsm::{Dispatcher, ProviderWorker, QueuePoller, StrategyRegistry, drain_all};
use ledger_engine::ledger::{
    AccountId, Amount, InvoiceId, InvoiceStatus, NewAccount, NewInvoice, NewOperation,
    NewTransaction, Provider, TransactionId, TransactionStatus,
};
use ledger_engine::processor::{DEFAULT_QUEUE_CAPACITY, TransactionProcessor};
use ledger_engine::provider::LoopbackProvider;
use ledger_engine::service::LedgerService;
use ledger_engine::store::{MemoryStore, Store, TOPIC_INVOICE, TOPIC_TRANSACTION};

struct Ledger {
    service: LedgerService,
    card: Arc<LoopbackProvider>,
    pollers: Vec<QueuePoller>,
    bank: AccountId,
    customer: AccountId,
    merchant: AccountId,
    hold: AccountId,
}

impl Ledger {
    async fn open() -> Self {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::new(StrategyRegistry::standard()),
        ));
        let processor = TransactionProcessor::new(store.clone(), DEFAULT_QUEUE_CAPACITY);
        let card = Arc::new(LoopbackProvider::new(Provider::Card));
        let worker = Arc::new(ProviderWorker::new(store.clone()).with_provider(card.clone()));
        let pollers = vec![
            QueuePoller::new(TOPIC_INVOICE, store.clone(), dispatcher.clone()),
            QueuePoller::new(TOPIC_TRANSACTION, store.clone(), dispatcher.clone()),
            QueuePoller::new(Provider::Card.topic(), store.clone(), worker),
        ];
        let service = LedgerService::new(store, dispatcher, processor);

        let usd = service.upsert_currency(" USD ", None).await.unwrap();
        let mut ids = Vec::new();
        for key in ["bank", "customer", "merchant", "hold"] {
            let account = service
                .create_account(NewAccount::new(usd.currency_id, key))
                .await
                .unwrap();
            ids.push(account.account_id);
        }

        Self {
            service,
            card,
            pollers,
            bank: ids[0],
            customer: ids[1],
            merchant: ids[2],
            hold: ids[3],
        }
    }

    async fn settle(&self) {
        drain_all(&self.pollers).await.unwrap();
    }

    async fn invoice_with(
        &self,
        key: &str,
        strategy: &str,
        provider: Provider,
        operation: NewOperation,
    ) -> (InvoiceId, TransactionId) {
        let invoice = self
            .service
            .new_invoice(NewInvoice::new(key, "simple"))
            .await
            .unwrap();
        let (transaction, _) = self
            .service
            .add_transaction_to_invoice(
                invoice.invoice_id,
                NewTransaction::new(strategy, provider, operation.amount).with_operation(operation),
            )
            .await
            .unwrap();
        (invoice.invoice_id, transaction.transaction_id)
    }

    /// Credit the customer through a recharge invoice
    async fn fund_customer(&self, amount: Amount) {
        let (invoice, _) = self
            .invoice_with(
                "funding",
                "internal",
                Provider::Internal,
                NewOperation::recharge(self.bank, self.customer, amount),
            )
            .await;
        self.service.auth_invoice(invoice).await.unwrap();
        self.settle().await;
        assert_eq!(
            self.service.invoice(invoice).await.unwrap().status,
            InvoiceStatus::Accepted
        );
    }

    async fn balance(&self, id: AccountId) -> (Amount, Amount) {
        let account = self.service.account(id).await.unwrap();
        (account.balance, account.balance_accepted)
    }

    async fn status(&self, id: TransactionId) -> TransactionStatus {
        self.service.transaction(id).await.unwrap().status
    }
}

#[tokio::test]
async fn qa_recharge_then_transfer() {
    let ledger = Ledger::open().await;
    ledger.fund_customer(100).await;
    assert_eq!(ledger.balance(ledger.customer).await, (100, 100));

    let (invoice, tx) = ledger
        .invoice_with(
            "order-1",
            "internal",
            Provider::Internal,
            NewOperation::transfer(ledger.customer, ledger.merchant, 40),
        )
        .await;
    assert_eq!(ledger.service.invoice(invoice).await.unwrap().total_amount, 40);

    ledger.service.auth_invoice(invoice).await.unwrap();
    ledger.settle().await;

    assert_eq!(ledger.status(tx).await, TransactionStatus::Accepted);
    assert_eq!(
        ledger.service.invoice(invoice).await.unwrap().status,
        InvoiceStatus::Accepted
    );
    assert_eq!(ledger.balance(ledger.customer).await, (60, 60));
    assert_eq!(ledger.balance(ledger.merchant).await, (40, 40));
    assert!(ledger.service.dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn qa_pending_card_completed_by_callbacks() {
    let ledger = Ledger::open().await;
    ledger.fund_customer(100).await;
    ledger.card.set_pending(true);

    let (invoice, tx) = ledger
        .invoice_with(
            "card-1",
            "card",
            Provider::Card,
            NewOperation::transfer(ledger.customer, ledger.merchant, 25).with_hold(ledger.hold),
        )
        .await;

    ledger.service.auth_invoice(invoice).await.unwrap();
    ledger.settle().await;
    // Provider answered "pending": no callback was queued
    assert_eq!(ledger.status(tx).await, TransactionStatus::AuthWait);
    assert_eq!(ledger.balance(ledger.customer).await, (100, 100));

    ledger
        .service
        .provider_callback(tx, TransactionStatus::Hold)
        .await
        .unwrap();
    ledger.settle().await;
    assert_eq!(ledger.status(tx).await, TransactionStatus::Hold);
    assert_eq!(ledger.balance(ledger.customer).await, (75, 100));
    assert_eq!(ledger.balance(ledger.hold).await, (25, 0));
    assert_eq!(
        ledger.service.invoice(invoice).await.unwrap().status,
        InvoiceStatus::Wait
    );

    ledger.service.accept_invoice(invoice).await.unwrap();
    ledger.settle().await;
    assert_eq!(ledger.status(tx).await, TransactionStatus::AcceptedWait);
    assert_eq!(ledger.card.capture_count(), 1);

    ledger
        .service
        .provider_callback(tx, TransactionStatus::Accepted)
        .await
        .unwrap();
    ledger.settle().await;

    assert_eq!(ledger.status(tx).await, TransactionStatus::Accepted);
    assert_eq!(
        ledger.service.invoice(invoice).await.unwrap().status,
        InvoiceStatus::Accepted
    );
    assert_eq!(ledger.balance(ledger.customer).await, (75, 75));
    assert_eq!(ledger.balance(ledger.merchant).await, (25, 25));
    assert_eq!(ledger.balance(ledger.hold).await, (0, 0));
}

#[tokio::test]
async fn qa_callback_refused_outside_wait() {
    let ledger = Ledger::open().await;
    let (_, tx) = ledger
        .invoice_with(
            "card-2",
            "card",
            Provider::Card,
            NewOperation::transfer(ledger.customer, ledger.merchant, 5).with_hold(ledger.hold),
        )
        .await;

    let err = ledger
        .service
        .provider_callback(tx, TransactionStatus::Hold)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNEXPECTED_STATUS");

    let err = ledger
        .service
        .provider_callback(tx, TransactionStatus::Auth)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_ALLOWED");
    assert_eq!(ledger.status(tx).await, TransactionStatus::Draft);
}

#[tokio::test]
async fn qa_submit_transition_through_processor() {
    let ledger = Ledger::open().await;
    ledger.fund_customer(50).await;
    let (_, tx) = ledger
        .invoice_with(
            "direct-1",
            "internal",
            Provider::Internal,
            NewOperation::transfer(ledger.customer, ledger.merchant, 20),
        )
        .await;

    let request = ledger
        .service
        .submit_transition(tx, TransactionStatus::Auth)
        .await
        .unwrap();
    assert_eq!(request.expected_status, TransactionStatus::Draft);
    assert_eq!(ledger.service.processor().process_pending().await, 1);

    assert_eq!(ledger.status(tx).await, TransactionStatus::Accepted);
    assert_eq!(ledger.balance(ledger.customer).await, (30, 30));
    assert_eq!(ledger.balance(ledger.merchant).await, (20, 20));

    // The snapshot is stale now; the retry is dropped without effect
    ledger.service.processor().submit(request).unwrap();
    assert_eq!(ledger.service.processor().process_pending().await, 1);
    assert_eq!(ledger.balance(ledger.customer).await, (30, 30));
    assert_eq!(ledger.service.processor().stats().snapshot().dropped, 1);
}

#[tokio::test]
async fn qa_creation_validation() {
    let ledger = Ledger::open().await;

    let err = ledger.service.upsert_currency("   ", None).await.unwrap_err();
    assert_eq!(err.code(), "EMPTY_KEY");

    let err = ledger
        .service
        .new_invoice(NewInvoice::new("inv", "nonexistent"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNKNOWN_STRATEGY");

    let invoice = ledger
        .service
        .new_invoice(NewInvoice::new("inv", "simple"))
        .await
        .unwrap();

    let zero = NewTransaction::new("internal", Provider::Internal, 0)
        .with_operation(NewOperation::transfer(ledger.customer, ledger.merchant, 1));
    let err = ledger
        .service
        .add_transaction_to_invoice(invoice.invoice_id, zero)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_AMOUNT");

    let eur = ledger.service.upsert_currency("eur", None).await.unwrap();
    let euro_account = ledger
        .service
        .create_account(NewAccount::new(eur.currency_id, "euro"))
        .await
        .unwrap();
    let mixed = NewTransaction::new("internal", Provider::Internal, 3).with_operation(
        NewOperation::transfer(ledger.customer, euro_account.account_id, 3),
    );
    let err = ledger
        .service
        .add_transaction_to_invoice(invoice.invoice_id, mixed)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CURRENCY_MISMATCH");

    let missing = NewTransaction::new("internal", Provider::Internal, 3)
        .with_operation(NewOperation::transfer(ledger.customer, AccountId(9_999), 3));
    let err = ledger
        .service
        .add_transaction_to_invoice(invoice.invoice_id, missing)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ACCOUNT_NOT_FOUND");

    // Nothing was written by the refused calls
    assert!(ledger
        .service
        .transactions(invoice.invoice_id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        ledger.service.invoice(invoice.invoice_id).await.unwrap().total_amount,
        0
    );
}

#[tokio::test]
async fn qa_invoice_closed_after_auth() {
    let ledger = Ledger::open().await;
    ledger.fund_customer(10).await;
    let (invoice, _) = ledger
        .invoice_with(
            "closed-1",
            "internal",
            Provider::Internal,
            NewOperation::transfer(ledger.customer, ledger.merchant, 10),
        )
        .await;
    ledger.service.auth_invoice(invoice).await.unwrap();

    let late = NewTransaction::new("internal", Provider::Internal, 1)
        .with_operation(NewOperation::transfer(ledger.customer, ledger.merchant, 1));
    let err = ledger
        .service
        .add_transaction_to_invoice(invoice, late)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVOICE_NOT_DRAFT");
}
