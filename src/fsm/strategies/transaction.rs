//! Transaction strategies `internal` and `card`
//!
//! `internal` moves money with the balance engine alone:
//!
//! ```text
//! draft ──► auth ──► accepted | rejected
//!   └──────────────► accepted               (nothing held)
//! ```
//!
//! `card` parks in a `*_wait` status behind every provider round trip:
//!
//! ```text
//! draft ──► auth_wait ──► hold ──► accepted_wait ──► accepted
//!              │  │         └────► rejected_wait ──► rejected
//!              │  └───────────────────────────────► accepted
//!              └──────────────────────────────────► rejected
//! ```
//!
//! Provider callbacks are only honoured once the worker stored the matching
//! `provider_oper_status`.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{lock_transaction, notify_invoice};
use crate::fsm::{StateMachine, TransitionHandler};
use crate::ledger::{
    ErrorKind, LedgerError, OPERATION_CHART, OperationStatus, Transaction, TransactionStatus,
};
use crate::processor::{StepOutcome, apply_balance_step};
use crate::provider::ProviderOperStatus;
use crate::store::{QueueMessage, Store};

pub const INTERNAL: &str = "internal";
pub const CARD: &str = "card";

pub fn internal() -> StateMachine<Transaction> {
    use TransactionStatus::*;
    StateMachine::new(INTERNAL)
        .on(Draft, Auth, BalanceStep::authorize(Auth))
        .on(Auth, Accepted, BalanceStep::finish(Accepted))
        .on(Auth, Rejected, BalanceStep::finish(Rejected))
}

pub fn card() -> StateMachine<Transaction> {
    use TransactionStatus::*;
    StateMachine::new(CARD)
        .on(Draft, Auth, ProviderCommand { park: AuthWait })
        .on(AuthWait, Hold, BalanceStep::authorize(Hold).after_provider())
        .on(
            AuthWait,
            Accepted,
            BalanceStep::authorize(Hold).settling().after_provider(),
        )
        .on(AuthWait, Rejected, RejectDraft)
        .on(Hold, Accepted, ProviderCommand { park: AcceptedWait })
        .on(AcceptedWait, Accepted, BalanceStep::finish(Accepted).after_provider())
        .on(Hold, Rejected, ProviderCommand { park: RejectedWait })
        .on(RejectedWait, Rejected, BalanceStep::finish(Rejected).after_provider())
}

/// Check a provider callback against the stored receipt
fn ensure_provider_status(
    transaction: &Transaction,
    target: TransactionStatus,
) -> Result<(), LedgerError> {
    let expected = ProviderOperStatus::from_target(target)?;
    match transaction.provider_oper_status.as_deref() {
        Some(status) if status == expected.as_str() => Ok(()),
        other => Err(LedgerError::unexpected_status(
            expected,
            other.unwrap_or("none"),
        )),
    }
}

/// Balance engine run inside the dispatch db tx
struct BalanceStep {
    /// Status handed to the engine
    engine: TransactionStatus,
    /// After `auth`: status when something is left on hold
    holding: TransactionStatus,
    settle_holds: bool,
    provider_guard: bool,
    /// A business error ends the transaction in `failed`
    fail_on_error: bool,
}

impl BalanceStep {
    fn authorize(holding: TransactionStatus) -> Self {
        Self {
            engine: TransactionStatus::Auth,
            holding,
            settle_holds: false,
            provider_guard: false,
            fail_on_error: true,
        }
    }

    fn finish(target: TransactionStatus) -> Self {
        Self {
            engine: target,
            holding: target,
            settle_holds: false,
            provider_guard: false,
            fail_on_error: false,
        }
    }

    fn settling(mut self) -> Self {
        self.settle_holds = true;
        self
    }

    fn after_provider(mut self) -> Self {
        self.provider_guard = true;
        self
    }

    fn final_status(&self, outcome: &StepOutcome) -> TransactionStatus {
        match self.engine {
            TransactionStatus::Auth if outcome.all_accepted() => TransactionStatus::Accepted,
            TransactionStatus::Auth => self.holding,
            other => other,
        }
    }
}

#[async_trait]
impl TransitionHandler<Transaction> for BalanceStep {
    async fn handle(
        &self,
        store: &dyn Store,
        snapshot: &Transaction,
        target: TransactionStatus,
    ) -> Result<(), LedgerError> {
        let mut tx = store.begin().await?;
        let mut transaction = lock_transaction(tx.as_mut(), snapshot).await?;
        if self.provider_guard {
            ensure_provider_status(&transaction, target)?;
        }

        let step = apply_balance_step(
            tx.as_mut(),
            transaction.transaction_id,
            self.engine,
            self.settle_holds,
        )
        .await;
        let outcome = match step {
            Ok(outcome) => outcome,
            Err(e) => {
                // release row locks before the failure write
                drop(tx);
                if self.fail_on_error && e.kind() == ErrorKind::Validation {
                    fail_transaction(store, &transaction, &e).await;
                }
                return Err(e);
            }
        };

        let from = transaction.status;
        transaction.status = self.final_status(&outcome);
        transaction.next_status = None;
        let transaction = tx.update_transaction(&transaction).await?;
        notify_invoice(tx.as_mut(), &transaction).await?;
        tx.commit().await?;

        info!(
            transaction_id = %transaction.transaction_id,
            strategy = %transaction.strategy,
            from = %from,
            status = %transaction.status,
            operations = outcome.operations.len(),
            "Transaction transitioned"
        );
        Ok(())
    }
}

async fn fail_transaction(store: &dyn Store, locked: &Transaction, cause: &LedgerError) {
    match mark_failed(store, locked).await {
        Ok(()) => warn!(
            transaction_id = %locked.transaction_id,
            from = %locked.status,
            code = cause.code(),
            "Transaction failed"
        ),
        Err(e) => warn!(
            transaction_id = %locked.transaction_id,
            error = %e,
            "Could not mark transaction failed"
        ),
    }
}

/// Move to `failed` if nothing touched the row since `locked` was read
async fn mark_failed(store: &dyn Store, locked: &Transaction) -> Result<(), LedgerError> {
    let mut tx = store.begin().await?;
    let mut transaction = lock_transaction(tx.as_mut(), locked).await?;
    if transaction.updated_at != locked.updated_at {
        return Err(LedgerError::StaleVersion(locked.transaction_id));
    }
    transaction.status = TransactionStatus::Failed;
    transaction.next_status = None;
    let transaction = tx.update_transaction(&transaction).await?;
    notify_invoice(tx.as_mut(), &transaction).await?;
    tx.commit().await
}

/// Hand the transition to the provider worker and park in `park`
struct ProviderCommand {
    park: TransactionStatus,
}

#[async_trait]
impl TransitionHandler<Transaction> for ProviderCommand {
    async fn handle(
        &self,
        store: &dyn Store,
        snapshot: &Transaction,
        target: TransactionStatus,
    ) -> Result<(), LedgerError> {
        let mut tx = store.begin().await?;
        let mut transaction = lock_transaction(tx.as_mut(), snapshot).await?;

        transaction.status = self.park;
        transaction.next_status = Some(target);
        let transaction = tx.update_transaction(&transaction).await?;
        let message_id = tx
            .enqueue(&QueueMessage::provider(&transaction, target))
            .await?;
        tx.commit().await?;

        info!(
            transaction_id = %transaction.transaction_id,
            provider = %transaction.provider,
            command = %target,
            status = %transaction.status,
            message_id,
            "Provider command queued"
        );
        Ok(())
    }
}

/// Provider declined before anything was held: close the drafts
struct RejectDraft;

#[async_trait]
impl TransitionHandler<Transaction> for RejectDraft {
    async fn handle(
        &self,
        store: &dyn Store,
        snapshot: &Transaction,
        target: TransactionStatus,
    ) -> Result<(), LedgerError> {
        let mut tx = store.begin().await?;
        let mut transaction = lock_transaction(tx.as_mut(), snapshot).await?;
        ensure_provider_status(&transaction, target)?;

        for op in tx.lock_operations(transaction.transaction_id).await? {
            OPERATION_CHART.ensure(op.status, OperationStatus::Rejected)?;
            tx.update_operation_status(op.operation_id, OperationStatus::Rejected)
                .await?;
        }

        transaction.status = TransactionStatus::Rejected;
        transaction.next_status = None;
        let transaction = tx.update_transaction(&transaction).await?;
        notify_invoice(tx.as_mut(), &transaction).await?;
        tx.commit().await?;

        info!(transaction_id = %transaction.transaction_id, "Transaction declined by provider");
        Ok(())
    }
}
