//! Dispatcher
//!
//! `Dispatch(target, entity_id)`: load the entity, take its persisted status
//! as the current state and fire the owning strategy's handler.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{FsmEntity, MessageHandler, StateMachine, StrategyRegistry};
use crate::ledger::{
    InvoiceId, InvoiceStatus, LedgerError, TransactionId, TransactionStatus,
};
use crate::store::{EntityKind, QueueMessage, Store};

pub struct Dispatcher {
    store: Arc<dyn Store>,
    registry: Arc<StrategyRegistry>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, registry: Arc<StrategyRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub async fn dispatch_invoice(
        &self,
        invoice_id: InvoiceId,
        target: InvoiceStatus,
    ) -> Result<(), LedgerError> {
        let invoice = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or(LedgerError::InvoiceNotFound(invoice_id))?;
        let machine = self.registry.invoice(&invoice.strategy)?;
        machine.fire(self.store.as_ref(), &invoice, target).await
    }

    pub async fn dispatch_transaction(
        &self,
        transaction_id: TransactionId,
        target: TransactionStatus,
    ) -> Result<(), LedgerError> {
        let transaction = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(transaction_id))?;
        let machine = self.registry.transaction(&transaction.strategy)?;
        machine.fire(self.store.as_ref(), &transaction, target).await
    }

    /// Queue entry point. Delivery is at-least-once: an entity already at the
    /// requested status is a repeated delivery and is acknowledged as is.
    pub async fn handle_message(&self, message: &QueueMessage) -> Result<(), LedgerError> {
        let payload = &message.payload;
        match payload.entity.kind {
            EntityKind::Invoice => {
                let id = InvoiceId(payload.entity.id);
                let invoice = self
                    .store
                    .get_invoice(id)
                    .await?
                    .ok_or(LedgerError::InvoiceNotFound(id))?;
                let machine = self.registry.invoice(&invoice.strategy)?;
                self.fire_delivered(&machine, &invoice, message).await
            }
            EntityKind::Transaction => {
                let id = TransactionId(payload.entity.id);
                let transaction = self
                    .store
                    .get_transaction(id)
                    .await?
                    .ok_or(LedgerError::TransactionNotFound(id))?;
                let machine = self.registry.transaction(&transaction.strategy)?;
                self.fire_delivered(&machine, &transaction, message).await
            }
        }
    }

    async fn fire_delivered<E: FsmEntity>(
        &self,
        machine: &StateMachine<E>,
        entity: &E,
        message: &QueueMessage,
    ) -> Result<(), LedgerError> {
        let payload = &message.payload;
        if entity.strategy() != payload.strategy {
            return Err(LedgerError::StrategyMismatch {
                expected: payload.strategy.clone(),
                actual: entity.strategy().to_string(),
            });
        }

        let target: E::Status = payload.target.parse()?;
        if entity.status() == target {
            debug!(
                entity = %payload.entity,
                status = %target,
                "Already at target, skipping repeated delivery"
            );
            return Ok(());
        }
        machine.fire(self.store.as_ref(), entity, target).await
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, message: &QueueMessage) -> Result<(), LedgerError> {
        self.handle_message(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::NewInvoice;
    use crate::store::{EntityRef, LedgerStore, MemoryStore, TOPIC_INVOICE};

    fn dispatcher(store: Arc<MemoryStore>) -> Dispatcher {
        Dispatcher::new(store, Arc::new(StrategyRegistry::standard()))
    }

    #[tokio::test]
    async fn test_dispatch_missing_entity() {
        let dispatcher = dispatcher(Arc::new(MemoryStore::new()));
        let err = dispatcher
            .dispatch_invoice(InvoiceId(42), InvoiceStatus::Auth)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVOICE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_dispatch_unregistered_pair() {
        let store = Arc::new(MemoryStore::new());
        let invoice = store
            .create_invoice(&NewInvoice::new("inv-1", "simple"))
            .await
            .unwrap();
        let err = dispatcher(store)
            .dispatch_invoice(invoice.invoice_id, InvoiceStatus::Accepted)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_TRANSITION_HANDLER");
    }

    #[tokio::test]
    async fn test_repeated_delivery_is_acknowledged() {
        let store = Arc::new(MemoryStore::new());
        let invoice = store
            .create_invoice(&NewInvoice::new("inv-1", "simple"))
            .await
            .unwrap();
        // draft -> draft has no handler; as a delivery it is a no-op
        let message = QueueMessage::invoice(&invoice, InvoiceStatus::Draft);
        dispatcher(store).handle_message(&message).await.unwrap();
    }

    #[tokio::test]
    async fn test_message_strategy_mismatch() {
        let store = Arc::new(MemoryStore::new());
        let invoice = store
            .create_invoice(&NewInvoice::new("inv-1", "simple"))
            .await
            .unwrap();
        let message = QueueMessage::new(
            TOPIC_INVOICE,
            EntityRef::invoice(invoice.invoice_id),
            "auth",
            "bulk",
        );
        let err = dispatcher(store).handle_message(&message).await.unwrap_err();
        assert!(matches!(err, LedgerError::StrategyMismatch { .. }));
    }
}
