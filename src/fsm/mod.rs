//! Strategy Dispatch Framework
//!
//! A strategy is a named table of `(from, to) -> handler` for one invoice
//! kind or one transaction kind. The [`Dispatcher`] loads an entity, reads its
//! persisted status as the current state and fires the matching handler.
//!
//! ```text
//!   queue topic ──► QueuePoller ──► Dispatcher ──► StrategyRegistry
//!                                                    │
//!                                     StateMachine<E>::fire(from, to)
//!                                                    │
//!                                 handler: own db tx, re-validate, write,
//!                                 enqueue follow-ups (outbox), commit
//! ```
//!
//! Handler contract:
//! 1. re-read and lock the entity, check status and strategy
//! 2. record `next_status` before anything externally visible
//! 3. run the effect: balance step in the same db tx, or enqueue a provider
//!    command and park in a `*_wait` status
//! 4. write the resulting status, clear `next_status`, commit
//!
//! Any error drops the db tx, so the entity stays where it was.

pub mod dispatcher;
pub mod machine;
pub mod poller;
pub mod provider_worker;
pub mod recovery;
pub mod registry;
pub mod strategies;

#[cfg(test)]
mod integration_tests;

use async_trait::async_trait;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use crate::ledger::{Invoice, InvoiceStatus, LedgerError, Transaction, TransactionStatus};
use crate::store::{EntityKind, QueueMessage, Store};

pub use dispatcher::Dispatcher;
pub use machine::StateMachine;
pub use poller::{QueuePoller, drain_all};
pub use provider_worker::ProviderWorker;
pub use recovery::{RecoveryWorker, WorkerConfig};
pub use registry::StrategyRegistry;

/// Entity driven by a strategy
pub trait FsmEntity: Clone + Send + Sync + 'static {
    type Status: Copy
        + Eq
        + Ord
        + Hash
        + fmt::Debug
        + fmt::Display
        + FromStr<Err = LedgerError>
        + Send
        + Sync
        + 'static;

    const KIND: EntityKind;

    fn entity_id(&self) -> i64;

    fn status(&self) -> Self::Status;

    fn strategy(&self) -> &str;
}

impl FsmEntity for Invoice {
    type Status = InvoiceStatus;
    const KIND: EntityKind = EntityKind::Invoice;

    fn entity_id(&self) -> i64 {
        self.invoice_id.get()
    }

    fn status(&self) -> InvoiceStatus {
        self.status
    }

    fn strategy(&self) -> &str {
        &self.strategy
    }
}

impl FsmEntity for Transaction {
    type Status = TransactionStatus;
    const KIND: EntityKind = EntityKind::Transaction;

    fn entity_id(&self) -> i64 {
        self.transaction_id.get()
    }

    fn status(&self) -> TransactionStatus {
        self.status
    }

    fn strategy(&self) -> &str {
        &self.strategy
    }
}

/// One `(from, to)` entry of a strategy table.
///
/// `entity` is the snapshot the dispatcher loaded; handlers re-read it under
/// a row lock before writing.
#[async_trait]
pub trait TransitionHandler<E: FsmEntity>: Send + Sync {
    async fn handle(
        &self,
        store: &dyn Store,
        entity: &E,
        target: E::Status,
    ) -> Result<(), LedgerError>;
}

/// Consumer of one queue topic
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage) -> Result<(), LedgerError>;
}
