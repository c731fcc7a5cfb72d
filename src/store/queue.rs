//! Durable Queue Messages
//!
//! Payload shape on every topic: `{entity: {kind, id}, target, strategy}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ledger::{Invoice, InvoiceId, InvoiceStatus, Transaction, TransactionId, TransactionStatus};

/// Topic consumed by the invoice dispatcher
pub const TOPIC_INVOICE: &str = "invoice";
/// Topic consumed by the transaction dispatcher
pub const TOPIC_TRANSACTION: &str = "transaction";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Invoice,
    Transaction,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Invoice => "invoice",
            EntityKind::Transaction => "transaction",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = crate::ledger::LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoice" => Ok(EntityKind::Invoice),
            "transaction" => Ok(EntityKind::Transaction),
            other => Err(crate::ledger::LedgerError::Serialization(format!(
                "unknown entity kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
}

impl EntityRef {
    pub fn invoice(id: InvoiceId) -> Self {
        Self {
            kind: EntityKind::Invoice,
            id: id.get(),
        }
    }

    pub fn transaction(id: TransactionId) -> Self {
        Self {
            kind: EntityKind::Transaction,
            id: id.get(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub entity: EntityRef,
    /// Requested status (dispatch topics) or provider command (provider topics)
    pub target: String,
    /// Strategy name of the entity
    pub strategy: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub topic: String,
    pub payload: MessagePayload,
}

impl QueueMessage {
    pub fn new(topic: impl Into<String>, entity: EntityRef, target: &str, strategy: &str) -> Self {
        Self {
            topic: topic.into(),
            payload: MessagePayload {
                entity,
                target: target.to_string(),
                strategy: strategy.to_string(),
            },
        }
    }

    /// Dispatch request for an invoice
    pub fn invoice(invoice: &Invoice, target: InvoiceStatus) -> Self {
        Self::new(
            TOPIC_INVOICE,
            EntityRef::invoice(invoice.invoice_id),
            target.as_str(),
            &invoice.strategy,
        )
    }

    /// Dispatch request for a transaction
    pub fn transaction(transaction: &Transaction, target: TransactionStatus) -> Self {
        Self::new(
            TOPIC_TRANSACTION,
            EntityRef::transaction(transaction.transaction_id),
            target.as_str(),
            &transaction.strategy,
        )
    }

    /// Command for the transaction's provider worker
    pub fn provider(transaction: &Transaction, command: TransactionStatus) -> Self {
        Self::new(
            transaction.provider.topic(),
            EntityRef::transaction(transaction.transaction_id),
            command.as_str(),
            &transaction.strategy,
        )
    }

    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(&self.payload)
    }

    pub fn from_json(topic: impl Into<String>, payload: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            topic: topic.into(),
            payload: serde_json::from_value(payload)?,
        })
    }
}

/// Message handed to a consumer by `WorkQueue::claim`
#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    pub message_id: i64,
    pub message: QueueMessage,
    pub created_at: DateTime<Utc>,
}

/// Queue message lifecycle (SMALLINT in storage)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum MessageStatus {
    Pending = 0,
    Claimed = 1,
    Processed = 2,
    Failed = -1,
}

impl MessageStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }
}

/// Work that was dropped and needs an operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Component that dropped the work (`processor`, `poller:<topic>`)
    pub source: String,
    pub entity: EntityRef,
    pub target: String,
    pub error: String,
    pub created_at: DateTime<Utc>,
}
