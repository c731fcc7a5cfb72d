//! Payment Provider Collaborators
//!
//! The core only ever asks a provider to submit, capture or void a transfer.
//! Replies arrive as a [`ProviderReceipt`]; a receipt that already carries a
//! final status is turned into a dispatch message by the provider worker,
//! a `pending` one waits for an inbound callback.

pub mod loopback;

pub use loopback::LoopbackProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ledger::{Amount, LedgerError, Provider, Transaction, TransactionId, TransactionStatus};

/// Provider-side state of an operation (stored in `provider_oper_status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderOperStatus {
    /// Accepted by the provider, outcome reported later by callback
    Pending,
    /// Funds reserved
    Hold,
    /// Funds moved
    Accepted,
    /// Declined or voided
    Rejected,
}

impl ProviderOperStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderOperStatus::Pending => "pending",
            ProviderOperStatus::Hold => "hold",
            ProviderOperStatus::Accepted => "accepted",
            ProviderOperStatus::Rejected => "rejected",
        }
    }

    /// Transaction status this provider state asks for, if final
    pub fn callback_target(&self) -> Option<TransactionStatus> {
        match self {
            ProviderOperStatus::Pending => None,
            ProviderOperStatus::Hold => Some(TransactionStatus::Hold),
            ProviderOperStatus::Accepted => Some(TransactionStatus::Accepted),
            ProviderOperStatus::Rejected => Some(TransactionStatus::Rejected),
        }
    }

    /// Provider state reported by an inbound callback for `target`
    pub fn from_target(target: TransactionStatus) -> Result<Self, LedgerError> {
        match target {
            TransactionStatus::Hold => Ok(ProviderOperStatus::Hold),
            TransactionStatus::Accepted => Ok(ProviderOperStatus::Accepted),
            TransactionStatus::Rejected => Ok(ProviderOperStatus::Rejected),
            other => Err(LedgerError::TargetNotAllowed(other.to_string())),
        }
    }
}

impl fmt::Display for ProviderOperStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderOperStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProviderOperStatus::Pending),
            "hold" => Ok(ProviderOperStatus::Hold),
            "accepted" => Ok(ProviderOperStatus::Accepted),
            "rejected" => Ok(ProviderOperStatus::Rejected),
            other => Err(LedgerError::Provider(format!("unknown provider status {other:?}"))),
        }
    }
}

/// Provider reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReceipt {
    /// Correlation id
    pub oper_id: String,
    pub status: ProviderOperStatus,
    /// Where the payer completes the operation, if anywhere
    pub url: Option<String>,
}

/// External payment provider
///
/// All calls must be idempotent per transaction / operation id: the worker
/// may repeat a call after a crash.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Provider tag this client serves
    fn provider(&self) -> Provider;

    /// Start a transfer; `hold` reserves funds for a later capture/void
    async fn submit_transfer(
        &self,
        transaction_id: TransactionId,
        amount: Amount,
        hold: bool,
    ) -> Result<ProviderReceipt, LedgerError>;

    /// Settle a held transfer
    async fn capture(&self, oper_id: &str) -> Result<ProviderReceipt, LedgerError>;

    /// Release a held transfer
    async fn void(&self, oper_id: &str) -> Result<ProviderReceipt, LedgerError>;
}

/// Parked in `*_wait` with the provider's answer still `pending`: only an
/// inbound callback can move it on, so recovery leaves it alone.
pub fn awaits_callback(transaction: &Transaction) -> bool {
    transaction.status.is_waiting()
        && transaction.provider_oper_status.as_deref() == Some(ProviderOperStatus::Pending.as_str())
}
