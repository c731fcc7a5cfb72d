//! Ledger Entities
//!
//! Currency, Account, Operation, Transaction and Invoice rows plus the
//! creation requests that validate them. Status-bearing entities are created
//! once and only move forward through their transition chart.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use super::error::LedgerError;
use super::status::{InvoiceStatus, OperationStatus, OperationStrategy, Provider, TransactionStatus};
use super::types::{
    AccountId, Amount, CurrencyId, InvoiceId, OperationId, TransactionId, normalize_key,
};

/// Opaque metadata blob
pub type Meta = serde_json::Value;

/// Current time at database precision (microseconds).
///
/// `updated_at` is the optimistic-concurrency token, so every store must
/// produce values that survive a PostgreSQL round trip unchanged.
pub fn db_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Currency {
    pub currency_id: CurrencyId,
    /// Normalized (trimmed, lower-cased), unique
    pub key: String,
    pub meta: Option<Meta>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: AccountId,
    pub currency_id: CurrencyId,
    /// Unique per currency
    pub key: String,
    /// Total balance, including funds still subject to a hold
    pub balance: Amount,
    /// Settled portion of the balance
    pub balance_accepted: Amount,
    pub meta: Option<Meta>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: OperationId,
    pub transaction_id: TransactionId,
    pub invoice_id: InvoiceId,
    pub src_account_id: AccountId,
    pub dst_account_id: AccountId,
    pub amount: Amount,
    pub strategy: OperationStrategy,
    pub hold: bool,
    pub hold_account_id: Option<AccountId>,
    pub status: OperationStatus,
    pub key: Option<String>,
    pub meta: Option<Meta>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    /// Hold account of a hold operation
    pub fn hold_account(&self) -> Result<AccountId, LedgerError> {
        self.hold_account_id.ok_or(LedgerError::MissingHoldAccount)
    }

    /// Every account this operation may touch
    pub fn accounts(&self) -> impl Iterator<Item = AccountId> + '_ {
        [self.src_account_id, self.dst_account_id]
            .into_iter()
            .chain(self.hold_account_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: TransactionId,
    pub invoice_id: InvoiceId,
    pub amount: Amount,
    /// Name of the transaction strategy that drives this transaction
    pub strategy: String,
    pub provider: Provider,
    pub provider_oper_id: Option<String>,
    pub provider_oper_status: Option<String>,
    pub provider_oper_url: Option<String>,
    pub status: TransactionStatus,
    /// Status this transaction is currently moving toward
    pub next_status: Option<TransactionStatus>,
    pub meta: Option<Meta>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: InvoiceId,
    /// Caller-unique key
    pub key: String,
    /// Name of the invoice strategy that drives this invoice
    pub strategy: String,
    pub total_amount: Amount,
    pub status: InvoiceStatus,
    pub next_status: Option<InvoiceStatus>,
    pub meta: Option<Meta>,
    pub payload: Option<Meta>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================
// CREATION REQUESTS
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAccount {
    pub currency_id: CurrencyId,
    pub key: String,
    pub meta: Option<Meta>,
}

impl NewAccount {
    pub fn new(currency_id: CurrencyId, key: impl Into<String>) -> Self {
        Self {
            currency_id,
            key: key.into(),
            meta: None,
        }
    }

    /// Normalizes the key in place
    pub fn validate(&mut self) -> Result<(), LedgerError> {
        self.key = normalize_key(&self.key);
        if self.key.is_empty() {
            return Err(LedgerError::EmptyKey);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOperation {
    pub src_account_id: AccountId,
    pub dst_account_id: AccountId,
    pub amount: Amount,
    pub strategy: OperationStrategy,
    pub hold: bool,
    pub hold_account_id: Option<AccountId>,
    pub key: Option<String>,
    pub meta: Option<Meta>,
}

impl NewOperation {
    pub fn new(
        strategy: OperationStrategy,
        src_account_id: AccountId,
        dst_account_id: AccountId,
        amount: Amount,
    ) -> Self {
        Self {
            src_account_id,
            dst_account_id,
            amount,
            strategy,
            hold: false,
            hold_account_id: None,
            key: None,
            meta: None,
        }
    }

    pub fn transfer(src: AccountId, dst: AccountId, amount: Amount) -> Self {
        Self::new(OperationStrategy::SimpleTransfer, src, dst, amount)
    }

    pub fn recharge(src: AccountId, dst: AccountId, amount: Amount) -> Self {
        Self::new(OperationStrategy::Recharge, src, dst, amount)
    }

    pub fn withdraw(src: AccountId, dst: AccountId, amount: Amount) -> Self {
        Self::new(OperationStrategy::Withdraw, src, dst, amount)
    }

    /// Two-phase variant parking funds on `hold_account_id`
    pub fn with_hold(mut self, hold_account_id: AccountId) -> Self {
        self.hold = true;
        self.hold_account_id = Some(hold_account_id);
        self
    }

    /// Parse a wire strategy name; empty or unknown names are refused.
    pub fn parse_strategy(name: &str) -> Result<OperationStrategy, LedgerError> {
        name.parse()
            .map_err(|_| LedgerError::NotAllowedOperationStrategy(name.to_string()))
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        match (self.hold, self.hold_account_id) {
            (true, None) => Err(LedgerError::MissingHoldAccount),
            (false, Some(_)) => Err(LedgerError::UnexpectedHoldAccount),
            _ => Ok(()),
        }
    }

    /// Every account this operation references
    pub fn accounts(&self) -> impl Iterator<Item = AccountId> + '_ {
        [self.src_account_id, self.dst_account_id]
            .into_iter()
            .chain(self.hold_account_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub amount: Amount,
    pub strategy: String,
    pub provider: Provider,
    pub meta: Option<Meta>,
    pub operations: Vec<NewOperation>,
}

impl NewTransaction {
    pub fn new(strategy: impl Into<String>, provider: Provider, amount: Amount) -> Self {
        Self {
            amount,
            strategy: strategy.into(),
            provider,
            meta: None,
            operations: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: NewOperation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Parse a wire provider tag; the empty tag is never a valid provider.
    pub fn parse_provider(tag: &str) -> Result<Provider, LedgerError> {
        tag.parse()
            .map_err(|_| LedgerError::UnknownProvider(tag.to_string()))
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if self.strategy.trim().is_empty() {
            return Err(LedgerError::UnknownStrategy(self.strategy.clone()));
        }
        self.operations.iter().try_for_each(NewOperation::validate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInvoice {
    pub key: String,
    pub strategy: String,
    pub meta: Option<Meta>,
    pub payload: Option<Meta>,
}

impl NewInvoice {
    pub fn new(key: impl Into<String>, strategy: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            strategy: strategy.into(),
            meta: None,
            payload: None,
        }
    }

    pub fn validate(&mut self) -> Result<(), LedgerError> {
        self.key = self.key.trim().to_string();
        if self.key.is_empty() {
            return Err(LedgerError::EmptyKey);
        }
        Ok(())
    }
}
