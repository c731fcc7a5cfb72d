//! Ledger Error Types
//!
//! Single error type for the accounting kernel, the processor and the
//! dispatch framework. Every variant belongs to one [`ErrorKind`]:
//! validation errors are never retried, conflicts may be retried by the
//! caller after a fresh read, capacity errors are backpressure.

use thiserror::Error;

use super::types::{AccountId, InvoiceId, OperationId, TransactionId};

/// Error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Capacity,
    Internal,
}

#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    // === Validation Errors ===
    #[error("Key must not be empty")]
    EmptyKey,

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Hold operation requires a hold account")]
    MissingHoldAccount,

    #[error("Hold account given for a non-hold operation")]
    UnexpectedHoldAccount,

    #[error("Unknown status: {0}")]
    UnknownStatus(String),

    #[error("Not allowed operation strategy: {0}")]
    NotAllowedOperationStrategy(String),

    #[error("Unknown provider: {0:?}")]
    UnknownProvider(String),

    #[error("Strategy not registered: {0}")]
    UnknownStrategy(String),

    #[error("Accounts of one operation must share a currency")]
    CurrencyMismatch,

    #[error("Currency not found: {0}")]
    CurrencyNotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Invoice not found: {0}")]
    InvoiceNotFound(InvoiceId),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("Invoice {0} is not in draft")]
    InvoiceNotDraft(InvoiceId),

    #[error("Invoice {0} has no transactions")]
    EmptyInvoice(InvoiceId),

    #[error("Operation {operation_id} not in allowed status: {status}")]
    OperationNotInAllowedStatus {
        operation_id: OperationId,
        status: String,
    },

    #[error("Not allowed: balance engine does not handle target status {0}")]
    TargetNotAllowed(String),

    #[error("Transition not allowed for {entity}: {from} -> {to}")]
    TransitionNotAllowed {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("No transition handler in strategy {strategy}: {from} -> {to}")]
    NoTransitionHandler {
        strategy: String,
        from: String,
        to: String,
    },

    #[error("Entity belongs to strategy {actual}, dispatched to {expected}")]
    StrategyMismatch { expected: String, actual: String },

    #[error("Insufficient balance on account {0}")]
    InsufficientBalance(AccountId),

    // === Concurrency Conflicts ===
    #[error("Rejected - stale version of transaction {0}")]
    StaleVersion(TransactionId),

    #[error("Unexpected status: expected {expected}, found {actual}")]
    UnexpectedStatus { expected: String, actual: String },

    // === Capacity ===
    #[error("Processor can't keep up")]
    Backpressure,

    #[error("Processor is stopped")]
    ProcessorStopped,

    // === Internal ===
    #[error("Not supported pairs of strategy and next status: {strategy} -> {target}")]
    UnsupportedPair { strategy: String, target: String },

    #[error("Amount would cause overflow")]
    Overflow,

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LedgerError {
    /// Taxonomy bucket
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::StaleVersion(_) | LedgerError::UnexpectedStatus { .. } => {
                ErrorKind::Conflict
            }
            LedgerError::Backpressure | LedgerError::ProcessorStopped => ErrorKind::Capacity,
            LedgerError::UnsupportedPair { .. }
            | LedgerError::Overflow
            | LedgerError::Provider(_)
            | LedgerError::Database(_)
            | LedgerError::Serialization(_) => ErrorKind::Internal,
            _ => ErrorKind::Validation,
        }
    }

    /// Only conflicts are worth retrying, and only after a fresh read
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::EmptyKey => "EMPTY_KEY",
            LedgerError::InvalidAmount => "INVALID_AMOUNT",
            LedgerError::MissingHoldAccount => "MISSING_HOLD_ACCOUNT",
            LedgerError::UnexpectedHoldAccount => "UNEXPECTED_HOLD_ACCOUNT",
            LedgerError::UnknownStatus(_) => "UNKNOWN_STATUS",
            LedgerError::NotAllowedOperationStrategy(_) => "NOT_ALLOWED_OPERATION_STRATEGY",
            LedgerError::UnknownProvider(_) => "UNKNOWN_PROVIDER",
            LedgerError::UnknownStrategy(_) => "UNKNOWN_STRATEGY",
            LedgerError::CurrencyMismatch => "CURRENCY_MISMATCH",
            LedgerError::CurrencyNotFound(_) => "CURRENCY_NOT_FOUND",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::InvoiceNotFound(_) => "INVOICE_NOT_FOUND",
            LedgerError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            LedgerError::Duplicate(_) => "DUPLICATE",
            LedgerError::InvoiceNotDraft(_) => "INVOICE_NOT_DRAFT",
            LedgerError::EmptyInvoice(_) => "EMPTY_INVOICE",
            LedgerError::OperationNotInAllowedStatus { .. } => "OPERATION_NOT_IN_ALLOWED_STATUS",
            LedgerError::TargetNotAllowed(_) => "NOT_ALLOWED",
            LedgerError::TransitionNotAllowed { .. } => "TRANSITION_NOT_ALLOWED",
            LedgerError::NoTransitionHandler { .. } => "NO_TRANSITION_HANDLER",
            LedgerError::StrategyMismatch { .. } => "STRATEGY_MISMATCH",
            LedgerError::InsufficientBalance(_) => "INSUFFICIENT_BALANCE",
            LedgerError::StaleVersion(_) => "STALE_VERSION",
            LedgerError::UnexpectedStatus { .. } => "UNEXPECTED_STATUS",
            LedgerError::Backpressure => "PROCESSOR_BACKPRESSURE",
            LedgerError::ProcessorStopped => "PROCESSOR_STOPPED",
            LedgerError::UnsupportedPair { .. } => "UNSUPPORTED_PAIR",
            LedgerError::Overflow => "OVERFLOW",
            LedgerError::Provider(_) => "PROVIDER_ERROR",
            LedgerError::Database(_) => "DATABASE_ERROR",
            LedgerError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Helper for status re-validation failures
    pub fn unexpected_status(expected: impl ToString, actual: impl ToString) -> Self {
        LedgerError::UnexpectedStatus {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}
