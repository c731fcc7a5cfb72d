//! Ledger Kernel
//!
//! Data model, transition charts and the balance engine. Nothing in here
//! touches storage.

pub mod balance;
pub mod chart;
pub mod error;
pub mod models;
pub mod status;
pub mod types;

pub use balance::{BalanceDeltas, BalanceEngine};
pub use chart::{Charted, INVOICE_CHART, OPERATION_CHART, TRANSACTION_CHART, TransitionChart};
pub use error::{ErrorKind, LedgerError};
pub use models::{
    Account, Currency, Invoice, Meta, NewAccount, NewInvoice, NewOperation, NewTransaction,
    Operation, Transaction, db_now,
};
pub use status::{InvoiceStatus, OperationStatus, OperationStrategy, Provider, TransactionStatus};
pub use types::{
    AccountId, Amount, CurrencyId, InvoiceId, OperationId, TransactionId, normalize_key,
};
