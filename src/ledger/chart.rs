//! Transition Charts
//!
//! A chart is an immutable `from → {to}` table over one status enum.
//! Lookups are fail-closed: a `from` that is not a declared source key
//! allows nothing.

use std::fmt;

use super::error::LedgerError;
use super::status::{InvoiceStatus, OperationStatus, TransactionStatus};

/// Declared transition table for one entity kind
#[derive(Debug)]
pub struct TransitionChart<S: 'static> {
    entity: &'static str,
    edges: &'static [(S, &'static [S])],
}

impl<S> TransitionChart<S>
where
    S: Copy + Eq + fmt::Display + 'static,
{
    pub const fn new(entity: &'static str, edges: &'static [(S, &'static [S])]) -> Self {
        Self { entity, edges }
    }

    /// Entity name used in error messages
    pub fn entity(&self) -> &'static str {
        self.entity
    }

    /// Allowed targets from `from` (empty for undeclared sources)
    pub fn targets(&self, from: S) -> &'static [S] {
        self.edges
            .iter()
            .find(|(source, _)| *source == from)
            .map(|(_, targets)| *targets)
            .unwrap_or_default()
    }

    /// True iff `from → to` is declared
    #[inline]
    pub fn allowed(&self, from: S, to: S) -> bool {
        self.targets(from).contains(&to)
    }

    /// `allowed` as a `Result`
    pub fn ensure(&self, from: S, to: S) -> Result<(), LedgerError> {
        if self.allowed(from, to) {
            Ok(())
        } else {
            Err(LedgerError::TransitionNotAllowed {
                entity: self.entity,
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }
}

pub static OPERATION_CHART: TransitionChart<OperationStatus> = TransitionChart::new(
    "operation",
    &[
        (
            OperationStatus::Draft,
            &[
                OperationStatus::Hold,
                OperationStatus::Accepted,
                OperationStatus::Rejected,
            ],
        ),
        (
            OperationStatus::Hold,
            &[OperationStatus::Accepted, OperationStatus::Rejected],
        ),
    ],
);

/// Only the statuses the Transaction Processor understands. The `*_wait`
/// and `hold` sub-states belong to strategies and are not charted.
pub static TRANSACTION_CHART: TransitionChart<TransactionStatus> = TransitionChart::new(
    "transaction",
    &[
        (TransactionStatus::Draft, &[TransactionStatus::Auth]),
        (
            TransactionStatus::Auth,
            &[
                TransactionStatus::Accepted,
                TransactionStatus::Rejected,
                TransactionStatus::Failed,
            ],
        ),
    ],
);

/// Leaving `draft` is governed by the owning invoice strategy.
pub static INVOICE_CHART: TransitionChart<InvoiceStatus> = TransitionChart::new(
    "invoice",
    &[
        (
            InvoiceStatus::Auth,
            &[
                InvoiceStatus::Wait,
                InvoiceStatus::Accepted,
                InvoiceStatus::Rejected,
            ],
        ),
        (
            InvoiceStatus::Wait,
            &[InvoiceStatus::Accepted, InvoiceStatus::Rejected],
        ),
    ],
);

/// Status enums that have a declared chart
pub trait Charted: Copy + Eq + fmt::Display + Sized + 'static {
    fn chart() -> &'static TransitionChart<Self>;

    #[inline]
    fn can_transition_to(self, to: Self) -> bool {
        Self::chart().allowed(self, to)
    }
}

impl Charted for OperationStatus {
    fn chart() -> &'static TransitionChart<Self> {
        &OPERATION_CHART
    }
}

impl Charted for TransactionStatus {
    fn chart() -> &'static TransitionChart<Self> {
        &TRANSACTION_CHART
    }
}

impl Charted for InvoiceStatus {
    fn chart() -> &'static TransitionChart<Self> {
        &INVOICE_CHART
    }
}
