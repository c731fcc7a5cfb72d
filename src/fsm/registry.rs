//! Strategy Registry
//!
//! Process-wide map of strategy name to dispatch table. Built once at
//! startup and shared read-only afterwards.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::info;

use super::StateMachine;
use super::strategies::{invoice, transaction};
use crate::ledger::{Invoice, LedgerError, Transaction};

#[derive(Default)]
pub struct StrategyRegistry {
    invoices: FxHashMap<String, Arc<StateMachine<Invoice>>>,
    transactions: FxHashMap<String, Arc<StateMachine<Transaction>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `simple` invoice and `internal` / `card`
    /// transaction strategies
    pub fn standard() -> Self {
        let mut registry = Self::new();
        // Names are distinct constants; registration cannot collide here
        let _ = registry.register_invoice(invoice::simple());
        let _ = registry.register_transaction(transaction::internal());
        let _ = registry.register_transaction(transaction::card());
        registry
    }

    pub fn register_invoice(&mut self, machine: StateMachine<Invoice>) -> Result<(), LedgerError> {
        let name = machine.name().to_string();
        if self.invoices.contains_key(&name) {
            return Err(LedgerError::Duplicate(format!("invoice strategy {name}")));
        }
        info!(strategy = %name, transitions = machine.transitions().len(), "Invoice strategy registered");
        self.invoices.insert(name, Arc::new(machine));
        Ok(())
    }

    pub fn register_transaction(
        &mut self,
        machine: StateMachine<Transaction>,
    ) -> Result<(), LedgerError> {
        let name = machine.name().to_string();
        if self.transactions.contains_key(&name) {
            return Err(LedgerError::Duplicate(format!("transaction strategy {name}")));
        }
        info!(strategy = %name, transitions = machine.transitions().len(), "Transaction strategy registered");
        self.transactions.insert(name, Arc::new(machine));
        Ok(())
    }

    pub fn invoice(&self, name: &str) -> Result<Arc<StateMachine<Invoice>>, LedgerError> {
        self.invoices
            .get(name)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownStrategy(name.to_string()))
    }

    pub fn transaction(&self, name: &str) -> Result<Arc<StateMachine<Transaction>>, LedgerError> {
        self.transactions
            .get(name)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownStrategy(name.to_string()))
    }

    /// Registered invoice strategy names, sorted
    pub fn invoice_strategies(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.invoices.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered transaction strategy names, sorted
    pub fn transaction_strategies(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.transactions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
