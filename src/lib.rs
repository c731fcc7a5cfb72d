//! Ledger Engine - double-entry ledger with strategy-driven state machines
//!
//! Invoices group transactions; transactions group operations; operations
//! move money between accounts. Lifecycle changes are driven by named
//! strategies registered in a state machine registry and executed through a
//! durable work queue.
//!
//! # Modules
//!
//! - [`ledger`] - Entities, statuses, transition charts and the balance engine
//! - [`store`] - Storage traits with PostgreSQL and in-memory backends
//! - [`processor`] - Single-consumer transaction processor (bounded queue)
//! - [`fsm`] - State machines, strategies, dispatcher, pollers and workers
//! - [`provider`] - External payment provider seam
//! - [`service`] - Entry points for an API layer
//! - [`config`] / [`logging`] / [`db`] - Process plumbing

pub mod config;
pub mod db;
pub mod fsm;
pub mod ledger;
pub mod logging;
pub mod processor;
pub mod provider;
pub mod service;
pub mod shutdown;
pub mod store;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use fsm::{Dispatcher, StrategyRegistry};
pub use ledger::{InvoiceStatus, LedgerError, TransactionStatus};
pub use processor::TransactionProcessor;
pub use service::LedgerService;
pub use shutdown::ShutdownSignal;
pub use store::{MemoryStore, PgStore, Store};
