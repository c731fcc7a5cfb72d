//! Per-strategy dispatch table

use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

use super::{FsmEntity, TransitionHandler};
use crate::ledger::LedgerError;
use crate::store::Store;

/// Named `(from, to) -> handler` table
pub struct StateMachine<E: FsmEntity> {
    name: String,
    handlers: FxHashMap<(E::Status, E::Status), Arc<dyn TransitionHandler<E>>>,
}

impl<E: FsmEntity> StateMachine<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: FxHashMap::default(),
        }
    }

    /// Register a handler; a later registration for the same pair replaces it
    pub fn on(
        mut self,
        from: E::Status,
        to: E::Status,
        handler: impl TransitionHandler<E> + 'static,
    ) -> Self {
        self.handlers.insert((from, to), Arc::new(handler));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handles(&self, from: E::Status, to: E::Status) -> bool {
        self.handlers.contains_key(&(from, to))
    }

    /// Registered pairs, sorted
    pub fn transitions(&self) -> Vec<(E::Status, E::Status)> {
        let mut pairs: Vec<_> = self.handlers.keys().copied().collect();
        pairs.sort();
        pairs
    }

    /// Run the handler for `(entity.status(), target)`.
    ///
    /// An unregistered pair is an error, never a silent no-op.
    pub async fn fire(
        &self,
        store: &dyn Store,
        entity: &E,
        target: E::Status,
    ) -> Result<(), LedgerError> {
        if entity.strategy() != self.name {
            return Err(LedgerError::StrategyMismatch {
                expected: self.name.clone(),
                actual: entity.strategy().to_string(),
            });
        }

        let from = entity.status();
        let handler = self
            .handlers
            .get(&(from, target))
            .ok_or_else(|| LedgerError::NoTransitionHandler {
                strategy: self.name.clone(),
                from: from.to_string(),
                to: target.to_string(),
            })?;

        debug!(
            strategy = %self.name,
            kind = %E::KIND,
            id = entity.entity_id(),
            from = %from,
            to = %target,
            "Firing transition"
        );
        handler.handle(store, entity, target).await
    }
}
