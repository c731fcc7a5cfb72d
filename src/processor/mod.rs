//! Transaction Processor
//!
//! Single-worker executor for requested transaction transitions.
//!
//! ```text
//! submit() ──► ArrayQueue (bounded) ──► worker thread ──► one DB transaction
//!   │ full                                   │               claim (CAS on updated_at)
//!   ▼                                        │               lock ops ASC, run engine
//! Backpressure                               │               write ops, accounts, tx
//!                                            ▼
//!                          on error: dead letter (+ mark failed)
//! ```
//!
//! The worker is strictly serial, so at most one mutation is in flight per
//! process. Concurrent processes are serialized by the database row locks.

pub mod step;


use chrono::{DateTime, Utc};
use crossbeam_queue::ArrayQueue;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::ledger::{
    ErrorKind, LedgerError, TRANSACTION_CHART, Transaction, TransactionId, TransactionStatus,
    db_now,
};
use crate::shutdown::ShutdownSignal;
use crate::store::{DeadLetter, EntityRef, Store};

pub use step::{StepOutcome, apply_balance_step, apply_deltas, mark_failed};

/// Default bounded queue size
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Idle park between empty polls; `submit` unparks the worker early
const IDLE_PARK: Duration = Duration::from_millis(50);

/// A requested transition, computed against a snapshot of the transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub transaction_id: TransactionId,
    pub expected_status: TransactionStatus,
    pub next_status: TransactionStatus,
    pub expected_updated_at: DateTime<Utc>,
}

impl TransitionRequest {
    /// Request `next_status` against the given snapshot
    pub fn from_snapshot(transaction: &Transaction, next_status: TransactionStatus) -> Self {
        Self {
            transaction_id: transaction.transaction_id,
            expected_status: transaction.status,
            next_status,
            expected_updated_at: transaction.updated_at,
        }
    }
}

/// Processor counters
#[derive(Debug, Default)]
pub struct ProcessorStats {
    /// Requests accepted into the queue
    pub submitted: AtomicU64,
    /// Requests committed
    pub committed: AtomicU64,
    /// Transactions moved to `failed` after a business error
    pub failed: AtomicU64,
    /// Requests that errored and were dead-lettered
    pub dropped: AtomicU64,
    /// Queue full events
    pub backpressure: AtomicU64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            backpressure: self.backpressure.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStatsSnapshot {
    pub submitted: u64,
    pub committed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub backpressure: u64,
}

impl std::fmt::Display for ProcessorStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Processor Stats: submitted={}, committed={}, failed={}, dropped={}, backpressure={}",
            self.submitted, self.committed, self.failed, self.dropped, self.backpressure
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Claim, chart or persistence; the db tx rolls back
    Refused,
    /// The balance engine or a balance write
    Balance,
}

struct Dropped {
    error: LedgerError,
    stage: Stage,
}

impl Dropped {
    fn refused(error: LedgerError) -> Self {
        Self {
            error,
            stage: Stage::Refused,
        }
    }

    fn balance(error: LedgerError) -> Self {
        Self {
            error,
            stage: Stage::Balance,
        }
    }
}

pub struct TransactionProcessor {
    store: Arc<dyn Store>,
    queue: ArrayQueue<TransitionRequest>,
    stats: ProcessorStats,
    shutdown: ShutdownSignal,
    worker: Mutex<Option<Thread>>,
}

impl TransactionProcessor {
    pub fn new(store: Arc<dyn Store>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue: ArrayQueue::new(capacity.max(1)),
            stats: ProcessorStats::default(),
            shutdown: ShutdownSignal::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Non-blocking enqueue; a full queue is reported, never buffered.
    pub fn submit(&self, request: TransitionRequest) -> Result<(), LedgerError> {
        if self.shutdown.is_shutdown_requested() {
            return Err(LedgerError::ProcessorStopped);
        }
        if let Err(request) = self.queue.push(request) {
            self.stats.backpressure.fetch_add(1, Ordering::Relaxed);
            warn!(
                transaction_id = %request.transaction_id,
                capacity = self.queue.capacity(),
                "Processor queue full"
            );
            return Err(LedgerError::Backpressure);
        }
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.wake_worker();
        Ok(())
    }

    /// Drain the queue on the caller's task. Returns the number of requests
    /// handled (committed or dropped).
    pub async fn process_pending(&self) -> usize {
        let mut handled = 0;
        while let Some(request) = self.queue.pop() {
            let _ = self.process(request).await;
            handled += 1;
        }
        handled
    }

    /// Run one request to completion, recording the outcome.
    pub async fn process(&self, request: TransitionRequest) -> Result<Transaction, LedgerError> {
        match self.execute(&request).await {
            Ok(transaction) => {
                self.stats.committed.fetch_add(1, Ordering::Relaxed);
                info!(
                    transaction_id = %transaction.transaction_id,
                    from = %request.expected_status,
                    status = %transaction.status,
                    "Transition committed"
                );
                Ok(transaction)
            }
            Err(Dropped { error, stage }) => {
                self.on_error(&request, &error, stage).await;
                Err(error)
            }
        }
    }

    /// Version, then status, then chart; only a balance-step error may end
    /// the transaction in `failed`.
    async fn execute(&self, request: &TransitionRequest) -> Result<Transaction, Dropped> {
        let mut tx = self.store.begin().await.map_err(Dropped::refused)?;
        let mut transaction = tx
            .claim_transaction(
                request.transaction_id,
                request.expected_status,
                request.expected_updated_at,
                request.next_status,
            )
            .await
            .map_err(Dropped::refused)?;
        TRANSACTION_CHART
            .ensure(request.expected_status, request.next_status)
            .map_err(Dropped::refused)?;

        let outcome =
            apply_balance_step(tx.as_mut(), request.transaction_id, request.next_status, false)
                .await
                .map_err(Dropped::balance)?;

        // An auth that left nothing on hold is already settled
        transaction.status =
            if request.next_status == TransactionStatus::Auth && outcome.all_accepted() {
                TransactionStatus::Accepted
            } else {
                request.next_status
            };
        transaction.next_status = None;

        let transaction = tx
            .update_transaction(&transaction)
            .await
            .map_err(Dropped::refused)?;
        tx.commit().await.map_err(Dropped::refused)?;
        Ok(transaction)
    }

    async fn on_error(&self, request: &TransitionRequest, e: &LedgerError, stage: Stage) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        error!(
            transaction_id = %request.transaction_id,
            from = %request.expected_status,
            to = %request.next_status,
            code = e.code(),
            error = %e,
            "Transition dropped"
        );

        // Business errors of the balance step end the transaction; refusals and
        // conflicts leave it untouched
        let ends_transaction = stage == Stage::Balance
            && e.kind() == ErrorKind::Validation
            && !matches!(e, LedgerError::TargetNotAllowed(_));
        if ends_transaction {
            match mark_failed(
                self.store.as_ref(),
                request.transaction_id,
                request.expected_status,
                request.expected_updated_at,
                request.next_status,
            )
            .await
            {
                Ok(Some(_)) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => {}
                Err(mark_err) => {
                    warn!(
                        transaction_id = %request.transaction_id,
                        error = %mark_err,
                        "Could not mark transaction failed"
                    );
                }
            }
        }

        let letter = DeadLetter {
            source: "processor".to_string(),
            entity: EntityRef::transaction(request.transaction_id),
            target: request.next_status.to_string(),
            error: e.to_string(),
            created_at: db_now(),
        };
        if let Err(dl_err) = self.store.record_dead_letter(&letter).await {
            error!(error = %dl_err, "Failed to record dead letter");
        }
    }

    /// Spawn the dedicated worker thread. Requests run on `runtime`.
    pub fn start(self: &Arc<Self>, runtime: Handle) -> io::Result<JoinHandle<()>> {
        let processor = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("ledger-processor".to_string())
            .spawn(move || processor.run(runtime))?;
        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(handle.thread().clone());
        }
        Ok(handle)
    }

    fn run(&self, runtime: Handle) {
        info!(capacity = self.queue.capacity(), "Transaction processor started");
        loop {
            match self.queue.pop() {
                Some(request) => {
                    let _ = runtime.block_on(self.process(request));
                }
                None if self.shutdown.is_shutdown_requested() => break,
                None => thread::park_timeout(IDLE_PARK),
            }
        }
        debug!("Transaction processor drained");
        info!(stats = %self.stats.snapshot(), "Transaction processor stopped");
    }

    /// Stop accepting requests; the worker drains what is queued and exits.
    pub fn shutdown(&self) {
        self.shutdown.request_shutdown();
        self.wake_worker();
    }

    fn wake_worker(&self) {
        if let Ok(worker) = self.worker.lock() {
            if let Some(thread) = worker.as_ref() {
                thread.unpark();
            }
        }
    }
}
