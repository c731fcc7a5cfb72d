//! Loopback provider
//!
//! In-process provider that answers immediately. Used by `--in-memory` runs
//! and tests; behavior can be switched at runtime to decline, stay pending
//! or fail outright.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use ulid::Ulid;

use super::{PaymentProvider, ProviderOperStatus, ProviderReceipt};
use crate::ledger::{Amount, LedgerError, Provider, TransactionId};

pub struct LoopbackProvider {
    provider: Provider,
    /// Track calls for verification: oper_id -> call names
    calls: Mutex<HashMap<String, Vec<&'static str>>>,
    submit_count: AtomicUsize,
    capture_count: AtomicUsize,
    void_count: AtomicUsize,
    /// Configured behavior
    decline: AtomicBool,
    pending: AtomicBool,
    fail: AtomicBool,
}

impl LoopbackProvider {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            calls: Mutex::new(HashMap::new()),
            submit_count: AtomicUsize::new(0),
            capture_count: AtomicUsize::new(0),
            void_count: AtomicUsize::new(0),
            decline: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_decline(&self, decline: bool) {
        self.decline.store(decline, Ordering::SeqCst);
    }

    pub fn set_pending(&self, pending: bool) {
        self.pending.store(pending, Ordering::SeqCst);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn submit_count(&self) -> usize {
        self.submit_count.load(Ordering::SeqCst)
    }

    pub fn capture_count(&self) -> usize {
        self.capture_count.load(Ordering::SeqCst)
    }

    pub fn void_count(&self) -> usize {
        self.void_count.load(Ordering::SeqCst)
    }

    /// Calls recorded for one provider operation, in order
    pub fn calls(&self, oper_id: &str) -> Vec<&'static str> {
        self.calls
            .lock()
            .map(|calls| calls.get(oper_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn record(&self, oper_id: &str, call: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.entry(oper_id.to_string()).or_default().push(call);
        }
    }

    fn check_fail(&self, call: &str) -> Result<(), LedgerError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(LedgerError::Provider(format!("loopback {call} failure")))
        } else {
            Ok(())
        }
    }

    fn receipt(&self, oper_id: String, status: ProviderOperStatus) -> ProviderReceipt {
        let status = if self.pending.load(Ordering::SeqCst) {
            ProviderOperStatus::Pending
        } else {
            status
        };
        ProviderReceipt {
            url: Some(format!("loopback://{}/{}", self.provider, oper_id)),
            oper_id,
            status,
        }
    }
}

#[async_trait]
impl PaymentProvider for LoopbackProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn submit_transfer(
        &self,
        transaction_id: TransactionId,
        amount: Amount,
        hold: bool,
    ) -> Result<ProviderReceipt, LedgerError> {
        self.submit_count.fetch_add(1, Ordering::SeqCst);
        self.check_fail("submit")?;

        let oper_id = Ulid::new().to_string();
        self.record(&oper_id, "submit");
        tracing::debug!(
            transaction_id = %transaction_id,
            amount,
            hold,
            oper_id = %oper_id,
            "Loopback transfer submitted"
        );

        let status = if self.decline.load(Ordering::SeqCst) {
            ProviderOperStatus::Rejected
        } else if hold {
            ProviderOperStatus::Hold
        } else {
            ProviderOperStatus::Accepted
        };
        Ok(self.receipt(oper_id, status))
    }

    async fn capture(&self, oper_id: &str) -> Result<ProviderReceipt, LedgerError> {
        self.capture_count.fetch_add(1, Ordering::SeqCst);
        self.check_fail("capture")?;
        self.record(oper_id, "capture");
        Ok(self.receipt(oper_id.to_string(), ProviderOperStatus::Accepted))
    }

    async fn void(&self, oper_id: &str) -> Result<ProviderReceipt, LedgerError> {
        self.void_count.fetch_add(1, Ordering::SeqCst);
        self.check_fail("void")?;
        self.record(oper_id, "void");
        Ok(self.receipt(oper_id.to_string(), ProviderOperStatus::Rejected))
    }
}
