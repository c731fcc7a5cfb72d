//! Provider Worker
//!
//! Consumes `provider.<name>` commands. The provider is called outside any
//! db tx; the receipt is stored afterwards together with the follow-up
//! dispatch message. A command whose result is already stored is not sent
//! again, only its callback is re-published.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::MessageHandler;
use crate::ledger::{LedgerError, Provider, Transaction, TransactionId, TransactionStatus};
use crate::provider::{PaymentProvider, ProviderOperStatus, ProviderReceipt};
use crate::store::{QueueMessage, Store};

pub struct ProviderWorker {
    store: Arc<dyn Store>,
    providers: FxHashMap<Provider, Arc<dyn PaymentProvider>>,
}

impl ProviderWorker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            providers: FxHashMap::default(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.providers.insert(provider.provider(), provider);
        self
    }

    /// Topics this worker consumes, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.providers.keys().map(Provider::topic).collect();
        topics.sort();
        topics
    }

    fn client(&self, provider: Provider) -> Result<&Arc<dyn PaymentProvider>, LedgerError> {
        self.providers
            .get(&provider)
            .ok_or_else(|| LedgerError::UnknownProvider(provider.to_string()))
    }

    /// Status the transaction parks in while `command` is in flight
    fn parked_in(command: TransactionStatus) -> Result<TransactionStatus, LedgerError> {
        match command {
            TransactionStatus::Auth => Ok(TransactionStatus::AuthWait),
            TransactionStatus::Accepted => Ok(TransactionStatus::AcceptedWait),
            TransactionStatus::Rejected => Ok(TransactionStatus::RejectedWait),
            other => Err(LedgerError::TargetNotAllowed(other.to_string())),
        }
    }

    /// Receipt already stored for `command`, if any
    fn recorded(transaction: &Transaction, command: TransactionStatus) -> Option<ProviderReceipt> {
        let oper_id = transaction.provider_oper_id.clone()?;
        let status: ProviderOperStatus = transaction.provider_oper_status.as_deref()?.parse().ok()?;
        let done = match command {
            TransactionStatus::Auth => true,
            TransactionStatus::Accepted => status == ProviderOperStatus::Accepted,
            TransactionStatus::Rejected => status == ProviderOperStatus::Rejected,
            _ => false,
        };
        done.then(|| ProviderReceipt {
            oper_id,
            status,
            url: transaction.provider_oper_url.clone(),
        })
    }

    async fn call(
        &self,
        transaction: &Transaction,
        command: TransactionStatus,
    ) -> Result<ProviderReceipt, LedgerError> {
        let client = self.client(transaction.provider)?;
        let oper_id = || {
            transaction.provider_oper_id.as_deref().ok_or_else(|| {
                LedgerError::Provider(format!(
                    "transaction {} has no provider operation",
                    transaction.transaction_id
                ))
            })
        };

        match command {
            TransactionStatus::Auth => {
                let hold = self
                    .store
                    .list_operations(transaction.transaction_id)
                    .await?
                    .iter()
                    .any(|op| op.hold);
                client
                    .submit_transfer(transaction.transaction_id, transaction.amount, hold)
                    .await
            }
            TransactionStatus::Accepted => client.capture(oper_id()?).await,
            TransactionStatus::Rejected => client.void(oper_id()?).await,
            other => Err(LedgerError::TargetNotAllowed(other.to_string())),
        }
    }

    pub async fn execute(
        &self,
        transaction_id: TransactionId,
        command: TransactionStatus,
    ) -> Result<(), LedgerError> {
        let parked = Self::parked_in(command)?;
        let transaction = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(transaction_id))?;
        if transaction.status != parked {
            debug!(
                transaction_id = %transaction_id,
                command = %command,
                status = %transaction.status,
                "Transaction no longer waiting on provider"
            );
            return Ok(());
        }

        let receipt = match Self::recorded(&transaction, command) {
            Some(receipt) => {
                debug!(transaction_id = %transaction_id, command = %command, "Provider result already stored");
                receipt
            }
            None => self.call(&transaction, command).await?,
        };

        let mut tx = self.store.begin().await?;
        let mut current = tx.lock_transaction(transaction_id).await?;
        if current.status != parked {
            debug!(transaction_id = %transaction_id, status = %current.status, "Moved on during provider call");
            return Ok(());
        }
        current.provider_oper_id = Some(receipt.oper_id.clone());
        current.provider_oper_status = Some(receipt.status.as_str().to_string());
        if receipt.url.is_some() {
            current.provider_oper_url = receipt.url.clone();
        }
        let current = tx.update_transaction(&current).await?;
        if let Some(target) = receipt.status.callback_target() {
            tx.enqueue(&QueueMessage::transaction(&current, target)).await?;
        }
        tx.commit().await?;

        info!(
            transaction_id = %transaction_id,
            provider = %current.provider,
            command = %command,
            oper_id = %receipt.oper_id,
            provider_status = %receipt.status,
            "Provider receipt stored"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ProviderWorker {
    async fn handle(&self, message: &QueueMessage) -> Result<(), LedgerError> {
        let command: TransactionStatus = message.payload.target.parse()?;
        self.execute(TransactionId(message.payload.entity.id), command)
            .await
    }
}
