//! Queue Poller
//!
//! One loop per topic: claim the oldest pending message, hand it to the
//! topic's handler, then acknowledge it. A failed message is marked failed
//! and written to the dead-letter log; there is no automatic redelivery.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::MessageHandler;
use crate::ledger::{LedgerError, db_now};
use crate::shutdown::ShutdownSignal;
use crate::store::{DeadLetter, Store};

/// Default delay between polls of an empty topic
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct QueuePoller {
    topic: String,
    store: Arc<dyn Store>,
    handler: Arc<dyn MessageHandler>,
    poll_interval: Duration,
}

impl QueuePoller {
    pub fn new(
        topic: impl Into<String>,
        store: Arc<dyn Store>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            topic: topic.into(),
            store,
            handler,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Handle at most one message. Returns false when the topic was empty.
    pub async fn poll_once(&self) -> Result<bool, LedgerError> {
        let Some(claimed) = self.store.claim(&self.topic).await? else {
            return Ok(false);
        };

        match self.handler.handle(&claimed.message).await {
            Ok(()) => {
                self.store.complete(claimed.message_id).await?;
                debug!(
                    topic = %self.topic,
                    message_id = claimed.message_id,
                    entity = %claimed.message.payload.entity,
                    target = %claimed.message.payload.target,
                    "Message handled"
                );
            }
            Err(e) => {
                error!(
                    topic = %self.topic,
                    message_id = claimed.message_id,
                    entity = %claimed.message.payload.entity,
                    target = %claimed.message.payload.target,
                    code = e.code(),
                    error = %e,
                    "Message failed"
                );
                self.store.fail(claimed.message_id, &e.to_string()).await?;
                let letter = DeadLetter {
                    source: format!("poller:{}", self.topic),
                    entity: claimed.message.payload.entity,
                    target: claimed.message.payload.target.clone(),
                    error: e.to_string(),
                    created_at: db_now(),
                };
                self.store.record_dead_letter(&letter).await?;
            }
        }
        Ok(true)
    }

    /// Handle messages until the topic is empty
    pub async fn drain(&self) -> Result<usize, LedgerError> {
        let mut handled = 0;
        while self.poll_once().await? {
            handled += 1;
        }
        Ok(handled)
    }

    pub async fn run(&self, shutdown: Arc<ShutdownSignal>) {
        info!(topic = %self.topic, interval_ms = self.poll_interval.as_millis() as u64, "Queue poller started");
        loop {
            if shutdown.is_shutdown_requested() {
                break;
            }
            match self.poll_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(topic = %self.topic, error = %e, "Queue poll failed"),
            }
            if shutdown.sleep(self.poll_interval).await {
                break;
            }
        }
        info!(topic = %self.topic, "Queue poller stopped");
    }
}

/// Run every poller until all their topics are empty at once. Follow-up
/// messages published by one topic are picked up by the next round.
pub async fn drain_all(pollers: &[QueuePoller]) -> Result<usize, LedgerError> {
    let mut total = 0;
    loop {
        let mut round = 0;
        for poller in pollers {
            round += poller.drain().await?;
        }
        if round == 0 {
            return Ok(total);
        }
        total += round;
    }
}
