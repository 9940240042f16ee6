//! Single-queue consumer
//!
//! Pulls one delivery at a time, hands it to a dedicated processing task and
//! settles it from the consumer loop once the task finishes. Settlement is
//! only ever issued here, exactly once per delivery.

use crate::broker::{QueueBroker, Subscription};
use crate::platform::PlatformApi;
use crate::processor::MessageProcessor;
use crate::retry::Settlement;
use crate::types::ConnectorDescriptor;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consumer of one queue
pub struct Consumer {
    descriptor: ConnectorDescriptor,
    broker: Arc<dyn QueueBroker>,
    processor: Arc<MessageProcessor>,
    platform: Arc<dyn PlatformApi>,
    liveness_interval: Duration,
    busy: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Consumer {
    /// Create new consumer
    pub fn new(
        descriptor: ConnectorDescriptor,
        broker: Arc<dyn QueueBroker>,
        processor: Arc<MessageProcessor>,
        platform: Arc<dyn PlatformApi>,
        liveness_interval: Duration,
    ) -> Self {
        Self {
            descriptor,
            broker,
            processor,
            platform,
            liveness_interval,
            busy: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    /// Queue consumed
    pub fn queue_name(&self) -> &str {
        &self.descriptor.queue_name
    }

    /// Set while a delivery is being processed and settled
    pub fn busy_flag(&self) -> Arc<AtomicBool> {
        self.busy.clone()
    }

    /// Token that stops the consumer
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Consume until cancelled or the subscription fails
    ///
    /// Returns `Ok(())` on cancellation. Connection failures and a closed
    /// delivery stream are returned as errors so the owner can replace the
    /// consumer.
    pub async fn run(self) -> Result<()> {
        info!(queue = %self.queue_name(), "Starting consumer");

        let mut subscription = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            subscription = self.broker.subscribe(&self.descriptor) => subscription?,
        };

        let liveness_token = self.cancel.child_token();
        let liveness = self.spawn_liveness(liveness_token.clone());

        let result = self.consume(subscription.as_mut()).await;

        liveness_token.cancel();
        if let Err(e) = liveness.await {
            warn!(queue = %self.queue_name(), error = %e, "Liveness task failed");
        }

        if let Err(e) = subscription.close().await {
            warn!(queue = %self.queue_name(), error = %e, "Unable to close subscription");
        }

        match &result {
            Ok(()) => info!(queue = %self.queue_name(), "Consumer stopped"),
            Err(e) => error!(queue = %self.queue_name(), error = %e, "Consumer failed"),
        }
        result
    }

    async fn consume(&self, subscription: &mut dyn Subscription) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                next = subscription.next_delivery() => next,
            };

            let delivery = match next {
                Some(delivery) => delivery?,
                None => return Err(Error::SubscriptionClosed(self.descriptor.queue_name.clone())),
            };

            self.busy.store(true, Ordering::SeqCst);
            let tag = delivery.tag;
            let settlement = self.process(tag, delivery.body).await;

            let settled = match settlement {
                Settlement::Ack => subscription.ack(tag).await,
                Settlement::Nack => subscription.nack(tag).await,
            };
            self.busy.store(false, Ordering::SeqCst);

            settled?;
            debug!(queue = %self.queue_name(), tag, ?settlement, "Message settled");
        }
    }

    async fn process(&self, tag: u64, body: Vec<u8>) -> Settlement {
        let processor = self.processor.clone();
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move { processor.handle_delivery(tag, &body, &cancel).await });
        let _guard = AbortOnDrop(task.abort_handle());

        match task.await {
            Ok(decision) => decision.settlement().unwrap_or(Settlement::Nack),
            Err(e) => {
                error!(
                    queue = %self.queue_name(),
                    tag,
                    error = %e,
                    "Processing task failed, returning message to the queue"
                );
                Settlement::Nack
            }
        }
    }

    fn spawn_liveness(&self, token: CancellationToken) -> JoinHandle<()> {
        let platform = self.platform.clone();
        let interval = self.liveness_interval;
        let queue = self.descriptor.queue_name.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match platform.ping().await {
                            Ok(()) => debug!(queue = %queue, "Liveness ping"),
                            Err(e) => error!(queue = %queue, error = %e, "Error pinging the API"),
                        }
                    }
                }
            }
        })
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
