//! Reconciles running consumers against the connector registry
//!
//! Every poll cycle the desired queue set is fetched and the consumer map is
//! brought in line with it: missing or dead consumers are started, consumers
//! whose connection parameters changed are replaced and consumers for queues
//! no longer advertised are stopped.
//!
//! Stopping is cooperative. The first pass only cancels the consumer so it can
//! settle its message and close its subscription; the handle is dropped once
//! the task has exited. A consumer still alive and idle on a later pass is
//! aborted. A consumer in the middle of a message is never interrupted.

use crate::broker::QueueBroker;
use crate::config::WorkerConfig;
use crate::consumer::Consumer;
use crate::platform::{ConnectorRegistry, PlatformApi};
use crate::processor::MessageProcessor;
use crate::types::ConnectorDescriptor;
use crate::Result;
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handle on a running consumer task
pub struct ConsumerHandle {
    descriptor: ConnectorDescriptor,
    cancel: CancellationToken,
    busy: Arc<AtomicBool>,
    stopping: bool,
    task: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    /// Descriptor the consumer was started with
    pub fn descriptor(&self) -> &ConnectorDescriptor {
        &self.descriptor
    }

    /// Whether the consumer task is still running
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Whether the consumer is processing a message
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Whether a stop was requested
    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    fn request_stop(&mut self) {
        self.cancel.cancel();
        self.stopping = true;
    }

    fn reap(self) {
        match self.task.now_or_never() {
            Some(Ok(Ok(()))) => debug!(queue = %self.descriptor.queue_name, "Consumer exited"),
            Some(Ok(Err(e))) => {
                warn!(queue = %self.descriptor.queue_name, error = %e, "Consumer exited with error")
            }
            Some(Err(e)) if e.is_panic() => {
                error!(queue = %self.descriptor.queue_name, "Consumer panicked")
            }
            Some(Err(_)) | None => {}
        }
    }
}

/// Changes applied by one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Queues that got a new consumer
    pub started: Vec<String>,
    /// Queues whose consumer was dead or had stale connection parameters
    pub restarted: Vec<String>,
    /// Queues whose consumer was stopped
    pub stopped: Vec<String>,
    /// Queues whose consumer was asked to stop and has not exited yet
    pub deferred: Vec<String>,
}

impl ReconcileReport {
    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
            && self.restarted.is_empty()
            && self.stopped.is_empty()
            && self.deferred.is_empty()
    }
}

/// Owns the consumer map
pub struct Supervisor {
    registry: Arc<dyn ConnectorRegistry>,
    broker: Arc<dyn QueueBroker>,
    platform: Arc<dyn PlatformApi>,
    processor: Arc<MessageProcessor>,
    config: WorkerConfig,
    consumers: HashMap<String, ConsumerHandle>,
    desired: BTreeSet<String>,
}

impl Supervisor {
    /// Create new supervisor
    pub fn new(
        registry: Arc<dyn ConnectorRegistry>,
        broker: Arc<dyn QueueBroker>,
        platform: Arc<dyn PlatformApi>,
        processor: Arc<MessageProcessor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            registry,
            broker,
            platform,
            processor,
            config,
            consumers: HashMap::new(),
            desired: BTreeSet::new(),
        }
    }

    /// Queues with a live consumer that is not stopping, sorted
    pub fn running_queues(&self) -> Vec<String> {
        let mut queues: Vec<_> = self
            .consumers
            .iter()
            .filter(|(_, handle)| handle.is_alive() && !handle.stopping)
            .map(|(queue, _)| queue.clone())
            .collect();
        queues.sort();
        queues
    }

    /// Handle of a queue's consumer
    pub fn consumer(&self, queue_name: &str) -> Option<&ConsumerHandle> {
        self.consumers.get(queue_name)
    }

    /// Bring the consumer map in line with the desired descriptors
    pub fn reconcile(&mut self, desired: Vec<ConnectorDescriptor>) -> ReconcileReport {
        let desired: BTreeMap<String, ConnectorDescriptor> = desired
            .into_iter()
            .map(|descriptor| (descriptor.queue_name.clone(), descriptor))
            .collect();
        self.desired = desired.keys().cloned().collect();
        let mut report = ReconcileReport::default();

        let undesired: Vec<String> = self
            .consumers
            .keys()
            .filter(|queue| !desired.contains_key(*queue))
            .cloned()
            .collect();
        for queue in undesired {
            if self.stop(&queue) {
                report.stopped.push(queue);
            } else {
                report.deferred.push(queue);
            }
        }

        for (queue, descriptor) in desired {
            let Some(handle) = self.consumers.get(&queue) else {
                self.start(descriptor);
                report.started.push(queue);
                continue;
            };

            if !handle.is_alive() {
                if handle.stopping {
                    info!(queue = %queue, "Consumer exited, starting replacement");
                } else {
                    info!(queue = %queue, "Consumer is dead, restarting");
                }
                self.remove(&queue);
                self.start(descriptor);
                report.restarted.push(queue);
            } else if handle.stopping || handle.descriptor != descriptor {
                if !handle.stopping {
                    info!(queue = %queue, "Connection parameters changed, replacing consumer");
                }
                if self.stop(&queue) {
                    self.start(descriptor);
                    report.restarted.push(queue);
                } else {
                    report.deferred.push(queue);
                }
            }
        }

        report.started.sort();
        report.restarted.sort();
        report.stopped.sort();
        report.deferred.sort();
        report
    }

    /// Poll the registry and reconcile until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            "Supervisor started"
        );

        loop {
            let fetched = tokio::select! {
                _ = shutdown.cancelled() => break,
                fetched = self.registry.list_connectors() => fetched,
            };

            let wait = match fetched {
                Ok(desired) => {
                    let report = self.reconcile(desired);
                    if !report.is_empty() {
                        info!(
                            started = ?report.started,
                            restarted = ?report.restarted,
                            stopped = ?report.stopped,
                            deferred = ?report.deferred,
                            "Consumers reconciled"
                        );
                    }
                    self.config.poll_interval()
                }
                Err(e) => {
                    error!(error = %e, "Unable to fetch connectors, retrying");
                    self.config.registry_backoff()
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop every consumer
    ///
    /// Consumers of queues that are no longer desired are aborted right away.
    /// The others are cancelled and get `shutdown_grace` to settle their
    /// in-flight message before being aborted.
    pub async fn shutdown(&mut self) {
        let grace = self.config.shutdown_grace();
        info!(consumers = self.consumers.len(), "Stopping consumers");

        let mut tasks = Vec::new();
        for (queue, handle) in self.consumers.drain() {
            handle.cancel.cancel();
            if self.desired.contains(&queue) {
                tasks.push(handle.task);
            } else {
                debug!(queue = %queue, "Aborting consumer of undesired queue");
                handle.task.abort();
            }
        }
        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();

        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(grace_secs = grace.as_secs(), "Consumers still running, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        info!("Supervisor stopped");
    }

    fn start(&mut self, descriptor: ConnectorDescriptor) {
        let consumer = Consumer::new(
            descriptor.clone(),
            self.broker.clone(),
            self.processor.clone(),
            self.platform.clone(),
            self.config.liveness_interval(),
        );
        let handle = ConsumerHandle {
            cancel: consumer.cancel_token(),
            busy: consumer.busy_flag(),
            stopping: false,
            task: tokio::spawn(consumer.run()),
            descriptor,
        };
        info!(queue = %handle.descriptor.queue_name, "Consumer started");
        self.consumers
            .insert(handle.descriptor.queue_name.clone(), handle);
    }

    /// Move a consumer towards exit, `true` once its handle is gone
    fn stop(&mut self, queue_name: &str) -> bool {
        let Some(handle) = self.consumers.get_mut(queue_name) else {
            return true;
        };

        if !handle.is_alive() {
            self.remove(queue_name);
            info!(queue = %queue_name, "Consumer stopped");
            return true;
        }

        if !handle.stopping {
            handle.request_stop();
            info!(queue = %queue_name, "Consumer stop requested");
            return false;
        }

        if handle.is_busy() {
            info!(queue = %queue_name, "Consumer busy, operation is running, keep trying");
            return false;
        }

        warn!(queue = %queue_name, "Consumer did not exit after stop request, aborting");
        handle.task.abort();
        self.remove(queue_name);
        true
    }

    fn remove(&mut self, queue_name: &str) {
        if let Some(handle) = self.consumers.remove(queue_name) {
            handle.reap();
        }
    }
}
