//! In-memory broker, scripted platform and static registry for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ingest_worker::config::WorkerConfig;
use ingest_worker::retry::Jitter;
use ingest_worker::{
    BundleImport, ConnectionParams, ConnectorDescriptor, ConnectorRegistry, Delivery, Error,
    FailureReport, MessageProcessor, PlatformApi, PrometheusMetrics, QueueBroker, RemoteResult,
    RequestContext, Result, RetryPolicy, Subscription,
};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

/// Settlement observed by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Ack(String, u64),
    Nack(String, u64),
}

#[derive(Default)]
struct BrokerState {
    senders: HashMap<String, mpsc::UnboundedSender<Delivery>>,
    backlog: HashMap<String, Vec<Delivery>>,
    refused: HashSet<String>,
    next_tag: u64,
    settled: Vec<Settled>,
    subscribed: Vec<ConnectorDescriptor>,
    closed: Vec<String>,
}

/// Broker keeping queues in memory
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message, delivered to the current subscriber or the next one
    pub fn publish(&self, queue: &str, body: Vec<u8>) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.next_tag += 1;
        let delivery = Delivery {
            tag: state.next_tag,
            body,
        };
        let tag = delivery.tag;

        let unsent = match state.senders.get(queue) {
            Some(sender) => sender.send(delivery).err().map(|e| e.0),
            None => Some(delivery),
        };
        if let Some(delivery) = unsent {
            state.backlog.entry(queue.to_string()).or_default().push(delivery);
        }
        tag
    }

    /// End the delivery stream of the current subscriber
    pub fn close_queue(&self, queue: &str) {
        self.state.lock().unwrap().senders.remove(queue);
    }

    /// Refuse new connections for a queue
    pub fn refuse(&self, queue: &str) {
        self.state.lock().unwrap().refused.insert(queue.to_string());
    }

    /// Accept connections for a queue again
    pub fn accept(&self, queue: &str) {
        self.state.lock().unwrap().refused.remove(queue);
    }

    pub fn settled(&self) -> Vec<Settled> {
        self.state.lock().unwrap().settled.clone()
    }

    pub fn subscriptions(&self) -> Vec<ConnectorDescriptor> {
        self.state.lock().unwrap().subscribed.clone()
    }

    pub fn subscription_count(&self, queue: &str) -> usize {
        self.subscriptions()
            .iter()
            .filter(|d| d.queue_name == queue)
            .count()
    }

    /// Number of subscriptions on a queue closed by their consumer
    pub fn closed_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .closed
            .iter()
            .filter(|q| q.as_str() == queue)
            .count()
    }

    /// Wait until at least `count` settlements were observed
    pub async fn wait_settled(&self, count: usize) -> Vec<Settled> {
        wait_until(|| self.settled().len() >= count).await;
        self.settled()
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn subscribe(&self, descriptor: &ConnectorDescriptor) -> Result<Box<dyn Subscription>> {
        let mut state = self.state.lock().unwrap();
        let queue = descriptor.queue_name.clone();
        if state.refused.contains(&queue) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("connection refused for {}", queue),
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        for delivery in state.backlog.remove(&queue).unwrap_or_default() {
            let _ = sender.send(delivery);
        }
        state.senders.insert(queue.clone(), sender);
        state.subscribed.push(descriptor.clone());

        Ok(Box::new(MemorySubscription {
            queue,
            receiver,
            state: self.state.clone(),
        }))
    }
}

struct MemorySubscription {
    queue: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        self.receiver.recv().await.map(Ok)
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.settled.push(Settled::Ack(self.queue.clone(), tag));
        Ok(())
    }

    async fn nack(&mut self, tag: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.settled.push(Settled::Nack(self.queue.clone(), tag));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.receiver.close();
        self.state.lock().unwrap().closed.push(self.queue.clone());
        Ok(())
    }
}

/// Platform answering imports from a script
#[derive(Default)]
pub struct ScriptedPlatform {
    imports: Mutex<VecDeque<RemoteResult<()>>>,
    imported: Mutex<Vec<String>>,
    reports: Mutex<Vec<(String, Option<FailureReport>)>>,
    pings: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
    panic_on: Mutex<Option<String>>,
}

impl ScriptedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results of the next imports, in order; later imports succeed
    pub fn script(&self, results: Vec<RemoteResult<()>>) {
        self.imports.lock().unwrap().extend(results);
    }

    /// Block imports until [`ScriptedPlatform::release`] is called
    pub fn hold_imports(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let one held import through
    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(1);
        }
    }

    /// Panic when importing this exact content
    pub fn panic_on(&self, content: &str) {
        *self.panic_on.lock().unwrap() = Some(content.to_string());
    }

    pub fn imported(&self) -> Vec<String> {
        self.imported.lock().unwrap().clone()
    }

    pub fn reports(&self) -> Vec<(String, Option<FailureReport>)> {
        self.reports.lock().unwrap().clone()
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformApi for ScriptedPlatform {
    async fn ping(&self) -> RemoteResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn import_bundle(
        &self,
        _ctx: &RequestContext,
        request: BundleImport<'_>,
    ) -> RemoteResult<()> {
        if self.panic_on.lock().unwrap().as_deref() == Some(request.content) {
            panic!("import of {} blew up", request.content);
        }

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        self.imported
            .lock()
            .unwrap()
            .push(request.content.to_string());
        self.imports.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn delete(&self, _ctx: &RequestContext, _id: &str) -> RemoteResult<()> {
        Ok(())
    }

    async fn merge(
        &self,
        _ctx: &RequestContext,
        _target_id: &str,
        _source_ids: &[String],
    ) -> RemoteResult<()> {
        Ok(())
    }

    async fn report_expectation(
        &self,
        _ctx: &RequestContext,
        work_id: &str,
        report: Option<&FailureReport>,
    ) -> RemoteResult<()> {
        self.reports
            .lock()
            .unwrap()
            .push((work_id.to_string(), report.cloned()));
        Ok(())
    }
}

/// Registry returning whatever was last set
pub struct StaticRegistry {
    connectors: Mutex<RemoteResult<Vec<ConnectorDescriptor>>>,
    fetches: AtomicUsize,
}

impl StaticRegistry {
    pub fn new(connectors: RemoteResult<Vec<ConnectorDescriptor>>) -> Self {
        Self {
            connectors: Mutex::new(connectors),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, connectors: RemoteResult<Vec<ConnectorDescriptor>>) {
        *self.connectors.lock().unwrap() = connectors;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectorRegistry for StaticRegistry {
    async fn list_connectors(&self) -> RemoteResult<Vec<ConnectorDescriptor>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.connectors.lock().unwrap().clone()
    }
}

pub fn params(host: &str) -> ConnectionParams {
    ConnectionParams {
        host: host.to_string(),
        port: 5672,
        vhost: "/".to_string(),
        user: "guest".to_string(),
        pass: "guest".to_string(),
        use_ssl: false,
    }
}

pub fn descriptor(queue: &str, host: &str) -> ConnectorDescriptor {
    ConnectorDescriptor::new(queue, params(host))
}

/// Wire body of a bundle message
pub fn bundle_message(content: &str, work_id: Option<&str>) -> Vec<u8> {
    let mut body = json!({
        "applicant_id": "user-1",
        "type": "bundle",
        "content": STANDARD.encode(content),
    });
    if let Some(work_id) = work_id {
        body["work_id"] = json!(work_id);
    }
    body.to_string().into_bytes()
}

/// Policy without delays, for real-time tests
pub fn instant_policy() -> RetryPolicy {
    RetryPolicy {
        timeout_pause_secs: 0,
        timeout_jitter: Jitter::new(0.0, 0.0),
        lock_jitter: Jitter::new(0.0, 0.0),
        reference_jitter: Jitter::new(0.0, 0.0),
        bad_gateway_cooldown_secs: 0,
        ..RetryPolicy::default()
    }
}

pub fn processor(
    platform: Arc<ScriptedPlatform>,
    metrics: Arc<PrometheusMetrics>,
) -> Arc<MessageProcessor> {
    Arc::new(MessageProcessor::new(platform, instant_policy(), metrics))
}

pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval_secs: 1,
        registry_backoff_secs: 1,
        liveness_interval_secs: 30,
        shutdown_grace_secs: 1,
        ..WorkerConfig::default()
    }
}

/// Poll a condition for up to five seconds
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
