//! Resilient queue consumer feeding a knowledge platform
//!
//! Provides:
//! - A supervisor that keeps one consumer per advertised queue
//! - Prefetch-one consumers that settle every delivery exactly once
//! - A processor that retries remote failures per failure class
//! - A GraphQL platform client and an AMQP broker
//! - Observability via tracing and Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod metrics;
pub mod platform;
pub mod processor;
pub mod retry;
pub mod supervisor;
pub mod telemetry;
pub mod types;

pub use broker::{AmqpBroker, Delivery, QueueBroker, Subscription};
pub use client::HttpPlatformClient;
pub use config::Config;
pub use consumer::Consumer;
pub use error::{Error, Result};
pub use message::{EventEnvelope, InboundMessage, PayloadKind};
pub use metrics::{MetricsSink, PrometheusMetrics};
pub use platform::{
    BundleImport, ConnectorRegistry, ErrorCode, PlatformApi, RemoteFailure, RemoteResult,
    RequestContext,
};
pub use processor::{MessageProcessor, ProcessingAttempt};
pub use retry::{Failure, FailureClass, RetryDecision, RetryPolicy, Settlement};
pub use supervisor::{ReconcileReport, Supervisor};
pub use types::{ConnectionParams, ConnectorDescriptor, FailureReport};
