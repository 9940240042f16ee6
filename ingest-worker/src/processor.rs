//! Per-message processing state machine
//!
//! Decodes a delivery, dispatches it to the platform and loops over the
//! retry policy until the message reaches a terminal decision. Retries are an
//! explicit loop so the long unbounded paths never grow the stack.

use crate::message::{EventAction, EventEnvelope, InboundMessage, PayloadKind};
use crate::metrics::MetricsSink;
use crate::platform::{BundleImport, PlatformApi, RequestContext};
use crate::retry::{Failure, FailureClass, RetryDecision, RetryPolicy};
use crate::types::{FailureReport, SOURCE_UNPARSEABLE};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempt bookkeeping for one logical message
#[derive(Debug, Clone)]
pub struct ProcessingAttempt {
    message_ref: u64,
    count: u32,
    started_at: DateTime<Utc>,
}

impl ProcessingAttempt {
    /// Fresh attempt state for a delivery
    pub fn new(message_ref: u64) -> Self {
        Self {
            message_ref,
            count: 0,
            started_at: Utc::now(),
        }
    }

    /// Delivery tag of the message
    pub fn message_ref(&self) -> u64 {
        self.message_ref
    }

    /// Number of the current attempt, 0 when idle
    pub fn count(&self) -> u32 {
        self.count
    }

    /// When processing of the message began
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Start the next attempt and return its number
    pub fn advance(&mut self) -> u32 {
        self.count += 1;
        self.count
    }

    /// Back to idle after a terminal outcome
    pub fn reset(&mut self) {
        self.count = 0;
    }
}

enum Payload {
    Bundle(String),
    Event(EventEnvelope),
}

enum Outcome {
    Imported,
    Skipped,
}

/// Turns deliveries into terminal ack/nack decisions
pub struct MessageProcessor {
    platform: Arc<dyn PlatformApi>,
    policy: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl MessageProcessor {
    /// Create new processor
    pub fn new(
        platform: Arc<dyn PlatformApi>,
        policy: RetryPolicy,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            platform,
            policy,
            metrics,
        }
    }

    /// Retry policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Process one raw delivery to a terminal decision
    pub async fn handle_delivery(
        &self,
        delivery_tag: u64,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> RetryDecision {
        let start = Instant::now();
        self.metrics.record_processed();

        let decision = match InboundMessage::from_bytes(body) {
            Ok(message) => {
                let mut attempt = ProcessingAttempt::new(delivery_tag);
                self.process(&message, &mut attempt, cancel).await
            }
            Err(e) => {
                // Nothing to retry and no work id to report to
                error!(tag = delivery_tag, error = %e, "Unparseable message, dropping it");
                self.metrics.record_failure(FailureClass::Unclassified);
                RetryDecision::ack()
            }
        };

        self.metrics.record_duration(start.elapsed());
        decision
    }

    /// Run attempts for one message until a terminal decision
    ///
    /// `attempt` is advanced once per attempt and reset to zero before
    /// returning.
    pub async fn process(
        &self,
        message: &InboundMessage,
        attempt: &mut ProcessingAttempt,
        cancel: &CancellationToken,
    ) -> RetryDecision {
        if let PayloadKind::Other(kind) = &message.kind {
            info!(tag = attempt.message_ref(), kind = %kind, "Unknown message type, acknowledging");
            attempt.reset();
            return RetryDecision::ack();
        }

        let ctx = RequestContext::for_message(message);
        let (source, payload) = decode(message);

        loop {
            let number = attempt.advance();
            let result = match &payload {
                Ok(payload) => self.dispatch(&ctx, message, payload, number).await,
                Err(failure) => Err(failure.clone()),
            };

            let failure = match result {
                Ok(Outcome::Imported) => {
                    self.metrics.record_success();
                    self.report(&ctx, message, None).await;
                    attempt.reset();
                    return RetryDecision::ack();
                }
                Ok(Outcome::Skipped) => {
                    attempt.reset();
                    return RetryDecision::ack();
                }
                Err(failure) => failure,
            };

            let decision = self.policy.decide(&failure, number, &source);
            self.record_failure(&failure, &decision);

            if decision.is_terminal() {
                self.conclude(&ctx, message, attempt, &failure, &decision, cancel)
                    .await;
                attempt.reset();
                return decision;
            }

            let delay = decision.delay();
            warn!(
                tag = attempt.message_ref(),
                attempt = number,
                reason = failure.class.metric_label(),
                delay_ms = delay.as_millis() as u64,
                error = %failure.message,
                "Message reprocess"
            );

            if !sleep_unless_cancelled(delay, cancel).await {
                info!(
                    tag = attempt.message_ref(),
                    "Consumer stopping during backoff, returning message to the queue"
                );
                attempt.reset();
                return RetryDecision::nack();
            }
        }
    }

    /// Count a failed attempt
    ///
    /// Exhausted lock contention counts as a technical error. An exhausted
    /// missing reference is only logged and reported.
    fn record_failure(&self, failure: &Failure, decision: &RetryDecision) {
        match (failure.class, decision.is_terminal()) {
            (FailureClass::MissingReference, true) => {}
            (FailureClass::LockContention, true) => {
                self.metrics.record_failure(FailureClass::Unclassified)
            }
            (class, _) => self.metrics.record_failure(class),
        }
    }

    async fn dispatch(
        &self,
        ctx: &RequestContext,
        message: &InboundMessage,
        payload: &Payload,
        attempt: u32,
    ) -> Result<Outcome, Failure> {
        let attempt_hint = self.policy.attempt_hint(attempt);

        match payload {
            Payload::Bundle(content) => {
                self.platform
                    .import_bundle(
                        ctx,
                        BundleImport {
                            content,
                            update: message.update,
                            types: message.entity_filter(),
                            attempt_hint,
                        },
                    )
                    .await?;
            }
            Payload::Event(event) => match &event.action {
                EventAction::Create | EventAction::Update => {
                    let bundle = event.to_bundle()?;
                    self.import_object(ctx, message, &bundle, attempt_hint).await?;
                }
                EventAction::Delete => {
                    let id = event.object_id()?;
                    self.platform.delete(ctx, id).await?;
                }
                EventAction::Merge => {
                    let target_id = event.object_id()?;
                    let source_ids = event.source_ids()?;
                    let bundle = event.to_bundle()?;
                    self.platform.merge(ctx, target_id, &source_ids).await?;
                    self.import_object(ctx, message, &bundle, attempt_hint).await?;
                }
                EventAction::Other(action) => {
                    debug!(action = %action, "Unknown event action, skipping");
                    return Ok(Outcome::Skipped);
                }
            },
        }

        Ok(Outcome::Imported)
    }

    async fn import_object(
        &self,
        ctx: &RequestContext,
        message: &InboundMessage,
        bundle: &str,
        attempt_hint: Option<u32>,
    ) -> Result<(), Failure> {
        self.platform
            .import_bundle(
                ctx,
                BundleImport {
                    content: bundle,
                    update: true,
                    types: message.entity_filter(),
                    attempt_hint,
                },
            )
            .await?;
        Ok(())
    }

    async fn conclude(
        &self,
        ctx: &RequestContext,
        message: &InboundMessage,
        attempt: &ProcessingAttempt,
        failure: &Failure,
        decision: &RetryDecision,
        cancel: &CancellationToken,
    ) {
        match decision {
            RetryDecision::TerminalAck { report } => {
                error!(
                    tag = attempt.message_ref(),
                    attempt = attempt.count(),
                    reason = failure.class.metric_label(),
                    error = %failure.message,
                    "Giving up on message"
                );
                if let Some(report) = report {
                    self.report(ctx, message, Some(report)).await;
                }
            }
            RetryDecision::TerminalNack { cooldown } => {
                error!(
                    tag = attempt.message_ref(),
                    reason = failure.class.metric_label(),
                    error = %failure.message,
                    "Message NOT acknowledged"
                );
                sleep_unless_cancelled(*cooldown, cancel).await;
            }
            RetryDecision::RetryUnbounded { .. } | RetryDecision::RetryBounded { .. } => {}
        }
    }

    async fn report(
        &self,
        ctx: &RequestContext,
        message: &InboundMessage,
        report: Option<&FailureReport>,
    ) {
        let Some(work_id) = message.work_id.as_deref() else {
            return;
        };

        if let Err(e) = self.platform.report_expectation(ctx, work_id, report).await {
            warn!(work_id = %work_id, error = %e, "Unable to report work expectation");
        }
    }
}

fn decode(message: &InboundMessage) -> (String, Result<Payload, Failure>) {
    let text = match message.content_text() {
        Ok(text) => text,
        Err(e) => return (SOURCE_UNPARSEABLE.to_string(), Err(e.into())),
    };

    let payload = match message.kind {
        PayloadKind::Event => EventEnvelope::parse(&text)
            .map(Payload::Event)
            .map_err(Failure::from),
        _ => Ok(Payload::Bundle(text.clone())),
    };

    (text, payload)
}

async fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }

    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
