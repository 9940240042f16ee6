//! Failure classification and retry policy
//!
//! | Class | Retry |
//! |---|---|
//! | timeout | pause 60s + jitter [10,30]s, unbounded |
//! | request error | nack immediately |
//! | lock contention | jitter [10,30]s, up to 60 attempts |
//! | missing reference | jitter [1,3]s, up to 4 attempts, then ack with report |
//! | bad gateway | cooldown 60s, nack |
//! | anything else | ack with report |

use crate::platform::{ErrorCode, RemoteFailure};
use crate::types::FailureReport;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Failure class driving the retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Remote call timed out
    Timeout,
    /// Generic request/network error
    Network,
    /// Resource lock contention
    LockContention,
    /// Referenced object does not exist yet
    MissingReference,
    /// Upstream gateway failure
    BadGateway,
    /// Anything else
    Unclassified,
}

impl FailureClass {
    /// All classes, in metric label order
    pub const ALL: [FailureClass; 6] = [
        FailureClass::Timeout,
        FailureClass::Network,
        FailureClass::Unclassified,
        FailureClass::LockContention,
        FailureClass::MissingReference,
        FailureClass::BadGateway,
    ];

    /// Classify a remote failure
    pub fn of(failure: &RemoteFailure) -> Self {
        match failure {
            RemoteFailure::Timeout(_) => FailureClass::Timeout,
            RemoteFailure::Network(_) => FailureClass::Network,
            RemoteFailure::Application { code, .. } => match code {
                ErrorCode::LockConflict => FailureClass::LockContention,
                ErrorCode::MissingReference => FailureClass::MissingReference,
                ErrorCode::BadGateway => FailureClass::BadGateway,
                ErrorCode::Other(_) => FailureClass::Unclassified,
            },
        }
    }

    /// Label used on the failure counter
    pub fn metric_label(&self) -> &'static str {
        match self {
            FailureClass::Timeout => "timeout",
            FailureClass::Network => "request-error",
            FailureClass::LockContention => "lock-error",
            FailureClass::MissingReference => "missing-reference-error",
            FailureClass::BadGateway => "bad-gateway-error",
            FailureClass::Unclassified => "technical-error",
        }
    }
}

/// A classified failure of one processing attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Class
    pub class: FailureClass,
    /// Human readable error
    pub message: String,
}

impl Failure {
    /// Unclassified failure (decode errors, malformed events)
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Unclassified,
            message: message.into(),
        }
    }
}

impl From<RemoteFailure> for Failure {
    fn from(failure: RemoteFailure) -> Self {
        Self {
            class: FailureClass::of(&failure),
            message: failure.to_string(),
        }
    }
}

impl From<crate::Error> for Failure {
    fn from(error: crate::Error) -> Self {
        match error {
            crate::Error::Remote(failure) => failure.into(),
            other => Failure::unclassified(other.to_string()),
        }
    }
}

/// Random delay range, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Jitter {
    /// Lower bound
    pub min_secs: f64,
    /// Upper bound
    pub max_secs: f64,
}

impl Jitter {
    /// Create new range
    pub const fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    /// Draw a delay, rounded to hundredths of a second
    pub fn sample(&self) -> Duration {
        let secs = if self.max_secs > self.min_secs {
            rand::thread_rng().gen_range(self.min_secs..=self.max_secs)
        } else {
            self.min_secs
        };
        let secs = (secs.max(0.0) * 100.0).round() / 100.0;
        Duration::from_secs_f64(secs)
    }

    /// Whether a delay lies within the range
    pub fn contains(&self, delay: Duration) -> bool {
        let secs = delay.as_secs_f64();
        secs >= self.min_secs - f64::EPSILON && secs <= self.max_secs + f64::EPSILON
    }
}

/// Ack/nack sent back to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Remove from the queue
    Ack,
    /// Return to the queue for redelivery
    Nack,
}

/// What to do after one processing attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry without an attempt bound, after a fixed pause plus jitter
    RetryUnbounded {
        /// Fixed pause before the jitter
        pause: Duration,
        /// Jitter range
        jitter: Jitter,
    },
    /// Retry after jitter while attempts remain
    RetryBounded {
        /// Jitter range
        jitter: Jitter,
        /// Attempt bound of the failure class
        max_attempts: u32,
    },
    /// Acknowledge, optionally reporting the failure against the work id
    TerminalAck {
        /// Failure report
        report: Option<FailureReport>,
    },
    /// Reject back to the broker after a cooldown
    TerminalNack {
        /// Pause before rejecting
        cooldown: Duration,
    },
}

impl RetryDecision {
    /// Plain successful acknowledgment
    pub fn ack() -> Self {
        RetryDecision::TerminalAck { report: None }
    }

    /// Immediate rejection
    pub fn nack() -> Self {
        RetryDecision::TerminalNack {
            cooldown: Duration::ZERO,
        }
    }

    /// Whether the message has reached a final outcome
    pub fn is_terminal(&self) -> bool {
        self.settlement().is_some()
    }

    /// Broker settlement of a terminal decision
    pub fn settlement(&self) -> Option<Settlement> {
        match self {
            RetryDecision::TerminalAck { .. } => Some(Settlement::Ack),
            RetryDecision::TerminalNack { .. } => Some(Settlement::Nack),
            RetryDecision::RetryUnbounded { .. } | RetryDecision::RetryBounded { .. } => None,
        }
    }

    /// Sleep before the next attempt (or before rejecting)
    pub fn delay(&self) -> Duration {
        match self {
            RetryDecision::RetryUnbounded { pause, jitter } => *pause + jitter.sample(),
            RetryDecision::RetryBounded { jitter, .. } => jitter.sample(),
            RetryDecision::TerminalNack { cooldown } => *cooldown,
            RetryDecision::TerminalAck { .. } => Duration::ZERO,
        }
    }
}

/// Retry policy parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts allowed under lock contention
    pub lock_max_attempts: u32,
    /// Attempts allowed for missing references; also where the attempt hint stops
    pub reference_max_attempts: u32,
    /// Fixed pause after a timeout
    pub timeout_pause_secs: u64,
    /// Jitter after a timeout
    pub timeout_jitter: Jitter,
    /// Jitter after lock contention
    pub lock_jitter: Jitter,
    /// Jitter after a missing reference
    pub reference_jitter: Jitter,
    /// Pause before rejecting on a gateway failure
    pub bad_gateway_cooldown_secs: u64,
    /// Source excerpts at or above this many characters are elided
    pub report_source_limit: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            lock_max_attempts: 60,
            reference_max_attempts: 4,
            timeout_pause_secs: 60,
            timeout_jitter: Jitter::new(10.0, 30.0),
            lock_jitter: Jitter::new(10.0, 30.0),
            reference_jitter: Jitter::new(1.0, 3.0),
            bad_gateway_cooldown_secs: 60,
            report_source_limit: 50_000,
        }
    }
}

impl RetryPolicy {
    /// Decide what follows the failed attempt number `attempt` (1-based)
    pub fn decide(&self, failure: &Failure, attempt: u32, source: &str) -> RetryDecision {
        match failure.class {
            FailureClass::Timeout => RetryDecision::RetryUnbounded {
                pause: Duration::from_secs(self.timeout_pause_secs),
                jitter: self.timeout_jitter,
            },
            FailureClass::Network => RetryDecision::nack(),
            FailureClass::LockContention if attempt < self.lock_max_attempts => {
                RetryDecision::RetryBounded {
                    jitter: self.lock_jitter,
                    max_attempts: self.lock_max_attempts,
                }
            }
            FailureClass::MissingReference if attempt < self.reference_max_attempts => {
                RetryDecision::RetryBounded {
                    jitter: self.reference_jitter,
                    max_attempts: self.reference_max_attempts,
                }
            }
            FailureClass::BadGateway => RetryDecision::TerminalNack {
                cooldown: Duration::from_secs(self.bad_gateway_cooldown_secs),
            },
            FailureClass::MissingReference
            | FailureClass::LockContention
            | FailureClass::Unclassified => RetryDecision::TerminalAck {
                report: Some(FailureReport::new(
                    failure.message.clone(),
                    source,
                    self.report_source_limit,
                )),
            },
        }
    }

    /// Attempt number forwarded to the platform on bundle imports
    pub fn attempt_hint(&self, attempt: u32) -> Option<u32> {
        if attempt >= self.reference_max_attempts {
            None
        } else {
            Some(attempt)
        }
    }
}
