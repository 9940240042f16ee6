//! Remote knowledge-platform interface
//!
//! The platform performs the actual imports; this crate only drives it. Every
//! call returns a typed [`RemoteFailure`] so retry classification is a
//! structural match on the variant and error code.

use crate::message::InboundMessage;
use crate::types::{ConnectorDescriptor, FailureReport};
use async_trait::async_trait;
use thiserror::Error;

/// Platform application error code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// Another writer holds a lock on an impacted object
    LockConflict,
    /// A referenced object does not exist (yet)
    MissingReference,
    /// Upstream gateway failure (HTTP 502)
    BadGateway,
    /// Any other rejection
    Other(String),
}

impl ErrorCode {
    /// Map a platform error code string
    pub fn from_code(code: &str) -> Self {
        match code {
            "LOCK_ERROR" => ErrorCode::LockConflict,
            "MISSING_REFERENCE_ERROR" => ErrorCode::MissingReference,
            "BAD_GATEWAY" => ErrorCode::BadGateway,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

/// Failure of a remote platform call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteFailure {
    /// Connection or read timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Transport-level failure
    #[error("Request failed: {0}")]
    Network(String),

    /// Platform rejected the call
    #[error("{message}")]
    Application {
        /// Error code
        code: ErrorCode,
        /// Error message
        message: String,
    },
}

impl RemoteFailure {
    /// Shorthand for an application failure
    pub fn application(code: ErrorCode, message: impl Into<String>) -> Self {
        RemoteFailure::Application {
            code,
            message: message.into(),
        }
    }
}

/// Result of a remote call
pub type RemoteResult<T> = std::result::Result<T, RemoteFailure>;

/// Per-call request scope
///
/// Applicant and upsert mode are passed with every call instead of being
/// stored on a shared client, so concurrent consumers never see each other's
/// headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Applicant id header
    pub applicant_id: Option<String>,
    /// Synchronized upsert header
    pub synchronized: bool,
}

impl RequestContext {
    /// Scope for one inbound message
    pub fn for_message(message: &InboundMessage) -> Self {
        Self {
            applicant_id: message.applicant_id.clone(),
            synchronized: message.synchronized,
        }
    }
}

/// Bundle import request
#[derive(Debug, Clone, Copy)]
pub struct BundleImport<'a> {
    /// Serialized bundle
    pub content: &'a str,
    /// Update existing objects
    pub update: bool,
    /// Entity type filter
    pub types: Option<&'a [String]>,
    /// Attempt number, `None` once the platform should stop special-casing retries
    pub attempt_hint: Option<u32>,
}

/// Operations consumed from the platform
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Trivial read-only liveness query
    async fn ping(&self) -> RemoteResult<()>;

    /// Import a bundle
    async fn import_bundle(&self, ctx: &RequestContext, request: BundleImport<'_>)
        -> RemoteResult<()>;

    /// Delete an object
    async fn delete(&self, ctx: &RequestContext, id: &str) -> RemoteResult<()>;

    /// Merge source objects into a target
    async fn merge(&self, ctx: &RequestContext, target_id: &str, source_ids: &[String])
        -> RemoteResult<()>;

    /// Mark one expected unit of work as done (`None`) or failed
    async fn report_expectation(
        &self,
        ctx: &RequestContext,
        work_id: &str,
        report: Option<&FailureReport>,
    ) -> RemoteResult<()>;
}

/// Source of the desired queue set
#[async_trait]
pub trait ConnectorRegistry: Send + Sync {
    /// Fetch the current connector descriptors
    async fn list_connectors(&self) -> RemoteResult<Vec<ConnectorDescriptor>>;
}
