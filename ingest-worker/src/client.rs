//! GraphQL client for the knowledge platform
//!
//! All operations are POSTed to `{url}/graphql` with a bearer token. The
//! applicant and upsert headers come from the per-call [`RequestContext`].

use crate::config::PlatformConfig;
use crate::platform::{
    BundleImport, ConnectorRegistry, ErrorCode, PlatformApi, RemoteFailure, RemoteResult,
    RequestContext,
};
use crate::types::{ConnectionParams, ConnectorDescriptor, FailureReport};
use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// Applicant header
pub const APPLICANT_HEADER: &str = "applicant-id";

/// Synchronized upsert header
pub const SYNCHRONIZED_HEADER: &str = "synchronized-upsert";

const PING_QUERY: &str = "query Ping { about { version } }";

const CONNECTORS_QUERY: &str = r#"
query ConnectorsForWorker {
  connectorsForWorker {
    id
    name
    config {
      push
      connection { host port vhost user pass use_ssl }
    }
  }
}"#;

const IMPORT_MUTATION: &str = r#"
mutation BundleImport($content: String!, $update: Boolean, $types: [String], $retryNumber: Int) {
  bundleImport(content: $content, update: $update, types: $types, retryNumber: $retryNumber)
}"#;

const DELETE_MUTATION: &str = r#"
mutation StixEdit($id: ID!) {
  stixEdit(id: $id) { delete }
}"#;

const MERGE_MUTATION: &str = r#"
mutation StixCoreObjectEdit($id: ID!, $stixCoreObjectsIds: [String]!) {
  stixCoreObjectEdit(id: $id) {
    merge(stixCoreObjectsIds: $stixCoreObjectsIds) { id }
  }
}"#;

const REPORT_MUTATION: &str = r#"
mutation ReportExpectation($id: ID!, $error: WorkErrorInput) {
  workEdit(id: $id) { reportExpectation(error: $error) }
}"#;

#[derive(Debug, Serialize)]
struct GraphqlRequest<'a> {
    query: &'a str,
    variables: Value,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    extensions: Option<ErrorExtensions>,
}

#[derive(Debug, Deserialize)]
struct ErrorExtensions {
    #[serde(default)]
    code: Option<String>,
}

impl GraphqlError {
    fn into_failure(self) -> RemoteFailure {
        let code = self
            .extensions
            .and_then(|ext| ext.code)
            .or(self.name)
            .unwrap_or_else(|| "UNKNOWN".to_string());
        RemoteFailure::application(ErrorCode::from_code(&code), self.message)
    }
}

#[derive(Debug, Deserialize)]
struct ConnectorsData {
    #[serde(rename = "connectorsForWorker", default)]
    connectors: Vec<ConnectorNode>,
}

#[derive(Debug, Deserialize)]
struct ConnectorNode {
    #[serde(default)]
    name: Option<String>,
    config: ConnectorConfigNode,
}

#[derive(Debug, Deserialize)]
struct ConnectorConfigNode {
    push: String,
    connection: ConnectionParams,
}

/// HTTP implementation of the platform API and connector registry
pub struct HttpPlatformClient {
    endpoint: String,
    token: String,
    client: Client,
}

impl HttpPlatformClient {
    /// Create new client
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(!config.ssl_verify)
            .build()?;

        let endpoint = format!("{}/graphql", config.url.trim_end_matches('/'));
        info!(endpoint = %endpoint, "Platform client configured");

        Ok(Self {
            endpoint,
            token: config.token.clone(),
            client,
        })
    }

    /// GraphQL endpoint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn execute(
        &self,
        ctx: Option<&RequestContext>,
        query: &str,
        variables: Value,
    ) -> RemoteResult<Value> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&GraphqlRequest { query, variables });

        if let Some(ctx) = ctx {
            if let Some(applicant_id) = &ctx.applicant_id {
                request = request.header(APPLICANT_HEADER, applicant_id);
            }
            request = request.header(SYNCHRONIZED_HEADER, ctx.synchronized.to_string());
        }

        let response = request.send().await.map_err(transport_failure)?;
        let status = response.status();

        if status == StatusCode::BAD_GATEWAY {
            return Err(RemoteFailure::application(
                ErrorCode::BadGateway,
                format!("Platform returned {}", status),
            ));
        }

        let body = response.text().await.map_err(transport_failure)?;
        if !status.is_success() {
            return Err(RemoteFailure::application(
                ErrorCode::Other(format!("HTTP_{}", status.as_u16())),
                format!("Platform returned {}: {}", status, body),
            ));
        }

        let parsed: GraphqlResponse = serde_json::from_str(&body).map_err(|e| {
            RemoteFailure::application(
                ErrorCode::Other("INVALID_RESPONSE".to_string()),
                format!("Failed to parse response: {}", e),
            )
        })?;

        if let Some(error) = parsed.errors.into_iter().next() {
            return Err(error.into_failure());
        }

        Ok(parsed.data.unwrap_or(Value::Null))
    }
}

fn transport_failure(error: reqwest::Error) -> RemoteFailure {
    if error.is_timeout() {
        RemoteFailure::Timeout(error.to_string())
    } else {
        RemoteFailure::Network(error.to_string())
    }
}

#[async_trait]
impl PlatformApi for HttpPlatformClient {
    async fn ping(&self) -> RemoteResult<()> {
        self.execute(None, PING_QUERY, json!({})).await?;
        Ok(())
    }

    async fn import_bundle(
        &self,
        ctx: &RequestContext,
        request: BundleImport<'_>,
    ) -> RemoteResult<()> {
        debug!(
            update = request.update,
            retry_number = ?request.attempt_hint,
            "Importing bundle"
        );
        let variables = json!({
            "content": request.content,
            "update": request.update,
            "types": request.types,
            "retryNumber": request.attempt_hint,
        });
        self.execute(Some(ctx), IMPORT_MUTATION, variables).await?;
        Ok(())
    }

    async fn delete(&self, ctx: &RequestContext, id: &str) -> RemoteResult<()> {
        debug!(id = %id, "Deleting object");
        self.execute(Some(ctx), DELETE_MUTATION, json!({ "id": id }))
            .await?;
        Ok(())
    }

    async fn merge(
        &self,
        ctx: &RequestContext,
        target_id: &str,
        source_ids: &[String],
    ) -> RemoteResult<()> {
        debug!(target = %target_id, sources = source_ids.len(), "Merging objects");
        let variables = json!({ "id": target_id, "stixCoreObjectsIds": source_ids });
        self.execute(Some(ctx), MERGE_MUTATION, variables).await?;
        Ok(())
    }

    async fn report_expectation(
        &self,
        ctx: &RequestContext,
        work_id: &str,
        report: Option<&FailureReport>,
    ) -> RemoteResult<()> {
        let variables = json!({ "id": work_id, "error": report });
        self.execute(Some(ctx), REPORT_MUTATION, variables).await?;
        Ok(())
    }
}

#[async_trait]
impl ConnectorRegistry for HttpPlatformClient {
    async fn list_connectors(&self) -> RemoteResult<Vec<ConnectorDescriptor>> {
        let data = self.execute(None, CONNECTORS_QUERY, json!({})).await?;
        let data: ConnectorsData = serde_json::from_value(data).map_err(|e| {
            RemoteFailure::application(
                ErrorCode::Other("INVALID_RESPONSE".to_string()),
                format!("Failed to parse connectors: {}", e),
            )
        })?;

        Ok(data
            .connectors
            .into_iter()
            .map(|node| {
                debug!(connector = ?node.name, queue = %node.config.push, "Connector listed");
                ConnectorDescriptor::new(node.config.push, node.config.connection)
            })
            .collect())
    }
}
