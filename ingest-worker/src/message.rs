//! Inbound queue message and event payload decoding

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

/// Kind of payload carried by a message
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "Option<String>")]
pub enum PayloadKind {
    /// Batch of objects to import
    #[default]
    Bundle,
    /// Single create/update/delete/merge notification
    Event,
    /// Anything else (acknowledged and skipped)
    Other(String),
}

impl From<Option<String>> for PayloadKind {
    fn from(value: Option<String>) -> Self {
        match value.as_deref() {
            None | Some("bundle") => PayloadKind::Bundle,
            Some("event") => PayloadKind::Event,
            Some(other) => PayloadKind::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadKind::Bundle => write!(f, "bundle"),
            PayloadKind::Event => write!(f, "event"),
            PayloadKind::Other(kind) => write!(f, "{}", kind),
        }
    }
}

/// Message as delivered on a connector queue
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    /// User on whose behalf the import runs
    #[serde(default)]
    pub applicant_id: Option<String>,

    /// Work tracked by the platform, if any
    #[serde(default)]
    pub work_id: Option<String>,

    /// Ask the platform for a synchronized upsert
    #[serde(default, deserialize_with = "null_as_false")]
    pub synchronized: bool,

    /// Payload kind (`type` on the wire, defaults to bundle)
    #[serde(rename = "type", default)]
    pub kind: PayloadKind,

    /// Restrict import to these entity types (empty means no filter)
    #[serde(rename = "entities_types", default, deserialize_with = "null_as_empty")]
    pub entity_types: Vec<String>,

    /// Base64 encoded payload
    #[serde(default)]
    pub content: String,

    /// Update existing objects
    #[serde(default, deserialize_with = "null_as_false")]
    pub update: bool,
}

fn null_as_false<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl InboundMessage {
    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Entity type filter, `None` when no type was requested
    pub fn entity_filter(&self) -> Option<&[String]> {
        if self.entity_types.is_empty() {
            None
        } else {
            Some(&self.entity_types)
        }
    }

    /// Decode the base64 content into UTF-8 text
    pub fn content_text(&self) -> Result<String> {
        let raw = STANDARD
            .decode(self.content.trim())
            .map_err(|e| Error::Decode(format!("invalid base64 content: {}", e)))?;
        String::from_utf8(raw).map_err(|e| Error::Decode(format!("content is not UTF-8: {}", e)))
    }
}

/// Event action
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum EventAction {
    /// Object created
    Create,
    /// Object updated
    Update,
    /// Object deleted
    Delete,
    /// Objects merged into a target
    Merge,
    /// Unknown action
    Other(String),
}

impl From<String> for EventAction {
    fn from(value: String) -> Self {
        match value.as_str() {
            "create" => EventAction::Create,
            "update" => EventAction::Update,
            "delete" => EventAction::Delete,
            "merge" => EventAction::Merge,
            _ => EventAction::Other(value),
        }
    }
}

/// Reference to a merged source object
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRef {
    /// Object id
    pub id: String,
}

/// Event context
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventContext {
    /// Merge sources
    #[serde(default)]
    pub sources: Vec<SourceRef>,
}

/// Decoded event payload
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    /// Event action (`type` on the wire)
    #[serde(rename = "type")]
    pub action: EventAction,

    /// Object the event is about
    #[serde(default)]
    pub data: Value,

    /// Extra context (merge sources)
    #[serde(default)]
    pub context: Option<EventContext>,
}

impl EventEnvelope {
    /// Parse decoded event text
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Id of the event's object
    pub fn object_id(&self) -> Result<&str> {
        self.data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Decode("event data has no id".to_string()))
    }

    /// Ids of the objects merged into the target
    pub fn source_ids(&self) -> Result<Vec<String>> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| Error::Decode("merge event has no context".to_string()))?;
        Ok(context.sources.iter().map(|source| source.id.clone()).collect())
    }

    /// Wrap the event's object as a single-object bundle
    pub fn to_bundle(&self) -> Result<String> {
        if !self.data.is_object() {
            return Err(Error::Decode("event data is not an object".to_string()));
        }
        let bundle = json!({
            "type": "bundle",
            "objects": [self.data],
        });
        Ok(serde_json::to_string(&bundle)?)
    }
}
