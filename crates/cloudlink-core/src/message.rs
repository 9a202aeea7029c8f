//! # Message Model
//!
//! The message envelope exchanged between a client and the cloud endpoint.
//!
//! ## Message Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Message Lifecycle                                │
//! │                                                                         │
//! │  MessageBuilder ──build()──► Message (immutable)                        │
//! │        │                        │                                       │
//! │        │ validation             │ queue()                               │
//! │        ▼                        ▼                                       │
//! │  ValidationError          Priority Queue ──► send batch ──► wire        │
//! │  (never enqueued)                                                       │
//! │                                                                         │
//! │  DIRECTIONS                                                            │
//! │  ──────────                                                            │
//! │  DATA / ALERT / RESOURCES_REPORT   device ──► cloud                     │
//! │  REQUEST                           cloud  ──► device                    │
//! │  RESPONSE                          device ──► cloud (answers REQUEST)   │
//! │  RESPONSE_WAIT                     internal sentinel, never sent        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Messages serialize as camelCase JSON; the internal `storageRefs`
//! bookkeeping never reaches the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ValidationError, ValidationResult};

// =============================================================================
// Boundary Limits
// =============================================================================

/// Maximum UTF-8 byte length of any key in properties or payload data.
pub const MAX_KEY_BYTES: usize = 2048;

/// Maximum UTF-8 byte length of any string value in properties or payload data.
pub const MAX_STRING_VALUE_BYTES: usize = 65_536;

// =============================================================================
// Priority
// =============================================================================

/// Delivery priority of an outbound message.
///
/// Higher priorities are drained from the queue first; ties are broken by
/// submission order, which senders rely on for sequential attribute updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Lowest,
    #[default]
    Low,
    Medium,
    High,
    Highest,
}

impl Priority {
    /// Numeric rank used for heap ordering (higher pops first).
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Lowest => 0,
            Priority::Low => 1,
            Priority::Medium => 2,
            Priority::High => 3,
            Priority::Highest => 4,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Lowest => "LOWEST",
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Highest => "HIGHEST",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Reliability
// =============================================================================

/// Delivery reliability requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reliability {
    NoGuarantee,
    #[default]
    BestEffort,
    GuaranteedDelivery,
}

// =============================================================================
// Message Type
// =============================================================================

/// The kind of a message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Telemetry reading from a device.
    Data,
    /// Telemetry event that warrants attention.
    Alert,
    /// Server-originated operation (attribute write, action call).
    Request,
    /// Answer to a REQUEST, addressed back to the server.
    Response,
    /// Advertisement of the resources a device exposes.
    ResourcesReport,
    /// Internal sentinel: the handler will answer asynchronously.
    /// Never placed on the wire.
    ResponseWait,
}

impl MessageType {
    /// Whether messages of this type may be placed on the wire.
    pub fn is_wire_type(&self) -> bool {
        !matches!(self, MessageType::ResponseWait)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::Data => "DATA",
            MessageType::Alert => "ALERT",
            MessageType::Request => "REQUEST",
            MessageType::Response => "RESPONSE",
            MessageType::ResourcesReport => "RESOURCES_REPORT",
            MessageType::ResponseWait => "RESPONSE_WAIT",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Message payload, shaped by the message type.
///
/// Untagged on the wire: the field sets of the three variants are disjoint,
/// so deserialization is unambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// DATA / ALERT / RESOURCES_REPORT payload: a format URN plus a data map.
    Data {
        format: String,
        data: Map<String, Value>,
    },

    /// REQUEST payload: the operation the server is asking for.
    #[serde(rename_all = "camelCase")]
    Request {
        method: String,
        url: String,
        #[serde(default)]
        body: Value,
    },

    /// RESPONSE payload: status and body answering a request.
    #[serde(rename_all = "camelCase")]
    Response {
        status: u16,
        #[serde(default)]
        body: Value,
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
}

impl Payload {
    /// Returns the request URL for REQUEST/RESPONSE payloads.
    pub fn url(&self) -> Option<&str> {
        match self {
            Payload::Request { url, .. } => Some(url),
            Payload::Response { url, .. } => url.as_deref(),
            Payload::Data { .. } => None,
        }
    }
}

// =============================================================================
// Message
// =============================================================================

/// An immutable-after-build message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Client-generated unique id.
    pub client_id: Uuid,

    /// Originating endpoint id. Set exactly once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Destination endpoint id (REQUEST/RESPONSE routing).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,

    /// Endpoint that physically sent the message (gateway scenarios).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    /// Delivery priority.
    pub priority: Priority,

    /// Delivery reliability.
    pub reliability: Reliability,

    /// When the event the message describes occurred.
    pub event_time: DateTime<Utc>,

    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Free-form message properties.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,

    /// Type-shaped payload.
    pub payload: Payload,

    /// Ids of storage objects this message's payload references.
    /// Local dependency bookkeeping only, never serialized.
    #[serde(skip)]
    pub storage_refs: Vec<Uuid>,
}

impl Message {
    /// Starts building a message.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Builds the internal RESPONSE_WAIT sentinel.
    ///
    /// Returned by request handlers that will complete asynchronously; the
    /// correlator recognizes it and produces no response now.
    pub fn response_wait() -> Self {
        Message {
            client_id: Uuid::new_v4(),
            source: None,
            destination: None,
            sender: None,
            priority: Priority::default(),
            reliability: Reliability::default(),
            event_time: Utc::now(),
            kind: MessageType::ResponseWait,
            properties: Map::new(),
            payload: Payload::Response {
                status: 0,
                body: Value::Null,
                request_id: String::new(),
                url: None,
            },
            storage_refs: Vec::new(),
        }
    }

    /// Builds a RESPONSE answering `request`, echoing its id and routing
    /// it back to the request's source at the request's priority.
    pub fn response_to(request: &Message, status: u16, body: Value) -> Message {
        Message {
            client_id: Uuid::new_v4(),
            source: request.destination.clone(),
            destination: request.source.clone(),
            sender: None,
            priority: request.priority,
            reliability: request.reliability,
            event_time: Utc::now(),
            kind: MessageType::Response,
            properties: Map::new(),
            payload: Payload::Response {
                status,
                body,
                request_id: request.client_id.to_string(),
                url: request.payload.url().map(str::to_string),
            },
            storage_refs: Vec::new(),
        }
    }

    /// Validates mandatory fields and boundary limits.
    ///
    /// A message that fails here must never enter a queue.
    pub fn validate(&self) -> ValidationResult<()> {
        match (&self.kind, &self.payload) {
            (MessageType::Data | MessageType::Alert | MessageType::ResourcesReport, payload) => {
                match payload {
                    Payload::Data { format, data } => {
                        if format.trim().is_empty() {
                            return Err(ValidationError::Required {
                                field: "payload.format".into(),
                            });
                        }
                        validate_map(data)?;
                    }
                    _ => {
                        return Err(ValidationError::InvalidFormat {
                            field: "payload".into(),
                            reason: format!("{} messages require a data payload", self.kind),
                        })
                    }
                }
            }
            (MessageType::Request, Payload::Request { url, .. }) => {
                if url.trim().is_empty() {
                    return Err(ValidationError::Required {
                        field: "payload.url".into(),
                    });
                }
            }
            (MessageType::Request, _) => {
                return Err(ValidationError::InvalidFormat {
                    field: "payload".into(),
                    reason: "REQUEST messages require a request payload".into(),
                })
            }
            (MessageType::Response, Payload::Response { request_id, .. }) => {
                if request_id.trim().is_empty() {
                    return Err(ValidationError::Required {
                        field: "payload.requestId".into(),
                    });
                }
            }
            (MessageType::Response, _) => {
                return Err(ValidationError::InvalidFormat {
                    field: "payload".into(),
                    reason: "RESPONSE messages require a response payload".into(),
                })
            }
            (MessageType::ResponseWait, _) => {}
        }

        validate_map(&self.properties)?;
        Ok(())
    }

    /// Serializes to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Checks key and string-value byte limits, recursing into nested
/// objects and arrays.
fn validate_map(map: &Map<String, Value>) -> ValidationResult<()> {
    for (key, value) in map {
        if key.len() > MAX_KEY_BYTES {
            return Err(ValidationError::KeyTooLong {
                key: truncate_for_report(key),
                actual: key.len(),
                max: MAX_KEY_BYTES,
            });
        }
        validate_value(key, value)?;
    }
    Ok(())
}

fn validate_value(key: &str, value: &Value) -> ValidationResult<()> {
    match value {
        Value::String(s) => {
            if s.len() > MAX_STRING_VALUE_BYTES {
                return Err(ValidationError::ValueTooLong {
                    key: truncate_for_report(key),
                    actual: s.len(),
                    max: MAX_STRING_VALUE_BYTES,
                });
            }
        }
        Value::Object(map) => validate_map(map)?,
        Value::Array(items) => {
            for item in items {
                validate_value(key, item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Keeps error messages readable when the offending key is itself huge.
fn truncate_for_report(key: &str) -> String {
    const REPORT_LIMIT: usize = 64;
    if key.len() <= REPORT_LIMIT {
        key.to_string()
    } else {
        let mut end = REPORT_LIMIT;
        while !key.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &key[..end])
    }
}

// =============================================================================
// Message Builder
// =============================================================================

/// Fluent builder for [`Message`].
///
/// Validation runs in [`MessageBuilder::build`]; setter misuse (assigning
/// `source` twice) is remembered and surfaced there so the fluent chain
/// stays ergonomic.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    source: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    priority: Priority,
    reliability: Reliability,
    event_time: Option<DateTime<Utc>>,
    kind: Option<MessageType>,
    properties: Map<String, Value>,
    payload: Option<Payload>,
    storage_refs: Vec<Uuid>,
    duplicate_source: bool,
}

impl MessageBuilder {
    /// Sets the source endpoint id. May be called exactly once;
    /// a second call makes `build` fail.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        if self.source.is_some() {
            self.duplicate_source = true;
        } else {
            self.source = Some(source.into());
        }
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = Some(event_time);
        self
    }

    /// Adds a message property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Records that the payload references a storage object; the dispatcher
    /// holds the message back until that object finishes synchronizing.
    pub fn storage_reference(mut self, object_id: Uuid) -> Self {
        self.storage_refs.push(object_id);
        self
    }

    /// DATA payload with a format URN and data map.
    pub fn data(mut self, format: impl Into<String>, data: Map<String, Value>) -> Self {
        self.kind = Some(MessageType::Data);
        self.payload = Some(Payload::Data {
            format: format.into(),
            data,
        });
        self
    }

    /// ALERT payload with a format URN and data map.
    pub fn alert(mut self, format: impl Into<String>, data: Map<String, Value>) -> Self {
        self.kind = Some(MessageType::Alert);
        self.payload = Some(Payload::Data {
            format: format.into(),
            data,
        });
        self
    }

    /// RESOURCES_REPORT payload.
    pub fn resources_report(mut self, format: impl Into<String>, data: Map<String, Value>) -> Self {
        self.kind = Some(MessageType::ResourcesReport);
        self.payload = Some(Payload::Data {
            format: format.into(),
            data,
        });
        self
    }

    /// REQUEST payload (used when synthesizing server requests in tests
    /// and by enterprise clients issuing device operations).
    pub fn request(
        mut self,
        method: impl Into<String>,
        url: impl Into<String>,
        body: Value,
    ) -> Self {
        self.kind = Some(MessageType::Request);
        self.payload = Some(Payload::Request {
            method: method.into(),
            url: url.into(),
            body,
        });
        self
    }

    /// RESPONSE payload answering the request with the given id.
    pub fn response(mut self, status: u16, body: Value, request_id: impl Into<String>) -> Self {
        self.kind = Some(MessageType::Response);
        self.payload = Some(Payload::Response {
            status,
            body,
            request_id: request_id.into(),
            url: None,
        });
        self
    }

    /// Validates and builds the immutable message.
    pub fn build(self) -> ValidationResult<Message> {
        if self.duplicate_source {
            return Err(ValidationError::AlreadySet {
                field: "source".into(),
            });
        }

        let payload = self.payload.ok_or(ValidationError::Required {
            field: "payload".into(),
        })?;
        let kind = self.kind.ok_or(ValidationError::Required {
            field: "type".into(),
        })?;

        let message = Message {
            client_id: Uuid::new_v4(),
            source: self.source,
            destination: self.destination,
            sender: self.sender,
            priority: self.priority,
            reliability: self.reliability,
            event_time: self.event_time.unwrap_or_else(Utc::now),
            kind,
            properties: self.properties,
            payload,
            storage_refs: self.storage_refs,
        };

        message.validate()?;
        Ok(message)
    }
}

// =============================================================================
// Tests
// =============================================================================
