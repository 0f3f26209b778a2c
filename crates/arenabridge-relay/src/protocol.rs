//! Relay wire format: tagged JSON envelopes exchanged with browser workers.
//!
//! Every frame is `{"type", "correlation_key"?, "payload"}`. Server-to-worker
//! frames are always `type = "command"` with an `action` inside the payload.

use arenabridge_core::{Error, Result};
use arenabridge_pool::{BattleTarget, Mode, ModelKind};
use serde::{Deserialize, Serialize};

/// Identifier binding one request to the events its worker produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationKey {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for CorrelationKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection handle of one browser worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

// ---------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Register,
    Command,
    TextDelta,
    ImageUrlDelta,
    AttachmentEcho,
    Error,
    Finish,
    CaptureEvent,
    PageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Wrap a server-to-worker command.
    pub fn command(key: Option<&str>, command: &Command) -> Result<Self> {
        Ok(Self {
            kind: MessageKind::Command,
            correlation_key: key.map(str::to_string),
            payload: serde_json::to_value(command)?,
        })
    }

    /// Parse one text frame from a worker.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Protocol(format!("bad envelope: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------
// Server → worker
// ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Inline attachment carried as a data URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub url: String,
}

/// One turn of the flattened conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// `"a"` or `"b"`.
    pub participant_position: String,
}

/// What the worker runs against the upstream site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCommand {
    pub turns: Vec<Turn>,
    pub session_id: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_model_id: Option<String>,
    pub mode: Mode,
    pub kind: ModelKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Command {
    Chat(ChatCommand),
    Cancel,
    ActivateCapture {
        mode: Mode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        battle_target: Option<BattleTarget>,
    },
    SendPageContent,
    Refresh,
}

// ---------------------------------------------------------------
// Worker → server
// ---------------------------------------------------------------

/// One event of an in-flight correlation.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    TextDelta(String),
    ImageUrlDelta(String),
    AttachmentEcho(serde_json::Value),
    Error(String),
    Finish { reason: Option<String> },
}

impl RelayEvent {
    /// `error` and `finish` end the correlation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Finish { .. })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterInfo {
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CapturedIds {
    pub session_id: String,
    pub message_id: String,
}

#[derive(Deserialize)]
struct TextPayload {
    text: String,
}

#[derive(Deserialize)]
struct UrlPayload {
    url: String,
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: String,
}

#[derive(Deserialize, Default)]
struct FinishPayload {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct PageContentPayload {
    content: String,
}

/// A worker frame, dispatched by tag.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Register { client: Option<String>, version: Option<String> },
    Event { key: CorrelationKey, event: RelayEvent },
    CaptureEvent(CapturedIds),
    PageContent { key: Option<String>, content: String },
}

fn payload<T: serde::de::DeserializeOwned>(kind: MessageKind, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::Protocol(format!("bad {:?} payload: {}", kind, e)))
}

impl TryFrom<Envelope> for WorkerMessage {
    type Error = Error;

    fn try_from(env: Envelope) -> Result<Self> {
        let kind = env.kind;
        let event = match kind {
            MessageKind::Register => {
                let info: RegisterInfo = if env.payload.is_null() {
                    RegisterInfo::default()
                } else {
                    payload(kind, env.payload)?
                };
                return Ok(Self::Register {
                    client: info.client,
                    version: info.version,
                });
            }
            MessageKind::CaptureEvent => {
                return Ok(Self::CaptureEvent(payload(kind, env.payload)?));
            }
            MessageKind::PageContent => {
                let p: PageContentPayload = payload(kind, env.payload)?;
                return Ok(Self::PageContent {
                    key: env.correlation_key,
                    content: p.content,
                });
            }
            MessageKind::Command => {
                return Err(Error::Protocol("workers may not send commands".into()));
            }
            MessageKind::TextDelta => {
                RelayEvent::TextDelta(payload::<TextPayload>(kind, env.payload)?.text)
            }
            MessageKind::ImageUrlDelta => {
                RelayEvent::ImageUrlDelta(payload::<UrlPayload>(kind, env.payload)?.url)
            }
            MessageKind::AttachmentEcho => RelayEvent::AttachmentEcho(env.payload),
            MessageKind::Error => {
                RelayEvent::Error(payload::<ErrorPayload>(kind, env.payload)?.message)
            }
            MessageKind::Finish => {
                let p: FinishPayload = if env.payload.is_null() {
                    FinishPayload::default()
                } else {
                    payload(kind, env.payload)?
                };
                RelayEvent::Finish { reason: p.reason }
            }
        };

        let key = env
            .correlation_key
            .ok_or_else(|| Error::Protocol(format!("{:?} without correlation_key", kind)))?;
        Ok(Self::Event {
            key: CorrelationKey::from(key),
            event,
        })
    }
}
