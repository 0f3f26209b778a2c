//! Request translation: OpenAI messages + a resolved ID tuple into the
//! chat command a browser worker runs.

use arenabridge_core::{BridgeConfig, Error, Result};
use arenabridge_pool::{Mode, ModelEntry, ModelKind, Resolved};
use arenabridge_relay::{Attachment, ChatCommand, Role, Turn};
use tracing::{debug, warn};

use crate::filebed::FileBedClient;
use crate::types::{ChatMessage, ContentPart, MessageContent, MessageRole};

/// Content of the empty user turn appended in bypass mode.
const BYPASS_TURN: &str = " ";
/// Assistant turn inserted ahead of the bypass turn when the request
/// carries an attachment.
const ATTACHMENT_ACK: &str = "Attachment received.";

#[derive(Debug, Clone)]
pub struct TranslateOptions {
    pub tavern_mode: bool,
    pub bypass_enabled: bool,
    pub bypass_marker: String,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            tavern_mode: false,
            bypass_enabled: false,
            bypass_marker: "[bypass]".to_string(),
        }
    }
}

impl From<&BridgeConfig> for TranslateOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            tavern_mode: config.tavern_mode_enabled,
            bypass_enabled: config.bypass_enabled,
            bypass_marker: config.bypass_marker.clone(),
        }
    }
}

pub struct Translator {
    options: TranslateOptions,
    file_bed: Option<FileBedClient>,
}

impl Translator {
    pub fn new(options: TranslateOptions, file_bed: Option<FileBedClient>) -> Self {
        Self { options, file_bed }
    }

    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        Ok(Self::new(
            TranslateOptions::from(config),
            FileBedClient::from_config(&config.file_bed)?,
        ))
    }

    pub fn options(&self) -> &TranslateOptions {
        &self.options
    }

    /// Build the command for a chat request. Uploads (when the file bed is
    /// on) happen here, so an upload failure never reaches the relay.
    pub async fn translate(
        &self,
        messages: &[ChatMessage],
        resolved: &Resolved,
        entry: Option<&ModelEntry>,
    ) -> Result<ChatCommand> {
        if messages.is_empty() {
            return Err(Error::InvalidRequest("messages must not be empty".into()));
        }

        // The message that ends up last once system turns are merged.
        let trailing = if self.options.tavern_mode {
            messages.iter().rposition(|m| turn_role(m.role) != Role::System)
        } else {
            Some(messages.len() - 1)
        };

        let mut turns = Vec::with_capacity(messages.len() + 2);
        let mut image_count = 0usize;
        let mut bypass = false;
        for (idx, message) in messages.iter().enumerate() {
            let marker = (self.options.bypass_enabled && trailing == Some(idx))
                .then_some(self.options.bypass_marker.as_str());
            let (turn, stripped) = self.flatten(message, &mut image_count, marker).await?;
            bypass |= stripped;
            turns.push(turn);
        }

        if self.options.tavern_mode {
            turns = merge_system_turns(turns);
        }

        if bypass {
            debug!("Bypass requested, appending empty user turn");
            if image_count > 0 {
                turns.push(Turn {
                    role: Role::Assistant,
                    content: ATTACHMENT_ACK.to_string(),
                    attachments: Vec::new(),
                    participant_position: String::new(),
                });
            }
            turns.push(Turn {
                role: Role::User,
                content: BYPASS_TURN.to_string(),
                attachments: Vec::new(),
                participant_position: String::new(),
            });
        }

        assign_positions(&mut turns, resolved);
        Ok(command(turns, resolved, entry, None))
    }

    /// Command for a bare image-generation prompt.
    pub fn translate_image_prompt(
        &self,
        prompt: &str,
        resolved: &Resolved,
        entry: Option<&ModelEntry>,
    ) -> Result<ChatCommand> {
        if prompt.trim().is_empty() {
            return Err(Error::InvalidRequest("prompt must not be empty".into()));
        }
        let mut turns = vec![Turn {
            role: Role::User,
            content: prompt.to_string(),
            attachments: Vec::new(),
            participant_position: String::new(),
        }];
        assign_positions(&mut turns, resolved);
        Ok(command(turns, resolved, entry, Some(ModelKind::Image)))
    }

    /// Flatten one message into a turn. With `marker` set, a trailing
    /// bypass marker on a user message's last text part is stripped before
    /// any URL is joined in; the flag reports whether that happened.
    async fn flatten(
        &self,
        message: &ChatMessage,
        image_count: &mut usize,
        marker: Option<&str>,
    ) -> Result<(Turn, bool)> {
        let role = turn_role(message.role);

        let mut pieces: Vec<Piece> = Vec::new();
        let mut attachments = Vec::new();

        match &message.content {
            None => {}
            Some(MessageContent::Text(text)) => pieces.push(Piece::Text(text.clone())),
            Some(MessageContent::Parts(parts)) => {
                for part in parts {
                    match part {
                        ContentPart::Text { text } => pieces.push(Piece::Text(text.clone())),
                        ContentPart::ImageUrl { image_url } => {
                            let url = image_url.url.as_str();
                            if let Some(data) = DataUri::parse(url) {
                                *image_count += 1;
                                let name = format!("image_{}.{}", image_count, data.extension());
                                match &self.file_bed {
                                    Some(bed) => pieces.push(Piece::Link(bed.upload(&name, url).await?)),
                                    None => attachments.push(Attachment {
                                        name,
                                        content_type: data.mime.to_string(),
                                        url: url.to_string(),
                                    }),
                                }
                            } else if url.starts_with("http://") || url.starts_with("https://") {
                                pieces.push(Piece::Link(url.to_string()));
                            } else {
                                warn!("Ignoring image part with unsupported URL scheme");
                            }
                        }
                        ContentPart::Unsupported => {
                            debug!("Skipping unsupported content part");
                        }
                    }
                }
            }
        }

        let stripped = match marker {
            Some(marker) if role == Role::User => strip_bypass_marker(&mut pieces, marker),
            _ => false,
        };

        let content = pieces
            .iter()
            .map(Piece::as_str)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok((
            Turn {
                role,
                content,
                attachments,
                participant_position: String::new(),
            },
            stripped,
        ))
    }
}

/// Flattened message content, text kept apart from URLs joined in after it.
enum Piece {
    Text(String),
    Link(String),
}

impl Piece {
    fn as_str(&self) -> &str {
        match self {
            Self::Text(s) | Self::Link(s) => s,
        }
    }
}

fn turn_role(role: MessageRole) -> Role {
    match role {
        MessageRole::System | MessageRole::Developer => Role::System,
        MessageRole::Assistant => Role::Assistant,
        MessageRole::User | MessageRole::Tool => Role::User,
    }
}

fn command(
    turns: Vec<Turn>,
    resolved: &Resolved,
    entry: Option<&ModelEntry>,
    kind: Option<ModelKind>,
) -> ChatCommand {
    ChatCommand {
        turns,
        session_id: resolved.tuple.session_id.clone(),
        message_id: resolved.tuple.anchor_id.clone(),
        target_model_id: entry.map(|e| e.id.clone()),
        mode: resolved.mode,
        kind: kind.unwrap_or_else(|| entry.map(|e| e.kind).unwrap_or_default()),
    }
}

/// All system turns become one, placed first.
fn merge_system_turns(turns: Vec<Turn>) -> Vec<Turn> {
    let (system, rest): (Vec<Turn>, Vec<Turn>) = turns.into_iter().partition(|t| t.role == Role::System);
    if system.is_empty() {
        return rest;
    }

    let merged = Turn {
        role: Role::System,
        content: system
            .iter()
            .map(|t| t.content.as_str())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        attachments: system.into_iter().flat_map(|t| t.attachments).collect(),
        participant_position: String::new(),
    };

    let mut out = Vec::with_capacity(rest.len() + 1);
    out.push(merged);
    out.extend(rest);
    out
}

/// Remove a trailing bypass marker from the last text piece. Returns whether
/// one was found.
fn strip_bypass_marker(pieces: &mut [Piece], marker: &str) -> bool {
    if marker.is_empty() {
        return false;
    }
    let Some(text) = pieces.iter_mut().rev().find_map(|p| match p {
        Piece::Text(text) => Some(text),
        Piece::Link(_) => None,
    }) else {
        return false;
    };
    match text.trim_end().strip_suffix(marker) {
        Some(rest) => {
            *text = rest.trim_end().to_string();
            true
        }
        None => false,
    }
}

fn assign_positions(turns: &mut [Turn], resolved: &Resolved) {
    for turn in turns {
        let position = match resolved.mode {
            Mode::Battle => resolved.battle_target.position(),
            Mode::DirectChat if turn.role == Role::System => "b",
            Mode::DirectChat => "a",
        };
        turn.participant_position = position.to_string();
    }
}

/// Header of a `data:<mime>;base64,...` URI.
struct DataUri<'a> {
    mime: &'a str,
}

impl<'a> DataUri<'a> {
    fn parse(url: &'a str) -> Option<Self> {
        let rest = url.strip_prefix("data:")?;
        let (header, _) = rest.split_once(',')?;
        let mime = header.split(';').next().filter(|m| !m.is_empty())?;
        Some(Self { mime })
    }

    fn extension(&self) -> &'a str {
        match self.mime {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/svg+xml" => "svg",
            other => other
                .split_once('/')
                .map(|(_, sub)| sub)
                .filter(|s| !s.is_empty())
                .unwrap_or("bin"),
        }
    }
}
