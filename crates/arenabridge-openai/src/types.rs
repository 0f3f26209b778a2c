//! OpenAI wire types for chat completions, models and image generation.

use arenabridge_core::Error;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------
// Requests
// ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    #[serde(other)]
    Unsupported,
}

/// Message content: plain text or a list of typed parts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Character count of the textual parts, for usage estimates.
    pub fn text_len(&self) -> usize {
        match self {
            Self::Text(s) => s.chars().count(),
            Self::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.chars().count(),
                    _ => 0,
                })
                .sum(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

impl ChatMessage {
    pub fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(content.into())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ChatCompletionRequest {
    pub fn prompt_chars(&self) -> usize {
        self.messages
            .iter()
            .filter_map(|m| m.content.as_ref())
            .map(MessageContent::text_len)
            .sum()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageGenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub size: Option<String>,
}

// ---------------------------------------------------------------
// Responses
// ---------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Rough estimate at four characters per token.
    pub fn estimate(prompt_chars: usize, completion_chars: usize) -> Self {
        let tokens = |chars: usize| chars.div_ceil(4) as u32;
        let prompt_tokens = tokens(prompt_chars);
        let completion_tokens = tokens(completion_chars);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelObject>,
}

impl ModelList {
    pub fn from_names<I: IntoIterator<Item = String>>(names: I) -> Self {
        let created = chrono::Utc::now().timestamp();
        Self {
            object: "list".to_string(),
            data: names
                .into_iter()
                .map(|id| ModelObject {
                    id,
                    object: "model".to_string(),
                    created,
                    owned_by: "lmarena".to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationResponse {
    pub created: i64,
    pub data: Vec<ImageData>,
}

// ---------------------------------------------------------------
// Errors
// ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: Option<String>,
}

/// `{"error": {"message", "type", "code"}}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>, kind: &str, code: Option<&str>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                kind: kind.to_string(),
                code: code.map(str::to_string),
            },
        }
    }
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        let (kind, code) = match err {
            Error::NoMapping(_) => ("invalid_request_error", "model_not_mapped"),
            Error::InvalidRequest(_) => ("invalid_request_error", "invalid_request"),
            Error::Unauthorized => ("authentication_error", "invalid_api_key"),
            Error::NoWorkerAvailable => ("service_unavailable", "no_worker_available"),
            Error::WorkerBusy => ("service_unavailable", "worker_busy"),
            Error::WorkerLost => ("upstream_error", "worker_lost"),
            Error::Upstream(_) => ("upstream_error", "upstream_error"),
            Error::Translation(_) => ("upstream_error", "translation_failed"),
            Error::Timeout(_) => ("timeout_error", "timeout"),
            Error::NotCaptured => ("timeout_error", "not_captured"),
            Error::CoordinatorBusy(_) => ("conflict_error", "coordinator_busy"),
            Error::MalformedContent(_) => ("server_error", "malformed_content"),
            Error::Cancelled => ("server_error", "cancelled"),
            _ => ("server_error", "internal_error"),
        };
        Self::new(err.to_string(), kind, Some(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_forms() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m",
            "stream": true,
            "messages": [
                {"role": "developer", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "look"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}},
                    {"type": "input_audio", "input_audio": {}}
                ]},
                {"role": "assistant", "content": null}
            ]
        }))
        .unwrap();
        assert!(req.stream);
        assert_eq!(req.messages[0].role, MessageRole::Developer);
        match req.messages[1].content.as_ref().unwrap() {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 3);
                assert!(matches!(parts[2], ContentPart::Unsupported));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(req.messages[2].content.is_none());
        assert_eq!(req.prompt_chars(), "be brief".len() + "look".len());
    }

    #[test]
    fn test_error_body_shape() {
        let body = ErrorBody::from(&Error::NoWorkerAvailable);
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["error"]["type"], "service_unavailable");
        assert_eq!(v["error"]["code"], "no_worker_available");
        assert!(v["error"]["message"].as_str().unwrap().len() > 0);
    }

    #[test]
    fn test_usage_estimate() {
        let usage = Usage::estimate(9, 4);
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.completion_tokens, 1);
        assert_eq!(usage.total_tokens, 4);
    }
}
