//! Streaming response assembly: relay events of one correlation into
//! OpenAI chunks, or into a single completion.
//!
//! `StreamAssembler` is a pure state machine; `stream_chunks` and
//! `collect` drive it from a `Correlation`.

use std::pin::Pin;

use arenabridge_core::{Error, Result};
use arenabridge_relay::{Correlation, RelayEvent};
use futures::Stream;
use tracing::{debug, info, warn};

use crate::types::*;

/// Boxed stream of assembler output, for SSE handlers.
pub type OutputStream = Pin<Box<dyn Stream<Item = Output> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    AwaitingFirstEvent,
    Streaming,
    Finished,
    Failed,
    Cancelled,
}

impl AssemblerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

/// One frame for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Chunk(ChatCompletionChunk),
    Error(ErrorBody),
    /// The `[DONE]` marker.
    Done,
}

pub struct StreamAssembler {
    id: String,
    model: String,
    created: i64,
    state: AssemblerState,
    content: String,
    last_was_image: bool,
    image_urls: Vec<String>,
    finish_reason: Option<String>,
    failure: Option<Error>,
}

impl StreamAssembler {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            state: AssemblerState::AwaitingFirstEvent,
            content: String::new(),
            last_was_image: false,
            image_urls: Vec::new(),
            finish_reason: None,
            failure: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn image_urls(&self) -> &[String] {
        &self.image_urls
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    fn content_chunk(&mut self, text: String) -> Output {
        let role = match self.state {
            AssemblerState::AwaitingFirstEvent => Some("assistant".to_string()),
            _ => None,
        };
        self.state = AssemblerState::Streaming;
        self.content.push_str(&text);
        Output::Chunk(self.chunk(
            Delta {
                role,
                content: Some(text),
            },
            None,
        ))
    }

    /// Feed one relay event. Events after a terminal state are ignored.
    pub fn on_event(&mut self, event: RelayEvent) -> Vec<Output> {
        if self.state.is_terminal() {
            debug!("{} ignoring event after completion", self.id);
            return Vec::new();
        }

        match event {
            RelayEvent::TextDelta(text) => {
                self.last_was_image = false;
                if text.is_empty() {
                    return Vec::new();
                }
                vec![self.content_chunk(text)]
            }
            RelayEvent::ImageUrlDelta(url) => {
                let separator = if self.last_was_image { "\n\n" } else { "" };
                let markdown = format!("{}![Image]({})", separator, url);
                self.last_was_image = true;
                self.image_urls.push(url);
                vec![self.content_chunk(markdown)]
            }
            RelayEvent::AttachmentEcho(payload) => {
                info!("{} attachment echoed by upstream: {}", self.id, payload);
                Vec::new()
            }
            RelayEvent::Error(message) => self.on_failure(Error::Upstream(message)),
            RelayEvent::Finish { reason } => {
                let reason = reason.unwrap_or_else(|| "stop".to_string());
                self.finish_reason = Some(reason.clone());
                self.state = AssemblerState::Finished;
                vec![
                    Output::Chunk(self.chunk(Delta::default(), Some(reason))),
                    Output::Done,
                ]
            }
        }
    }

    /// Record a failure: an error frame followed by `[DONE]`.
    pub fn on_failure(&mut self, err: Error) -> Vec<Output> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        warn!("{} failed: {}", self.id, err);
        self.state = AssemblerState::Failed;
        let body = ErrorBody::from(&err);
        self.failure = Some(err);
        vec![Output::Error(body), Output::Done]
    }

    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.state = AssemblerState::Cancelled;
        }
    }

    /// Final non-streaming response.
    pub fn into_completion(self, prompt_chars: usize) -> Result<ChatCompletion> {
        if let Some(err) = self.failure {
            return Err(err);
        }
        if self.state != AssemblerState::Finished {
            return Err(Error::Cancelled);
        }
        let usage = Usage::estimate(prompt_chars, self.content.chars().count());
        Ok(ChatCompletion {
            id: self.id,
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model,
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: self.content,
                },
                finish_reason: self.finish_reason.unwrap_or_else(|| "stop".to_string()),
            }],
            usage,
        })
    }
}

/// Drive a correlation as a stream of caller frames. Dropping the stream
/// drops the correlation, which cancels it.
pub fn stream_chunks(mut correlation: Correlation, mut assembler: StreamAssembler) -> OutputStream {
    Box::pin(async_stream::stream! {
        while let Some(next) = correlation.next_event().await {
            let outputs = match next {
                Ok(event) => assembler.on_event(event),
                Err(e) => assembler.on_failure(e),
            };
            for output in outputs {
                yield output;
            }
            if assembler.state().is_terminal() {
                break;
            }
        }
        if !assembler.state().is_terminal() {
            for output in assembler.on_failure(Error::Cancelled) {
                yield output;
            }
        }
    })
}

/// Drive a correlation to completion and return the finished assembler.
pub async fn collect(mut correlation: Correlation, mut assembler: StreamAssembler) -> Result<StreamAssembler> {
    while let Some(next) = correlation.next_event().await {
        match next {
            Ok(event) => {
                assembler.on_event(event);
            }
            Err(e) => {
                assembler.on_failure(e);
            }
        }
        if assembler.state().is_terminal() {
            break;
        }
    }
    match assembler.state() {
        AssemblerState::Finished => Ok(assembler),
        AssemblerState::Failed => match assembler.failure.take() {
            Some(err) => Err(err),
            None => Err(Error::Internal("failure without cause".into())),
        },
        _ => Err(Error::Cancelled),
    }
}
