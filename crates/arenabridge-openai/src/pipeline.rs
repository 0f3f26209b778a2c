//! Resolve → translate → dispatch for one OpenAI request.

use std::sync::Arc;

use arenabridge_core::Result;
use arenabridge_pool::{ModelEntry, SessionPool};
use arenabridge_relay::{Correlation, DispatchTarget, RelayRegistry};
use tracing::{debug, info};

use crate::assembler::StreamAssembler;
use crate::translate::Translator;
use crate::types::{ChatCompletionRequest, ImageGenerationRequest};

/// A dispatched request, ready to be streamed or collected.
pub struct Dispatched {
    pub correlation: Correlation,
    pub assembler: StreamAssembler,
    pub prompt_chars: usize,
}

pub struct ChatPipeline<'a> {
    pub registry: &'a Arc<RelayRegistry>,
    pub pool: &'a SessionPool,
    pub translator: &'a Translator,
}

impl ChatPipeline<'_> {
    /// `entry` is the model's catalog entry, looked up by the caller.
    pub async fn chat(&self, request: &ChatCompletionRequest, entry: Option<ModelEntry>) -> Result<Dispatched> {
        let resolved = self.pool.resolve(&request.model)?;
        if request.temperature.is_some() || request.max_tokens.is_some() {
            debug!(
                "Sampling options (temperature {:?}, max_tokens {:?}) are decided upstream",
                request.temperature, request.max_tokens
            );
        }
        let command = self
            .translator
            .translate(&request.messages, &resolved, entry.as_ref())
            .await?;

        let correlation = self
            .registry
            .dispatch(DispatchTarget::AnyAvailable, command)
            .await?;
        info!(
            "Chat for '{}' ({}, {} messages) dispatched as {}",
            request.model,
            resolved.mode,
            request.messages.len(),
            correlation.key()
        );

        Ok(Dispatched {
            correlation,
            assembler: StreamAssembler::new(request.model.clone()),
            prompt_chars: request.prompt_chars(),
        })
    }

    pub async fn image(
        &self,
        model: &str,
        request: &ImageGenerationRequest,
        entry: Option<ModelEntry>,
    ) -> Result<Dispatched> {
        let resolved = self.pool.resolve(model)?;
        let command = self
            .translator
            .translate_image_prompt(&request.prompt, &resolved, entry.as_ref())?;
        let correlation = self
            .registry
            .dispatch(DispatchTarget::AnyAvailable, command)
            .await?;
        info!("Image generation for '{}' dispatched as {}", model, correlation.key());

        Ok(Dispatched {
            correlation,
            assembler: StreamAssembler::new(model.to_string()),
            prompt_chars: request.prompt.chars().count(),
        })
    }
}
