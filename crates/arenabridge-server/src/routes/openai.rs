//! OpenAI-compatible routes under `/v1`.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use arenabridge_core::Error;
use arenabridge_openai::*;
use arenabridge_pool::ModelKind;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Serialize;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::error::ApiResult;
use crate::state::AppState;

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Upper bound on images produced by one generation request.
const MAX_IMAGES: u32 = 4;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", get(list_models))
        .route("/chat/completions", post(chat_completions))
        .route("/images/generations", post(generate_images))
}

// ---------------------------------------------------------------
// Models
// ---------------------------------------------------------------

async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    Json(ModelList::from_names(state.model_names()))
}

// ---------------------------------------------------------------
// Chat completions
// ---------------------------------------------------------------

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> ApiResult<Response> {
    let translator = state.translator();
    let entry = state.catalog_entry(&request.model);
    let dispatched = state.pipeline(&translator).chat(&request, entry).await?;

    if request.stream {
        let stream: SseStream = Box::pin(
            stream_chunks(dispatched.correlation, dispatched.assembler)
                .map(|output| Ok::<_, Infallible>(sse_event(output))),
        );
        return Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response());
    }

    let assembler = collect(dispatched.correlation, dispatched.assembler).await?;
    let completion = assembler.into_completion(dispatched.prompt_chars)?;
    Ok(Json(completion).into_response())
}

fn sse_event(output: Output) -> Event {
    match output {
        Output::Chunk(chunk) => json_event(&chunk),
        Output::Error(body) => json_event(&body),
        Output::Done => Event::default().data("[DONE]"),
    }
}

fn json_event<T: Serialize>(value: &T) -> Event {
    match serde_json::to_string(value) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            warn!("Failed to serialize SSE frame: {}", e);
            Event::default().comment("serialization failed")
        }
    }
}

// ---------------------------------------------------------------
// Image generation
// ---------------------------------------------------------------

async fn generate_images(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ImageGenerationRequest>,
) -> ApiResult<Json<ImageGenerationResponse>> {
    let model = match request.model.clone() {
        Some(model) => model,
        None => default_image_model(&state).ok_or_else(|| {
            Error::InvalidRequest("no image model configured; pass `model`".into())
        })?,
    };
    if let Some(size) = &request.size {
        debug!("Requested size {} is decided upstream", size);
    }

    let n = request.n.unwrap_or(1).clamp(1, MAX_IMAGES);
    let translator = state.translator();
    let entry = state.catalog_entry(&model);

    let mut data = Vec::new();
    for _ in 0..n {
        let dispatched = state
            .pipeline(&translator)
            .image(&model, &request, entry.clone())
            .await?;
        let assembler = collect(dispatched.correlation, dispatched.assembler).await?;
        data.extend(
            assembler
                .image_urls()
                .iter()
                .map(|url| ImageData { url: url.clone() }),
        );
    }

    if data.is_empty() {
        return Err(Error::Upstream("no image was returned".into()).into());
    }

    Ok(Json(ImageGenerationResponse {
        created: chrono::Utc::now().timestamp(),
        data,
    }))
}

fn default_image_model(state: &AppState) -> Option<String> {
    let catalog = state.catalog.read();
    let name = catalog
        .names()
        .find(|name| catalog.kind_of(name) == ModelKind::Image)
        .map(str::to_string);
    name
}
