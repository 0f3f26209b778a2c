//! OpenAI-compatible request/response handling on top of the relay.

pub mod assembler;
pub mod filebed;
pub mod pipeline;
pub mod translate;
pub mod types;

pub use assembler::{collect, stream_chunks, AssemblerState, Output, OutputStream, StreamAssembler};
pub use filebed::FileBedClient;
pub use pipeline::{ChatPipeline, Dispatched};
pub use translate::{TranslateOptions, Translator};
pub use types::*;
