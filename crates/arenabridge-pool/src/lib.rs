//! Session/ID pool — per-model session identifier tuples and the model catalog.
//!
//! The pool answers "which upstream conversation does this request go to";
//! the catalog answers "which upstream model id, and is it an image model".

pub mod catalog;
pub mod pool;
pub mod types;

pub use catalog::{ModelCatalog, ModelEntry, ModelKind};
pub use pool::{parse_pool_file, SessionPool};
pub use types::*;
