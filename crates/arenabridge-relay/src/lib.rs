//! Relay — the bridge between stateless HTTP requests and connected browser workers.
//!
//! A browser tab running the companion script holds one WebSocket to the
//! server. Each tab is a worker that runs one upstream request at a time;
//! the registry hands requests to idle workers and routes the worker's
//! events back to the request that caused them.

pub mod capture;
pub mod protocol;
pub mod registry;
pub mod update;

pub use capture::{CaptureCoordinator, CaptureRequest, CaptureTicket};
pub use protocol::*;
pub use registry::{Correlation, DispatchTarget, RelayOptions, RelayRegistry, RegistryStatus, WorkerStatus};
pub use update::{parse_model_list, AvailableModel, UpdateCoordinator};
