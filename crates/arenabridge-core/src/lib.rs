//! arenabridge core — error taxonomy, data directory layout and bridge settings.

pub mod config;
pub mod error;

pub use config::{write_atomic, BridgeConfig, BusyPolicy, DataPaths, FileBedConfig};
pub use error::{Error, Result, TimeoutPhase};
