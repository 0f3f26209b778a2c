//! arenabridge HTTP and relay server.

use std::path::PathBuf;

pub mod error;
pub mod routes;
pub mod state;
pub mod validate;

pub use routes::build_router;
pub use state::AppState;

/// `ARENABRIDGE_DATA_DIR`, else `../data` next to the executable, else `./data`.
pub fn resolve_data_dir() -> PathBuf {
    std::env::var("ARENABRIDGE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()));
            if let Some(dir) = exe_dir {
                let parent_data = dir.join("../data");
                if parent_data.exists() {
                    return parent_data;
                }
            }
            PathBuf::from("data")
        })
}
