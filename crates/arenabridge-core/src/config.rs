//! Configuration and data directory management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Paths to every file arenabridge persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// Bridge settings (`data/config.json`).
    pub config_file: PathBuf,
    /// Logical model name to upstream id table (`data/models.json`).
    pub models_file: PathBuf,
    /// Session/ID pool (`data/id_pool.json`).
    pub id_pool_file: PathBuf,
    /// Last model list pulled from the browser (`data/available_models.json`).
    pub available_models_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            config_file: root.join("config.json"),
            models_file: root.join("models.json"),
            id_pool_file: root.join("id_pool.json"),
            available_models_file: root.join("available_models.json"),
            root,
        })
    }
}

/// What `dispatch` does when workers are connected but all of them are busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Park the request until a worker frees up or the wait budget runs out.
    Wait,
    /// Reject immediately with `WorkerBusy`.
    FailFast,
}

/// External file-hosting helper used instead of inlining attachments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileBedConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl FileBedConfig {
    /// Upload URL, only when the collaborator is switched on and configured.
    pub fn active_upload_url(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.upload_url.as_deref().filter(|u| !u.trim().is_empty())
    }
}

/// Stored bridge settings (persisted to config.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub tavern_mode_enabled: bool,
    #[serde(default)]
    pub bypass_enabled: bool,
    #[serde(default = "default_bypass_marker")]
    pub bypass_marker: String,
    #[serde(default = "default_true")]
    pub use_default_ids_if_mapping_not_found: bool,
    #[serde(default)]
    pub file_bed: FileBedConfig,
    #[serde(default = "default_first_event_timeout")]
    pub first_event_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_busy_policy")]
    pub busy_policy: BusyPolicy,
    #[serde(default = "default_busy_wait")]
    pub busy_wait_secs: u64,
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_secs: u64,
    #[serde(default = "default_page_content_timeout")]
    pub page_content_timeout_secs: u64,
    /// Path to config file for saving.
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_port() -> u16 {
    5102
}
fn default_bypass_marker() -> String {
    "[bypass]".into()
}
fn default_true() -> bool {
    true
}
fn default_first_event_timeout() -> u64 {
    360
}
fn default_idle_timeout() -> u64 {
    120
}
fn default_busy_policy() -> BusyPolicy {
    BusyPolicy::Wait
}
fn default_busy_wait() -> u64 {
    60
}
fn default_capture_timeout() -> u64 {
    120
}
fn default_page_content_timeout() -> u64 {
    30
}

/// Write `contents` to a sibling temp file, then rename it over `path`, so
/// readers never see a half-written file.
pub fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
            tavern_mode_enabled: false,
            bypass_enabled: false,
            bypass_marker: default_bypass_marker(),
            use_default_ids_if_mapping_not_found: true,
            file_bed: FileBedConfig::default(),
            first_event_timeout_secs: default_first_event_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            busy_policy: BusyPolicy::Wait,
            busy_wait_secs: default_busy_wait(),
            capture_timeout_secs: default_capture_timeout(),
            page_content_timeout_secs: default_page_content_timeout(),
            config_path: PathBuf::new(),
        }
    }
}

impl BridgeConfig {
    /// Load config from file, falling back to env vars and defaults.
    pub fn load(config_path: &Path) -> Self {
        let mut config: BridgeConfig = match std::fs::read_to_string(config_path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                warn!("Ignoring unreadable {}: {}", config_path.display(), e);
                BridgeConfig::default()
            }),
            Err(_) => BridgeConfig::default(),
        };

        config.config_path = config_path.to_path_buf();

        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        if config.api_key.is_none() {
            config.api_key = std::env::var("ARENABRIDGE_API_KEY").ok();
        }
        // An empty key in the file means "no auth".
        if config.api_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            config.api_key = None;
        }

        config
    }

    /// Strict variant of [`BridgeConfig::load`] used by `arenabridge validate`.
    pub fn parse_file(config_path: &Path) -> crate::Result<Option<Self>> {
        match std::fs::read_to_string(config_path) {
            Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Save config to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        write_atomic(&self.config_path, &json)?;
        info!("Saved bridge config to {}", self.config_path.display());
        Ok(())
    }

    pub fn first_event_timeout(&self) -> Duration {
        Duration::from_secs(self.first_event_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn busy_wait(&self) -> Duration {
        Duration::from_secs(self.busy_wait_secs)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn page_content_timeout(&self) -> Duration {
        Duration::from_secs(self.page_content_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load(&dir.path().join("config.json"));
        assert_eq!(config.busy_policy, BusyPolicy::Wait);
        assert!(config.use_default_ids_if_mapping_not_found);
        assert_eq!(config.bypass_marker, "[bypass]");
        assert_eq!(config.first_event_timeout(), Duration::from_secs(360));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"tavern_mode_enabled": true, "busy_policy": "fail_fast", "api_key": ""}"#,
        )
        .unwrap();

        let config = BridgeConfig::load(&path);
        assert!(config.tavern_mode_enabled);
        assert_eq!(config.busy_policy, BusyPolicy::FailFast);
        assert_eq!(config.idle_timeout_secs, 120);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = BridgeConfig::load(&path);
        config.bypass_enabled = true;
        config.save().unwrap();

        let parsed = BridgeConfig::parse_file(&path).unwrap().unwrap();
        assert!(parsed.bypass_enabled);
    }

    #[test]
    fn test_write_atomic_replaces_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("state.json");
        write_atomic(&path, "[1]").unwrap();
        write_atomic(&path, "[1, 2]").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[1, 2]");
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("state.json")]);
    }

    #[test]
    fn test_file_bed_requires_enabled_and_url() {
        let mut bed = FileBedConfig::default();
        assert!(bed.active_upload_url().is_none());
        bed.upload_url = Some("http://127.0.0.1:5180/upload".into());
        assert!(bed.active_upload_url().is_none());
        bed.enabled = true;
        assert_eq!(bed.active_upload_url(), Some("http://127.0.0.1:5180/upload"));
    }

    #[test]
    fn test_data_paths_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path().join("data")).unwrap();
        assert!(paths.root.exists());
        assert!(paths.id_pool_file.ends_with("id_pool.json"));
        assert!(paths.models_file.ends_with("models.json"));
    }
}
