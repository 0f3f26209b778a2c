//! Shared application state.

use std::collections::BTreeSet;
use std::sync::Arc;

use arenabridge_core::{write_atomic, BridgeConfig, DataPaths, Error, Result};
use arenabridge_openai::{ChatPipeline, Translator};
use arenabridge_pool::{ModelCatalog, ModelEntry, SessionPool};
use arenabridge_relay::{AvailableModel, RelayOptions, RelayRegistry};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

/// What `/internal/reload` picked up.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadSummary {
    #[serde(rename = "catalogModels")]
    pub catalog_models: usize,
    #[serde(rename = "poolModels")]
    pub pool_models: usize,
    #[serde(rename = "fallbackEnabled")]
    pub fallback_enabled: bool,
}

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub paths: DataPaths,
    pub config: RwLock<BridgeConfig>,
    pub pool: Arc<SessionPool>,
    pub catalog: RwLock<ModelCatalog>,
    pub registry: Arc<RelayRegistry>,
    translator: RwLock<Arc<Translator>>,
    pub available_models: RwLock<Vec<AvailableModel>>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(paths: DataPaths) -> Result<Self> {
        let config = BridgeConfig::load(&paths.config_file);
        Self::with_config(paths, config)
    }

    /// Build state around an already loaded config (tests override fields).
    pub fn with_config(paths: DataPaths, config: BridgeConfig) -> Result<Self> {
        let pool = Arc::new(SessionPool::load(
            &paths.id_pool_file,
            config.use_default_ids_if_mapping_not_found,
        )?);
        let catalog = ModelCatalog::load(&paths.models_file);
        let registry = Arc::new(RelayRegistry::new(pool.clone(), RelayOptions::from(&config)));
        let translator = Translator::from_config(&config)?;
        let available_models = load_available_models(&paths);

        Ok(Self {
            paths,
            config: RwLock::new(config),
            pool,
            catalog: RwLock::new(catalog),
            registry,
            translator: RwLock::new(Arc::new(translator)),
            available_models: RwLock::new(available_models),
            started_at: chrono::Utc::now(),
        })
    }

    pub fn translator(&self) -> Arc<Translator> {
        self.translator.read().clone()
    }

    /// Pipeline over the current translator; `translator` must outlive it.
    pub fn pipeline<'a>(&'a self, translator: &'a Translator) -> ChatPipeline<'a> {
        ChatPipeline {
            registry: &self.registry,
            pool: &self.pool,
            translator,
        }
    }

    pub fn catalog_entry(&self, model: &str) -> Option<ModelEntry> {
        self.catalog.read().get(model).cloned()
    }

    /// Union of catalog and pool model names, sorted.
    pub fn model_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.catalog.read().names().map(str::to_string).collect();
        names.extend(self.pool.model_names());
        names.into_iter().collect()
    }

    /// Re-read config.json, models.json and id_pool.json.
    pub fn reload(&self) -> Result<ReloadSummary> {
        let mut config = BridgeConfig::load(&self.paths.config_file);
        // The listening port cannot change while running.
        config.port = self.config.read().port;

        let translator = Translator::from_config(&config)?;
        self.pool.reload()?;
        self.pool
            .set_fallback_enabled(config.use_default_ids_if_mapping_not_found);
        self.registry.set_options(RelayOptions::from(&config));
        *self.translator.write() = Arc::new(translator);

        let catalog = ModelCatalog::load(&self.paths.models_file);
        let summary = ReloadSummary {
            catalog_models: catalog.len(),
            pool_models: self.pool.model_names().len(),
            fallback_enabled: config.use_default_ids_if_mapping_not_found,
        };
        *self.catalog.write() = catalog;
        *self.config.write() = config;

        info!(
            "Reloaded configuration: {} catalog models, {} pool models",
            summary.catalog_models, summary.pool_models
        );
        Ok(summary)
    }

    pub fn save_available_models(&self, models: Vec<AvailableModel>) -> Result<()> {
        let json = serde_json::to_string_pretty(&models)?;
        write_atomic(&self.paths.available_models_file, &json)?;
        info!("Saved {} available models", models.len());
        *self.available_models.write() = models;
        Ok(())
    }
}

fn load_available_models(paths: &DataPaths) -> Vec<AvailableModel> {
    match std::fs::read_to_string(&paths.available_models_file) {
        Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
            warn!("Ignoring unreadable available_models.json: {}", Error::from(e));
            Vec::new()
        }),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_names_union() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("models.json"), r#"{"b-model": "id-b", "a-model": "id-a"}"#).unwrap();
        std::fs::write(
            dir.path().join("id_pool.json"),
            r#"{"models": {"c-model": {"session_id": "s", "message_id": "m"}, "a-model": []}}"#,
        )
        .unwrap();
        let state = AppState::new(DataPaths::new(dir.path()).unwrap()).unwrap();
        assert_eq!(state.model_names(), vec!["a-model", "b-model", "c-model"]);
    }

    #[test]
    fn test_reload_picks_up_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(DataPaths::new(dir.path()).unwrap()).unwrap();
        assert!(state.model_names().is_empty());

        std::fs::write(dir.path().join("models.json"), r#"{"opus": "id-opus"}"#).unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"use_default_ids_if_mapping_not_found": false, "tavern_mode_enabled": true}"#,
        )
        .unwrap();
        let summary = state.reload().unwrap();
        assert_eq!(summary.catalog_models, 1);
        assert!(!summary.fallback_enabled);
        assert!(!state.pool.fallback_enabled());
        assert!(state.translator().options().tavern_mode);
        assert_eq!(state.catalog_entry("opus").unwrap().id, "id-opus");
    }

    #[test]
    fn test_available_models_persist() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path()).unwrap();
        let state = AppState::new(paths.clone()).unwrap();
        state
            .save_available_models(vec![AvailableModel {
                name: "gpt-x".into(),
                id: "1".into(),
                organization: None,
            }])
            .unwrap();

        let reopened = AppState::new(paths.clone()).unwrap();
        assert_eq!(reopened.available_models.read().len(), 1);

        let mut tmp = paths.available_models_file.as_os_str().to_owned();
        tmp.push(".tmp");
        assert!(!std::path::Path::new(&tmp).exists());
    }
}
