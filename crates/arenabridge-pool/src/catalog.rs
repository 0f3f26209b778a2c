//! Model catalog — logical model name to upstream model id (models.json).

use std::collections::BTreeMap;
use std::path::Path;

use arenabridge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Suffix on a catalog id that marks an image-generation model.
const IMAGE_SUFFIX: &str = ":image";

/// What a model produces; decides command shape and event interpretation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Text,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelEntry {
    /// Upstream model identifier, suffix stripped.
    pub id: String,
    pub kind: ModelKind,
}

impl ModelEntry {
    /// Parse a raw catalog value such as `"abc-123"` or `"abc-123:image"`.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_suffix(IMAGE_SUFFIX) {
            Some(id) => Self {
                id: id.to_string(),
                kind: ModelKind::Image,
            },
            None => Self {
                id: raw.to_string(),
                kind: ModelKind::Text,
            },
        }
    }
}

/// Static name → id table, reloadable as a whole.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    entries: BTreeMap<String, ModelEntry>,
}

impl ModelCatalog {
    /// Load the catalog. A missing file is an empty catalog.
    pub fn load(path: &Path) -> Self {
        match Self::parse_file(path) {
            Ok(catalog) => {
                info!("ModelCatalog: {} models loaded", catalog.len());
                catalog
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("Failed to load model catalog: {}", e);
                Self::default()
            }
        }
    }

    /// Strict parse, surfaced by `arenabridge validate`.
    pub fn parse_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let raw: BTreeMap<String, String> = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_raw(raw))
    }

    pub fn from_raw(raw: BTreeMap<String, String>) -> Self {
        Self {
            entries: raw
                .into_iter()
                .map(|(name, id)| (name, ModelEntry::parse(&id)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.get(name)
    }

    /// Kind of a model; unknown models are text models.
    pub fn kind_of(&self, name: &str) -> ModelKind {
        self.get(name).map(|e| e.kind).unwrap_or_default()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_suffix() {
        let e = ModelEntry::parse("0199-dall-e:image");
        assert_eq!(e.id, "0199-dall-e");
        assert_eq!(e.kind, ModelKind::Image);

        let t = ModelEntry::parse("0199-claude");
        assert_eq!(t.kind, ModelKind::Text);
        assert_eq!(t.id, "0199-claude");
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        std::fs::write(
            &path,
            r#"{"claude-opus": "id-opus", "flux": "id-flux:image"}"#,
        )
        .unwrap();

        let catalog = ModelCatalog::load(&path);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.kind_of("flux"), ModelKind::Image);
        assert_eq!(catalog.kind_of("claude-opus"), ModelKind::Text);
        assert_eq!(catalog.kind_of("missing"), ModelKind::Text);
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["claude-opus", "flux"]);
    }

    #[test]
    fn test_missing_or_bad_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModelCatalog::load(&dir.path().join("models.json")).is_empty());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "[1, 2]").unwrap();
        assert!(ModelCatalog::load(&bad).is_empty());
        assert!(ModelCatalog::parse_file(&bad).is_err());
    }
}
