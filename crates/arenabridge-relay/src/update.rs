//! Model-list update: one bulk page-content reply from a worker, parsed
//! into the upstream's list of available models.

use arenabridge_core::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{info, warn};

struct PendingUpdate {
    key: String,
    reply: oneshot::Sender<String>,
}

/// At most one page-content request in flight.
#[derive(Default)]
pub struct UpdateCoordinator {
    pending: Mutex<Option<PendingUpdate>>,
}

impl UpdateCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin(&self, key: &str) -> Result<oneshot::Receiver<String>> {
        let mut pending = self.pending.lock();
        if let Some(current) = pending.as_ref() {
            if !current.reply.is_closed() {
                return Err(Error::CoordinatorBusy("Model update"));
            }
        }
        let (reply, rx) = oneshot::channel();
        *pending = Some(PendingUpdate {
            key: key.to_string(),
            reply,
        });
        Ok(rx)
    }

    pub(crate) fn abandon(&self, key: &str) {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|p| p.key == key) {
            *pending = None;
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Handle a worker's page-content reply. A reply without a key is
    /// accepted for whatever request is pending.
    pub fn on_page_content(&self, key: Option<&str>, content: String) {
        let mut pending = self.pending.lock();
        let matches = match (pending.as_ref(), key) {
            (Some(p), Some(k)) => p.key == k,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            warn!("Unsolicited page content ({} bytes) dropped", content.len());
            return;
        }
        if let Some(p) = pending.take() {
            info!("Received page content ({} bytes)", content.len());
            let _ = p.reply.send(content);
        }
    }
}

/// One model offered by the upstream site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableModel {
    #[serde(rename = "publicName")]
    pub name: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

#[derive(Deserialize)]
struct RawModel {
    #[serde(rename = "publicName")]
    public_name: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    organization: Option<String>,
}

static MODEL_ARRAY_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""initial(?:State|Models)"\s*:\s*\["#).expect("static regex")
});

/// Extract the model list from page content: either a bare JSON array or
/// an HTML page embedding an `initialModels`/`initialState` array, possibly
/// inside an escaped string.
pub fn parse_model_list(content: &str) -> Result<Vec<AvailableModel>> {
    let trimmed = content.trim();
    if trimmed.starts_with('[') {
        if let Ok(models) = models_from_json(trimmed) {
            return Ok(models);
        }
    }

    let unescaped;
    let haystack = if MODEL_ARRAY_KEY.is_match(content) {
        content
    } else {
        unescaped = content.replace("\\\"", "\"").replace("\\\\", "\\");
        unescaped.as_str()
    };

    for found in MODEL_ARRAY_KEY.find_iter(haystack) {
        // The match ends right after the opening bracket.
        let start = found.end() - 1;
        let Some(array) = balanced_array(&haystack[start..]) else {
            continue;
        };
        match models_from_json(array) {
            Ok(models) if !models.is_empty() => return Ok(models),
            Ok(_) => {}
            Err(e) => warn!("Skipping unparseable model array: {}", e),
        }
    }

    Err(Error::MalformedContent(
        "no model list found in page content".to_string(),
    ))
}

fn models_from_json(array: &str) -> Result<Vec<AvailableModel>> {
    let raw: Vec<serde_json::Value> = serde_json::from_str(array)
        .map_err(|e| Error::MalformedContent(format!("model array: {}", e)))?;
    Ok(raw
        .into_iter()
        .filter_map(|v| serde_json::from_value::<RawModel>(v).ok())
        .filter_map(|m| {
            Some(AvailableModel {
                name: m.public_name?,
                id: m.id.unwrap_or_default(),
                organization: m.organization,
            })
        })
        .collect())
}

/// Slice of `s` (which starts with `[`) up to its matching `]`, skipping
/// brackets inside JSON strings.
fn balanced_array(s: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_array() {
        let models = parse_model_list(
            r#"[{"publicName": "claude-opus", "id": "id-1", "organization": "anthropic"},
                {"id": "no-name"}]"#,
        )
        .unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "claude-opus");
        assert_eq!(models[0].organization.as_deref(), Some("anthropic"));
    }

    #[test]
    fn test_embedded_escaped_array() {
        let page = r#"<html><script>self.__next_f.push([1,"{\"initialModels\":[{\"publicName\":\"gpt-x [beta]\",\"id\":\"id-9\"}],\"other\":1}"])</script></html>"#;
        let models = parse_model_list(page).unwrap();
        assert_eq!(
            models,
            vec![AvailableModel {
                name: "gpt-x [beta]".into(),
                id: "id-9".into(),
                organization: None,
            }]
        );
    }

    #[test]
    fn test_plain_embedded_array() {
        let page = r#"window.x = {"initialState": [{"publicName": "a", "id": "1"}, {"publicName": "b", "id": "2"}]};"#;
        let names: Vec<String> = parse_model_list(page)
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_no_list_is_malformed() {
        assert!(matches!(
            parse_model_list("<html>nothing here</html>"),
            Err(Error::MalformedContent(_))
        ));
        assert!(matches!(
            parse_model_list(r#"{"initialModels": [{"id": "x"}"#),
            Err(Error::MalformedContent(_))
        ));
    }

    #[test]
    fn test_balanced_array_ignores_string_brackets() {
        assert_eq!(balanced_array(r#"["]", [1]] tail"#), Some(r#"["]", [1]]"#));
        assert_eq!(balanced_array("[[1]"), None);
    }

    #[tokio::test]
    async fn test_page_content_routing() {
        let coord = UpdateCoordinator::new();
        let rx = coord.begin("k1").unwrap();
        assert!(matches!(coord.begin("k2"), Err(Error::CoordinatorBusy(_))));

        coord.on_page_content(Some("other"), "ignored".into());
        assert!(coord.is_pending());
        coord.on_page_content(Some("k1"), "<html>".into());
        assert_eq!(rx.await.unwrap(), "<html>");
        assert!(!coord.is_pending());
    }

    #[test]
    fn test_abandon_frees_slot() {
        let coord = UpdateCoordinator::new();
        let _rx = coord.begin("k1").unwrap();
        coord.abandon("k1");
        assert!(coord.begin("k2").is_ok());
    }
}
