//! ID tuple types and the on-disk pool file shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Interaction mode on the upstream site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    DirectChat,
    Battle,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DirectChat => write!(f, "direct_chat"),
            Self::Battle => write!(f, "battle"),
        }
    }
}

/// Which side of a battle a request speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BattleTarget {
    #[serde(alias = "a")]
    A,
    #[serde(alias = "b")]
    B,
}

impl BattleTarget {
    /// Lowercase participant position used on the relay wire.
    pub fn position(&self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }
}

/// One upstream conversation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTuple {
    pub session_id: String,
    /// Message the next turn is anchored to.
    #[serde(rename = "message_id")]
    pub anchor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battle_target: Option<BattleTarget>,
}

impl IdTuple {
    pub fn new(session_id: impl Into<String>, anchor_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            anchor_id: anchor_id.into(),
            mode: None,
            battle_target: None,
        }
    }

    pub fn with_mode(mut self, mode: Mode, battle_target: Option<BattleTarget>) -> Self {
        self.mode = Some(mode);
        self.battle_target = battle_target;
        self
    }

    /// Placeholder or blank identifiers cannot address an upstream conversation.
    pub fn is_usable(&self) -> bool {
        let blank = |s: &str| s.trim().is_empty() || s.starts_with("YOUR_");
        !blank(&self.session_id) && !blank(&self.anchor_id)
    }
}

/// Result of resolving a model name: one tuple and the mode it runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub tuple: IdTuple,
    pub mode: Mode,
    /// Only meaningful when `mode` is `Battle`.
    pub battle_target: BattleTarget,
    /// True when the global default tuple was used.
    pub from_default: bool,
}

/// Where a captured tuple is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    Global,
    Model(String),
}

impl std::fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global default"),
            Self::Model(name) => write!(f, "model '{}'", name),
        }
    }
}

/// How a captured tuple combines with what is already configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturePolicy {
    #[default]
    Replace,
    Append,
}

/// A model's pool entry on disk: a single tuple or a list of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(IdTuple),
    Many(Vec<IdTuple>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<IdTuple> {
        match self {
            Self::One(t) => vec![t],
            Self::Many(v) => v,
        }
    }
}

/// Persisted pool (id_pool.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<IdTuple>,
    #[serde(default = "default_mode")]
    pub default_mode: Mode,
    #[serde(default = "default_battle_target")]
    pub default_battle_target: BattleTarget,
    #[serde(default)]
    pub models: BTreeMap<String, OneOrMany>,
}

fn default_mode() -> Mode {
    Mode::DirectChat
}
fn default_battle_target() -> BattleTarget {
    BattleTarget::A
}

impl Default for PoolFile {
    fn default() -> Self {
        Self {
            default: None,
            default_mode: default_mode(),
            default_battle_target: default_battle_target(),
            models: BTreeMap::new(),
        }
    }
}

/// Pool status for the operator endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    #[serde(rename = "defaultConfigured")]
    pub default_configured: bool,
    #[serde(rename = "defaultMode")]
    pub default_mode: Mode,
    #[serde(rename = "fallbackEnabled")]
    pub fallback_enabled: bool,
    /// Tuple count per model name.
    pub models: BTreeMap<String, usize>,
}
