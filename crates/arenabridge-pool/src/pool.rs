//! Session/ID pool — model name to ID tuple resolution with a single writer.
//!
//! Readers take a cheap `Arc` snapshot and never block on a write in
//! progress; a write builds a new snapshot, persists it, then swaps it in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arenabridge_core::{write_atomic, Error, Result};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use crate::types::*;

#[derive(Debug, Clone)]
struct PoolSnapshot {
    default: Option<IdTuple>,
    default_mode: Mode,
    default_battle_target: BattleTarget,
    models: BTreeMap<String, Vec<IdTuple>>,
}

impl From<PoolFile> for PoolSnapshot {
    fn from(file: PoolFile) -> Self {
        Self {
            default: file.default,
            default_mode: file.default_mode,
            default_battle_target: file.default_battle_target,
            models: file
                .models
                .into_iter()
                .map(|(name, entry)| (name, entry.into_vec()))
                .filter(|(_, tuples)| !tuples.is_empty())
                .collect(),
        }
    }
}

impl PoolSnapshot {
    fn to_file(&self) -> PoolFile {
        PoolFile {
            default: self.default.clone(),
            default_mode: self.default_mode,
            default_battle_target: self.default_battle_target,
            models: self
                .models
                .iter()
                .map(|(name, tuples)| (name.clone(), OneOrMany::Many(tuples.clone())))
                .collect(),
        }
    }
}

/// Process-scoped pool of upstream session identifiers.
pub struct SessionPool {
    path: PathBuf,
    fallback_enabled: AtomicBool,
    snapshot: RwLock<Arc<PoolSnapshot>>,
    /// Serializes capture and reload.
    writer: Mutex<()>,
}

impl SessionPool {
    /// Load the pool from `path`. A missing file yields an empty pool.
    pub fn load(path: &Path, fallback_enabled: bool) -> Result<Self> {
        let snapshot = read_pool_file(path)?;
        info!(
            "SessionPool: {} models mapped, default {}",
            snapshot.models.len(),
            if snapshot.default.is_some() { "set" } else { "unset" }
        );
        Ok(Self {
            path: path.to_path_buf(),
            fallback_enabled: AtomicBool::new(fallback_enabled),
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        })
    }

    pub fn set_fallback_enabled(&self, enabled: bool) {
        self.fallback_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled.load(Ordering::Relaxed)
    }

    fn current(&self) -> Arc<PoolSnapshot> {
        self.snapshot.read().clone()
    }

    // ---------------------------------------------------------------
    // Resolution
    // ---------------------------------------------------------------

    /// Resolve a model name to one tuple, drawing uniformly at random when
    /// several are configured.
    pub fn resolve(&self, model: &str) -> Result<Resolved> {
        self.resolve_with(model, &mut rand::thread_rng())
    }

    pub fn resolve_with<R: Rng + ?Sized>(&self, model: &str, rng: &mut R) -> Result<Resolved> {
        let snapshot = self.current();

        let candidates: Vec<&IdTuple> = snapshot
            .models
            .get(model)
            .map(|tuples| tuples.iter().filter(|t| t.is_usable()).collect())
            .unwrap_or_default();

        if let Some(tuple) = candidates.choose(rng) {
            // A tuple's own mode beats the global default.
            let mode = tuple.mode.unwrap_or(snapshot.default_mode);
            let battle_target = tuple
                .battle_target
                .unwrap_or(snapshot.default_battle_target);
            debug!("Resolved '{}' to session {} ({})", model, tuple.session_id, mode);
            return Ok(Resolved {
                tuple: (*tuple).clone(),
                mode,
                battle_target,
                from_default: false,
            });
        }

        if !self.fallback_enabled() {
            return Err(Error::NoMapping(model.to_string()));
        }

        match snapshot.default.as_ref().filter(|t| t.is_usable()) {
            Some(tuple) => {
                debug!("Model '{}' unmapped, using global default", model);
                Ok(Resolved {
                    tuple: tuple.clone(),
                    mode: snapshot.default_mode,
                    battle_target: snapshot.default_battle_target,
                    from_default: true,
                })
            }
            None => Err(Error::NoMapping(model.to_string())),
        }
    }

    // ---------------------------------------------------------------
    // Writes (capture / reload)
    // ---------------------------------------------------------------

    /// Write a captured tuple. Durable on disk before any `resolve` sees it.
    pub fn capture(&self, target: &CaptureTarget, tuple: IdTuple, policy: CapturePolicy) -> Result<()> {
        if !tuple.is_usable() {
            return Err(Error::InvalidRequest(
                "captured identifiers are blank".to_string(),
            ));
        }

        let _guard = self.writer.lock();
        let mut next = (*self.current()).clone();

        match target {
            CaptureTarget::Global => {
                if let Some(mode) = tuple.mode {
                    next.default_mode = mode;
                }
                if let Some(side) = tuple.battle_target {
                    next.default_battle_target = side;
                }
                next.default = Some(tuple);
            }
            CaptureTarget::Model(name) => {
                let entry = next.models.entry(name.clone()).or_default();
                match policy {
                    CapturePolicy::Replace => *entry = vec![tuple],
                    CapturePolicy::Append => {
                        if !entry.contains(&tuple) {
                            entry.push(tuple);
                        }
                    }
                }
            }
        }

        write_pool_file(&self.path, &next.to_file())?;
        *self.snapshot.write() = Arc::new(next);
        info!("Captured session identifiers for {}", target);
        Ok(())
    }

    /// Re-read the pool file, replacing the in-memory snapshot.
    pub fn reload(&self) -> Result<()> {
        let _guard = self.writer.lock();
        let next = read_pool_file(&self.path)?;
        *self.snapshot.write() = Arc::new(next);
        info!("SessionPool reloaded from {}", self.path.display());
        Ok(())
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    /// Model names with at least one configured tuple.
    pub fn model_names(&self) -> Vec<String> {
        self.current().models.keys().cloned().collect()
    }

    pub fn tuples(&self, model: &str) -> Vec<IdTuple> {
        self.current().models.get(model).cloned().unwrap_or_default()
    }

    pub fn summary(&self) -> PoolSummary {
        let snapshot = self.current();
        PoolSummary {
            default_configured: snapshot.default.as_ref().is_some_and(|t| t.is_usable()),
            default_mode: snapshot.default_mode,
            fallback_enabled: self.fallback_enabled(),
            models: snapshot
                .models
                .iter()
                .map(|(name, tuples)| (name.clone(), tuples.len()))
                .collect(),
        }
    }
}

/// Parse a pool file without constructing a pool (used by `validate`).
pub fn parse_pool_file(path: &Path) -> Result<PoolFile> {
    let data = std::fs::read_to_string(path)?;
    serde_json::from_str(&data).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

fn read_pool_file(path: &Path) -> Result<PoolSnapshot> {
    match parse_pool_file(path) {
        Ok(file) => Ok(file.into()),
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(PoolFile::default().into())
        }
        Err(e) => Err(e),
    }
}

fn write_pool_file(path: &Path, file: &PoolFile) -> Result<()> {
    let json = serde_json::to_string_pretty(file)?;
    write_atomic(path, &json)?;
    Ok(())
}
