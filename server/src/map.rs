//! Map descriptors and the process-wide map content cache
//!
//! The session never parses map archives. It receives a [`MapDescriptor`]
//! carrying the slot templates, hashes and per-version limits extracted
//! elsewhere, and optionally the raw file bytes for transfers, which are
//! shared between sessions through a [`MapCache`].

use crate::error::GameError;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::slot::{MAX_SLOTS_LEGACY, MAX_SLOTS_MODERN};
use shared::{GameSlot, LayoutStyle};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

/// Who may sit in the observer team
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObserverMode {
    None,
    /// Defeated players become observers; no lobby observers
    OnDefeat,
    Full,
    /// Observers that may pause and resume
    Referees,
}

/// Which stats collector the session attaches once the game is loaded
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatsKind {
    None,
    W3mmd,
    Dota,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MapDescriptor {
    /// Path the client sees, e.g. `Maps\Download\DotA.w3x`
    pub path: String,
    pub size: u32,
    pub crc32: [u8; 4],
    pub hash: [u8; 4],
    #[serde(default)]
    pub sha1: Option<[u8; 20]>,
    pub width: [u8; 2],
    pub height: [u8; 2],
    pub game_flags: u32,
    pub game_type: u32,
    pub layout: LayoutStyle,
    pub slots: Vec<GameSlot>,
    /// Player slots announced in slot info
    pub num_players: u8,
    pub num_teams: u8,
    #[serde(default = "default_version_max_slots")]
    pub version_max_slots: u8,
    #[serde(default)]
    pub supported_versions: Vec<u8>,
    #[serde(default)]
    pub hcl_default: Option<String>,
    pub observers: ObserverMode,
    pub stats: StatsKind,
    /// Slot the map reserves for host-to-map communication
    #[serde(default)]
    pub hmc_slot: Option<u8>,
    /// Where the map file lives on the host, if it can be transferred
    #[serde(default)]
    pub local_path: Option<String>,
}

fn default_version_max_slots() -> u8 {
    MAX_SLOTS_LEGACY
}

impl MapDescriptor {
    pub fn load(path: &Path) -> Result<Self, GameError> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| GameError::Config(e.to_string()))
    }

    /// Observer team and color for this map's slot limit
    pub fn observer_sentinel(&self) -> u8 {
        self.version_max_slots
    }

    pub fn supports(&self, game_version: u8) -> bool {
        self.supported_versions.is_empty() || self.supported_versions.contains(&game_version)
    }

    /// Rejects descriptors a session could not be created from
    pub fn validate(&self, game_version: u8) -> Result<(), GameError> {
        if self.slots.is_empty() {
            return Err(GameError::MissingMapData(format!("{} has no slots", self.path)));
        }
        if self.version_max_slots != MAX_SLOTS_LEGACY && self.version_max_slots != MAX_SLOTS_MODERN {
            return Err(GameError::MissingMapData(format!(
                "invalid slot limit {}",
                self.version_max_slots
            )));
        }
        if self.slots.len() > self.version_max_slots as usize {
            return Err(GameError::MissingMapData(format!(
                "{} slots exceed the limit of {}",
                self.slots.len(),
                self.version_max_slots
            )));
        }
        if self.num_players == 0 || self.num_players as usize > self.slots.len() {
            return Err(GameError::MissingMapData("invalid player count".to_string()));
        }
        if self.num_teams == 0 {
            return Err(GameError::MissingMapData("invalid team count".to_string()));
        }
        if let Some(hmc) = self.hmc_slot {
            if hmc as usize >= self.slots.len() {
                return Err(GameError::MissingMapData(format!("invalid HMC slot {}", hmc)));
            }
        }
        if !self.supports(game_version) {
            return Err(GameError::UnsupportedVersion(game_version));
        }
        Ok(())
    }
}

/// Map file contents shared read-only between sessions
///
/// Entries are weak so a map is evicted as soon as the last session using it
/// drops its handle.
#[derive(Debug, Default)]
pub struct MapCache {
    entries: HashMap<String, Weak<Vec<u8>>>,
}

impl MapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Arc<Vec<u8>>> {
        self.entries.get(path).and_then(Weak::upgrade)
    }

    pub fn insert(&mut self, path: &str, data: Vec<u8>) -> Arc<Vec<u8>> {
        let data = Arc::new(data);
        self.entries.insert(path.to_string(), Arc::downgrade(&data));
        data
    }

    /// Returns the cached bytes or reads them from disk
    pub fn get_or_load(&mut self, path: &str) -> Result<Arc<Vec<u8>>, GameError> {
        if let Some(data) = self.get(path) {
            debug!("[MAP] cache hit for {}", path);
            return Ok(data);
        }
        let bytes = std::fs::read(path)?;
        info!("[MAP] loaded {} ({} bytes)", path, bytes.len());
        Ok(self.insert(path, bytes))
    }

    /// Drops entries no session holds anymore
    pub fn purge(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, weak| weak.strong_count() > 0);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
