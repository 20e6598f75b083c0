//! Persistence collaborator: bans and finished-game records
//!
//! The session only needs a handful of transactional upserts. Failures are
//! reported as [`PersistenceError`] and the caller logs them; gameplay never
//! waits on a successful write.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("no transaction in progress")]
    NoTransaction,
    #[error("transaction already in progress")]
    TransactionInProgress,
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub game_id: u64,
    pub name: String,
    pub map_path: String,
    pub creator: String,
    pub duration_secs: u64,
    pub winners: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub game_id: u64,
    pub name: String,
    pub ip: String,
    pub color: u8,
    pub team: u8,
    pub left_secs: u64,
    pub left_reason: String,
    /// Collector-provided values, e.g. `kills` or `won`
    pub stats: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BanRecord {
    pub name: String,
    pub ip: String,
    pub reason: String,
    pub game_id: u64,
}

pub trait Persistence {
    fn is_banned(&self, name: &str, ip: &str) -> Result<bool, PersistenceError>;
    fn begin(&mut self) -> Result<(), PersistenceError>;
    fn upsert_game(&mut self, record: GameRecord) -> Result<(), PersistenceError>;
    fn upsert_player(&mut self, record: PlayerRecord) -> Result<(), PersistenceError>;
    fn add_ban(&mut self, record: BanRecord) -> Result<(), PersistenceError>;
    fn commit(&mut self) -> Result<(), PersistenceError>;
    fn rollback(&mut self);
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Records {
    pub games: Vec<GameRecord>,
    pub players: Vec<PlayerRecord>,
    pub bans: Vec<BanRecord>,
}

impl Records {
    fn apply(&mut self, staged: Records) {
        for game in staged.games {
            match self.games.iter_mut().find(|g| g.game_id == game.game_id) {
                Some(existing) => *existing = game,
                None => self.games.push(game),
            }
        }
        for player in staged.players {
            match self
                .players
                .iter_mut()
                .find(|p| p.game_id == player.game_id && p.name.eq_ignore_ascii_case(&player.name))
            {
                Some(existing) => *existing = player,
                None => self.players.push(player),
            }
        }
        self.bans.extend(staged.bans);
    }

    fn is_banned(&self, name: &str, ip: &str) -> bool {
        self.bans
            .iter()
            .any(|b| b.name.eq_ignore_ascii_case(name) || (!ip.is_empty() && b.ip == ip))
    }
}

/// Keeps everything in memory; used by tests and when no records file is configured
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    pub records: Records,
    staged: Option<Records>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn staged_mut(&mut self) -> Result<&mut Records, PersistenceError> {
        self.staged.as_mut().ok_or(PersistenceError::NoTransaction)
    }
}

impl Persistence for MemoryPersistence {
    fn is_banned(&self, name: &str, ip: &str) -> Result<bool, PersistenceError> {
        Ok(self.records.is_banned(name, ip))
    }

    fn begin(&mut self) -> Result<(), PersistenceError> {
        if self.staged.is_some() {
            return Err(PersistenceError::TransactionInProgress);
        }
        self.staged = Some(Records::default());
        Ok(())
    }

    fn upsert_game(&mut self, record: GameRecord) -> Result<(), PersistenceError> {
        self.staged_mut()?.games.push(record);
        Ok(())
    }

    fn upsert_player(&mut self, record: PlayerRecord) -> Result<(), PersistenceError> {
        self.staged_mut()?.players.push(record);
        Ok(())
    }

    fn add_ban(&mut self, record: BanRecord) -> Result<(), PersistenceError> {
        self.staged_mut()?.bans.push(record);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), PersistenceError> {
        let staged = self.staged.take().ok_or(PersistenceError::NoTransaction)?;
        self.records.apply(staged);
        Ok(())
    }

    fn rollback(&mut self) {
        self.staged = None;
    }
}

/// Stores all records in a single bincode file, rewritten on every commit
pub struct FilePersistence {
    path: PathBuf,
    inner: MemoryPersistence,
}

impl FilePersistence {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let records = if path.exists() {
            let bytes = std::fs::read(&path)?;
            bincode::deserialize(&bytes)?
        } else {
            Records::default()
        };
        info!(
            "[DB] opened {} ({} games, {} bans)",
            path.display(),
            records.games.len(),
            records.bans.len()
        );
        Ok(Self {
            path,
            inner: MemoryPersistence {
                records,
                staged: None,
            },
        })
    }

    pub fn records(&self) -> &Records {
        &self.inner.records
    }
}

impl Persistence for FilePersistence {
    fn is_banned(&self, name: &str, ip: &str) -> Result<bool, PersistenceError> {
        self.inner.is_banned(name, ip)
    }

    fn begin(&mut self) -> Result<(), PersistenceError> {
        self.inner.begin()
    }

    fn upsert_game(&mut self, record: GameRecord) -> Result<(), PersistenceError> {
        self.inner.upsert_game(record)
    }

    fn upsert_player(&mut self, record: PlayerRecord) -> Result<(), PersistenceError> {
        self.inner.upsert_player(record)
    }

    fn add_ban(&mut self, record: BanRecord) -> Result<(), PersistenceError> {
        self.inner.add_ban(record)
    }

    fn commit(&mut self) -> Result<(), PersistenceError> {
        let staged = self.inner.staged.take().ok_or(PersistenceError::NoTransaction)?;
        let mut next = self.inner.records.clone();
        next.apply(staged);
        let bytes = bincode::serialize(&next)?;
        std::fs::write(&self.path, bytes)?;
        debug!("[DB] wrote {}", self.path.display());
        self.inner.records = next;
        Ok(())
    }

    fn rollback(&mut self) {
        self.inner.rollback();
    }
}

/// One store shared by every session of the process
pub type SharedPersistence<P> = Arc<Mutex<P>>;

fn lock<P>(shared: &Mutex<P>) -> Result<MutexGuard<'_, P>, PersistenceError> {
    shared.lock().map_err(|_| PersistenceError::Poisoned)
}

impl<P: Persistence> Persistence for Arc<Mutex<P>> {
    fn is_banned(&self, name: &str, ip: &str) -> Result<bool, PersistenceError> {
        lock(self)?.is_banned(name, ip)
    }

    fn begin(&mut self) -> Result<(), PersistenceError> {
        lock(self)?.begin()
    }

    fn upsert_game(&mut self, record: GameRecord) -> Result<(), PersistenceError> {
        lock(self)?.upsert_game(record)
    }

    fn upsert_player(&mut self, record: PlayerRecord) -> Result<(), PersistenceError> {
        lock(self)?.upsert_player(record)
    }

    fn add_ban(&mut self, record: BanRecord) -> Result<(), PersistenceError> {
        lock(self)?.add_ban(record)
    }

    fn commit(&mut self) -> Result<(), PersistenceError> {
        lock(self)?.commit()
    }

    fn rollback(&mut self) {
        if let Ok(mut inner) = self.lock() {
            inner.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(id: u64) -> GameRecord {
        GameRecord {
            game_id: id,
            name: "test".to_string(),
            map_path: "Maps\\Test.w3x".to_string(),
            creator: "LAN".to_string(),
            duration_secs: 600,
            winners: vec![],
        }
    }

    #[test]
    fn test_commit_applies_staged_records() {
        let mut db = MemoryPersistence::new();
        db.begin().unwrap();
        db.upsert_game(game(1)).unwrap();
        assert!(db.records.games.is_empty());
        db.commit().unwrap();
        assert_eq!(db.records.games.len(), 1);
    }

    #[test]
    fn test_rollback_discards() {
        let mut db = MemoryPersistence::new();
        db.begin().unwrap();
        db.add_ban(BanRecord {
            name: "griefer".to_string(),
            ip: String::new(),
            reason: "afk".to_string(),
            game_id: 1,
        })
        .unwrap();
        db.rollback();
        assert!(!db.is_banned("griefer", "").unwrap());
        assert!(matches!(db.commit(), Err(PersistenceError::NoTransaction)));
    }

    #[test]
    fn test_upsert_outside_transaction_fails() {
        let mut db = MemoryPersistence::new();
        assert!(db.upsert_game(game(1)).is_err());
    }

    #[test]
    fn test_ban_lookup_is_case_insensitive() {
        let mut db = MemoryPersistence::new();
        db.begin().unwrap();
        db.add_ban(BanRecord {
            name: "Griefer".to_string(),
            ip: "10.0.0.9".to_string(),
            reason: "left".to_string(),
            game_id: 2,
        })
        .unwrap();
        db.commit().unwrap();
        assert!(db.is_banned("griefer", "").unwrap());
        assert!(db.is_banned("someone", "10.0.0.9").unwrap());
        assert!(!db.is_banned("someone", "10.0.0.1").unwrap());
    }

    #[test]
    fn test_file_persistence_survives_reopen() {
        let path = std::env::temp_dir().join(format!("w3host-records-{}.bin", std::process::id()));
        let _ = std::fs::remove_file(&path);
        {
            let mut db = FilePersistence::open(&path).unwrap();
            db.begin().unwrap();
            db.upsert_game(game(7)).unwrap();
            db.commit().unwrap();
        }
        let db = FilePersistence::open(&path).unwrap();
        assert_eq!(db.records().games.len(), 1);
        assert_eq!(db.records().games[0].game_id, 7);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_shared_handle_writes_through() {
        let shared: SharedPersistence<MemoryPersistence> = Arc::new(Mutex::new(MemoryPersistence::new()));
        let mut handle = shared.clone();
        handle.begin().unwrap();
        handle.upsert_game(game(3)).unwrap();
        handle.commit().unwrap();
        assert_eq!(shared.lock().unwrap().records.games.len(), 1);
    }
}
