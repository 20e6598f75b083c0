//! Server and per-game configuration

use crate::error::GameError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// What to do when a desync splits the players
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesyncHandler {
    /// Announce the desync and keep going
    Notify,
    /// Drop the minority once fewer than half remain synchronized with the majority
    Drop,
}

/// When in-game names are replaced by pseudonyms
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HideNamesMode {
    Never,
    /// Only for free-for-all shaped games
    Auto,
    Always,
}

/// Tunables read by a game session
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Milliseconds between action frames
    pub latency_ms: u16,
    /// Frames a user may fall behind before the lag screen starts
    pub sync_limit: u32,
    /// Frames a lagging user must be within to leave the lag screen
    pub sync_limit_safe: u32,
    pub ping_equalizer_enabled: bool,
    pub ping_equalizer_max_frames: u8,
    /// Action frames between equalizer adjustments
    pub ping_equalizer_period_ticks: u32,
    pub countdown_start_value: u8,
    pub countdown_interval_ms: u64,
    /// Users above this ping block a non-forced countdown; 0 disables
    pub auto_kick_ping_ms: u32,
    pub game_over_tolerance_secs: u64,
    /// Tolerance used when the stats collector declared the result
    pub game_over_tolerance_stats_secs: u64,
    /// Remaining players at or below which the game-over timer starts
    pub num_players_to_start_game_over: u8,
    pub lag_drop_timeout_secs: u64,
    pub reconnect_wait_basic_secs: u64,
    pub reconnect_wait_extended_secs: u64,
    /// Minimum game time before a reconnect timeout saves the game first
    pub auto_save_min_elapsed_secs: u64,
    pub desync_handler: DesyncHandler,
    pub max_parallel_map_packets: u32,
    /// 0 means unlimited
    pub max_upload_kbps: u32,
    pub allow_map_downloads: bool,
    pub virtual_host_name: String,
    pub hide_lobby_names: bool,
    pub hide_in_game_names: HideNamesMode,
    pub lobby_ping_interval_ms: u64,
    /// Countdown is refused until this long after the last lobby leave
    pub min_leave_cooldown_ms: u64,
    pub mmd_definition_delay_ms: u64,
    pub mmd_action_delay_ms: u64,
    pub mmd_initial_delay_ms: u64,
    pub bannable_history_size: usize,
    pub max_player_name_len: usize,
    /// Port announced to reconnect-capable clients
    pub reconnect_port: u16,
    pub remake_quota: u8,
    pub pauses_per_player: u8,
    pub saves_per_player: u8,
    /// Users that send nothing for this long are dropped
    pub connection_timeout_secs: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            latency_ms: 100,
            sync_limit: 32,
            sync_limit_safe: 8,
            ping_equalizer_enabled: true,
            ping_equalizer_max_frames: 4,
            ping_equalizer_period_ticks: 20,
            countdown_start_value: 5,
            countdown_interval_ms: 500,
            auto_kick_ping_ms: 400,
            game_over_tolerance_secs: 60,
            game_over_tolerance_stats_secs: 300,
            num_players_to_start_game_over: 1,
            lag_drop_timeout_secs: 60,
            reconnect_wait_basic_secs: 60,
            reconnect_wait_extended_secs: 180,
            auto_save_min_elapsed_secs: 180,
            desync_handler: DesyncHandler::Notify,
            max_parallel_map_packets: 1000,
            max_upload_kbps: 0,
            allow_map_downloads: true,
            virtual_host_name: "|cFF4080C0Aura".to_string(),
            hide_lobby_names: false,
            hide_in_game_names: HideNamesMode::Never,
            lobby_ping_interval_ms: 2000,
            min_leave_cooldown_ms: 2000,
            mmd_definition_delay_ms: 1000,
            mmd_action_delay_ms: 3000,
            mmd_initial_delay_ms: 60_000,
            bannable_history_size: 20,
            max_player_name_len: 15,
            reconnect_port: 6114,
            remake_quota: 3,
            pauses_per_player: 3,
            saves_per_player: 1,
            connection_timeout_secs: 70,
        }
    }
}

impl GameConfig {
    /// Grace period for a disconnected reconnect-capable user, in milliseconds
    pub fn reconnect_wait_ms(&self, extended: bool) -> u64 {
        if extended {
            self.reconnect_wait_extended_secs * 1000
        } else {
            self.reconnect_wait_basic_secs * 1000
        }
    }

    /// Empty actions a basic reconnect client needs to keep its clock aligned
    pub fn gproxy_empty_actions(&self) -> u8 {
        let frames = self.reconnect_wait_basic_secs * 1000 / u64::from(self.latency_ms.max(1));
        // the legacy client caps the count at one byte and scales by 6 seconds per action
        (self.reconnect_wait_basic_secs / 60).clamp(1, u8::MAX as u64).min(frames) as u8
    }

    pub fn validate(&self) -> Result<(), GameError> {
        if self.latency_ms == 0 {
            return Err(GameError::Config("latency_ms must be positive".to_string()));
        }
        if self.sync_limit_safe > self.sync_limit {
            return Err(GameError::Config(
                "sync_limit_safe must not exceed sync_limit".to_string(),
            ));
        }
        if self.virtual_host_name.is_empty() || self.virtual_host_name.len() > 15 {
            return Err(GameError::Config(
                "virtual_host_name must be 1-15 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Process-level configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP address game clients connect to
    pub bind_address: SocketAddr,
    /// UDP port used for LAN discovery
    pub discovery_port: u16,
    /// Destination of discovery beacons
    pub broadcast_address: SocketAddr,
    /// Upper bound on a single wait of the main loop
    pub max_tick_ms: u64,
    /// Game version advertised in discovery beacons
    pub game_version: u8,
    /// Optional record file for finished games
    pub records_path: Option<String>,
    pub game: GameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 6112)),
            discovery_port: 6112,
            broadcast_address: SocketAddr::from(([255, 255, 255, 255], 6112)),
            max_tick_ms: 50,
            game_version: 28,
            records_path: None,
            game: GameConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads a JSON config file; missing fields keep their defaults
    pub fn load(path: &Path) -> Result<Self, GameError> {
        let text = std::fs::read_to_string(path)?;
        let config: ServerConfig =
            serde_json::from_str(&text).map_err(|e| GameError::Config(e.to_string()))?;
        config.game.validate()?;
        Ok(config)
    }
}
