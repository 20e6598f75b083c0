//! A hosted game from lobby to game over
//!
//! The session is a plain state machine driven by three inputs: packets from
//! connections ([`Game::receive`]), closed connections
//! ([`Game::connection_closed`]) and the clock ([`Game::update`]). Every
//! method takes the current time in milliseconds, so tests can drive a
//! session without sleeping. Anything the session wants to send is queued as
//! [`Outgoing`] and collected by the network layer with
//! [`Game::take_outgoing`].
//!
//! ```text
//! Lobby ──countdown──▶ Loading ──all loaded──▶ Playing ──▶ Over
//!   ▲                     │                       │
//!   └──── remake ─────────┴───────────────────────┘
//! ```

mod gproxy;
mod join;
mod lobby;
mod playing;

pub use lobby::{CountdownRefusal, LayoutPreset};

use crate::action_queue::FrameQueue;
use crate::collaborators::{Announcer, Creator};
use crate::config::GameConfig;
use crate::dota_stats::DotaStats;
use crate::error::GameError;
use crate::map::{MapDescriptor, ObserverMode};
use crate::persistence::Persistence;
use crate::slot_table::SlotTable;
use crate::user::{ConnId, GameUser, UserRoster};
use crate::virtual_user::VirtualUser;
use crate::w3mmd::W3mmd;
use log::{debug, info, warn};
use shared::discovery::{GameInfoParams, GameInfoTemplate};
use shared::gps::GPS_HEADER;
use shared::w3gs::{self, chat_flag, ClientPacket, RejectReason, W3GS_HEADER};
use shared::LeaveCode;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

/// Milliseconds between discovery beacons while the lobby is open
pub const DISCOVERY_INTERVAL_MS: u64 = 5000;
/// Chat lines longer than this are truncated
const MAX_CHAT_LEN: usize = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    Lobby,
    Loading,
    Playing,
    Over,
}

/// Work for the network layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Send { conn: ConnId, data: Vec<u8> },
    Close { conn: ConnId },
    /// UDP discovery traffic for the broadcast address
    Discovery(Vec<u8>),
}

/// Lifecycle notifications for the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    Started,
    Ended { game_id: u64 },
    /// The session went back to the lobby and needs a fresh identity
    Remade,
}

/// Everything needed to host one game
pub struct GameSetup {
    pub name: String,
    pub map: MapDescriptor,
    pub config: GameConfig,
    pub game_version: u8,
    pub host_counter: u32,
    pub game_id: u64,
    pub creator: Creator,
    pub owner: Option<String>,
    pub reserved: Vec<String>,
    pub hcl_command: Option<String>,
    pub require_verified: bool,
    /// Restoring a saved game waives the two-team requirement
    pub saved_game: bool,
    pub host_port: u16,
    pub entry_key: u32,
    pub random_seed: u32,
    pub map_data: Option<Arc<Vec<u8>>>,
}

impl GameSetup {
    pub fn new(name: impl Into<String>, map: MapDescriptor) -> Self {
        Self {
            name: name.into(),
            hcl_command: map.hcl_default.clone(),
            map,
            config: GameConfig::default(),
            game_version: 28,
            host_counter: 1,
            game_id: 1,
            creator: Creator::None,
            owner: None,
            reserved: Vec::new(),
            require_verified: false,
            saved_game: false,
            host_port: 6112,
            entry_key: rand::random(),
            random_seed: rand::random(),
            map_data: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Countdown {
    value: u8,
    forced: bool,
    next_tick_at: u64,
}

/// A recent occupant that can still be banned after leaving
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BannableEntry {
    pub name: String,
    pub ip: String,
    pub left_at: Option<u64>,
}

/// A participant of a started game, kept for the end-of-game records
#[derive(Debug, Clone)]
pub(crate) struct GamePlayer {
    uid: u8,
    sid: u8,
    name: String,
    ip: String,
    color: u8,
    team: u8,
    left_at: Option<u64>,
    left_reason: String,
}

pub enum StatsCollector {
    W3mmd(W3mmd),
    Dota(DotaStats),
}

pub struct Game {
    name: String,
    map: MapDescriptor,
    config: GameConfig,
    game_version: u8,
    host_counter: u32,
    game_id: u64,
    creator: Creator,
    owner: Option<String>,
    reserved: Vec<String>,
    hcl_command: String,
    require_verified: bool,
    saved_game: bool,
    host_port: u16,
    entry_key: u32,
    random_seed: u32,
    map_data: Option<Arc<Vec<u8>>>,
    game_info: GameInfoTemplate,

    slots: SlotTable,
    users: UserRoster,
    virtual_users: Vec<VirtualUser>,
    virtual_host_uid: Option<u8>,
    queue: FrameQueue,
    state: GameState,
    lagging: bool,
    desynced: bool,
    paused: bool,
    lobby_loading: bool,
    exiting: bool,
    hide_names: bool,

    countdown: Option<Countdown>,
    created_at: u64,
    loading_started_at: Option<u64>,
    playing_started_at: Option<u64>,
    last_frame_at: u64,
    frames_sent: u32,
    game_ticks: u64,
    frames_since_equalizer: u32,
    last_leave_at: Option<u64>,
    last_ping_at: u64,
    last_discovery_at: Option<u64>,
    game_over_at: Option<u64>,
    game_over_tolerance_ms: u64,
    players_at_start: usize,
    remake_count: u8,

    stats: Option<StatsCollector>,
    sync_graph: HashMap<u8, HashSet<u8>>,
    bannable: VecDeque<BannableEntry>,
    game_players: Vec<GamePlayer>,
    /// Connections asked to close that the network has not confirmed yet
    draining: HashSet<ConnId>,

    persistence: Box<dyn Persistence + Send>,
    announcer: Box<dyn Announcer + Send>,
    outgoing: Vec<Outgoing>,
    events: Vec<GameEvent>,
}

impl Game {
    /// Creates a lobby; refuses maps and settings that could only fail later
    pub fn new(
        setup: GameSetup,
        persistence: Box<dyn Persistence + Send>,
        announcer: Box<dyn Announcer + Send>,
        now: u64,
    ) -> Result<Self, GameError> {
        setup.map.validate(setup.game_version)?;
        setup.config.validate()?;
        if setup.name.is_empty() || setup.name.len() > 31 {
            return Err(GameError::Config(format!("invalid game name [{}]", setup.name)));
        }
        let game_info = Self::build_game_info(&setup.name, &setup.map, &setup.config, setup.host_counter, setup.entry_key)?;
        let max_users = setup.map.slots.len();
        let mut game = Self {
            slots: SlotTable::new(&setup.map),
            users: UserRoster::new(max_users),
            name: setup.name,
            config: setup.config,
            game_version: setup.game_version,
            host_counter: setup.host_counter,
            game_id: setup.game_id,
            creator: setup.creator,
            owner: setup.owner,
            reserved: setup.reserved.iter().map(|r| r.to_lowercase()).collect(),
            hcl_command: setup.hcl_command.unwrap_or_default(),
            require_verified: setup.require_verified,
            saved_game: setup.saved_game,
            host_port: setup.host_port,
            entry_key: setup.entry_key,
            random_seed: setup.random_seed,
            map_data: setup.map_data,
            map: setup.map,
            game_info,
            virtual_users: Vec::new(),
            virtual_host_uid: None,
            queue: FrameQueue::new(),
            state: GameState::Lobby,
            lagging: false,
            desynced: false,
            paused: false,
            lobby_loading: false,
            exiting: false,
            hide_names: false,
            countdown: None,
            created_at: now,
            loading_started_at: None,
            playing_started_at: None,
            last_frame_at: now,
            frames_sent: 0,
            game_ticks: 0,
            frames_since_equalizer: 0,
            last_leave_at: None,
            last_ping_at: now,
            last_discovery_at: None,
            game_over_at: None,
            game_over_tolerance_ms: 0,
            players_at_start: 0,
            remake_count: 0,
            stats: None,
            sync_graph: HashMap::new(),
            bannable: VecDeque::new(),
            game_players: Vec::new(),
            draining: HashSet::new(),
            persistence,
            announcer,
            outgoing: Vec::new(),
            events: Vec::new(),
        };
        game.create_virtual_host();
        info!("{} created on map [{}] by {}", game.prefix(), game.map.path, game.creator);
        Ok(game)
    }

    fn build_game_info(
        name: &str,
        map: &MapDescriptor,
        config: &GameConfig,
        host_counter: u32,
        entry_key: u32,
    ) -> Result<GameInfoTemplate, GameError> {
        Ok(GameInfoTemplate::build(&GameInfoParams {
            map_game_type: map.game_type,
            map_flags: map.game_flags,
            map_width: map.width,
            map_height: map.height,
            game_name: name,
            host_name: &config.virtual_host_name,
            map_path: &map.path,
            map_hash: map.hash,
            slots_total: map.slots.len() as u32,
            host_counter,
            entry_key,
        })?)
    }

    pub(crate) fn prefix(&self) -> String {
        format!("[GAME: {}]", self.name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> GameState {
        self.state
    }

    pub fn host_counter(&self) -> u32 {
        self.host_counter
    }

    pub fn game_id(&self) -> u64 {
        self.game_id
    }

    pub fn entry_key(&self) -> u32 {
        self.entry_key
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn map(&self) -> &MapDescriptor {
        &self.map
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    pub fn user(&self, uid: u8) -> Option<&GameUser> {
        self.users.get(uid)
    }

    pub fn user_by_name(&self, name: &str) -> Option<&GameUser> {
        self.users.find_by_name(name).and_then(|uid| self.users.get(uid))
    }

    pub fn users(&self) -> impl Iterator<Item = &GameUser> {
        self.users.iter()
    }

    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    pub fn virtual_users(&self) -> &[VirtualUser] {
        &self.virtual_users
    }

    pub fn virtual_host_uid(&self) -> Option<u8> {
        self.virtual_host_uid
    }

    pub fn is_lagging(&self) -> bool {
        self.lagging
    }

    pub fn is_desynced(&self) -> bool {
        self.desynced
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_lobby_loading(&self) -> bool {
        self.lobby_loading
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting
    }

    pub fn is_countdown_active(&self) -> bool {
        self.countdown.is_some()
    }

    pub fn names_hidden(&self) -> bool {
        self.hide_names
    }

    pub fn frames_sent(&self) -> u32 {
        self.frames_sent
    }

    pub fn game_ticks(&self) -> u64 {
        self.game_ticks
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn remake_count(&self) -> u8 {
        self.remake_count
    }

    pub fn game_over_at(&self) -> Option<u64> {
        self.game_over_at
    }

    pub fn stats(&self) -> Option<&StatsCollector> {
        self.stats.as_ref()
    }

    pub fn bannable_history(&self) -> impl Iterator<Item = &BannableEntry> {
        self.bannable.iter()
    }

    /// Whether two users are still known to be synchronized
    pub fn is_synced(&self, a: u8, b: u8) -> bool {
        self.sync_graph.get(&a).map(|peers| peers.contains(&b)).unwrap_or(false)
    }

    pub fn uptime_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at) / 1000
    }

    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn take_events(&mut self) -> Vec<GameEvent> {
        std::mem::take(&mut self.events)
    }

    /// Gives a remade session its new host counter and history id
    pub fn set_identity(&mut self, host_counter: u32, game_id: u64) -> Result<(), GameError> {
        self.game_info = Self::build_game_info(&self.name, &self.map, &self.config, host_counter, self.entry_key)?;
        self.host_counter = host_counter;
        self.game_id = game_id;
        Ok(())
    }

    fn has_referees(&self) -> bool {
        self.map.observers == ObserverMode::Referees
    }

    /// A UID not held by any user, virtual user, pending leaver or recently refreshed occupant
    pub(crate) fn new_uid(&self) -> Option<u8> {
        let pending: HashSet<u8> = self.queue.pending_leavers().collect();
        (1..0xFFu8).find(|&uid| {
            !pending.contains(&uid)
                && Some(uid) != self.virtual_host_uid
                && !self.users.iter().any(|u| u.uid == uid || u.old_uid == uid)
                && !self.virtual_users.iter().any(|v| v.uid == uid || v.old_uid == uid)
        })
    }

    /// UID used as the sender of host chat and map transfers
    pub(crate) fn host_uid(&self) -> u8 {
        self.virtual_host_uid
            .or_else(|| self.virtual_users.first().map(|v| v.uid))
            .or_else(|| self.users.iter().next().map(|u| u.uid))
            .unwrap_or(1)
    }

    pub(crate) fn send_to(&mut self, uid: u8, data: Vec<u8>) {
        let Some(user) = self.users.get_mut(uid) else {
            return;
        };
        let conn = user.conn;
        let disconnected = user.is_gproxy_disconnected();
        if let Some(gproxy) = user.gproxy.as_mut() {
            if data.first() == Some(&W3GS_HEADER) {
                gproxy.record_sent(&data);
            }
        }
        if !disconnected {
            self.outgoing.push(Outgoing::Send { conn, data });
        }
    }

    pub(crate) fn send_conn(&mut self, conn: ConnId, data: Vec<u8>) {
        self.outgoing.push(Outgoing::Send { conn, data });
    }

    pub(crate) fn send_all(&mut self, data: Vec<u8>) {
        for uid in self.users.uids() {
            self.send_to(uid, data.clone());
        }
    }

    pub(crate) fn send_all_except(&mut self, except: u8, data: Vec<u8>) {
        for uid in self.users.uids() {
            if uid != except {
                self.send_to(uid, data.clone());
            }
        }
    }

    pub(crate) fn close_conn(&mut self, conn: ConnId) {
        self.draining.insert(conn);
        self.outgoing.push(Outgoing::Close { conn });
    }

    fn chat_packet(&self, to: &[u8], message: &str) -> Option<Vec<u8>> {
        let mut end = message.len().min(MAX_CHAT_LEN);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        let message = &message[..end];
        let result = match self.state {
            GameState::Lobby => w3gs::chat_from_host(self.host_uid(), to, chat_flag::MESSAGE, &[], message),
            _ => w3gs::chat_from_host(self.host_uid(), to, chat_flag::MESSAGE_EXTRA, &[0, 0, 0, 0], message),
        };
        match result {
            Ok(packet) => Some(packet),
            Err(e) => {
                debug!("{} chat not sent: {}", self.prefix(), e);
                None
            }
        }
    }

    /// Chat from the host to one user
    pub fn send_chat(&mut self, uid: u8, message: &str) {
        if self.state == GameState::Loading {
            return;
        }
        if let Some(packet) = self.chat_packet(&[uid], message) {
            self.send_to(uid, packet);
        }
    }

    /// Chat from the host to everyone
    pub fn send_all_chat(&mut self, message: &str) {
        info!("{} [Local]: {}", self.prefix(), message);
        if self.state == GameState::Loading {
            return;
        }
        let uids = self.users.uids();
        if uids.is_empty() {
            return;
        }
        if let Some(packet) = self.chat_packet(&uids, message) {
            self.send_all(packet);
        }
    }

    pub(crate) fn send_slot_info(&mut self) {
        if self.state != GameState::Lobby {
            return;
        }
        let packet = w3gs::slot_info(self.slots.slots(), self.random_seed, self.map.layout, self.map.num_players);
        self.send_all(packet);
    }

    fn push_bannable(&mut self, name: &str, ip: String, left_at: Option<u64>) {
        if self.config.bannable_history_size == 0 {
            return;
        }
        self.bannable.retain(|b| !b.name.eq_ignore_ascii_case(name));
        if self.bannable.len() >= self.config.bannable_history_size {
            self.bannable.pop_front();
        }
        self.bannable.push_back(BannableEntry {
            name: name.to_string(),
            ip,
            left_at,
        });
    }

    /// Decodes one complete packet from a connection and acts on it
    pub fn receive(&mut self, conn: ConnId, addr: SocketAddr, data: &[u8], now: u64) {
        if self.exiting {
            return;
        }
        match data.first() {
            Some(&W3GS_HEADER) => match w3gs::parse_client_packet(data) {
                Ok(packet) => self.dispatch(conn, addr, packet, now),
                Err(e) => self.on_malformed(conn, data, &e.to_string(), now),
            },
            Some(&GPS_HEADER) => self.receive_gps(conn, addr, data, now),
            _ => {
                warn!("{} [{}] sent an unknown header, closing", self.prefix(), addr);
                self.on_malformed(conn, data, "unknown header", now);
            }
        }
    }

    fn on_malformed(&mut self, conn: ConnId, data: &[u8], reason: &str, now: u64) {
        match self.users.find_by_conn(conn) {
            Some(uid) => {
                warn!("{} user [{}] sent a malformed packet: {}", self.prefix(), uid, reason);
                self.remove_user(uid, "sent a malformed packet", LeaveCode::Disconnect, now);
            }
            None => {
                if data.get(1) == Some(&w3gs::id::REQJOIN) {
                    self.send_conn(conn, w3gs::reject_join(RejectReason::Full));
                }
                self.close_conn(conn);
            }
        }
    }

    fn dispatch(&mut self, conn: ConnId, addr: SocketAddr, packet: ClientPacket, now: u64) {
        let Some(uid) = self.users.find_by_conn(conn) else {
            match packet {
                ClientPacket::ReqJoin(request) => self.handle_join(conn, addr, request, now),
                ClientPacket::SearchGame => {}
                other => {
                    debug!("{} ignoring {:?} from unknown connection {}", self.prefix(), other, conn);
                    self.close_conn(conn);
                }
            }
            return;
        };
        if let Some(user) = self.users.get_mut(uid) {
            user.last_seen = now;
            if let Some(gproxy) = user.gproxy.as_mut() {
                gproxy.total_received = gproxy.total_received.wrapping_add(1);
            }
        }
        match packet {
            ClientPacket::ReqJoin(_) => debug!("{} duplicate join from [{}]", self.prefix(), uid),
            ClientPacket::LeaveGame { reason } => {
                let code = match self.state {
                    GameState::Lobby => LeaveCode::Lobby,
                    _ => LeaveCode::from_u32(reason).unwrap_or(LeaveCode::Lost),
                };
                self.remove_user(uid, "has left the game voluntarily", code, now);
            }
            ClientPacket::GameLoadedSelf => self.on_game_loaded(uid, now),
            ClientPacket::OutgoingAction { action, .. } => self.on_action(uid, action, now),
            ClientPacket::KeepAlive { checksum } => self.on_keepalive(uid, checksum, now),
            ClientPacket::ChatToHost(chat) => self.on_chat(uid, chat),
            ClientPacket::DropReq => self.on_drop_vote(uid, now),
            ClientPacket::MapSize(size) => self.on_map_size(uid, size, now),
            ClientPacket::PongToHost { value } => {
                if let Some(user) = self.users.get_mut(uid) {
                    user.add_rtt((now as u32).wrapping_sub(value));
                }
            }
            ClientPacket::SearchGame | ClientPacket::Unknown { .. } => {}
        }
    }

    /// The network lost or closed a connection
    pub fn connection_closed(&mut self, conn: ConnId, now: u64) {
        if let Some(uid) = self.users.find_by_conn(conn) {
            let gproxy = self.users.get(uid).map(GameUser::uses_gproxy).unwrap_or(false);
            if self.state != GameState::Lobby && gproxy && self.game_over_at.is_none() {
                self.on_gproxy_disconnect(uid, now);
            } else {
                let code = if self.state == GameState::Lobby {
                    LeaveCode::Lobby
                } else {
                    LeaveCode::Disconnect
                };
                self.remove_user(uid, "has lost the connection", code, now);
            }
        }
        if self.draining.remove(&conn) && self.lobby_loading && self.draining.is_empty() {
            self.lobby_loading = false;
            info!("{} previous connections drained, lobby open", self.prefix());
            self.last_discovery_at = None;
        }
    }

    /// Removes a user for good, wherever the game is
    pub(crate) fn remove_user(&mut self, uid: u8, reason: &str, code: LeaveCode, now: u64) {
        let Some(mut user) = self.users.remove_user(uid) else {
            return;
        };
        user.set_left(reason, code);
        info!("{} {} {}", self.prefix(), user.name, reason);
        if !user.is_gproxy_disconnected() {
            self.close_conn(user.conn);
        }
        let ip = std::net::Ipv4Addr::from(user.external_ip()).to_string();

        if self.state == GameState::Lobby {
            if let Some(sid) = self.slots.find_by_uid(uid) {
                self.slots.vacate(sid);
            }
            self.send_all(w3gs::player_leave_others(uid, code));
            self.last_leave_at = Some(now);
            self.push_bannable(&user.name, ip, Some(now));
            if let Some(countdown) = self.countdown {
                if !countdown.forced {
                    self.countdown = None;
                    self.send_all_chat("Countdown aborted!");
                    info!("{} countdown aborted", self.prefix());
                }
            }
            self.create_virtual_host();
            self.send_slot_info();
            return;
        }

        if self.state == GameState::Loading {
            self.send_all(w3gs::player_leave_others(uid, code));
        } else {
            self.queue.add_leaver(uid, code);
        }
        if let Some(player) = self.game_players.iter_mut().find(|p| p.uid == uid) {
            player.left_at = Some(now);
            player.left_reason = reason.to_string();
        }
        self.push_bannable(&user.name, ip, Some(now));
        self.sync_graph.remove(&uid);
        for peers in self.sync_graph.values_mut() {
            peers.remove(&uid);
        }
        if self.state == GameState::Playing || self.state == GameState::Over {
            let name = user.display_name(self.hide_names);
            self.send_all_chat(&format!("{} {}", name, reason));
        }

        if self.users.is_empty() && self.game_over_at.is_none() {
            if self.remake_count < self.config.remake_quota {
                self.remake(now);
            } else {
                self.set_game_over(now, 0, "all players left");
            }
            return;
        }
        if self.state == GameState::Loading {
            self.check_all_loaded(now);
        }
    }

    /// Back to a fresh lobby after everyone left a started game
    fn remake(&mut self, now: u64) {
        self.remake_count += 1;
        info!("{} remaking ({} of {})", self.prefix(), self.remake_count, self.config.remake_quota);
        if self.playing_started_at.is_some() {
            info!(
                "{} abandoned after {} ticks, discarding its stats and records",
                self.prefix(),
                self.game_ticks
            );
        }
        for conn in self.users.iter().map(|u| u.conn).collect::<Vec<_>>() {
            self.close_conn(conn);
        }
        self.users = UserRoster::new(self.map.slots.len());
        self.slots = SlotTable::new(&self.map);
        self.virtual_users.clear();
        self.virtual_host_uid = None;
        self.queue = FrameQueue::new();
        self.state = GameState::Lobby;
        self.lagging = false;
        self.desynced = false;
        self.paused = false;
        self.hide_names = false;
        self.countdown = None;
        self.loading_started_at = None;
        self.playing_started_at = None;
        self.frames_sent = 0;
        self.game_ticks = 0;
        self.frames_since_equalizer = 0;
        self.game_over_at = None;
        self.stats = None;
        self.sync_graph.clear();
        self.game_players.clear();
        self.random_seed = rand::random();
        self.last_leave_at = Some(now);
        self.last_discovery_at = None;
        self.lobby_loading = !self.draining.is_empty();
        self.create_virtual_host();
        self.events.push(GameEvent::Remade);
    }

    /// Runs every timer that is due
    pub fn update(&mut self, now: u64) {
        if self.exiting {
            return;
        }
        match self.state {
            GameState::Lobby => self.update_lobby(now),
            GameState::Loading => {
                self.update_gproxy(now);
                self.check_timeouts(now);
            }
            GameState::Playing | GameState::Over => self.update_playing(now),
        }
    }

    fn check_timeouts(&mut self, now: u64) {
        let timeout_ms = self.config.connection_timeout_secs * 1000;
        for uid in self.users.check_timeouts(now, timeout_ms) {
            self.remove_user(uid, "has lost the connection (timed out)", LeaveCode::Disconnect, now);
        }
    }

    /// Milliseconds until the next timer is due
    pub fn next_timeout(&self, now: u64) -> u64 {
        if self.exiting {
            return u64::MAX;
        }
        let mut deadlines = Vec::new();
        match self.state {
            GameState::Lobby => {
                deadlines.push(self.last_ping_at + self.config.lobby_ping_interval_ms);
                deadlines.push(self.last_discovery_at.map(|t| t + DISCOVERY_INTERVAL_MS).unwrap_or(now));
                if let Some(countdown) = self.countdown {
                    deadlines.push(countdown.next_tick_at);
                }
                if self.users.iter().any(|u| u.map_transfer.is_some()) {
                    deadlines.push(now + 10);
                }
            }
            GameState::Loading => {}
            GameState::Playing | GameState::Over => {
                if !self.lagging {
                    deadlines.push(self.last_frame_at + u64::from(self.config.latency_ms));
                } else {
                    deadlines.push(now + 1000);
                }
                if let Some(at) = self.game_over_at {
                    deadlines.push(at + self.game_over_tolerance_ms);
                }
            }
        }
        for user in self.users.iter() {
            if let Some(at) = user.gproxy.as_ref().and_then(|g| g.disconnected_at) {
                deadlines.push(at + self.config.reconnect_wait_ms(user.uses_gproxy_extended()));
            }
        }
        deadlines.push(now + 1000);
        deadlines.into_iter().min().map(|d| d.saturating_sub(now)).unwrap_or(0)
    }

    /// Ends the game now, e.g. on shutdown
    pub fn shutdown(&mut self, now: u64) {
        if self.exiting {
            return;
        }
        if self.game_over_at.is_none() && self.state != GameState::Lobby {
            self.set_game_over(now, 0, "host shutdown");
        }
        self.teardown(now);
    }
}
