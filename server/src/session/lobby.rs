//! Lobby-time behavior: countdown, slot commands, fake users, map uploads,
//! discovery and chat relay

use super::{Countdown, Game, GameEvent, GamePlayer, GameState, Outgoing, DISCOVERY_INTERVAL_MS};
use crate::hcl;
use crate::user::MapTransfer;
use crate::virtual_user::VirtualUser;
use log::{debug, info, warn};
use shared::w3gs::{self, chat_flag, ChatToHost, ChatToHostKind, MapSize, MAP_PART_SIZE};
use shared::{ComputerSkill, LeaveCode, Occupant, Race};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Why a countdown did not start
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CountdownRefusal {
    #[error("the game is not in the lobby")]
    NotInLobby,
    #[error("the countdown is already running")]
    AlreadyRunning,
    #[error("nobody has joined")]
    Empty,
    #[error("players still downloading the map: {}", .0.join(", "))]
    Downloading(Vec<String>),
    #[error("at least two teams are needed")]
    TooFewTeams,
    #[error("players with high or unknown ping: {}", .0.join(", "))]
    HighPing(Vec<String>),
    #[error("players not verified: {}", .0.join(", "))]
    Unverified(Vec<String>),
    #[error("someone left moments ago")]
    RecentLeave,
}

/// Slot arrangements applied in one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutPreset {
    FreeForAll,
    HumansVsAi { human_team: u8, ai_team: u8 },
    OneVsAll(u8),
    Compact,
}

impl Game {
    pub(crate) fn update_lobby(&mut self, now: u64) {
        if self.lobby_loading {
            return;
        }
        if now >= self.last_ping_at + self.config.lobby_ping_interval_ms {
            self.last_ping_at = now;
            self.send_all(w3gs::ping_from_host(now as u32));
        }
        let discovery_due = self
            .last_discovery_at
            .map(|at| now >= at + DISCOVERY_INTERVAL_MS)
            .unwrap_or(true);
        if discovery_due {
            self.broadcast_discovery(now);
        }
        self.pump_map_transfers(now);
        self.check_timeouts(now);
        self.tick_countdown(now);
    }

    fn broadcast_discovery(&mut self, now: u64) {
        if self.last_discovery_at.is_none() {
            self.outgoing
                .push(Outgoing::Discovery(w3gs::create_game(self.game_version, self.host_counter)));
        }
        self.last_discovery_at = Some(now);
        self.outgoing.push(Outgoing::Discovery(self.render_game_info(now)));
        let players = (self.users.len() + self.virtual_users.len()) as u32;
        let total = self.slots.len() as u32;
        self.outgoing
            .push(Outgoing::Discovery(w3gs::refresh_game(self.host_counter, players, total)));
    }

    fn render_game_info(&self, now: u64) -> Vec<u8> {
        let total = self.slots.len();
        let open = self.slots.slots().iter().filter(|s| s.is_open()).count();
        let available_off = if open == total { total } else { open + 1 };
        self.game_info.render(
            self.game_version,
            available_off as u32,
            self.uptime_secs(now) as u32,
            self.host_port,
        )
    }

    /// GAMEINFO for a LAN client that searched for games, while the lobby is joinable
    pub fn game_info_reply(&self, now: u64) -> Option<Vec<u8>> {
        if self.state != GameState::Lobby || self.lobby_loading || self.exiting {
            return None;
        }
        Some(self.render_game_info(now))
    }

    /// Starts the countdown; `force` skips every readiness check at once
    pub fn start_countdown(&mut self, force: bool, now: u64) -> Result<(), CountdownRefusal> {
        let result = self.check_countdown(force, now);
        match &result {
            Ok(()) => {
                info!("{} countdown started{}", self.prefix(), if force { " (forced)" } else { "" });
                self.countdown = Some(Countdown {
                    value: self.config.countdown_start_value,
                    forced: force,
                    next_tick_at: now,
                });
            }
            Err(refusal) => {
                let message = format!("Countdown refused: {}", refusal);
                self.send_all_chat(&message);
            }
        }
        result
    }

    fn check_countdown(&self, force: bool, now: u64) -> Result<(), CountdownRefusal> {
        if self.state != GameState::Lobby || self.lobby_loading {
            return Err(CountdownRefusal::NotInLobby);
        }
        if self.countdown.is_some() {
            return Err(CountdownRefusal::AlreadyRunning);
        }
        if self.users.is_empty() {
            return Err(CountdownRefusal::Empty);
        }
        if force {
            return Ok(());
        }

        let downloading: Vec<String> = self
            .users
            .iter()
            .filter(|u| {
                let status = self.slots.find_by_uid(u.uid).and_then(|sid| self.slots.get(sid)).map(|s| s.download_status);
                !u.map_ready || status != Some(100)
            })
            .map(|u| u.name.clone())
            .collect();
        if !downloading.is_empty() {
            return Err(CountdownRefusal::Downloading(downloading));
        }
        if !self.saved_game && self.slots.occupied_teams().len() < 2 {
            return Err(CountdownRefusal::TooFewTeams);
        }
        if self.config.auto_kick_ping_ms > 0 {
            let laggy: Vec<String> = self
                .users
                .iter()
                .filter(|u| u.rtt().map(|rtt| rtt > self.config.auto_kick_ping_ms).unwrap_or(true))
                .map(|u| u.name.clone())
                .collect();
            if !laggy.is_empty() {
                return Err(CountdownRefusal::HighPing(laggy));
            }
        }
        if self.require_verified {
            let unverified: Vec<String> = self.users.iter().filter(|u| !u.verified).map(|u| u.name.clone()).collect();
            if !unverified.is_empty() {
                return Err(CountdownRefusal::Unverified(unverified));
            }
        }
        if let Some(left_at) = self.last_leave_at {
            if now < left_at + self.config.min_leave_cooldown_ms {
                return Err(CountdownRefusal::RecentLeave);
            }
        }
        Ok(())
    }

    pub fn stop_countdown(&mut self) -> bool {
        if self.countdown.take().is_some() {
            self.send_all_chat("Countdown stopped!");
            true
        } else {
            false
        }
    }

    fn tick_countdown(&mut self, now: u64) {
        let Some(mut countdown) = self.countdown else {
            return;
        };
        if now < countdown.next_tick_at {
            return;
        }
        if countdown.value > 0 {
            self.send_all_chat(&format!("{}. . .", countdown.value));
            countdown.value -= 1;
            countdown.next_tick_at += self.config.countdown_interval_ms;
            self.countdown = Some(countdown);
        } else {
            self.start_loading(now);
        }
    }

    fn start_loading(&mut self, now: u64) {
        self.countdown = None;
        let missing: Vec<u8> = self.users.iter().filter(|u| !u.map_ready).map(|u| u.uid).collect();
        for uid in missing {
            self.remove_user(uid, "was kicked for not having the map", LeaveCode::Lobby, now);
        }
        if self.users.is_empty() {
            warn!("{} nobody left to start the game with", self.prefix());
            return;
        }

        self.delete_virtual_host();
        if self.users.len() + self.virtual_users.len() < 2 {
            self.add_fake_user(false);
        }
        if !self.hcl_command.is_empty() {
            let command = self.hcl_command.clone();
            match hcl::encode(&command, self.slots.slots_mut()) {
                Ok(()) => info!("{} encoded HCL command [{}]", self.prefix(), command),
                Err(e) => warn!("{} HCL command not applied: {}", self.prefix(), e),
            }
        }
        self.send_slot_info();
        self.send_all(w3gs::countdown_start());
        self.send_all(w3gs::countdown_end());

        self.state = GameState::Loading;
        self.loading_started_at = Some(now);
        self.outgoing
            .push(Outgoing::Discovery(w3gs::decreate_game(self.host_counter)));
        let loaded: Vec<Vec<u8>> = self.virtual_users.iter().map(VirtualUser::game_loaded_bytes).collect();
        for packet in loaded {
            self.send_all(packet);
        }

        let mut players = Vec::new();
        for user in self.users.iter_mut() {
            let Some(sid) = self.slots.find_by_uid(user.uid) else {
                continue;
            };
            user.observer = self.slots.is_observer(sid);
            user.map_transfer = None;
            user.last_seen = now;
            if let Some(slot) = self.slots.get(sid) {
                players.push(GamePlayer {
                    uid: user.uid,
                    sid,
                    name: user.name.clone(),
                    ip: Ipv4Addr::from(user.external_ip()).to_string(),
                    color: slot.color,
                    team: slot.team,
                    left_at: None,
                    left_reason: String::new(),
                });
            }
        }
        self.game_players = players;
        self.players_at_start = self.users.iter().filter(|u| !u.observer).count();
        self.events.push(GameEvent::Started);
        if self.announcer.is_enabled() {
            let message = format!("Game [{}] started with {} players", self.name, self.users.len());
            self.announcer.queue_chat(&message);
        }
        info!("{} started loading with {} players", self.prefix(), self.users.len());
    }

    pub(crate) fn create_virtual_host(&mut self) {
        if self.virtual_host_uid.is_some() || self.state != GameState::Lobby {
            return;
        }
        if self.users.len() + self.virtual_users.len() + 1 > self.map.version_max_slots as usize {
            return;
        }
        let Some(uid) = self.new_uid() else {
            return;
        };
        match w3gs::player_info_exclude_ip(uid, &self.config.virtual_host_name) {
            Ok(packet) => {
                self.virtual_host_uid = Some(uid);
                self.send_all(packet);
            }
            Err(e) => warn!("{} virtual host not created: {}", self.prefix(), e),
        }
    }

    pub(crate) fn delete_virtual_host(&mut self) {
        if let Some(uid) = self.virtual_host_uid.take() {
            self.send_all(w3gs::player_leave_others(uid, LeaveCode::Lobby));
        }
    }

    /// Adds a fake user to the first open slot
    pub fn create_fake_user(&mut self) -> Option<u8> {
        self.add_fake_user(true)
    }

    fn add_fake_user(&mut self, keep_joinable: bool) -> Option<u8> {
        if self.state != GameState::Lobby {
            return None;
        }
        let sid = self.slots.first_open()?;
        if keep_joinable && !self.slots.can_lock_for_joins(sid) {
            return None;
        }
        if self.users.len() + self.virtual_users.len() + 2 > self.map.version_max_slots as usize {
            self.delete_virtual_host();
        }
        let uid = self.new_uid()?;
        if !self.slots.occupy(sid, uid, Occupant::Fake, 100) {
            return None;
        }
        let mut fake = VirtualUser::new(
            sid,
            uid,
            format!("User[{}]", sid as u16 + 1),
            self.config.pauses_per_player,
            self.config.saves_per_player,
        );
        fake.observer = self.slots.is_observer(sid);
        match fake.player_info_bytes() {
            Ok(packet) => self.send_all(packet),
            Err(e) => warn!("{} fake user entry not sent: {}", self.prefix(), e),
        }
        info!("{} added {} as [{}]", self.prefix(), fake.display_name(), uid);
        self.virtual_users.push(fake);
        self.send_slot_info();
        Some(uid)
    }

    pub fn delete_fake_user(&mut self, sid: u8) -> bool {
        if self.state != GameState::Lobby {
            return false;
        }
        let Some(index) = self.virtual_users.iter().position(|v| v.sid == sid) else {
            return false;
        };
        let fake = self.virtual_users.remove(index);
        self.slots.vacate(sid);
        self.send_all(fake.game_quit_bytes(LeaveCode::Lobby));
        self.send_slot_info();
        self.create_virtual_host();
        true
    }

    pub fn delete_fake_users(&mut self) -> usize {
        let sids: Vec<u8> = self.virtual_users.iter().map(|v| v.sid).collect();
        sids.into_iter().filter(|&sid| self.delete_fake_user(sid)).count()
    }

    /// Fills every open slot that can be taken without locking the lobby
    pub fn fill_fake_users(&mut self) -> usize {
        let mut added = 0;
        while self.create_fake_user().is_some() {
            added += 1;
        }
        added
    }

    /// Keeps fake users pointing at their slots after occupants moved
    fn sync_virtual_sids(&mut self) {
        for fake in self.virtual_users.iter_mut() {
            if let Some(sid) = self.slots.find_by_uid(fake.uid) {
                fake.sid = sid;
                fake.observer = self.slots.is_observer(sid);
            }
        }
    }

    fn slot_changed(&mut self, changed: bool) -> bool {
        if changed {
            self.sync_virtual_sids();
            self.send_slot_info();
        }
        changed
    }

    /// Empties a slot's occupant, kicking a player only when `kick` is set
    fn clear_occupant(&mut self, sid: u8, kick: bool, now: u64) -> bool {
        let Some(slot) = self.slots.get(sid) else {
            return false;
        };
        match slot.occupant {
            Occupant::Player => {
                if !kick {
                    return false;
                }
                let uid = slot.uid;
                self.remove_user(uid, "was kicked by the host", LeaveCode::Lobby, now);
                true
            }
            Occupant::Fake => self.delete_fake_user(sid),
            _ => true,
        }
    }

    pub fn open_slot(&mut self, sid: u8, kick: bool, now: u64) -> bool {
        if self.state != GameState::Lobby || !self.slots.is_editable(sid) {
            return false;
        }
        if !self.clear_occupant(sid, kick, now) {
            return false;
        }
        let changed = self.slots.open(sid);
        self.slot_changed(changed)
    }

    pub fn close_slot(&mut self, sid: u8, kick: bool, now: u64) -> bool {
        if self.state != GameState::Lobby || !self.slots.is_editable(sid) || !self.slots.can_lock_after_vacate(sid) {
            return false;
        }
        if !self.clear_occupant(sid, kick, now) {
            return false;
        }
        let changed = self.slots.close(sid);
        self.slot_changed(changed)
    }

    pub fn computer_slot(&mut self, sid: u8, skill: ComputerSkill, kick: bool, now: u64) -> bool {
        if self.state != GameState::Lobby || !self.slots.accepts_computer(sid) {
            return false;
        }
        if !self.clear_occupant(sid, kick, now) {
            return false;
        }
        let changed = self.slots.set_computer(sid, skill);
        self.slot_changed(changed)
    }

    pub fn swap_slots(&mut self, sid1: u8, sid2: u8) -> bool {
        if self.state != GameState::Lobby {
            return false;
        }
        let changed = self.slots.swap(sid1, sid2);
        self.slot_changed(changed)
    }

    pub fn set_slot_team(&mut self, sid: u8, team: u8, force: bool) -> bool {
        if self.state != GameState::Lobby {
            return false;
        }
        let changed = self.slots.set_team(sid, team, force);
        self.slot_changed(changed)
    }

    pub fn set_slot_color(&mut self, sid: u8, color: u8, force: bool) -> bool {
        if self.state != GameState::Lobby {
            return false;
        }
        let changed = self.slots.set_color(sid, color, force);
        self.slot_changed(changed)
    }

    pub fn apply_layout(&mut self, preset: LayoutPreset) -> bool {
        if self.state != GameState::Lobby {
            return false;
        }
        let changed = match preset {
            LayoutPreset::FreeForAll => self.slots.set_layout_ffa(),
            LayoutPreset::HumansVsAi { human_team, ai_team } => self.slots.set_layout_humans_vs_ai(human_team, ai_team),
            LayoutPreset::OneVsAll(sid) => self.slots.set_layout_one_vs_all(sid),
            LayoutPreset::Compact => self.slots.set_layout_compact(),
        };
        self.slot_changed(changed)
    }

    pub fn kick(&mut self, name: &str, now: u64) -> bool {
        let Some(uid) = self.users.find_by_name(name) else {
            return false;
        };
        let code = if self.state == GameState::Lobby {
            LeaveCode::Lobby
        } else {
            LeaveCode::Lost
        };
        self.remove_user(uid, "was kicked by the host", code, now);
        true
    }

    /// Replaces the host command line sent to the map when loading starts
    pub fn set_hcl(&mut self, command: &str) -> Result<(), hcl::HclError> {
        hcl::validate(command)?;
        self.hcl_command = command.to_string();
        Ok(())
    }

    pub(crate) fn on_map_size(&mut self, uid: u8, size: MapSize, now: u64) {
        if self.state != GameState::Lobby {
            return;
        }
        let Some(sid) = self.slots.find_by_uid(uid) else {
            return;
        };
        let map_size = self.map.size;
        if size.size_flag == 1 && size.map_size == map_size {
            let mut finished = false;
            if let Some(user) = self.users.get_mut(uid) {
                user.map_ready = true;
                finished = user.map_transfer.take().is_some();
            }
            if finished {
                info!("{} [{}] finished downloading the map", self.prefix(), uid);
            }
            let changed = self.slots.set_download_status(sid, 100);
            self.slot_changed(changed);
            return;
        }

        let can_upload = self.config.allow_map_downloads
            && self.map_data.as_ref().map(|d| d.len() as u64 == u64::from(map_size)).unwrap_or(false);
        if !can_upload {
            self.remove_user(uid, "doesn't have the map and map downloads are disabled", LeaveCode::Lobby, now);
            return;
        }
        let Some(current) = self.users.get(uid).map(|u| u.map_transfer) else {
            return;
        };
        let (transfer, percent) = match current {
            None => {
                info!("{} uploading the map to [{}]", self.prefix(), uid);
                self.send_to(uid, w3gs::start_download(self.host_uid()));
                let transfer = MapTransfer {
                    sent: 0,
                    acked: 0,
                    started_at: now,
                };
                (transfer, 0)
            }
            Some(mut transfer) => {
                transfer.acked = (size.map_size as usize).max(transfer.acked);
                let percent = (transfer.acked as u64 * 100 / u64::from(map_size.max(1))).min(100) as u8;
                (transfer, percent)
            }
        };
        if let Some(user) = self.users.get_mut(uid) {
            user.map_transfer = Some(transfer);
        }
        let changed = self.slots.set_download_status(sid, percent);
        self.slot_changed(changed);
    }

    /// Sends map parts up to the in-flight window and the upload rate cap
    fn pump_map_transfers(&mut self, now: u64) {
        let Some(data) = self.map_data.clone() else {
            return;
        };
        let window = self.config.max_parallel_map_packets as usize * MAP_PART_SIZE;
        let kbps = u64::from(self.config.max_upload_kbps);
        let host = self.host_uid();
        for uid in self.users.uids() {
            let Some(user) = self.users.get_mut(uid) else {
                continue;
            };
            let Some(mut transfer) = user.map_transfer else {
                continue;
            };
            let mut limit = data.len().min(transfer.acked + window);
            if kbps > 0 {
                let elapsed = now.saturating_sub(transfer.started_at);
                let allowed = (elapsed * kbps * 1024 / 8 / 1000) as usize + MAP_PART_SIZE;
                limit = limit.min(allowed);
            }
            let mut packets = Vec::new();
            while transfer.sent < limit {
                match w3gs::map_part(host, uid, transfer.sent, &data) {
                    Some((packet, end)) => {
                        packets.push(packet);
                        transfer.sent = end;
                    }
                    None => break,
                }
            }
            user.map_transfer = Some(transfer);
            if !packets.is_empty() {
                debug!("{} sent {} map parts to [{}]", self.prefix(), packets.len(), uid);
            }
            for packet in packets {
                self.send_to(uid, packet);
            }
        }
    }

    pub(crate) fn on_chat(&mut self, uid: u8, chat: ChatToHost) {
        if chat.from_uid != uid {
            debug!("{} [{}] sent chat as [{}]", self.prefix(), uid, chat.from_uid);
            return;
        }
        match chat.kind {
            ChatToHostKind::Message(message) => self.relay_chat(uid, &chat.to_uids, chat_flag::MESSAGE, &[], &message),
            ChatToHostKind::MessageExtra { extra_flags, message } => {
                self.relay_chat(uid, &chat.to_uids, chat_flag::MESSAGE_EXTRA, &extra_flags, &message)
            }
            setting => {
                if self.state != GameState::Lobby || self.countdown.is_some() {
                    return;
                }
                let Some(sid) = self.slots.find_by_uid(uid) else {
                    return;
                };
                let changed = match setting {
                    ChatToHostKind::TeamChange(team) => self.slots.set_team(sid, team, false),
                    ChatToHostKind::ColorChange(color) => self.slots.set_color(sid, color, false),
                    ChatToHostKind::RaceChange(race) => {
                        Race::from_byte(race).map(|race| self.slots.set_race(sid, race)).unwrap_or(false)
                    }
                    ChatToHostKind::HandicapChange(handicap) => self.slots.set_handicap(sid, handicap),
                    _ => false,
                };
                self.slot_changed(changed);
            }
        }
    }

    fn relay_chat(&mut self, from: u8, to_uids: &[u8], flag: u8, extra: &[u8], message: &str) {
        if self.state == GameState::Loading {
            return;
        }
        let name = self
            .users
            .get(from)
            .map(|u| u.display_name(self.hide_names))
            .unwrap_or_default();
        info!("{} [{}]: {}", self.prefix(), name, message);
        let recipients: Vec<u8> = to_uids
            .iter()
            .copied()
            .filter(|&to| to != from && self.users.get(to).is_some())
            .collect();
        if recipients.is_empty() {
            return;
        }
        match w3gs::chat_from_host(from, &recipients, flag, extra, message) {
            Ok(packet) => {
                for to in recipients {
                    self.send_to(to, packet.clone());
                }
            }
            Err(e) => debug!("{} chat from [{}] dropped: {}", self.prefix(), from, e),
        }
    }
}
