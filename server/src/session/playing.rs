//! Loading, the action clock, lag and desync handling, stats and game over

use super::{Game, GameEvent, GameState, StatsCollector};
use crate::action_queue::{equalizer_target, step_offset, FrameCallback};
use crate::config::{DesyncHandler, HideNamesMode};
use crate::dota_stats::DotaStats;
use crate::map::StatsKind;
use crate::persistence::{GameRecord, Persistence, PersistenceError, PlayerRecord};
use crate::w3mmd::{MmdDelays, StatsContext, W3mmd};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use shared::w3gs::{self, action, ACTION_BATCH_LIMIT, ACTION_HEADER_SIZE};
use shared::{IncomingAction, LeaveCode};
use std::collections::{BTreeMap, HashSet};

/// Frames relayed in one update when the clock fell behind
const MAX_CATCH_UP_FRAMES: u32 = 4;
const AUTO_SAVE_NAME: &[u8] = b"auto.w3z\0";

fn write_records(
    persistence: &mut dyn Persistence,
    game: GameRecord,
    players: Vec<PlayerRecord>,
) -> Result<(), PersistenceError> {
    persistence.begin()?;
    persistence.upsert_game(game)?;
    for player in players {
        persistence.upsert_player(player)?;
    }
    persistence.commit()
}

impl Game {
    pub(crate) fn on_game_loaded(&mut self, uid: u8, now: u64) {
        if self.state != GameState::Loading {
            return;
        }
        let Some(user) = self.users.get_mut(uid) else {
            return;
        };
        if user.finished_loading {
            return;
        }
        user.finished_loading = true;
        user.finished_loading_at = Some(now);
        let elapsed = now.saturating_sub(self.loading_started_at.unwrap_or(now));
        info!("{} [{}] finished loading in {} ms", self.prefix(), uid, elapsed);
        self.send_all(w3gs::game_loaded_others(uid));
        self.check_all_loaded(now);
    }

    pub(crate) fn check_all_loaded(&mut self, now: u64) {
        if self.state != GameState::Loading || self.users.is_empty() {
            return;
        }
        if self
            .users
            .iter()
            .all(|u| u.finished_loading || u.is_gproxy_disconnected())
        {
            self.start_playing(now);
        }
    }

    fn start_playing(&mut self, now: u64) {
        self.state = GameState::Playing;
        self.playing_started_at = Some(now);
        self.last_frame_at = now;
        self.frames_sent = 0;
        self.resolve_hidden_names();
        self.stats = match self.map.stats {
            StatsKind::W3mmd => Some(StatsCollector::W3mmd(W3mmd::new(
                self.name.clone(),
                MmdDelays {
                    initial_ms: self.config.mmd_initial_delay_ms,
                    definition_ms: self.config.mmd_definition_delay_ms,
                    action_ms: self.config.mmd_action_delay_ms,
                },
            ))),
            StatsKind::Dota => Some(StatsCollector::Dota(DotaStats::new(self.name.clone()))),
            StatsKind::None => None,
        };
        let uids = self.users.uids();
        self.sync_graph = uids
            .iter()
            .map(|&uid| (uid, uids.iter().copied().filter(|&other| other != uid).collect()))
            .collect();
        info!("{} everyone finished loading, the game is on", self.prefix());
    }

    /// Names are hidden in game for free-for-all shaped lobbies
    fn resolve_hidden_names(&mut self) {
        self.hide_names = match self.config.hide_in_game_names {
            HideNamesMode::Never => false,
            HideNamesMode::Always => true,
            HideNamesMode::Auto => {
                let teams: Vec<u8> = self
                    .slots
                    .slots()
                    .iter()
                    .filter(|s| s.is_occupied() && s.team != self.slots.observer_team())
                    .map(|s| s.team)
                    .collect();
                let distinct: HashSet<u8> = teams.iter().copied().collect();
                distinct.len() >= 3 && distinct.len() == teams.len()
            }
        };
        if !self.hide_names {
            return;
        }
        let mut pseudonyms: Vec<u8> = (1..=self.users.len() as u8).collect();
        pseudonyms.shuffle(&mut rand::thread_rng());
        for (user, pseudonym) in self.users.iter_mut().zip(pseudonyms) {
            user.pseudonym_uid = pseudonym;
        }
        info!("{} player names are hidden", self.prefix());
    }

    pub(crate) fn update_playing(&mut self, now: u64) {
        self.update_gproxy(now);
        self.check_timeouts(now);
        if self.exiting {
            return;
        }
        self.check_lag(now);
        if !self.lagging {
            let latency = u64::from(self.config.latency_ms);
            let mut sent = 0;
            while now >= self.last_frame_at + latency && sent < MAX_CATCH_UP_FRAMES {
                self.send_frame();
                self.last_frame_at += latency;
                sent += 1;
            }
            if now >= self.last_frame_at + latency {
                debug!("{} dropping {} ms of clock backlog", self.prefix(), now - self.last_frame_at);
                self.last_frame_at = now;
            }
        }
        self.update_stats(now);
        self.check_game_over(now);
        if let Some(at) = self.game_over_at {
            if now >= at + self.game_over_tolerance_ms || self.users.is_empty() {
                self.teardown(now);
            }
        }
    }

    /// Relays the head frame and advances the game clock by one interval
    fn send_frame(&mut self) {
        let interval = self.config.latency_ms;
        let empty_actions = self.config.gproxy_empty_actions() as usize;
        if empty_actions > 0 {
            let padded: Vec<u8> = self.users.iter().filter(|u| u.uses_gproxy()).map(|u| u.uid).collect();
            for uid in padded {
                self.send_to(uid, w3gs::empty_actions(empty_actions));
            }
        }
        let flushed = self.queue.flush(interval);
        for packet in flushed.packets {
            self.send_all(packet);
        }
        self.frames_sent += 1;
        self.game_ticks += u64::from(interval);
        match flushed.callback {
            FrameCallback::Pause => {
                self.paused = true;
                info!("{} paused by [{}]", self.prefix(), flushed.callback_uid);
            }
            FrameCallback::Resume => {
                self.paused = false;
                info!("{} resumed by [{}]", self.prefix(), flushed.callback_uid);
            }
            FrameCallback::None => {}
        }
        for (uid, code) in flushed.leavers {
            self.send_all(w3gs::player_leave_others(uid, code));
        }
        self.frames_since_equalizer += 1;
        if self.frames_since_equalizer >= self.config.ping_equalizer_period_ticks {
            self.frames_since_equalizer = 0;
            self.update_equalizer();
        }
    }

    /// Holds back users with better pings so everyone sees actions at the same time
    fn update_equalizer(&mut self) {
        if !self.config.ping_equalizer_enabled {
            return;
        }
        let Some(worst) = self.users.iter().filter_map(|u| u.rtt()).max() else {
            return;
        };
        let latency = u32::from(self.config.latency_ms);
        let cap = self.config.ping_equalizer_max_frames;
        for user in self.users.iter_mut() {
            if let Some(rtt) = user.rtt() {
                let target = equalizer_target(rtt, worst, latency, cap);
                user.equalizer_offset = step_offset(user.equalizer_offset, target);
            }
        }
        let max_offset = self.users.iter().map(|u| u.equalizer_offset).max().unwrap_or(0);
        self.queue.grow(max_offset);
        self.queue.shrink(max_offset);
    }

    fn check_lag(&mut self, now: u64) {
        let frames = self.frames_sent;
        if !self.lagging {
            let limit = self.config.sync_limit;
            let laggers: Vec<u8> = self
                .users
                .iter()
                .filter(|u| !u.is_gproxy_disconnected() && frames.saturating_sub(u.sync_counter) > limit)
                .map(|u| u.uid)
                .collect();
            if laggers.is_empty() {
                return;
            }
            for &uid in &laggers {
                if let Some(user) = self.users.get_mut(uid) {
                    user.lagging = true;
                    user.started_lagging_at = Some(now);
                }
            }
            for user in self.users.iter_mut() {
                user.drop_vote = false;
            }
            self.lagging = true;
            let screen: Vec<(u8, u32)> = laggers.iter().map(|&uid| (uid, 0)).collect();
            match w3gs::start_lag(&screen) {
                Ok(packet) => self.send_all(packet),
                Err(e) => warn!("{} lag screen not sent: {}", self.prefix(), e),
            }
            info!("{} started lagging on {:?}", self.prefix(), laggers);
            return;
        }

        let safe = self.config.sync_limit_safe;
        let drop_after = self.config.lag_drop_timeout_secs * 1000;
        let lagging: Vec<u8> = self
            .users
            .iter()
            .filter(|u| u.lagging && !u.is_gproxy_disconnected())
            .map(|u| u.uid)
            .collect();
        for uid in lagging {
            let Some(user) = self.users.get_mut(uid) else {
                continue;
            };
            let elapsed = now.saturating_sub(user.started_lagging_at.unwrap_or(now));
            if frames.saturating_sub(user.sync_counter) < safe {
                user.lagging = false;
                user.started_lagging_at = None;
                info!("{} [{}] stopped lagging after {} ms", self.prefix(), uid, elapsed);
                self.send_all(w3gs::stop_lag(uid, elapsed as u32));
            } else if drop_after > 0 && elapsed > drop_after {
                let reason = format!("was automatically dropped after {} seconds", elapsed / 1000);
                self.remove_user(uid, &reason, LeaveCode::Disconnect, now);
            }
        }
        if !self.users.iter().any(|u| u.lagging) {
            self.lagging = false;
            self.last_frame_at = now;
            for user in self.users.iter_mut() {
                user.drop_vote = false;
            }
        }
    }

    pub(crate) fn on_drop_vote(&mut self, uid: u8, now: u64) {
        if !self.lagging {
            return;
        }
        match self.users.get_mut(uid) {
            Some(user) if !user.lagging => user.drop_vote = true,
            _ => return,
        }
        let voters = self.users.iter().filter(|u| !u.lagging).count();
        let votes = self.users.iter().filter(|u| !u.lagging && u.drop_vote).count();
        info!("{} [{}] voted to drop the laggers ({}/{})", self.prefix(), uid, votes, voters);
        if votes * 2 > voters {
            let laggers: Vec<u8> = self.users.iter().filter(|u| u.lagging).map(|u| u.uid).collect();
            for lagger in laggers {
                self.remove_user(lagger, "was dropped by vote", LeaveCode::Disconnect, now);
            }
        }
    }

    pub(crate) fn on_action(&mut self, uid: u8, data: Vec<u8>, now: u64) {
        if !matches!(self.state, GameState::Playing | GameState::Over) {
            debug!("{} [{}] sent an action outside the game", self.prefix(), uid);
            return;
        }
        if ACTION_HEADER_SIZE + data.len() > ACTION_BATCH_LIMIT {
            warn!("{} [{}] sent an oversized action ({} bytes), dropped", self.prefix(), uid, data.len());
            return;
        }
        let has_referees = self.has_referees();
        let Some(user) = self.users.get_mut(uid) else {
            return;
        };
        let callback = match data.first().copied() {
            Some(action::PAUSE) => {
                if !user.can_pause(has_referees) {
                    info!("[GAME] [{}] has no pauses left", uid);
                    return;
                }
                user.remaining_pauses -= 1;
                FrameCallback::Pause
            }
            Some(action::RESUME) => {
                if !user.can_resume(has_referees) {
                    return;
                }
                FrameCallback::Resume
            }
            Some(action::SAVE) => {
                if !user.can_save(has_referees) {
                    info!("[GAME] [{}] has no saves left", uid);
                    return;
                }
                user.remaining_saves -= 1;
                FrameCallback::None
            }
            _ => FrameCallback::None,
        };
        let offset = user.equalizer_offset;
        self.feed_stats(&data, now);
        let frame = self.queue.frame_for(offset);
        if callback != FrameCallback::None {
            frame.callback = callback;
            frame.callback_uid = uid;
        }
        frame.add_action(IncomingAction::new(uid, data));
    }

    fn feed_stats(&mut self, data: &[u8], now: u64) {
        let ticks = self.game_ticks;
        let colors: Vec<u8> = self.game_players.iter().map(|p| p.color).collect();
        let winner_found = match self.stats.as_mut() {
            Some(StatsCollector::W3mmd(mmd)) => {
                mmd.recv_action(data, ticks);
                false
            }
            Some(StatsCollector::Dota(dota)) => dota.process_action(data, |color| colors.contains(&color)),
            None => false,
        };
        if winner_found && self.game_over_at.is_none() {
            let tolerance = self.config.game_over_tolerance_stats_secs * 1000;
            self.set_game_over(now, tolerance, "the map reported a winner");
        }
    }

    fn stats_context(&self) -> StatsContext {
        StatsContext {
            ticks: self.game_ticks,
            paused: self.paused,
            num_slots: self.slots.len() as u8,
            num_controllers: self.slots.controllers() as u8,
        }
    }

    fn update_stats(&mut self, now: u64) {
        let ctx = self.stats_context();
        let over = match self.stats.as_mut() {
            Some(StatsCollector::W3mmd(mmd)) => !mmd.update_queue(&ctx),
            _ => false,
        };
        if over && self.game_over_at.is_none() {
            let tolerance = self.config.game_over_tolerance_stats_secs * 1000;
            self.set_game_over(now, tolerance, "the map reported the result");
        }
    }

    pub(crate) fn on_keepalive(&mut self, uid: u8, checksum: u32, now: u64) {
        if !matches!(self.state, GameState::Playing | GameState::Over) {
            return;
        }
        let Some(user) = self.users.get_mut(uid) else {
            return;
        };
        user.sync_counter += 1;
        user.checksums.push_back(checksum);
        self.check_checksums(now);
    }

    /// Compares checksums frame by frame once every user has sent one
    fn check_checksums(&mut self, now: u64) {
        let mut diverged = Vec::new();
        loop {
            let uids = self.users.uids();
            let ready = !uids.is_empty()
                && self.users.iter().all(|u| !u.checksums.is_empty());
            if !ready {
                break;
            }
            let fronts: Vec<(u8, u32)> = self
                .users
                .iter_mut()
                .filter_map(|u| u.checksums.pop_front().map(|c| (u.uid, c)))
                .collect();
            for (i, &(a, checksum_a)) in fronts.iter().enumerate() {
                for &(b, checksum_b) in &fronts[i + 1..] {
                    if checksum_a != checksum_b && self.is_synced(a, b) {
                        if let Some(peers) = self.sync_graph.get_mut(&a) {
                            peers.remove(&b);
                        }
                        if let Some(peers) = self.sync_graph.get_mut(&b) {
                            peers.remove(&a);
                        }
                        diverged.push((a, b));
                    }
                }
            }
        }
        if diverged.is_empty() {
            return;
        }
        self.desynced = true;
        for (a, b) in diverged {
            let name_a = self.users.get(a).map(|u| u.display_name(self.hide_names)).unwrap_or_default();
            let name_b = self.users.get(b).map(|u| u.display_name(self.hide_names)).unwrap_or_default();
            warn!("{} desync between {} and {}", self.prefix(), name_a, name_b);
            self.send_all_chat(&format!("Desync detected: {} and {} are no longer in the same game", name_a, name_b));
        }
        if self.config.desync_handler == DesyncHandler::Drop {
            let total = self.users.len();
            let minority: Vec<u8> = self
                .users
                .iter()
                .filter(|u| (self.sync_graph.get(&u.uid).map(HashSet::len).unwrap_or(0) + 1) * 2 < total)
                .map(|u| u.uid)
                .collect();
            for uid in minority {
                self.remove_user(uid, "was dropped after desyncing", LeaveCode::Disconnect, now);
            }
        }
    }

    fn check_game_over(&mut self, now: u64) {
        if self.game_over_at.is_some() || self.state != GameState::Playing {
            return;
        }
        let remaining = self.users.iter().filter(|u| !u.observer).count();
        let tolerance = self.config.game_over_tolerance_secs * 1000;
        if remaining == 0 {
            self.set_game_over(now, tolerance, "no players remain");
        } else if remaining <= self.config.num_players_to_start_game_over as usize && self.players_at_start > remaining {
            let reason = format!("only {} players remain", remaining);
            self.set_game_over(now, tolerance, &reason);
        }
    }

    /// Starts the game-over timer; connections close once the tolerance runs out
    pub(crate) fn set_game_over(&mut self, now: u64, tolerance_ms: u64, reason: &str) {
        if self.game_over_at.is_some() {
            return;
        }
        self.state = GameState::Over;
        self.game_over_at = Some(now);
        self.game_over_tolerance_ms = tolerance_ms;
        info!("{} is over ({}), closing in {} s", self.prefix(), reason, tolerance_ms / 1000);
        if tolerance_ms > 0 {
            self.send_all_chat(&format!("The game is over, closing in {} seconds", tolerance_ms / 1000));
        }
    }

    /// Host request to end the game after the normal tolerance
    pub fn request_game_over(&mut self, now: u64) -> bool {
        if self.state != GameState::Playing {
            return false;
        }
        let tolerance = self.config.game_over_tolerance_secs * 1000;
        self.set_game_over(now, tolerance, "requested by the host");
        true
    }

    pub(crate) fn teardown(&mut self, now: u64) {
        if self.exiting {
            return;
        }
        self.exiting = true;
        let ctx = self.stats_context();
        if let Some(StatsCollector::W3mmd(mmd)) = self.stats.as_mut() {
            mmd.flush_queue(&ctx);
        }
        self.save_records(now);
        let conns: Vec<_> = self
            .users
            .iter()
            .filter(|u| !u.is_gproxy_disconnected())
            .map(|u| u.conn)
            .collect();
        for conn in conns {
            self.close_conn(conn);
        }
        if self.state == GameState::Lobby {
            self.outgoing
                .push(super::Outgoing::Discovery(w3gs::decreate_game(self.host_counter)));
        }
        self.events.push(GameEvent::Ended { game_id: self.game_id });
        if self.announcer.is_enabled() {
            let message = format!("Game [{}] is over", self.name);
            self.announcer.queue_chat(&message);
        }
        info!("{} closed", self.prefix());
    }

    fn winners(&self) -> Vec<String> {
        match &self.stats {
            Some(StatsCollector::W3mmd(mmd)) => mmd.winners(),
            Some(StatsCollector::Dota(dota)) => dota
                .records()
                .into_iter()
                .filter(|r| r.win == 1)
                .filter_map(|r| self.game_players.iter().find(|p| p.color == r.color).map(|p| p.name.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    fn save_records(&mut self, now: u64) {
        let Some(started) = self.loading_started_at else {
            return;
        };
        let game = GameRecord {
            game_id: self.game_id,
            name: self.name.clone(),
            map_path: self.map.path.clone(),
            creator: self.creator.to_string(),
            duration_secs: now.saturating_sub(started) / 1000,
            winners: self.winners(),
        };
        let dota_records = match &self.stats {
            Some(StatsCollector::Dota(dota)) => dota.records(),
            _ => Vec::new(),
        };
        let players: Vec<PlayerRecord> = self
            .game_players
            .iter()
            .map(|p| {
                let stats = match &self.stats {
                    Some(StatsCollector::W3mmd(mmd)) => mmd.player_stats(p.sid),
                    Some(StatsCollector::Dota(_)) => dota_records
                        .iter()
                        .find(|r| r.color == p.color)
                        .map(|r| r.stats())
                        .unwrap_or_default(),
                    None => BTreeMap::new(),
                };
                PlayerRecord {
                    game_id: self.game_id,
                    name: p.name.clone(),
                    ip: p.ip.clone(),
                    color: p.color,
                    team: p.team,
                    left_secs: p.left_at.unwrap_or(now).saturating_sub(started) / 1000,
                    left_reason: if p.left_reason.is_empty() {
                        "stayed until the end".to_string()
                    } else {
                        p.left_reason.clone()
                    },
                    stats,
                }
            })
            .collect();
        let count = players.len();
        if let Err(e) = write_records(self.persistence.as_mut(), game, players) {
            warn!("{} could not save the game records: {}", self.prefix(), e);
            self.persistence.rollback();
        } else {
            info!("{} saved records for {} players", self.prefix(), count);
        }
    }

    /// Queues a save from a fake user before someone is dropped for good
    pub(crate) fn try_auto_save(&mut self, now: u64) {
        let Some(started) = self.playing_started_at else {
            return;
        };
        if self.state != GameState::Playing
            || now.saturating_sub(started) < self.config.auto_save_min_elapsed_secs * 1000
        {
            return;
        }
        let has_referees = self.has_referees();
        let Some(saver) = self.virtual_users.iter_mut().find(|v| v.can_save(has_referees)) else {
            debug!("[GAME] no fake user can save the game");
            return;
        };
        saver.remaining_saves -= 1;
        let uid = saver.uid;
        let mut data = vec![action::SAVE];
        data.extend_from_slice(AUTO_SAVE_NAME);
        self.queue.add_action(0, IncomingAction::new(uid, data));
        info!("{} saving the game before dropping a player", self.prefix());
    }
}
