//! GProxy reconnects: the handshake, the grace period and packet replay
//!
//! A reconnect-capable user who loses the socket after the lobby stays in the
//! game behind a lag screen. Everything sent to them meanwhile is buffered and
//! replayed when they come back on a new connection with their key.

use super::{Game, GameState};
use crate::user::{ConnId, GProxyState};
use log::{debug, info, warn};
use shared::gps::{self, GpsClientPacket, GpsRejectReason};
use shared::w3gs;
use shared::LeaveCode;
use std::net::SocketAddr;

/// Clients from this version on understand the extended grace period
const EXTENDED_MIN_VERSION: u32 = 2;

impl Game {
    pub(crate) fn receive_gps(&mut self, conn: ConnId, addr: SocketAddr, data: &[u8], now: u64) {
        let packet = match gps::parse_client_packet(data) {
            Ok(packet) => packet,
            Err(e) => {
                self.on_malformed(conn, data, &e.to_string(), now);
                return;
            }
        };
        if let GpsClientPacket::Reconnect {
            uid,
            reconnect_key,
            last_packet,
        } = packet
        {
            self.on_gproxy_reconnect(conn, addr, uid, reconnect_key, last_packet, now);
            return;
        }
        let Some(uid) = self.users.find_by_conn(conn) else {
            debug!("{} {:?} from unknown connection {}", self.prefix(), packet, conn);
            self.close_conn(conn);
            return;
        };
        match packet {
            GpsClientPacket::Init { version } => self.on_gproxy_init(uid, version),
            GpsClientPacket::SupportExtended { seconds } => {
                if let Some(gproxy) = self.users.get_mut(uid).and_then(|u| u.gproxy.as_mut()) {
                    gproxy.extended = true;
                    debug!("[GAME] [{}] accepts the extended grace period ({} s)", uid, seconds);
                }
            }
            GpsClientPacket::Ack { last_packet } => {
                if let Some(gproxy) = self.users.get_mut(uid).and_then(|u| u.gproxy.as_mut()) {
                    gproxy.acknowledge(last_packet);
                }
            }
            GpsClientPacket::Reconnect { .. } | GpsClientPacket::Unknown { .. } => {}
        }
    }

    fn on_gproxy_init(&mut self, uid: u8, version: u32) {
        let reconnect_key: u32 = rand::random();
        let Some(user) = self.users.get_mut(uid) else {
            return;
        };
        if user.gproxy.is_some() {
            return;
        }
        user.gproxy = Some(GProxyState::new(version, reconnect_key));
        let conn = user.conn;
        info!("{} [{}] is using GProxy version {}", self.prefix(), uid, version);
        let empty_actions = self.config.gproxy_empty_actions();
        self.send_conn(conn, gps::init(self.config.reconnect_port, uid, reconnect_key, empty_actions));
        if version >= EXTENDED_MIN_VERSION {
            let wait_ms = self.config.reconnect_wait_ms(true);
            self.send_conn(conn, gps::support_extended(wait_ms, self.game_id as u32));
        }
    }

    fn reject_reconnect(&mut self, conn: ConnId, reason: GpsRejectReason) {
        self.send_conn(conn, gps::reject(reason));
        self.close_conn(conn);
    }

    fn on_gproxy_reconnect(
        &mut self,
        conn: ConnId,
        addr: SocketAddr,
        uid: u8,
        reconnect_key: u32,
        last_packet: u32,
        now: u64,
    ) {
        if self.state == GameState::Lobby {
            self.reject_reconnect(conn, GpsRejectReason::NotFound);
            return;
        }
        let Some(gproxy) = self.users.get(uid).and_then(|u| u.gproxy.as_ref()) else {
            self.reject_reconnect(conn, GpsRejectReason::NotFound);
            return;
        };
        if gproxy.reconnect_key != reconnect_key {
            warn!("{} [{}] tried to reconnect with a wrong key from {}", self.prefix(), uid, addr);
            self.reject_reconnect(conn, GpsRejectReason::Invalid);
            return;
        }
        let Some(replay) = gproxy.replay_from(last_packet) else {
            self.reject_reconnect(conn, GpsRejectReason::Invalid);
            self.remove_user(uid, "could not be resynchronized after reconnecting", LeaveCode::Disconnect, now);
            return;
        };
        let total_received = gproxy.total_received;

        let Some(user) = self.users.get_mut(uid) else {
            return;
        };
        let old_conn = user.conn;
        let was_connected = !user.is_gproxy_disconnected();
        user.conn = conn;
        user.addr = addr;
        user.last_seen = now;
        let lagged_for = user.started_lagging_at.map(|at| now.saturating_sub(at));
        user.lagging = false;
        user.started_lagging_at = None;
        if let Some(gproxy) = user.gproxy.as_mut() {
            gproxy.disconnected_at = None;
        }
        let name = user.display_name(self.hide_names);
        if was_connected && old_conn != conn {
            self.close_conn(old_conn);
        }

        info!("{} [{}] reconnected, replaying {} packets", self.prefix(), uid, replay.len());
        self.send_conn(conn, gps::reconnect(total_received));
        for packet in replay {
            self.send_conn(conn, packet);
        }
        if let Some(elapsed) = lagged_for {
            self.send_all(w3gs::stop_lag(uid, elapsed as u32));
        }
        if self.lagging && !self.users.iter().any(|u| u.lagging) {
            self.lagging = false;
            self.last_frame_at = now;
        }
        self.send_all_chat(&format!("{} has reconnected", name));
        if self.state == GameState::Loading {
            self.check_all_loaded(now);
        }
    }

    /// Keeps a reconnect-capable user in the game after the socket dropped
    pub(crate) fn on_gproxy_disconnect(&mut self, uid: u8, now: u64) {
        let playing = matches!(self.state, GameState::Playing | GameState::Over);
        let Some(user) = self.users.get_mut(uid) else {
            return;
        };
        let extended = user.uses_gproxy_extended();
        if let Some(gproxy) = user.gproxy.as_mut() {
            if gproxy.disconnected_at.is_some() {
                return;
            }
            gproxy.disconnected_at = Some(now);
        }
        if playing && !user.lagging {
            user.lagging = true;
            user.started_lagging_at = Some(now);
        }
        let name = user.display_name(self.hide_names);
        let wait_secs = self.config.reconnect_wait_ms(extended) / 1000;
        info!("{} {} disconnected, waiting {} s for a reconnect", self.prefix(), name, wait_secs);
        if playing {
            self.lagging = true;
            match w3gs::start_lag(&[(uid, 0)]) {
                Ok(packet) => self.send_all_except(uid, packet),
                Err(e) => warn!("{} lag screen not sent: {}", self.prefix(), e),
            }
        }
        self.send_all_chat(&format!("{} has disconnected, waiting {} seconds", name, wait_secs));
    }

    /// Drops users whose grace period ran out
    pub(crate) fn update_gproxy(&mut self, now: u64) {
        let expired: Vec<(u8, u64)> = self
            .users
            .iter()
            .filter_map(|u| {
                let at = u.gproxy.as_ref()?.disconnected_at?;
                let wait = self.config.reconnect_wait_ms(u.uses_gproxy_extended());
                (now >= at + wait).then_some((u.uid, wait))
            })
            .collect();
        for (uid, wait) in expired {
            self.try_auto_save(now);
            let reason = format!("failed to reconnect within {} seconds", wait / 1000);
            self.remove_user(uid, &reason, LeaveCode::Disconnect, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{game_with, join, sends_to, start_game, test_addr};
    use super::super::{Game, GameState, Outgoing};
    use crate::config::GameConfig;
    use crate::map::tests::test_map;
    use crate::persistence::MemoryPersistence;
    use shared::gps::{self, GPS_HEADER};
    use shared::w3gs::{self, id};

    fn gps_sends(outgoing: &[Outgoing], conn: u32, message_id: u8) -> usize {
        outgoing
            .iter()
            .filter(|o| matches!(o, Outgoing::Send { conn: c, data } if *c == conn && data[0] == GPS_HEADER && data[1] == message_id))
            .count()
    }

    fn config() -> GameConfig {
        GameConfig {
            connection_timeout_secs: 600,
            ping_equalizer_enabled: false,
            ..GameConfig::default()
        }
    }

    /// Grubby plays plain, Moon negotiates GProxy once the game runs
    fn gproxy_game(extended: bool) -> (Game, Vec<u8>, u64) {
        let mut game = game_with(config(), test_map(), Box::new(MemoryPersistence::new()));
        let (uids, now) = start_game(&mut game, &["Grubby", "Moon"]);
        game.receive(2, test_addr(1002), &gps::client_init(if extended { 2 } else { 1 }), now);
        if extended {
            game.receive(2, test_addr(1002), &gps::client_support_extended(180), now);
        }
        game.take_outgoing();
        (game, uids, now)
    }

    fn reconnect_key(game: &Game, uid: u8) -> u32 {
        game.user(uid).unwrap().gproxy.as_ref().unwrap().reconnect_key
    }

    #[test]
    fn test_init_handshake() {
        let mut game = game_with(config(), test_map(), Box::new(MemoryPersistence::new()));
        let uid = join(&mut game, 1, "Grubby", 0);
        game.take_outgoing();
        game.receive(1, test_addr(1001), &gps::client_init(2), 0);
        let out = game.take_outgoing();
        assert_eq!(gps_sends(&out, 1, gps::id::INIT), 1);
        assert_eq!(gps_sends(&out, 1, gps::id::SUPPORT_EXTENDED), 1);
        assert!(game.user(uid).unwrap().uses_gproxy());
        assert!(!game.user(uid).unwrap().uses_gproxy_extended());

        game.receive(1, test_addr(1001), &gps::client_support_extended(180), 0);
        assert!(game.user(uid).unwrap().uses_gproxy_extended());
    }

    #[test]
    fn test_disconnect_keeps_user_behind_lag_screen() {
        let (mut game, uids, now) = gproxy_game(false);
        game.connection_closed(2, now + 100);
        let moon = game.user(uids[1]).unwrap();
        assert!(moon.is_gproxy_disconnected());
        assert!(game.is_lagging());
        let out = game.take_outgoing();
        assert_eq!(sends_to(&out, 1, id::START_LAG), 1);
        assert_eq!(sends_to(&out, 2, id::CHAT_FROM_HOST), 0);
    }

    #[test]
    fn test_reconnect_replays_missed_packets() {
        let (mut game, uids, now) = gproxy_game(false);
        game.update(now + 100);
        game.update(now + 200);
        let received = game.user(uids[1]).unwrap().gproxy.as_ref().unwrap().total_sent;
        game.connection_closed(2, now + 250);
        game.send_all_chat("while you were away");
        game.take_outgoing();

        let key = reconnect_key(&game, uids[1]);
        game.receive(9, test_addr(2002), &gps::client_reconnect(uids[1], key, received), now + 5_000);
        let out = game.take_outgoing();
        assert_eq!(gps_sends(&out, 9, gps::id::RECONNECT), 1);
        // two replayed chats and the reconnect notice
        assert_eq!(sends_to(&out, 9, id::CHAT_FROM_HOST), 3);
        assert_eq!(sends_to(&out, 1, id::STOP_LAG), 1);
        assert!(!game.is_lagging());
        assert_eq!(game.user(uids[1]).unwrap().conn, 9);

        // later W3GS traffic arrives on the new connection
        game.receive(9, test_addr(2002), &w3gs::outgoing_keepalive(0), now + 5_010);
        assert_eq!(game.user(uids[1]).unwrap().sync_counter, 1);
    }

    #[test]
    fn test_reconnect_with_wrong_key_is_rejected() {
        let (mut game, uids, now) = gproxy_game(false);
        game.connection_closed(2, now);
        let key = reconnect_key(&game, uids[1]).wrapping_add(1);
        game.receive(9, test_addr(2002), &gps::client_reconnect(uids[1], key, 0), now + 10);
        let out = game.take_outgoing();
        assert_eq!(gps_sends(&out, 9, gps::id::REJECT), 1);
        assert!(out.contains(&Outgoing::Close { conn: 9 }));
        assert!(game.user(uids[1]).unwrap().is_gproxy_disconnected());
    }

    #[test]
    fn test_reconnect_to_lobby_is_not_found() {
        let mut game = game_with(config(), test_map(), Box::new(MemoryPersistence::new()));
        game.receive(9, test_addr(2002), &gps::client_reconnect(2, 1, 0), 0);
        let out = game.take_outgoing();
        assert!(out.contains(&Outgoing::Send {
            conn: 9,
            data: gps::reject(gps::GpsRejectReason::NotFound)
        }));
    }

    #[test]
    fn test_extended_grace_period_expires() {
        let (mut game, uids, now) = gproxy_game(true);
        game.connection_closed(2, now);
        game.update(now + 60_000);
        assert!(game.user(uids[1]).is_some());
        game.take_outgoing();

        game.update(now + 180_000);
        assert!(game.user(uids[1]).is_none());
        let chats: Vec<Vec<u8>> = game
            .take_outgoing()
            .into_iter()
            .filter_map(|o| match o {
                Outgoing::Send { conn: 1, data } if data[1] == id::CHAT_FROM_HOST => Some(data),
                _ => None,
            })
            .collect();
        let needle = b"failed to reconnect within 180 seconds";
        assert!(chats.iter().any(|c| c.windows(needle.len()).any(|w| w == needle)));
        assert_eq!(game.state(), GameState::Over);
    }

    #[test]
    fn test_ack_trims_replay_buffer() {
        let (mut game, uids, now) = gproxy_game(false);
        game.update(now + 100);
        let sent = game.user(uids[1]).unwrap().gproxy.as_ref().unwrap().total_sent;
        assert!(sent > 0);
        game.receive(2, test_addr(1002), &gps::client_ack(sent), now + 150);
        assert!(game.user(uids[1]).unwrap().gproxy.as_ref().unwrap().buffer.is_empty());
    }
}
