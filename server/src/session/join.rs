//! Join admission and the lobby handshake

use super::{Game, GameState};
use crate::user::{ConnId, GameUser};
use log::{info, warn};
use shared::w3gs::{self, IncomingJoinRequest, RejectReason};
use shared::{LeaveCode, Occupant};
use std::net::{Ipv4Addr, SocketAddr};

/// Host counter bits that identify the game itself; the top byte names the realm
const HOST_COUNTER_MASK: u32 = 0x00FF_FFFF;

impl Game {
    fn is_reserved(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.reserved.contains(&lower) || self.is_owner(name)
    }

    pub(crate) fn is_owner(&self, name: &str) -> bool {
        self.owner
            .as_ref()
            .map(|owner| owner.eq_ignore_ascii_case(name))
            .unwrap_or(false)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.users.find_by_name(name).is_some()
            || self.virtual_users.iter().any(|v| v.name.eq_ignore_ascii_case(name))
            || (self.virtual_host_uid.is_some() && self.config.virtual_host_name.eq_ignore_ascii_case(name))
    }

    fn check_join(&self, request: &IncomingJoinRequest, addr: SocketAddr) -> Result<(), RejectReason> {
        if self.state != GameState::Lobby || self.lobby_loading || self.countdown.is_some() {
            return Err(RejectReason::Started);
        }
        if request.host_counter & HOST_COUNTER_MASK != self.host_counter & HOST_COUNTER_MASK {
            return Err(RejectReason::Started);
        }
        let realm_id = (request.host_counter >> 24) as u8;
        if realm_id == 0 && request.entry_key != self.entry_key {
            return Err(RejectReason::WrongPassword);
        }
        let name = request.name.as_str();
        if name.is_empty() || name.len() > self.config.max_player_name_len || self.name_taken(name) {
            return Err(RejectReason::Full);
        }
        match self.persistence.is_banned(name, &addr.ip().to_string()) {
            Ok(true) => {
                info!("{} {} is banned", self.prefix(), name);
                return Err(RejectReason::Full);
            }
            Ok(false) => {}
            Err(e) => warn!("{} ban lookup failed for {}: {}", self.prefix(), name, e),
        }
        Ok(())
    }

    /// Frees a slot for a reserved joiner by removing a fake user or the
    /// latest non-reserved player
    fn make_room(&mut self, now: u64) -> Option<u8> {
        if let Some(sid) = self
            .virtual_users
            .iter()
            .rev()
            .map(|v| v.sid)
            .find(|&sid| !self.slots.is_observer(sid))
        {
            if self.delete_fake_user(sid) {
                return Some(sid);
            }
        }
        let victim = self
            .users
            .iter()
            .filter(|u| !u.reserved && !u.owner)
            .max_by_key(|u| u.joined_at)
            .map(|u| u.uid)?;
        let sid = self.slots.find_by_uid(victim)?;
        self.remove_user(victim, "was kicked to make room for a reserved player", LeaveCode::Lobby, now);
        Some(sid)
    }

    fn reject(&mut self, conn: ConnId, addr: SocketAddr, name: &str, reason: RejectReason) {
        info!("{} rejected {} from {}: {:?}", self.prefix(), name, addr, reason);
        self.send_conn(conn, w3gs::reject_join(reason));
        self.close_conn(conn);
    }

    pub(crate) fn handle_join(&mut self, conn: ConnId, addr: SocketAddr, request: IncomingJoinRequest, now: u64) {
        if let Err(reason) = self.check_join(&request, addr) {
            self.reject(conn, addr, &request.name, reason);
            return;
        }
        let name = request.name.clone();
        let reserved = self.is_reserved(&name);
        let sid = match self.slots.first_open() {
            Some(sid) => Some(sid),
            None if reserved => self.make_room(now),
            None => None,
        };
        let Some(sid) = sid else {
            self.reject(conn, addr, &name, RejectReason::Full);
            return;
        };

        if self.users.len() + self.virtual_users.len() + 2 > self.map.version_max_slots as usize {
            self.delete_virtual_host();
        }
        let Some(uid) = self.new_uid() else {
            self.reject(conn, addr, &name, RejectReason::Full);
            return;
        };

        let mut user = GameUser::new(conn, addr, uid, name.clone(), request.internal_ip, now);
        user.realm_id = (request.host_counter >> 24) as u8;
        user.verified = user.realm_id != 0;
        user.reserved = reserved;
        user.owner = self.is_owner(&name);
        user.remaining_pauses = self.config.pauses_per_player;
        user.remaining_saves = self.config.saves_per_player;
        if self.users.add_user(user).is_none() {
            self.reject(conn, addr, &name, RejectReason::Full);
            return;
        }
        if !self.slots.occupy(sid, uid, Occupant::Player, 255) {
            self.users.remove_user(uid);
            self.reject(conn, addr, &name, RejectReason::Full);
            return;
        }
        self.send_join_handshake(uid);
        let ip = Ipv4Addr::from(self.users.get(uid).map(GameUser::external_ip).unwrap_or([0; 4])).to_string();
        self.push_bannable(&name, ip, None);
        info!("{} {} joined slot {} as [{}]", self.prefix(), name, sid + 1, uid);
    }

    fn lobby_name(&self, user: &GameUser) -> String {
        user.display_name(self.config.hide_lobby_names)
    }

    /// Slot table, every other occupant and the map check to the joiner; the
    /// joiner's player entry to everyone else
    fn send_join_handshake(&mut self, uid: u8) {
        let Some(user) = self.users.get(uid) else {
            return;
        };
        let external_ip = user.external_ip();
        let port = user.addr.port();
        let joiner_info = w3gs::player_info(uid, &self.lobby_name(user), external_ip, user.internal_ip);

        let mut packets = vec![w3gs::slot_info_join(
            uid,
            port,
            external_ip,
            self.slots.slots(),
            self.random_seed,
            self.map.layout,
            self.map.num_players,
        )];
        if let Some(host) = self.virtual_host_uid {
            match w3gs::player_info_exclude_ip(host, &self.config.virtual_host_name) {
                Ok(packet) => packets.push(packet),
                Err(e) => warn!("{} virtual host entry not sent: {}", self.prefix(), e),
            }
        }
        for fake in &self.virtual_users {
            match fake.player_info_bytes() {
                Ok(packet) => packets.push(packet),
                Err(e) => warn!("{} fake user entry not sent: {}", self.prefix(), e),
            }
        }
        for other in self.users.iter().filter(|u| u.uid != uid) {
            match w3gs::player_info(other.uid, &self.lobby_name(other), other.external_ip(), other.internal_ip) {
                Ok(packet) => packets.push(packet),
                Err(e) => warn!("{} player entry for [{}] not sent: {}", self.prefix(), other.uid, e),
            }
        }
        match w3gs::map_check(&self.map.path, self.map.size, self.map.crc32, self.map.hash, self.map.sha1) {
            Ok(packet) => packets.push(packet),
            Err(e) => warn!("{} map check for [{}] not sent: {}", self.prefix(), uid, e),
        }
        for packet in packets {
            self.send_to(uid, packet);
        }

        match joiner_info {
            Ok(packet) => self.send_all_except(uid, packet),
            Err(e) => warn!("{} player entry for [{}] not sent: {}", self.prefix(), uid, e),
        }
        self.send_slot_info();
    }
}
