//! Network-attached game users and the per-session roster
//!
//! This module handles the session-side bookkeeping of connected users:
//! - Identity (UID, name, addresses, realm of origin)
//! - Round-trip time samples used by the countdown checks and the ping equalizer
//! - Synchronization counters and the queue of unverified keepalive checksums
//! - Reconnect (GProxy) state, including the replay buffer of sent packets
//!
//! The roster owns every [`GameUser`]; everything else refers to users by UID.

use log::info;
use shared::LeaveCode;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};

/// Identifier the network layer assigns to a TCP connection
pub type ConnId = u32;

/// RTT samples kept per user
pub const MAX_RTT_SAMPLES: usize = 10;

/// Reconnect state of a user whose client speaks the GProxy extension
#[derive(Debug, Clone, Default)]
pub struct GProxyState {
    /// Negotiated the extended grace period
    pub extended: bool,
    pub version: u32,
    pub reconnect_key: u32,
    /// Set while the connection is gone and the grace period runs
    pub disconnected_at: Option<u64>,
    /// Packets sent but not yet acknowledged, oldest first
    pub buffer: VecDeque<Vec<u8>>,
    pub total_sent: u32,
    pub total_received: u32,
}

impl GProxyState {
    pub fn new(version: u32, reconnect_key: u32) -> Self {
        Self {
            version,
            reconnect_key,
            ..Self::default()
        }
    }

    /// Records a packet that may have to be replayed after a reconnect
    pub fn record_sent(&mut self, packet: &[u8]) {
        self.buffer.push_back(packet.to_vec());
        self.total_sent = self.total_sent.wrapping_add(1);
    }

    /// Forgets packets the client confirmed up to `last_packet`
    pub fn acknowledge(&mut self, last_packet: u32) {
        let first_buffered = self.total_sent.wrapping_sub(self.buffer.len() as u32);
        let confirmed = last_packet.wrapping_sub(first_buffered).min(self.buffer.len() as u32);
        self.buffer.drain(..confirmed as usize);
    }

    /// Packets sent after `last_packet`, or `None` if some were already discarded
    pub fn replay_from(&self, last_packet: u32) -> Option<Vec<Vec<u8>>> {
        let missing = self.total_sent.wrapping_sub(last_packet) as usize;
        if missing > self.buffer.len() {
            return None;
        }
        let skip = self.buffer.len() - missing;
        Some(self.buffer.iter().skip(skip).cloned().collect())
    }
}

/// Progress of a map upload to one user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapTransfer {
    /// Bytes queued to the client
    pub sent: usize,
    /// Bytes the client reported as received
    pub acked: usize,
    pub started_at: u64,
}

/// A user holding a slot through a live (or reconnecting) connection
#[derive(Debug)]
pub struct GameUser {
    pub conn: ConnId,
    pub addr: SocketAddr,
    pub name: String,
    pub uid: u8,
    /// UID before the last refresh, 0xFF if never refreshed
    pub old_uid: u8,
    /// Pseudonym assigned when names are hidden in game, 0xFF otherwise
    pub pseudonym_uid: u8,
    pub internal_ip: [u8; 4],
    /// High byte of the host counter the join came through; 0 for LAN
    pub realm_id: u8,
    pub reserved: bool,
    pub observer: bool,
    pub owner: bool,
    pub verified: bool,
    pub map_ready: bool,
    rtts: VecDeque<u32>,
    pongs_received: u32,
    /// Keepalives received
    pub sync_counter: u32,
    /// Checksums not yet compared against the other users
    pub checksums: VecDeque<u32>,
    pub finished_loading: bool,
    pub finished_loading_at: Option<u64>,
    pub lagging: bool,
    pub started_lagging_at: Option<u64>,
    pub drop_vote: bool,
    pub left_reason: Option<String>,
    pub left_code: LeaveCode,
    pub remaining_pauses: u8,
    pub remaining_saves: u8,
    pub gproxy: Option<GProxyState>,
    /// Frames this user's actions trail the next outgoing frame
    pub equalizer_offset: u8,
    pub map_transfer: Option<MapTransfer>,
    pub joined_at: u64,
    /// Last time anything arrived from this user
    pub last_seen: u64,
}

impl GameUser {
    pub fn new(
        conn: ConnId,
        addr: SocketAddr,
        uid: u8,
        name: impl Into<String>,
        internal_ip: [u8; 4],
        now: u64,
    ) -> Self {
        Self {
            conn,
            addr,
            name: name.into(),
            uid,
            old_uid: 0xFF,
            pseudonym_uid: 0xFF,
            internal_ip,
            realm_id: 0,
            reserved: false,
            observer: false,
            owner: false,
            verified: false,
            map_ready: false,
            rtts: VecDeque::with_capacity(MAX_RTT_SAMPLES),
            pongs_received: 0,
            sync_counter: 0,
            checksums: VecDeque::new(),
            finished_loading: false,
            finished_loading_at: None,
            lagging: false,
            started_lagging_at: None,
            drop_vote: false,
            left_reason: None,
            left_code: LeaveCode::Lobby,
            remaining_pauses: 3,
            remaining_saves: 1,
            gproxy: None,
            equalizer_offset: 0,
            map_transfer: None,
            joined_at: now,
            last_seen: now,
        }
    }

    pub fn external_ip(&self) -> [u8; 4] {
        match self.addr.ip() {
            IpAddr::V4(ip) => ip.octets(),
            IpAddr::V6(ip) => ip.to_ipv4_mapped().map(|v4| v4.octets()).unwrap_or([0; 4]),
        }
    }

    pub fn lower_name(&self) -> String {
        self.name.to_lowercase()
    }

    /// Name shown to others; pseudonyms replace it once names are hidden
    pub fn display_name(&self, hidden: bool) -> String {
        if !hidden {
            return self.name.clone();
        }
        if self.pseudonym_uid == 0xFF {
            format!("Player {}", self.uid)
        } else {
            format!("Player {}?", self.pseudonym_uid)
        }
    }

    /// Adds a round-trip sample; the very first pong is discarded because it
    /// includes the time the client spent joining
    pub fn add_rtt(&mut self, rtt: u32) {
        self.pongs_received += 1;
        if self.pongs_received == 1 {
            return;
        }
        if self.rtts.len() == MAX_RTT_SAMPLES {
            self.rtts.pop_front();
        }
        self.rtts.push_back(rtt);
    }

    pub fn has_rtt(&self) -> bool {
        !self.rtts.is_empty()
    }

    pub fn average_rtt(&self) -> Option<f64> {
        if self.rtts.is_empty() {
            return None;
        }
        Some(self.rtts.iter().map(|&r| r as f64).sum::<f64>() / self.rtts.len() as f64)
    }

    /// Average RTT rounded to whole milliseconds
    pub fn rtt(&self) -> Option<u32> {
        self.average_rtt().map(|avg| avg.round() as u32)
    }

    pub fn uses_gproxy(&self) -> bool {
        self.gproxy.is_some()
    }

    pub fn uses_gproxy_extended(&self) -> bool {
        self.gproxy.as_ref().map(|g| g.extended).unwrap_or(false)
    }

    /// Connection lost but the reconnect grace period is still running
    pub fn is_gproxy_disconnected(&self) -> bool {
        self.gproxy
            .as_ref()
            .map(|g| g.disconnected_at.is_some())
            .unwrap_or(false)
    }

    pub fn is_leaving(&self) -> bool {
        self.left_reason.is_some()
    }

    pub fn can_pause(&self, has_referees: bool) -> bool {
        self.remaining_pauses > 0 && (!self.observer || has_referees)
    }

    pub fn can_resume(&self, has_referees: bool) -> bool {
        !self.observer || has_referees
    }

    pub fn can_save(&self, has_referees: bool) -> bool {
        self.remaining_saves > 0 && (!self.observer || has_referees)
    }

    pub fn set_left(&mut self, reason: impl Into<String>, code: LeaveCode) {
        if self.left_reason.is_none() {
            self.left_reason = Some(reason.into());
            self.left_code = code;
        }
    }

    pub fn is_timed_out(&self, now: u64, timeout_ms: u64) -> bool {
        !self.is_gproxy_disconnected() && now.saturating_sub(self.last_seen) > timeout_ms
    }
}

/// Owns every connected user of a session
///
/// Users are kept in join order so broadcasts and comparisons are
/// deterministic. Lookups are linear; a session never holds more than 24
/// users.
#[derive(Debug)]
pub struct UserRoster {
    users: Vec<GameUser>,
    max_users: usize,
}

impl UserRoster {
    pub fn new(max_users: usize) -> Self {
        Self {
            users: Vec::new(),
            max_users,
        }
    }

    /// Adds a user, returning its UID, or `None` if the roster is full or the
    /// UID is already taken
    pub fn add_user(&mut self, user: GameUser) -> Option<u8> {
        if self.users.len() >= self.max_users || self.get(user.uid).is_some() {
            return None;
        }
        let uid = user.uid;
        info!("User {} [{}] joined from {}", user.name, uid, user.addr);
        self.users.push(user);
        Some(uid)
    }

    pub fn remove_user(&mut self, uid: u8) -> Option<GameUser> {
        let index = self.users.iter().position(|u| u.uid == uid)?;
        let user = self.users.remove(index);
        info!("User {} [{}] removed", user.name, uid);
        Some(user)
    }

    pub fn find_by_conn(&self, conn: ConnId) -> Option<u8> {
        self.users
            .iter()
            .find(|u| u.conn == conn && !u.is_gproxy_disconnected())
            .map(|u| u.uid)
    }

    pub fn find_by_name(&self, name: &str) -> Option<u8> {
        self.users
            .iter()
            .find(|u| u.name.eq_ignore_ascii_case(name))
            .map(|u| u.uid)
    }

    pub fn get(&self, uid: u8) -> Option<&GameUser> {
        self.users.iter().find(|u| u.uid == uid)
    }

    pub fn get_mut(&mut self, uid: u8) -> Option<&mut GameUser> {
        self.users.iter_mut().find(|u| u.uid == uid)
    }

    /// UIDs of users that have been silent for longer than the timeout
    pub fn check_timeouts(&self, now: u64, timeout_ms: u64) -> Vec<u8> {
        self.users
            .iter()
            .filter(|u| !u.is_leaving() && u.is_timed_out(now, timeout_ms))
            .map(|u| u.uid)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GameUser> {
        self.users.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut GameUser> {
        self.users.iter_mut()
    }

    pub fn uids(&self) -> Vec<u8> {
        self.users.iter().map(|u| u.uid).collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:6113".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "10.1.2.3:6113".parse().unwrap()
    }

    fn user(conn: ConnId, uid: u8, name: &str) -> GameUser {
        GameUser::new(conn, test_addr(), uid, name, [0; 4], 0)
    }

    #[test]
    fn test_roster_capacity() {
        let mut roster = UserRoster::new(1);
        assert_eq!(roster.add_user(user(1, 2, "a")), Some(2));
        assert_eq!(roster.add_user(user(2, 3, "b")), None);
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_roster_rejects_duplicate_uid() {
        let mut roster = UserRoster::new(4);
        roster.add_user(user(1, 2, "a"));
        assert_eq!(roster.add_user(user(2, 2, "b")), None);
    }

    #[test]
    fn test_remove_user() {
        let mut roster = UserRoster::new(2);
        roster.add_user(user(1, 2, "a"));
        assert!(roster.remove_user(2).is_some());
        assert!(roster.remove_user(2).is_none());
        assert!(roster.is_empty());
    }

    #[test]
    fn test_find_by_conn_and_name() {
        let mut roster = UserRoster::new(4);
        roster.add_user(user(10, 2, "Grubby"));
        roster.add_user(user(11, 3, "Moon"));
        assert_eq!(roster.find_by_conn(11), Some(3));
        assert_eq!(roster.find_by_conn(99), None);
        assert_eq!(roster.find_by_name("grubby"), Some(2));
    }

    #[test]
    fn test_external_ip() {
        let u = GameUser::new(1, test_addr2(), 2, "a", [0; 4], 0);
        assert_eq!(u.external_ip(), [10, 1, 2, 3]);
    }

    #[test]
    fn test_first_pong_is_discarded() {
        let mut u = user(1, 2, "a");
        u.add_rtt(900);
        assert!(!u.has_rtt());
        u.add_rtt(100);
        u.add_rtt(51);
        assert_approx_eq!(u.average_rtt().unwrap(), 75.5);
        assert_eq!(u.rtt(), Some(76));
    }

    #[test]
    fn test_rtt_window_is_bounded() {
        let mut u = user(1, 2, "a");
        u.add_rtt(0);
        for i in 0..20 {
            u.add_rtt(i * 10);
        }
        // only the last ten samples (100..=190) remain
        assert_approx_eq!(u.average_rtt().unwrap(), 145.0);
    }

    #[test]
    fn test_check_timeouts() {
        let mut roster = UserRoster::new(4);
        roster.add_user(user(1, 2, "a"));
        roster.add_user(user(2, 3, "b"));
        roster.get_mut(3).unwrap().last_seen = 5_000;
        assert_eq!(roster.check_timeouts(6_000, 2_000), vec![2]);
    }

    #[test]
    fn test_gproxy_buffer_ack_and_replay() {
        let mut state = GProxyState::new(1, 42);
        for i in 0..5u8 {
            state.record_sent(&[i]);
        }
        state.acknowledge(2);
        assert_eq!(state.buffer.len(), 3);
        assert_eq!(state.replay_from(3), Some(vec![vec![3], vec![4]]));
        assert_eq!(state.replay_from(5), Some(vec![]));
        assert_eq!(state.replay_from(1), None);
    }

    #[test]
    fn test_display_name_pseudonyms() {
        let mut u = user(1, 4, "Grubby");
        assert_eq!(u.display_name(false), "Grubby");
        assert_eq!(u.display_name(true), "Player 4");
        u.pseudonym_uid = 2;
        assert_eq!(u.display_name(true), "Player 2?");
    }
}
