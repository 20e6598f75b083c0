//! W3GS game protocol: packet parsers for client traffic and builders for host traffic
//!
//! Every packet starts with the `0xF7` header, a one-byte message id and a
//! little-endian `u16` length covering the whole packet. Builders assemble the
//! payload first and patch the length in afterwards; parsers reject any packet
//! whose declared length disagrees with the buffer.

use crate::bytes::{
    assign_length, ensure_len, extract_cstring, push_cstring, read_u16, read_u32,
    validate_length,
};
use crate::error::ProtocolError;
use crate::slot::{encode_slot_info, GameSlot, LayoutStyle};

pub const W3GS_HEADER: u8 = 0xF7;

/// Longest player name the client accepts
pub const MAX_PLAYER_NAME_SIZE: usize = 15;
/// Subpacket size after which a new action batch is started
pub const ACTION_BATCH_LIMIT: usize = 1452;
/// UID and length prefix of each action in a subpacket
pub const ACTION_HEADER_SIZE: usize = 3;
/// Largest map chunk carried by a single `MAPPART`
pub const MAP_PART_SIZE: usize = 1442;

/// Message ids
pub mod id {
    pub const PING_FROM_HOST: u8 = 0x01;
    pub const SLOTINFOJOIN: u8 = 0x04;
    pub const REJECTJOIN: u8 = 0x05;
    pub const PLAYERINFO: u8 = 0x06;
    pub const PLAYERLEAVE_OTHERS: u8 = 0x07;
    pub const GAMELOADED_OTHERS: u8 = 0x08;
    pub const SLOTINFO: u8 = 0x09;
    pub const COUNTDOWN_START: u8 = 0x0A;
    pub const COUNTDOWN_END: u8 = 0x0B;
    pub const INCOMING_ACTION: u8 = 0x0C;
    pub const CHAT_FROM_HOST: u8 = 0x0F;
    pub const START_LAG: u8 = 0x10;
    pub const STOP_LAG: u8 = 0x11;
    pub const REQJOIN: u8 = 0x1E;
    pub const LEAVEGAME: u8 = 0x21;
    pub const GAMELOADED_SELF: u8 = 0x23;
    pub const OUTGOING_ACTION: u8 = 0x26;
    pub const OUTGOING_KEEPALIVE: u8 = 0x27;
    pub const CHAT_TO_HOST: u8 = 0x28;
    pub const DROPREQ: u8 = 0x29;
    pub const SEARCHGAME: u8 = 0x2F;
    pub const GAMEINFO: u8 = 0x30;
    pub const CREATEGAME: u8 = 0x31;
    pub const REFRESHGAME: u8 = 0x32;
    pub const DECREATEGAME: u8 = 0x33;
    pub const MAPCHECK: u8 = 0x3D;
    pub const STARTDOWNLOAD: u8 = 0x3F;
    pub const MAPSIZE: u8 = 0x42;
    pub const MAPPART: u8 = 0x43;
    pub const PONG_TO_HOST: u8 = 0x46;
    pub const INCOMING_ACTION2: u8 = 0x48;
}

/// Leading bytes of opaque actions the host keeps books on
pub mod action {
    pub const PAUSE: u8 = 0x01;
    pub const RESUME: u8 = 0x02;
    pub const SAVE: u8 = 0x06;
    pub const SAVE_ENDED: u8 = 0x07;
    pub const CHAT_TRIGGER: u8 = 0x60;
    pub const SYNC_INT: u8 = 0x6B;
}

/// Chat flags used by `CHAT_TO_HOST` / `CHAT_FROM_HOST`
pub mod chat_flag {
    pub const MESSAGE: u8 = 16;
    pub const TEAM_CHANGE: u8 = 17;
    pub const COLOR_CHANGE: u8 = 18;
    pub const RACE_CHANGE: u8 = 19;
    pub const HANDICAP_CHANGE: u8 = 20;
    pub const MESSAGE_EXTRA: u8 = 32;
}

/// Reasons sent in `REJECTJOIN`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RejectReason {
    Full = 9,
    Started = 10,
    WrongPassword = 27,
}

/// Codes sent in `PLAYERLEAVE_OTHERS` and received in `LEAVEGAME`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LeaveCode {
    Disconnect = 1,
    Lost = 7,
    LostBuildings = 8,
    Won = 9,
    Draw = 10,
    Observer = 11,
    Lobby = 13,
    GProxy = 100,
}

impl LeaveCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(LeaveCode::Disconnect),
            7 => Some(LeaveCode::Lost),
            8 => Some(LeaveCode::LostBuildings),
            9 => Some(LeaveCode::Won),
            10 => Some(LeaveCode::Draw),
            11 => Some(LeaveCode::Observer),
            13 => Some(LeaveCode::Lobby),
            100 => Some(LeaveCode::GProxy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingJoinRequest {
    pub host_counter: u32,
    pub entry_key: u32,
    pub name: String,
    pub internal_ip: [u8; 4],
}

/// An opaque action tagged with the UID that sent it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingAction {
    pub uid: u8,
    pub action: Vec<u8>,
}

impl IncomingAction {
    pub fn new(uid: u8, action: Vec<u8>) -> Self {
        Self { uid, action }
    }

    /// The first action byte, 0 for an empty action
    pub fn sniffed_type(&self) -> u8 {
        self.action.first().copied().unwrap_or(0)
    }

    /// Bytes this action occupies inside an action subpacket
    pub fn wire_len(&self) -> usize {
        ACTION_HEADER_SIZE + self.action.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatToHostKind {
    Message(String),
    MessageExtra { extra_flags: [u8; 4], message: String },
    TeamChange(u8),
    ColorChange(u8),
    RaceChange(u8),
    HandicapChange(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatToHost {
    pub from_uid: u8,
    pub to_uids: Vec<u8>,
    pub kind: ChatToHostKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapSize {
    /// 1 = client has the map, 3 = download progress report
    pub size_flag: u8,
    pub map_size: u32,
}

/// Everything a connected game client may send to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    ReqJoin(IncomingJoinRequest),
    LeaveGame { reason: u32 },
    GameLoadedSelf,
    OutgoingAction { crc: u32, action: Vec<u8> },
    KeepAlive { checksum: u32 },
    ChatToHost(ChatToHost),
    DropReq,
    MapSize(MapSize),
    PongToHost { value: u32 },
    SearchGame,
    Unknown { id: u8 },
}

/// Reads the total length of the packet at the front of `buffer`, if the header is complete
pub fn peek_packet_len(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < 4 {
        return None;
    }
    Some(u16::from_le_bytes([buffer[2], buffer[3]]) as usize)
}

/// Decodes a complete W3GS packet sent by a client
pub fn parse_client_packet(data: &[u8]) -> Result<ClientPacket, ProtocolError> {
    validate_length(data, W3GS_HEADER)?;
    match data[1] {
        id::REQJOIN => parse_req_join(data).map(ClientPacket::ReqJoin),
        id::LEAVEGAME => Ok(ClientPacket::LeaveGame {
            reason: read_u32(data, 4)?,
        }),
        id::GAMELOADED_SELF => Ok(ClientPacket::GameLoadedSelf),
        id::OUTGOING_ACTION => {
            ensure_len(data, 8)?;
            Ok(ClientPacket::OutgoingAction {
                crc: read_u32(data, 4)?,
                action: data[8..].to_vec(),
            })
        }
        id::OUTGOING_KEEPALIVE => parse_keepalive(data).map(|checksum| ClientPacket::KeepAlive { checksum }),
        id::CHAT_TO_HOST => parse_chat_to_host(data).map(ClientPacket::ChatToHost),
        id::DROPREQ => Ok(ClientPacket::DropReq),
        id::MAPSIZE => parse_map_size(data).map(ClientPacket::MapSize),
        id::PONG_TO_HOST => Ok(ClientPacket::PongToHost {
            value: read_u32(data, 4)?,
        }),
        id::SEARCHGAME => Ok(ClientPacket::SearchGame),
        other => Ok(ClientPacket::Unknown { id: other }),
    }
}

fn parse_req_join(data: &[u8]) -> Result<IncomingJoinRequest, ProtocolError> {
    ensure_len(data, 20)?;
    let host_counter = read_u32(data, 4)?;
    let entry_key = read_u32(data, 8)?;
    let raw_name = extract_cstring(data, 19);
    if raw_name.is_empty() {
        return Err(ProtocolError::InvalidName);
    }
    ensure_len(data, raw_name.len() + 30)?;
    let ip_at = raw_name.len() + 26;
    let mut internal_ip = [0u8; 4];
    internal_ip.copy_from_slice(&data[ip_at..ip_at + 4]);

    Ok(IncomingJoinRequest {
        host_counter,
        entry_key,
        name: String::from_utf8_lossy(raw_name).into_owned(),
        internal_ip,
    })
}

fn parse_keepalive(data: &[u8]) -> Result<u32, ProtocolError> {
    if data.len() != 9 {
        return Err(ProtocolError::LengthMismatch {
            declared: 9,
            actual: data.len(),
        });
    }
    read_u32(data, 5)
}

fn parse_chat_to_host(data: &[u8]) -> Result<ChatToHost, ProtocolError> {
    ensure_len(data, 5)?;
    let total = data[4] as usize;
    let mut i = 5;
    if total == 0 {
        return Err(ProtocolError::EmptyRecipients);
    }
    ensure_len(data, i + total + 2)?;
    let to_uids = data[i..i + total].to_vec();
    i += total;
    let from_uid = data[i];
    let flag = data[i + 1];
    i += 2;

    let kind = match flag {
        chat_flag::MESSAGE => {
            ensure_len(data, i + 1)?;
            let message = extract_cstring(data, i);
            ChatToHostKind::Message(String::from_utf8_lossy(message).into_owned())
        }
        chat_flag::TEAM_CHANGE..=chat_flag::HANDICAP_CHANGE => {
            ensure_len(data, i + 1)?;
            let byte = data[i];
            match flag {
                chat_flag::TEAM_CHANGE => ChatToHostKind::TeamChange(byte),
                chat_flag::COLOR_CHANGE => ChatToHostKind::ColorChange(byte),
                chat_flag::RACE_CHANGE => ChatToHostKind::RaceChange(byte),
                _ => ChatToHostKind::HandicapChange(byte),
            }
        }
        chat_flag::MESSAGE_EXTRA => {
            ensure_len(data, i + 5)?;
            let mut extra_flags = [0u8; 4];
            extra_flags.copy_from_slice(&data[i..i + 4]);
            let message = extract_cstring(data, i + 4);
            ChatToHostKind::MessageExtra {
                extra_flags,
                message: String::from_utf8_lossy(message).into_owned(),
            }
        }
        other => return Err(ProtocolError::UnexpectedId(other)),
    };

    Ok(ChatToHost {
        from_uid,
        to_uids,
        kind,
    })
}

fn parse_map_size(data: &[u8]) -> Result<MapSize, ProtocolError> {
    ensure_len(data, 13)?;
    Ok(MapSize {
        size_flag: data[8],
        map_size: read_u32(data, 9)?,
    })
}

fn header(message_id: u8) -> Vec<u8> {
    vec![W3GS_HEADER, message_id, 0, 0]
}

/// Writes the length of a packet built from caller-sized data
fn finish(mut packet: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
    assign_length(&mut packet)?;
    Ok(packet)
}

/// Writes the length of a packet whose layout keeps it far below the u16 limit
fn seal(mut packet: Vec<u8>) -> Vec<u8> {
    debug_assert!(packet.len() <= u16::MAX as usize);
    let [lo, hi] = (packet.len() as u16).to_le_bytes();
    packet[2] = lo;
    packet[3] = hi;
    packet
}

pub fn ping_from_host(ticks: u32) -> Vec<u8> {
    let mut packet = header(id::PING_FROM_HOST);
    packet.extend_from_slice(&ticks.to_le_bytes());
    seal(packet)
}

/// Client-side join request, used by tests and tooling that act as a game client
pub fn req_join(
    host_counter: u32,
    entry_key: u32,
    name: &str,
    listen_port: u16,
) -> Result<Vec<u8>, ProtocolError> {
    let mut packet = header(id::REQJOIN);
    packet.extend_from_slice(&host_counter.to_le_bytes());
    packet.extend_from_slice(&entry_key.to_le_bytes());
    packet.push(0);
    packet.extend_from_slice(&listen_port.to_le_bytes());
    packet.extend_from_slice(&[0; 4]);
    push_cstring(&mut packet, name.as_bytes());
    packet.extend_from_slice(&[0; 4]);
    packet.extend_from_slice(&listen_port.to_be_bytes());
    packet.extend_from_slice(&[0; 12]);
    finish(packet)
}

pub fn slot_info_join(
    uid: u8,
    port: u16,
    external_ip: [u8; 4],
    slots: &[GameSlot],
    random_seed: u32,
    layout: LayoutStyle,
    player_slots: u8,
) -> Vec<u8> {
    let info = encode_slot_info(slots, random_seed, layout, player_slots);
    let mut packet = header(id::SLOTINFOJOIN);
    packet.extend_from_slice(&(info.len() as u16).to_le_bytes());
    packet.extend_from_slice(&info);
    packet.push(uid);
    packet.extend_from_slice(&[2, 0]);
    packet.extend_from_slice(&port.to_be_bytes());
    packet.extend_from_slice(&external_ip);
    packet.extend_from_slice(&[0; 8]);
    seal(packet)
}

pub fn reject_join(reason: RejectReason) -> Vec<u8> {
    let mut packet = header(id::REJECTJOIN);
    packet.extend_from_slice(&(reason as u32).to_le_bytes());
    seal(packet)
}

fn push_sockaddr(packet: &mut Vec<u8>, ip: [u8; 4]) {
    packet.extend_from_slice(&[2, 0, 0, 0]);
    packet.extend_from_slice(&ip);
    packet.extend_from_slice(&[0; 8]);
}

pub fn player_info(
    uid: u8,
    name: &str,
    external_ip: [u8; 4],
    internal_ip: [u8; 4],
) -> Result<Vec<u8>, ProtocolError> {
    if name.is_empty() || name.len() > MAX_PLAYER_NAME_SIZE {
        return Err(ProtocolError::InvalidName);
    }
    let mut packet = header(id::PLAYERINFO);
    packet.extend_from_slice(&[2, 0, 0, 0]);
    packet.push(uid);
    push_cstring(&mut packet, name.as_bytes());
    packet.extend_from_slice(&[1, 0]);
    push_sockaddr(&mut packet, external_ip);
    push_sockaddr(&mut packet, internal_ip);
    finish(packet)
}

/// Player info with both addresses zeroed
pub fn player_info_exclude_ip(uid: u8, name: &str) -> Result<Vec<u8>, ProtocolError> {
    player_info(uid, name, [0; 4], [0; 4])
}

pub fn player_leave_others(uid: u8, code: LeaveCode) -> Vec<u8> {
    let mut packet = header(id::PLAYERLEAVE_OTHERS);
    packet.push(uid);
    packet.extend_from_slice(&(code as u32).to_le_bytes());
    seal(packet)
}

pub fn game_loaded_others(uid: u8) -> Vec<u8> {
    let mut packet = header(id::GAMELOADED_OTHERS);
    packet.push(uid);
    seal(packet)
}

pub fn slot_info(
    slots: &[GameSlot],
    random_seed: u32,
    layout: LayoutStyle,
    player_slots: u8,
) -> Vec<u8> {
    let info = encode_slot_info(slots, random_seed, layout, player_slots);
    let mut packet = header(id::SLOTINFO);
    packet.extend_from_slice(&(info.len() as u16).to_le_bytes());
    packet.extend_from_slice(&info);
    seal(packet)
}

pub fn countdown_start() -> Vec<u8> {
    seal(header(id::COUNTDOWN_START))
}

pub fn countdown_end() -> Vec<u8> {
    seal(header(id::COUNTDOWN_END))
}

/// `INCOMING_ACTION` with no actions and a zero send interval
pub fn empty_action() -> Vec<u8> {
    vec![W3GS_HEADER, id::INCOMING_ACTION, 6, 0, 0, 0]
}

pub fn empty_actions(count: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 * count);
    for _ in 0..count {
        out.extend_from_slice(&empty_action());
    }
    out
}

fn action_subpacket(actions: &[IncomingAction]) -> Vec<u8> {
    let mut subpacket = Vec::with_capacity(actions.iter().map(|a| a.wire_len()).sum());
    for action in actions {
        subpacket.push(action.uid);
        subpacket.extend_from_slice(&(action.action.len() as u16).to_le_bytes());
        subpacket.extend_from_slice(&action.action);
    }
    subpacket
}

fn action_crc(subpacket: &[u8]) -> u16 {
    (crc32fast::hash(subpacket) & 0xFFFF) as u16
}

/// Final packet of a frame, carrying the time until the next one
pub fn incoming_action(actions: &[IncomingAction], send_interval: u16) -> Result<Vec<u8>, ProtocolError> {
    let mut packet = header(id::INCOMING_ACTION);
    packet.extend_from_slice(&send_interval.to_le_bytes());
    if !actions.is_empty() {
        let subpacket = action_subpacket(actions);
        packet.extend_from_slice(&action_crc(&subpacket).to_le_bytes());
        packet.extend_from_slice(&subpacket);
    }
    finish(packet)
}

/// Continuation packet of a frame; always precedes the final `INCOMING_ACTION`
pub fn incoming_action2(actions: &[IncomingAction]) -> Result<Vec<u8>, ProtocolError> {
    let mut packet = header(id::INCOMING_ACTION2);
    packet.extend_from_slice(&[0, 0]);
    if !actions.is_empty() {
        let subpacket = action_subpacket(actions);
        packet.extend_from_slice(&action_crc(&subpacket).to_le_bytes());
        packet.extend_from_slice(&subpacket);
    }
    finish(packet)
}

/// A decoded `INCOMING_ACTION` or `INCOMING_ACTION2`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionBatch {
    /// `None` for continuation packets
    pub send_interval: Option<u16>,
    pub actions: Vec<IncomingAction>,
}

/// Decodes one relayed action packet, verifying the subpacket checksum
pub fn parse_action_batch(data: &[u8]) -> Result<ActionBatch, ProtocolError> {
    validate_length(data, W3GS_HEADER)?;
    let send_interval = match data[1] {
        id::INCOMING_ACTION => Some(read_u16(data, 4)?),
        id::INCOMING_ACTION2 => None,
        other => return Err(ProtocolError::UnexpectedId(other)),
    };
    ensure_len(data, 6)?;
    if data.len() == 6 {
        return Ok(ActionBatch {
            send_interval,
            actions: Vec::new(),
        });
    }
    let crc = read_u16(data, 6)?;
    let subpacket = &data[8..];
    if action_crc(subpacket) != crc {
        return Err(ProtocolError::ChecksumMismatch);
    }

    let mut actions = Vec::new();
    let mut i = 0;
    while i < subpacket.len() {
        ensure_len(subpacket, i + 3)?;
        let uid = subpacket[i];
        let len = read_u16(subpacket, i + 1)? as usize;
        ensure_len(subpacket, i + 3 + len)?;
        actions.push(IncomingAction::new(
            uid,
            subpacket[i + 3..i + 3 + len].to_vec(),
        ));
        i += 3 + len;
    }
    Ok(ActionBatch {
        send_interval,
        actions,
    })
}

pub fn chat_from_host(
    from_uid: u8,
    to_uids: &[u8],
    flag: u8,
    flag_extra: &[u8],
    message: &str,
) -> Result<Vec<u8>, ProtocolError> {
    if to_uids.is_empty() {
        return Err(ProtocolError::EmptyRecipients);
    }
    if message.is_empty() || message.len() >= 255 {
        return Err(ProtocolError::MessageTooLong(message.len()));
    }
    let mut packet = header(id::CHAT_FROM_HOST);
    packet.push(to_uids.len() as u8);
    packet.extend_from_slice(to_uids);
    packet.push(from_uid);
    packet.push(flag);
    packet.extend_from_slice(flag_extra);
    push_cstring(&mut packet, message.as_bytes());
    finish(packet)
}

/// Lag screen for the given `(uid, lagging_ms)` pairs
pub fn start_lag(laggers: &[(u8, u32)]) -> Result<Vec<u8>, ProtocolError> {
    if laggers.is_empty() {
        return Err(ProtocolError::EmptyRecipients);
    }
    let mut packet = header(id::START_LAG);
    packet.push(laggers.len() as u8);
    for (uid, lagging_ms) in laggers {
        packet.push(*uid);
        packet.extend_from_slice(&lagging_ms.to_le_bytes());
    }
    finish(packet)
}

pub fn stop_lag(uid: u8, lagging_ms: u32) -> Vec<u8> {
    let mut packet = header(id::STOP_LAG);
    packet.push(uid);
    packet.extend_from_slice(&lagging_ms.to_le_bytes());
    seal(packet)
}

const PRODUCT_TFT: [u8; 4] = *b"PX3W";

pub fn create_game(game_version: u8, host_counter: u32) -> Vec<u8> {
    let mut packet = header(id::CREATEGAME);
    packet.extend_from_slice(&PRODUCT_TFT);
    packet.extend_from_slice(&[game_version, 0, 0, 0]);
    packet.extend_from_slice(&host_counter.to_le_bytes());
    seal(packet)
}

pub fn refresh_game(host_counter: u32, players: u32, player_slots: u32) -> Vec<u8> {
    let mut packet = header(id::REFRESHGAME);
    packet.extend_from_slice(&host_counter.to_le_bytes());
    packet.extend_from_slice(&players.to_le_bytes());
    packet.extend_from_slice(&player_slots.to_le_bytes());
    seal(packet)
}

pub fn decreate_game(host_counter: u32) -> Vec<u8> {
    let mut packet = header(id::DECREATEGAME);
    packet.extend_from_slice(&host_counter.to_le_bytes());
    seal(packet)
}

pub fn map_check(
    map_path: &str,
    map_size: u32,
    map_crc32: [u8; 4],
    map_hash: [u8; 4],
    map_sha1: Option<[u8; 20]>,
) -> Result<Vec<u8>, ProtocolError> {
    let mut packet = header(id::MAPCHECK);
    packet.extend_from_slice(&[1, 0, 0, 0]);
    push_cstring(&mut packet, map_path.as_bytes());
    packet.extend_from_slice(&map_size.to_le_bytes());
    packet.extend_from_slice(&map_crc32);
    packet.extend_from_slice(&map_hash);
    if let Some(sha1) = map_sha1 {
        packet.extend_from_slice(&sha1);
    }
    finish(packet)
}

pub fn start_download(from_uid: u8) -> Vec<u8> {
    let mut packet = header(id::STARTDOWNLOAD);
    packet.extend_from_slice(&[1, 0, 0, 0]);
    packet.push(from_uid);
    seal(packet)
}

/// Map chunk starting at `start` within `map_data`; returns the packet and the end offset
pub fn map_part(from_uid: u8, to_uid: u8, start: usize, map_data: &[u8]) -> Option<(Vec<u8>, usize)> {
    if start >= map_data.len() {
        return None;
    }
    let end = (start + MAP_PART_SIZE).min(map_data.len());
    let chunk = &map_data[start..end];

    let mut packet = header(id::MAPPART);
    packet.extend_from_slice(&[to_uid, from_uid, 1, 0, 0, 0]);
    packet.extend_from_slice(&(start as u32).to_le_bytes());
    packet.extend_from_slice(&crc32fast::hash(chunk).to_le_bytes());
    packet.extend_from_slice(chunk);
    Some((seal(packet), end))
}

/// Client-side `MAPSIZE`, used by tests driving the download flow
pub fn map_size(size_flag: u8, map_size: u32) -> Vec<u8> {
    let mut packet = header(id::MAPSIZE);
    packet.extend_from_slice(&[1, 0, 0, 0]);
    packet.push(size_flag);
    packet.extend_from_slice(&map_size.to_le_bytes());
    seal(packet)
}

pub fn leave_game(reason: LeaveCode) -> Vec<u8> {
    let mut packet = header(id::LEAVEGAME);
    packet.extend_from_slice(&(reason as u32).to_le_bytes());
    seal(packet)
}

pub fn game_loaded_self() -> Vec<u8> {
    seal(header(id::GAMELOADED_SELF))
}

/// Client-side action; the CRC field is not checked by the host
pub fn outgoing_action(action: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut packet = header(id::OUTGOING_ACTION);
    packet.extend_from_slice(&crc32fast::hash(action).to_le_bytes());
    packet.extend_from_slice(action);
    finish(packet)
}

pub fn outgoing_keepalive(checksum: u32) -> Vec<u8> {
    let mut packet = header(id::OUTGOING_KEEPALIVE);
    packet.push(0);
    packet.extend_from_slice(&checksum.to_le_bytes());
    seal(packet)
}

pub fn chat_to_host(from_uid: u8, to_uids: &[u8], message: &str) -> Result<Vec<u8>, ProtocolError> {
    let mut packet = header(id::CHAT_TO_HOST);
    packet.push(to_uids.len() as u8);
    packet.extend_from_slice(to_uids);
    packet.push(from_uid);
    packet.push(chat_flag::MESSAGE);
    push_cstring(&mut packet, message.as_bytes());
    finish(packet)
}

/// Client-side lobby setting request (team, color, race or handicap)
pub fn chat_to_host_setting(from_uid: u8, flag: u8, value: u8) -> Vec<u8> {
    let mut packet = header(id::CHAT_TO_HOST);
    packet.extend_from_slice(&[1, from_uid, from_uid, flag, value]);
    seal(packet)
}

pub fn drop_req() -> Vec<u8> {
    seal(header(id::DROPREQ))
}

pub fn pong_to_host(value: u32) -> Vec<u8> {
    let mut packet = header(id::PONG_TO_HOST);
    packet.extend_from_slice(&value.to_le_bytes());
    seal(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::GameSlot;

    fn chat_packet(to: &[u8], from: u8, flag: u8, body: &[u8]) -> Vec<u8> {
        let mut packet = vec![W3GS_HEADER, id::CHAT_TO_HOST, 0, 0, to.len() as u8];
        packet.extend_from_slice(to);
        packet.push(from);
        packet.push(flag);
        packet.extend_from_slice(body);
        let len = packet.len() as u16;
        packet[2..4].copy_from_slice(&len.to_le_bytes());
        packet
    }

    #[test]
    fn test_req_join_parse() {
        let packet = req_join(0x01000005, 0xCAFEBABE, "Grubby", 6112).unwrap();
        match parse_client_packet(&packet).unwrap() {
            ClientPacket::ReqJoin(request) => {
                assert_eq!(request.host_counter, 0x01000005);
                assert_eq!(request.entry_key, 0xCAFEBABE);
                assert_eq!(request.name, "Grubby");
                assert_eq!(request.internal_ip, [0, 0, 0, 0]);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_req_join_rejects_truncated_name_block() {
        let mut packet = req_join(1, 2, "Moon", 6112).unwrap();
        packet.truncate(30);
        let len = packet.len() as u16;
        packet[2..4].copy_from_slice(&len.to_le_bytes());
        assert!(matches!(
            parse_client_packet(&packet),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_keepalive_requires_exact_size() {
        let packet = [W3GS_HEADER, id::OUTGOING_KEEPALIVE, 9, 0, 0, 0x78, 0x56, 0x34, 0x12];
        assert_eq!(
            parse_client_packet(&packet).unwrap(),
            ClientPacket::KeepAlive {
                checksum: 0x12345678
            }
        );

        let long = [W3GS_HEADER, id::OUTGOING_KEEPALIVE, 10, 0, 0, 1, 2, 3, 4, 5];
        assert!(parse_client_packet(&long).is_err());
    }

    #[test]
    fn test_chat_to_host_variants() {
        let message = chat_packet(&[1, 2], 3, chat_flag::MESSAGE, b"gl hf\0");
        let parsed = parse_client_packet(&message).unwrap();
        assert_eq!(
            parsed,
            ClientPacket::ChatToHost(ChatToHost {
                from_uid: 3,
                to_uids: vec![1, 2],
                kind: ChatToHostKind::Message("gl hf".to_string()),
            })
        );

        let team = chat_packet(&[1], 3, chat_flag::TEAM_CHANGE, &[1]);
        match parse_client_packet(&team).unwrap() {
            ClientPacket::ChatToHost(chat) => {
                assert_eq!(chat.kind, ChatToHostKind::TeamChange(1))
            }
            other => panic!("unexpected packet {:?}", other),
        }

        let extra = chat_packet(&[1], 3, chat_flag::MESSAGE_EXTRA, b"\x02\0\0\0hi\0");
        match parse_client_packet(&extra).unwrap() {
            ClientPacket::ChatToHost(chat) => assert_eq!(
                chat.kind,
                ChatToHostKind::MessageExtra {
                    extra_flags: [2, 0, 0, 0],
                    message: "hi".to_string()
                }
            ),
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_map_size_parse() {
        let packet = map_size(3, 1_000_000);
        assert_eq!(
            parse_client_packet(&packet).unwrap(),
            ClientPacket::MapSize(MapSize {
                size_flag: 3,
                map_size: 1_000_000
            })
        );
    }

    #[test]
    fn test_empty_action_shape() {
        assert_eq!(empty_action(), vec![0xF7, 0x0C, 0x06, 0x00, 0x00, 0x00]);
        assert_eq!(incoming_action(&[], 0).unwrap(), empty_action());
        assert_eq!(empty_actions(3).len(), 18);
    }

    #[test]
    fn test_incoming_action_roundtrip_preserves_order() {
        let actions = vec![
            IncomingAction::new(2, vec![0x10, 0x20]),
            IncomingAction::new(1, vec![0x6B, 1, 2, 3]),
            IncomingAction::new(2, vec![]),
        ];
        let packet = incoming_action(&actions, 100).unwrap();
        let batch = parse_action_batch(&packet).unwrap();
        assert_eq!(batch.send_interval, Some(100));
        assert_eq!(batch.actions, actions);

        let packet2 = incoming_action2(&actions).unwrap();
        let batch2 = parse_action_batch(&packet2).unwrap();
        assert_eq!(batch2.send_interval, None);
        assert_eq!(batch2.actions, actions);
    }

    #[test]
    fn test_oversized_action_packets_are_refused() {
        let largest = outgoing_action(&vec![0x10; u16::MAX as usize - 8]).unwrap();
        assert_eq!(largest.len(), u16::MAX as usize);
        assert_eq!(u16::from_le_bytes([largest[2], largest[3]]), u16::MAX);
        assert_eq!(
            outgoing_action(&vec![0x10; u16::MAX as usize - 7]),
            Err(ProtocolError::Oversized(u16::MAX as usize + 1))
        );

        let relayed = vec![IncomingAction::new(1, vec![0x10; u16::MAX as usize - 8])];
        assert_eq!(
            incoming_action(&relayed, 100),
            Err(ProtocolError::Oversized(u16::MAX as usize + 3))
        );
        assert!(incoming_action2(&relayed).is_err());
    }

    #[test]
    fn test_action_batch_detects_corruption() {
        let actions = vec![IncomingAction::new(1, vec![1, 2, 3])];
        let mut packet = incoming_action(&actions, 50).unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        assert_eq!(
            parse_action_batch(&packet),
            Err(ProtocolError::ChecksumMismatch)
        );
    }

    #[test]
    fn test_player_info_validates_name() {
        assert!(player_info_exclude_ip(1, "").is_err());
        assert!(player_info_exclude_ip(1, "ThisNameIsWayTooLong").is_err());

        let packet = player_info(4, "Sky", [1, 2, 3, 4], [10, 0, 0, 1]).unwrap();
        assert_eq!(packet[1], id::PLAYERINFO);
        assert_eq!(packet[8], 4);
        assert_eq!(&packet[9..13], b"Sky\0");
        assert_eq!(peek_packet_len(&packet), Some(packet.len()));
    }

    #[test]
    fn test_fixed_size_builders() {
        assert_eq!(reject_join(RejectReason::Full), vec![0xF7, 0x05, 8, 0, 9, 0, 0, 0]);
        assert_eq!(player_leave_others(3, LeaveCode::Lobby)[2], 9);
        assert_eq!(game_loaded_others(3), vec![0xF7, 0x08, 5, 0, 3]);
        assert_eq!(countdown_start(), vec![0xF7, 0x0A, 4, 0]);
        assert_eq!(create_game(28, 7).len(), 16);
        assert_eq!(refresh_game(7, 2, 10).len(), 16);
        assert_eq!(decreate_game(7).len(), 8);
        assert_eq!(start_download(1), vec![0xF7, 0x3F, 9, 0, 1, 0, 0, 0, 1]);
        assert_eq!(stop_lag(2, 1500).len(), 9);
    }

    #[test]
    fn test_chat_from_host_limits() {
        assert!(chat_from_host(1, &[], 16, &[], "hello").is_err());
        assert!(chat_from_host(1, &[2], 16, &[], "").is_err());
        let long = "x".repeat(300);
        assert!(chat_from_host(1, &[2], 16, &[], &long).is_err());
        let packet = chat_from_host(1, &[2, 3], 32, &[0, 0, 0, 0], "hi").unwrap();
        assert_eq!(packet[4], 2);
        assert_eq!(*packet.last().unwrap(), 0);
    }

    #[test]
    fn test_start_lag_layout() {
        let packet = start_lag(&[(1, 100), (3, 2500)]).unwrap();
        assert_eq!(packet[4], 2);
        assert_eq!(packet.len(), 5 + 2 * 5);
        assert!(start_lag(&[]).is_err());
    }

    #[test]
    fn test_map_part_chunks() {
        let map: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let (first, end) = map_part(1, 2, 0, &map).unwrap();
        assert_eq!(end, MAP_PART_SIZE);
        assert_eq!(first.len(), 18 + MAP_PART_SIZE);
        assert_eq!(
            &first[14..18],
            &crc32fast::hash(&map[..MAP_PART_SIZE]).to_le_bytes()
        );

        let (_, end) = map_part(1, 2, 2 * MAP_PART_SIZE, &map).unwrap();
        assert_eq!(end, 3000);
        assert!(map_part(1, 2, 3000, &map).is_none());
    }

    #[test]
    fn test_slot_info_packets() {
        let slots = vec![GameSlot::open(0, 0), GameSlot::open(1, 1)];
        let info = slot_info(&slots, 1, LayoutStyle::Melee, 2);
        assert_eq!(info[1], id::SLOTINFO);
        assert_eq!(read_u16(&info, 4).unwrap() as usize, info.len() - 6);

        let join = slot_info_join(2, 6112, [127, 0, 0, 1], &slots, 1, LayoutStyle::Melee, 2);
        assert_eq!(join[1], id::SLOTINFOJOIN);
        let info_len = read_u16(&join, 4).unwrap() as usize;
        assert_eq!(join[6 + info_len], 2);
    }
    #[test]
    fn test_client_builders_parse() {
        assert_eq!(
            parse_client_packet(&outgoing_keepalive(0xABCD)).unwrap(),
            ClientPacket::KeepAlive { checksum: 0xABCD }
        );
        assert_eq!(parse_client_packet(&drop_req()).unwrap(), ClientPacket::DropReq);
        assert_eq!(parse_client_packet(&game_loaded_self()).unwrap(), ClientPacket::GameLoadedSelf);
        assert_eq!(
            parse_client_packet(&leave_game(LeaveCode::Lost)).unwrap(),
            ClientPacket::LeaveGame { reason: 7 }
        );
        match parse_client_packet(&outgoing_action(&[1, 2, 3]).unwrap()).unwrap() {
            ClientPacket::OutgoingAction { action, .. } => assert_eq!(action, vec![1, 2, 3]),
            other => panic!("unexpected packet {:?}", other),
        }
        match parse_client_packet(&chat_to_host_setting(3, chat_flag::TEAM_CHANGE, 1)).unwrap() {
            ClientPacket::ChatToHost(chat) => {
                assert_eq!(chat.from_uid, 3);
                assert_eq!(chat.kind, ChatToHostKind::TeamChange(1));
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }
}
