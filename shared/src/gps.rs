//! GProxy reconnect protocol (`0xF8` header)
//!
//! Reconnect-capable clients negotiate a key and an empty-action count at game
//! start. When their connection drops they open a new socket, present the key
//! together with the number of packets they received, and the host replays
//! whatever was sent after that point.

use crate::bytes::{assign_length, read_u32, validate_length};
use crate::error::ProtocolError;

pub const GPS_HEADER: u8 = 0xF8;

pub mod id {
    pub const INIT: u8 = 1;
    pub const RECONNECT: u8 = 2;
    pub const ACK: u8 = 3;
    pub const REJECT: u8 = 4;
    pub const SUPPORT_EXTENDED: u8 = 50;
    pub const CHANGE_KEY: u8 = 51;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GpsRejectReason {
    Invalid = 1,
    NotFound = 2,
}

/// Messages a reconnect-capable client sends to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpsClientPacket {
    Init { version: u32 },
    Reconnect { uid: u8, reconnect_key: u32, last_packet: u32 },
    Ack { last_packet: u32 },
    SupportExtended { seconds: u32 },
    Unknown { id: u8 },
}

pub fn parse_client_packet(data: &[u8]) -> Result<GpsClientPacket, ProtocolError> {
    validate_length(data, GPS_HEADER)?;
    match data[1] {
        id::INIT => Ok(GpsClientPacket::Init {
            version: read_u32(data, 4)?,
        }),
        id::RECONNECT => {
            let reconnect_key = read_u32(data, 5)?;
            let last_packet = read_u32(data, 9)?;
            Ok(GpsClientPacket::Reconnect {
                uid: data[4],
                reconnect_key,
                last_packet,
            })
        }
        id::ACK => Ok(GpsClientPacket::Ack {
            last_packet: read_u32(data, 4)?,
        }),
        id::SUPPORT_EXTENDED => Ok(GpsClientPacket::SupportExtended {
            seconds: read_u32(data, 4)?,
        }),
        other => Ok(GpsClientPacket::Unknown { id: other }),
    }
}

fn fixed(message_id: u8, value: u32) -> Vec<u8> {
    let mut packet = vec![GPS_HEADER, message_id, 8, 0];
    packet.extend_from_slice(&value.to_le_bytes());
    packet
}

pub fn init(reconnect_port: u16, uid: u8, reconnect_key: u32, empty_actions: u8) -> Vec<u8> {
    let mut packet = vec![GPS_HEADER, id::INIT, 12, 0];
    packet.extend_from_slice(&reconnect_port.to_le_bytes());
    packet.push(uid);
    packet.extend_from_slice(&reconnect_key.to_le_bytes());
    packet.push(empty_actions);
    packet
}

pub fn reconnect(last_packet: u32) -> Vec<u8> {
    fixed(id::RECONNECT, last_packet)
}

pub fn ack(last_packet: u32) -> Vec<u8> {
    fixed(id::ACK, last_packet)
}

pub fn reject(reason: GpsRejectReason) -> Vec<u8> {
    fixed(id::REJECT, reason as u32)
}

pub fn change_key(reconnect_key: u32) -> Vec<u8> {
    fixed(id::CHANGE_KEY, reconnect_key)
}

/// Announces the extended grace period; `game_id` is omitted when zero
pub fn support_extended(wait_ms: u64, game_id: u32) -> Vec<u8> {
    let mut packet = vec![GPS_HEADER, id::SUPPORT_EXTENDED, 0, 0];
    packet.extend_from_slice(&((wait_ms / 1000) as u32).to_le_bytes());
    if game_id > 0 {
        packet.extend_from_slice(&game_id.to_le_bytes());
    }
    // at most 12 bytes, cannot overflow
    let _ = assign_length(&mut packet);
    packet
}

/// Client-side reconnect request
pub fn client_reconnect(uid: u8, reconnect_key: u32, last_packet: u32) -> Vec<u8> {
    let mut packet = vec![GPS_HEADER, id::RECONNECT, 13, 0, uid];
    packet.extend_from_slice(&reconnect_key.to_le_bytes());
    packet.extend_from_slice(&last_packet.to_le_bytes());
    packet
}

pub fn client_init(version: u32) -> Vec<u8> {
    fixed(id::INIT, version)
}

pub fn client_ack(last_packet: u32) -> Vec<u8> {
    fixed(id::ACK, last_packet)
}

pub fn client_support_extended(seconds: u32) -> Vec<u8> {
    fixed(id::SUPPORT_EXTENDED, seconds)
}
