//! LAN discovery beacons (`GAMEINFO`)
//!
//! The beacon is large and almost entirely static for the life of a lobby, so
//! it is encoded once into a template. Each broadcast copies the template and
//! patches the game version and the dynamic tail (available slots, uptime and
//! port) at offsets recorded while the template was built.

use crate::bytes::{assign_length, push_cstring};
use crate::error::ProtocolError;
use crate::w3gs::{id, W3GS_HEADER};

/// Static inputs of the discovery beacon
#[derive(Debug, Clone)]
pub struct GameInfoParams<'a> {
    pub map_game_type: u32,
    pub map_flags: u32,
    pub map_width: [u8; 2],
    pub map_height: [u8; 2],
    pub game_name: &'a str,
    pub host_name: &'a str,
    pub map_path: &'a str,
    pub map_hash: [u8; 4],
    pub slots_total: u32,
    pub host_counter: u32,
    pub entry_key: u32,
}

/// Pre-encoded `GAMEINFO` with the offsets of its mutable fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInfoTemplate {
    bytes: Vec<u8>,
    version_offset: usize,
    dynamic_offset: usize,
}

impl GameInfoTemplate {
    pub fn build(params: &GameInfoParams<'_>) -> Result<Self, ProtocolError> {
        if params.game_name.is_empty() || params.host_name.is_empty() || params.map_path.is_empty() {
            return Err(ProtocolError::InvalidName);
        }

        let mut stat = Vec::new();
        stat.extend_from_slice(&params.map_flags.to_le_bytes());
        stat.push(0);
        stat.extend_from_slice(&params.map_width);
        stat.extend_from_slice(&params.map_height);
        stat.extend_from_slice(&params.map_hash);
        push_cstring(&mut stat, params.map_path.as_bytes());
        push_cstring(&mut stat, params.host_name.as_bytes());
        stat.push(0);
        let stat = encode_stat_string(&stat);

        let mut bytes = vec![W3GS_HEADER, id::GAMEINFO, 0, 0];
        bytes.extend_from_slice(b"PX3W");
        let version_offset = bytes.len();
        bytes.extend_from_slice(&[0; 4]);
        bytes.extend_from_slice(&params.host_counter.to_le_bytes());
        bytes.extend_from_slice(&params.entry_key.to_le_bytes());
        push_cstring(&mut bytes, params.game_name.as_bytes());
        bytes.push(0);
        push_cstring(&mut bytes, &stat);
        bytes.extend_from_slice(&params.slots_total.to_le_bytes());
        bytes.extend_from_slice(&params.map_game_type.to_le_bytes());
        bytes.extend_from_slice(&[1, 0, 0, 0]);
        let dynamic_offset = bytes.len();
        bytes.extend_from_slice(&[0; 10]);
        assign_length(&mut bytes)?;

        Ok(Self {
            bytes,
            version_offset,
            dynamic_offset,
        })
    }

    /// Produces a ready-to-send beacon without re-encoding the static part
    pub fn render(&self, game_version: u8, slots_available_off: u32, uptime_secs: u32, port: u16) -> Vec<u8> {
        let mut packet = self.bytes.clone();
        packet[self.version_offset] = game_version;
        let d = self.dynamic_offset;
        packet[d..d + 4].copy_from_slice(&slots_available_off.to_le_bytes());
        packet[d + 4..d + 8].copy_from_slice(&uptime_secs.to_le_bytes());
        packet[d + 8..d + 10].copy_from_slice(&port.to_le_bytes());
        packet
    }

    pub fn version_offset(&self) -> usize {
        self.version_offset
    }

    pub fn dynamic_offset(&self) -> usize {
        self.dynamic_offset
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Removes zero bytes: every group of seven bytes is prefixed by a mask whose
/// bits record which bytes were odd before being forced odd.
pub fn encode_stat_string(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len() + data.len() / 7 + 1);
    for group in data.chunks(7) {
        let mut mask = 1u8;
        let mut encoded = Vec::with_capacity(group.len());
        for (i, &byte) in group.iter().enumerate() {
            if byte % 2 == 0 {
                encoded.push(byte.wrapping_add(1));
            } else {
                encoded.push(byte);
                mask |= 1 << (i + 1);
            }
        }
        result.push(mask);
        result.extend_from_slice(&encoded);
    }
    result
}

pub fn decode_stat_string(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    for group in data.chunks(8) {
        let mask = group[0];
        for (i, &byte) in group[1..].iter().enumerate() {
            if mask & (1 << (i + 1)) == 0 {
                result.push(byte.wrapping_sub(1));
            } else {
                result.push(byte);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> GameInfoParams<'static> {
        GameInfoParams {
            map_game_type: 1,
            map_flags: 0x0001_8000,
            map_width: [116, 0],
            map_height: [116, 0],
            game_name: "dota -ap",
            host_name: "Host",
            map_path: "Maps\\Download\\DotA.w3x",
            map_hash: [1, 2, 3, 4],
            slots_total: 12,
            host_counter: 5,
            entry_key: 0x11223344,
        }
    }

    #[test]
    fn test_stat_string_has_no_zero_bytes() {
        let raw = [0u8, 1, 2, 3, 0, 0, 255, 254, 0];
        let encoded = encode_stat_string(&raw);
        assert!(!encoded.contains(&0));
        assert_eq!(decode_stat_string(&encoded), raw.to_vec());
    }

    #[test]
    fn test_template_render_only_touches_dynamic_fields() {
        let template = GameInfoTemplate::build(&params()).unwrap();
        let a = template.render(28, 3, 10, 6112);
        let b = template.render(31, 7, 99, 6113);

        assert_eq!(a.len(), template.len());
        assert_eq!(a[template.version_offset()], 28);
        assert_eq!(b[template.version_offset()], 31);

        let d = template.dynamic_offset();
        assert_eq!(&a[d..d + 4], &3u32.to_le_bytes());
        assert_eq!(&b[d + 4..d + 8], &99u32.to_le_bytes());
        assert_eq!(&b[d + 8..d + 10], &6113u16.to_le_bytes());

        for i in 0..a.len() {
            if i == template.version_offset() || i >= d {
                continue;
            }
            assert_eq!(a[i], b[i], "static byte {} differs", i);
        }
    }

    #[test]
    fn test_template_header() {
        let template = GameInfoTemplate::build(&params()).unwrap();
        let packet = template.render(28, 0, 0, 6112);
        assert_eq!(&packet[0..2], &[W3GS_HEADER, id::GAMEINFO]);
        assert_eq!(u16::from_le_bytes([packet[2], packet[3]]) as usize, packet.len());
        assert_eq!(&packet[4..8], b"PX3W");
        assert_eq!(&packet[12..16], &5u32.to_le_bytes());
    }

    #[test]
    fn test_template_requires_names() {
        let mut bad = params();
        bad.game_name = "";
        assert!(GameInfoTemplate::build(&bad).is_err());
    }
}
