//! Host command lines smuggled into slot handicaps
//!
//! Each occupied slot carries one character. The byte written combines the
//! character index with the slot's real handicap so the map script can
//! recover both. Bytes that are valid vanilla handicaps are never produced.

use shared::slot::VALID_HANDICAPS;
use shared::GameSlot;
use thiserror::Error;

pub const HCL_CHARS: &str = "abcdefghijklmnopqrstuvwxyz0123456789 -=,.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HclError {
    #[error("[{0}] is not a valid HCL string")]
    InvalidCharacter(String),
    #[error("HCL string needs {needed} occupied slots, only {available} available")]
    TooLong { needed: usize, available: usize },
    #[error("slot handicap {0} cannot carry an HCL character")]
    BadHandicap(u8),
}

fn encoding_map() -> Vec<u8> {
    (0..=255u8)
        .filter(|b| *b != 0 && *b != 255 && !VALID_HANDICAPS.contains(b))
        .collect()
}

pub fn validate(command: &str) -> Result<(), HclError> {
    if command.chars().all(|c| HCL_CHARS.contains(c)) {
        Ok(())
    } else {
        Err(HclError::InvalidCharacter(command.to_string()))
    }
}

/// Writes `command` into the handicaps of occupied slots, in slot order
pub fn encode(command: &str, slots: &mut [GameSlot]) -> Result<(), HclError> {
    validate(command)?;
    let occupied: Vec<usize> = (0..slots.len()).filter(|&i| slots[i].is_occupied()).collect();
    let needed = command.chars().count();
    if needed > occupied.len() {
        return Err(HclError::TooLong {
            needed,
            available: occupied.len(),
        });
    }

    let map = encoding_map();
    let mut encoded = Vec::with_capacity(needed);
    for (c, &sid) in command.chars().zip(&occupied) {
        let char_index = HCL_CHARS.find(c).ok_or_else(|| HclError::InvalidCharacter(c.to_string()))?;
        let handicap = slots[sid].handicap;
        let handicap_index = VALID_HANDICAPS
            .iter()
            .position(|h| *h == handicap)
            .ok_or(HclError::BadHandicap(handicap))?;
        encoded.push((sid, map[handicap_index + char_index * VALID_HANDICAPS.len()]));
    }
    for (sid, byte) in encoded {
        slots[sid].handicap = byte;
    }
    Ok(())
}

/// Reads the command back and restores the original handicaps
pub fn decode(slots: &mut [GameSlot]) -> String {
    let map = encoding_map();
    let alphabet: Vec<char> = HCL_CHARS.chars().collect();
    let mut command = String::new();
    for slot in slots.iter_mut().filter(|s| s.is_occupied()) {
        let Some(k) = map.iter().position(|b| *b == slot.handicap) else {
            continue;
        };
        let (char_index, handicap_index) = (k / VALID_HANDICAPS.len(), k % VALID_HANDICAPS.len());
        if let Some(c) = alphabet.get(char_index) {
            command.push(*c);
            slot.handicap = VALID_HANDICAPS[handicap_index];
        }
    }
    command
}
