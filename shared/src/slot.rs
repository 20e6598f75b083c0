//! Slot descriptors as they travel on the wire
//!
//! A lobby is a fixed array of slots. Each slot carries the nine bytes the game
//! client expects in `SLOTINFO` packets plus the map-defined slot type, which
//! never leaves the host.

use serde::{Deserialize, Serialize};

/// Highest slot count supported by modern game versions
pub const MAX_SLOTS_MODERN: u8 = 24;
/// Slot count of game versions before 1.29
pub const MAX_SLOTS_LEGACY: u8 = 12;

pub const DEFAULT_HANDICAP: u8 = 100;
pub const VALID_HANDICAPS: [u8; 6] = [50, 60, 70, 80, 90, 100];

const RACE_SELECTABLE_FLAG: u8 = 64;

pub const COLOR_NAMES: [&str; 24] = [
    "red",
    "blue",
    "teal",
    "purple",
    "yellow",
    "orange",
    "green",
    "pink",
    "gray",
    "light blue",
    "dark green",
    "brown",
    "maroon",
    "navy",
    "turquoise",
    "violet",
    "wheat",
    "peach",
    "mint",
    "lavender",
    "coal",
    "snow",
    "emerald",
    "peanut",
];

/// Human-readable name of a color index, or "observer" for the sentinel
pub fn color_name(color: u8) -> &'static str {
    COLOR_NAMES
        .get(color as usize)
        .copied()
        .unwrap_or("observer")
}

/// Parses a color name (case-insensitive) into its index
pub fn parse_color(name: &str) -> Option<u8> {
    let lower = name.trim().to_ascii_lowercase();
    match lower.as_str() {
        "bleu" => Some(1),
        "grey" => Some(8),
        "lightblue" | "light-blue" => Some(9),
        "darkgreen" | "dark-green" => Some(10),
        _ => COLOR_NAMES
            .iter()
            .position(|&c| c == lower)
            .map(|i| i as u8),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SlotStatus {
    Open = 0,
    Closed = 1,
    Occupied = 2,
}

impl SlotStatus {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SlotStatus::Open),
            1 => Some(SlotStatus::Closed),
            2 => Some(SlotStatus::Occupied),
            _ => None,
        }
    }
}

/// Map-defined slot type. Types up to `User` can be edited from the lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SlotType {
    Auto,
    User,
    Computer,
    Neutral,
    Rescueable,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Race {
    Human = 1,
    Orc = 2,
    NightElf = 4,
    Undead = 8,
    Random = 32,
}

impl Race {
    /// Decodes a race byte, ignoring the selectable flag
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte & !RACE_SELECTABLE_FLAG {
            1 => Some(Race::Human),
            2 => Some(Race::Orc),
            4 => Some(Race::NightElf),
            8 => Some(Race::Undead),
            32 => Some(Race::Random),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ComputerSkill {
    Easy = 0,
    Normal = 1,
    Hard = 2,
}

impl ComputerSkill {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ComputerSkill::Easy),
            1 => Some(ComputerSkill::Normal),
            2 => Some(ComputerSkill::Hard),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "easy" | "0" => Some(ComputerSkill::Easy),
            "normal" | "1" => Some(ComputerSkill::Normal),
            "hard" | "insane" | "2" => Some(ComputerSkill::Hard),
            _ => None,
        }
    }
}

/// What is sitting in an occupied slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Occupant {
    None,
    Player,
    Computer,
    Fake,
}

/// One lobby position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSlot {
    pub slot_type: SlotType,
    pub uid: u8,
    /// 0..=100, or 255 while unknown
    pub download_status: u8,
    pub status: SlotStatus,
    pub occupant: Occupant,
    pub team: u8,
    pub color: u8,
    pub race: Race,
    pub race_selectable: bool,
    pub computer_skill: ComputerSkill,
    pub handicap: u8,
}

impl GameSlot {
    /// An open, user-editable slot with the given team and color
    pub fn open(team: u8, color: u8) -> Self {
        Self {
            slot_type: SlotType::User,
            uid: 0,
            download_status: 255,
            status: SlotStatus::Open,
            occupant: Occupant::None,
            team,
            color,
            race: Race::Random,
            race_selectable: true,
            computer_skill: ComputerSkill::Normal,
            handicap: DEFAULT_HANDICAP,
        }
    }

    /// A map-fixed computer slot
    pub fn fixed_computer(team: u8, color: u8, race: Race, skill: ComputerSkill) -> Self {
        Self {
            slot_type: SlotType::Computer,
            uid: 0,
            download_status: 100,
            status: SlotStatus::Occupied,
            occupant: Occupant::Computer,
            team,
            color,
            race,
            race_selectable: false,
            computer_skill: skill,
            handicap: DEFAULT_HANDICAP,
        }
    }

    pub fn is_selectable(&self) -> bool {
        self.slot_type <= SlotType::User
    }

    pub fn is_occupied(&self) -> bool {
        self.status == SlotStatus::Occupied
    }

    pub fn is_open(&self) -> bool {
        self.status == SlotStatus::Open
    }

    /// Occupied by a human or a fake stand-in
    pub fn is_player_or_fake(&self) -> bool {
        self.is_occupied() && self.occupant != Occupant::Computer
    }

    pub fn is_computer(&self) -> bool {
        self.is_occupied() && self.occupant == Occupant::Computer
    }

    pub fn race_byte(&self) -> u8 {
        let flag = if self.race_selectable {
            RACE_SELECTABLE_FLAG
        } else {
            0
        };
        self.race as u8 | flag
    }

    /// The nine bytes sent for this slot in `SLOTINFO`
    pub fn protocol_bytes(&self) -> [u8; 9] {
        [
            self.uid,
            self.download_status,
            self.status as u8,
            (self.occupant == Occupant::Computer) as u8,
            self.team,
            self.color,
            self.race_byte(),
            self.computer_skill as u8,
            self.handicap,
        ]
    }

    /// Decodes the nine-byte wire form; the slot type defaults to `User`
    pub fn from_protocol_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 9 {
            return None;
        }
        let status = SlotStatus::from_byte(bytes[2])?;
        let occupant = match (status, bytes[3]) {
            (SlotStatus::Occupied, 1) => Occupant::Computer,
            (SlotStatus::Occupied, _) => Occupant::Player,
            _ => Occupant::None,
        };
        Some(Self {
            slot_type: if occupant == Occupant::Computer {
                SlotType::Computer
            } else {
                SlotType::User
            },
            uid: bytes[0],
            download_status: bytes[1],
            status,
            occupant,
            team: bytes[4],
            color: bytes[5],
            race: Race::from_byte(bytes[6])?,
            race_selectable: bytes[6] & RACE_SELECTABLE_FLAG != 0,
            computer_skill: ComputerSkill::from_byte(bytes[7])?,
            handicap: bytes[8],
        })
    }

    /// Returns the slot to the open state while keeping its team/color position
    pub fn clear(&mut self) {
        self.uid = 0;
        self.download_status = 255;
        self.status = SlotStatus::Open;
        self.occupant = Occupant::None;
        self.computer_skill = ComputerSkill::Normal;
        self.handicap = DEFAULT_HANDICAP;
    }
}

/// How the lobby presents team/color control to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LayoutStyle {
    Melee = 0,
    CustomForces = 1,
    FixedPlayerSettings = 3,
}

impl LayoutStyle {
    pub fn has_custom_forces(self) -> bool {
        self != LayoutStyle::Melee
    }

    pub fn has_fixed_settings(self) -> bool {
        self == LayoutStyle::FixedPlayerSettings
    }
}

/// Encodes the slot table as embedded in `SLOTINFO` and `SLOTINFOJOIN`
pub fn encode_slot_info(
    slots: &[GameSlot],
    random_seed: u32,
    layout: LayoutStyle,
    player_slots: u8,
) -> Vec<u8> {
    let mut info = Vec::with_capacity(7 + slots.len() * 9);
    info.push(slots.len() as u8);
    for slot in slots {
        info.extend_from_slice(&slot.protocol_bytes());
    }
    info.extend_from_slice(&random_seed.to_le_bytes());
    info.push(layout as u8);
    info.push(player_slots);
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_slot_defaults() {
        let slot = GameSlot::open(1, 4);
        assert!(slot.is_open());
        assert!(slot.is_selectable());
        assert!(!slot.is_player_or_fake());
        assert_eq!(slot.handicap, DEFAULT_HANDICAP);
        assert_eq!(slot.race_byte(), 32 | 64);
    }

    #[test]
    fn test_protocol_bytes_roundtrip() {
        let mut slot = GameSlot::open(0, 2);
        slot.status = SlotStatus::Occupied;
        slot.occupant = Occupant::Player;
        slot.uid = 3;
        slot.download_status = 100;
        slot.race = Race::Orc;

        let bytes = slot.protocol_bytes();
        assert_eq!(bytes, [3, 100, 2, 0, 0, 2, 2 | 64, 1, 100]);

        let decoded = GameSlot::from_protocol_bytes(&bytes).unwrap();
        assert_eq!(decoded, slot);
    }

    #[test]
    fn test_fixed_computer_is_not_selectable() {
        let slot = GameSlot::fixed_computer(1, 5, Race::Undead, ComputerSkill::Hard);
        assert!(!slot.is_selectable());
        assert!(slot.is_computer());
        assert_eq!(slot.protocol_bytes()[3], 1);
        assert_eq!(slot.protocol_bytes()[7], 2);
    }

    #[test]
    fn test_encode_slot_info_layout() {
        let slots = vec![GameSlot::open(0, 0), GameSlot::open(1, 1)];
        let info = encode_slot_info(&slots, 0xDEADBEEF, LayoutStyle::CustomForces, 2);

        assert_eq!(info.len(), 1 + 2 * 9 + 4 + 2);
        assert_eq!(info[0], 2);
        assert_eq!(&info[19..23], &0xDEADBEEFu32.to_le_bytes());
        assert_eq!(info[23], 1);
        assert_eq!(info[24], 2);
    }

    #[test]
    fn test_color_names() {
        assert_eq!(color_name(0), "red");
        assert_eq!(color_name(23), "peanut");
        assert_eq!(color_name(24), "observer");
        assert_eq!(parse_color("Teal"), Some(2));
        assert_eq!(parse_color("grey"), Some(8));
        assert_eq!(parse_color("chartreuse"), None);
    }

    #[test]
    fn test_clear_keeps_position() {
        let mut slot = GameSlot::open(2, 7);
        slot.status = SlotStatus::Occupied;
        slot.occupant = Occupant::Player;
        slot.uid = 9;
        slot.clear();
        assert!(slot.is_open());
        assert_eq!(slot.team, 2);
        assert_eq!(slot.color, 7);
        assert_eq!(slot.uid, 0);
    }
}
