//! Legacy DotA statistics (`dr.x` sync-int packets)
//!
//! Colors 1-5 are the Sentinel and 7-11 the Scourge; 0 and 6 are the
//! computer-controlled bases.

use log::{info, warn};
use shared::w3gs::action::SYNC_INT;
use std::collections::BTreeMap;

const SIGNATURE: &[u8] = b"dr.x\0";
const MAX_COLORS: usize = 12;

pub fn is_hero_color(color: u8) -> bool {
    (1..=5).contains(&color) || (7..=11).contains(&color)
}

fn is_sentinel(color: u8) -> bool {
    (1..=5).contains(&color)
}

fn is_scourge(color: u8) -> bool {
    (7..=11).contains(&color)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DotaPlayer {
    pub kills: u32,
    pub deaths: u32,
    pub assists: u32,
    pub creep_kills: u32,
    pub creep_denies: u32,
    pub neutral_kills: u32,
    pub tower_kills: u32,
    pub rax_kills: u32,
    pub courier_kills: u32,
    /// Color the map reported for this player, 0 until known
    pub new_color: u8,
}

/// A player line ready to be stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotaRecord {
    pub color: u8,
    /// 1 won, 2 lost, 0 unknown
    pub win: u8,
    pub player: DotaPlayer,
}

impl DotaRecord {
    pub fn stats(&self) -> BTreeMap<String, String> {
        let p = &self.player;
        [
            ("win", self.win as u32),
            ("kills", p.kills),
            ("deaths", p.deaths),
            ("assists", p.assists),
            ("creepkills", p.creep_kills),
            ("creepdenies", p.creep_denies),
            ("neutralkills", p.neutral_kills),
            ("towerkills", p.tower_kills),
            ("raxkills", p.rax_kills),
            ("courierkills", p.courier_kills),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }
}

#[derive(Debug)]
pub struct DotaStats {
    game_name: String,
    players: [Option<DotaPlayer>; MAX_COLORS],
    winner: u8,
}

fn cstring_at(data: &[u8], start: usize) -> Option<&[u8]> {
    let rest = data.get(start..)?;
    let end = rest.iter().position(|b| *b == 0)?;
    Some(&rest[..end])
}

impl DotaStats {
    pub fn new(game_name: impl Into<String>) -> Self {
        let game_name = game_name.into();
        info!("[STATS: {}] using dota stats", game_name);
        Self {
            game_name,
            players: Default::default(),
            winner: 0,
        }
    }

    pub fn winner(&self) -> u8 {
        self.winner
    }

    pub fn player(&self, color: u8) -> Option<&DotaPlayer> {
        self.players.get(color as usize).and_then(Option::as_ref)
    }

    fn entry(&mut self, color: u8) -> Option<&mut DotaPlayer> {
        self.players
            .get_mut(color as usize)
            .map(|slot| slot.get_or_insert_with(DotaPlayer::default))
    }

    /// Scans one action; `has_player` tells whether a color is held by a player.
    /// Returns true once a winner is known.
    pub fn process_action(&mut self, data: &[u8], has_player: impl Fn(u8) -> bool) -> bool {
        let mut i = 0;
        while data.len() >= i + 6 {
            if data[i] != SYNC_INT || &data[i + 1..i + 6] != SIGNATURE {
                i += 1;
                continue;
            }
            let Some(section) = cstring_at(data, i + 6) else {
                i += 1;
                continue;
            };
            let key_start = i + 7 + section.len();
            let Some(key) = cstring_at(data, key_start) else {
                i += 1;
                continue;
            };
            let value_start = key_start + key.len() + 1;
            let Some(value) = data.get(value_start..value_start + 4) else {
                i += 1;
                continue;
            };
            let section = String::from_utf8_lossy(section).into_owned();
            let key = String::from_utf8_lossy(key).into_owned();
            self.handle(&section, &key, value[0], &has_player);
            i = value_start + 4;
        }
        self.winner != 0
    }

    fn handle(&mut self, section: &str, key: &str, value: u8, has_player: &impl Fn(u8) -> bool) {
        match section {
            "Data" => self.handle_data(key, value, has_player),
            "Global" if key == "Winner" => {
                self.winner = value;
                let side = match value {
                    1 => "Sentinel".to_string(),
                    2 => "Scourge".to_string(),
                    other => other.to_string(),
                };
                info!("[STATS: {}] detected winner: {}", self.game_name, side);
            }
            _ if section.len() <= 2 && !section.is_empty() && section.bytes().all(|b| b.is_ascii_digit()) => {
                let id = section.parse::<u8>().unwrap_or(0);
                if !is_hero_color(id) {
                    return;
                }
                let Some(player) = self.entry(id) else {
                    return;
                };
                if player.new_color == 0 {
                    player.new_color = id;
                }
                let mut chars = key.chars();
                match (chars.next(), chars.next()) {
                    (Some('3'), _) => player.creep_kills = value as u32,
                    (Some('4'), _) => player.creep_denies = value as u32,
                    (Some('7'), _) => player.neutral_kills = value as u32,
                    (Some('i'), Some('d')) => {
                        player.new_color = if value >= 6 { value + 1 } else { value };
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn handle_data(&mut self, key: &str, value: u8, has_player: &impl Fn(u8) -> bool) {
        let suffix_color = |prefix: &str| key[prefix.len()..].parse::<u8>().unwrap_or(0);
        if key.len() >= 5 && key.starts_with("Hero") {
            let killer = value;
            let victim = suffix_color("Hero");
            if !has_player(victim) {
                return;
            }
            if has_player(killer) {
                let same_side = (killer <= 5 && victim <= 5) || (killer >= 7 && victim >= 7);
                if !same_side {
                    if let Some(p) = self.entry(killer) {
                        p.kills += 1;
                    }
                    if let Some(p) = self.entry(victim) {
                        p.deaths += 1;
                    }
                }
            } else if let Some(p) = self.entry(victim) {
                p.deaths += 1;
            }
        } else if key.len() >= 7 && key.starts_with("Assist") {
            if has_player(value) {
                if let Some(p) = self.entry(suffix_color("Assist")) {
                    p.assists += 1;
                }
            }
        } else if key.len() >= 8 && key.starts_with("Tower") {
            if is_hero_color(value) {
                if let Some(p) = self.entry(value) {
                    p.tower_kills += 1;
                }
            }
        } else if key.len() >= 6 && key.starts_with("Rax") {
            if is_hero_color(value) {
                if let Some(p) = self.entry(value) {
                    p.rax_kills += 1;
                }
            }
        } else if key.len() >= 8 && key.starts_with("Courier") && is_hero_color(value) {
            if let Some(p) = self.entry(value) {
                p.courier_kills += 1;
            }
        }
    }

    /// Final per-player lines; invalid or duplicate reported colors are discarded
    pub fn records(&self) -> Vec<DotaRecord> {
        let mut kept: Vec<Option<&DotaPlayer>> = self.players.iter().map(Option::as_ref).collect();
        for i in 0..MAX_COLORS {
            let Some(player) = kept[i] else {
                continue;
            };
            let color = player.new_color;
            if !is_hero_color(color) {
                warn!("[STATS: {}] discarding player data, invalid color found", self.game_name);
                kept[i] = None;
                continue;
            }
            for later in kept.iter_mut().skip(i + 1) {
                if later.map(|p| p.new_color == color).unwrap_or(false) {
                    warn!("[STATS: {}] discarding player data, duplicate color found", self.game_name);
                    *later = None;
                }
            }
        }

        kept.into_iter()
            .flatten()
            .map(|player| {
                let color = player.new_color;
                let win = match self.winner {
                    1 if is_sentinel(color) => 1,
                    2 if is_scourge(color) => 1,
                    2 if is_sentinel(color) => 2,
                    1 if is_scourge(color) => 2,
                    _ => 0,
                };
                DotaRecord {
                    color,
                    win,
                    player: player.clone(),
                }
            })
            .collect()
    }
}

/// Builds a sync-int action carrying one `dr.x` entry
pub fn encode_packet(section: &str, key: &str, value: u32) -> Vec<u8> {
    let mut data = vec![SYNC_INT];
    data.extend_from_slice(SIGNATURE);
    data.extend_from_slice(section.as_bytes());
    data.push(0);
    data.extend_from_slice(key.as_bytes());
    data.push(0);
    data.extend_from_slice(&value.to_le_bytes());
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn everyone(color: u8) -> bool {
        is_hero_color(color)
    }

    #[test]
    fn test_hero_kills_across_sides_only() {
        let mut stats = DotaStats::new("dota");
        stats.process_action(&encode_packet("Data", "Hero7", 1), everyone);
        stats.process_action(&encode_packet("Data", "Hero2", 1), everyone);
        assert_eq!(stats.player(1).unwrap().kills, 1);
        assert_eq!(stats.player(7).unwrap().deaths, 1);
        assert_eq!(stats.player(2).map(|p| p.deaths).unwrap_or(0), 0);
    }

    #[test]
    fn test_death_without_player_killer() {
        let mut stats = DotaStats::new("dota");
        stats.process_action(&encode_packet("Data", "Hero3", 0), everyone);
        assert_eq!(stats.player(3).unwrap().deaths, 1);
        assert_eq!(stats.player(0).map(|p| p.kills).unwrap_or(0), 0);
    }

    #[test]
    fn test_structures_and_assists() {
        let mut stats = DotaStats::new("dota");
        let mut data = encode_packet("Data", "Tower010", 8);
        data.extend(encode_packet("Data", "Rax100", 9));
        data.extend(encode_packet("Data", "Courier4", 2));
        data.extend(encode_packet("Data", "Assist5", 8));
        data.extend(encode_packet("Data", "Tower011", 6));
        assert!(!stats.process_action(&data, everyone));
        assert_eq!(stats.player(8).unwrap().tower_kills, 1);
        assert_eq!(stats.player(9).unwrap().rax_kills, 1);
        assert_eq!(stats.player(2).unwrap().courier_kills, 1);
        assert_eq!(stats.player(5).unwrap().assists, 1);
        assert!(stats.player(6).is_none());
    }

    #[test]
    fn test_numeric_sections_and_winner() {
        let mut stats = DotaStats::new("dota");
        let mut data = encode_packet("1", "3", 40);
        data.extend(encode_packet("1", "4", 5));
        data.extend(encode_packet("1", "7", 12));
        data.extend(encode_packet("1", "id", 1));
        data.extend(encode_packet("7", "id", 6));
        data.extend(encode_packet("6", "3", 99));
        assert!(!stats.process_action(&data, everyone));
        assert!(stats.process_action(&encode_packet("Global", "Winner", 2), everyone));

        let records = stats.records();
        assert_eq!(records.len(), 2);
        let sentinel = records.iter().find(|r| r.color == 1).unwrap();
        assert_eq!(sentinel.player.creep_kills, 40);
        assert_eq!(sentinel.player.creep_denies, 5);
        assert_eq!(sentinel.player.neutral_kills, 12);
        assert_eq!(sentinel.win, 2);
        let scourge = records.iter().find(|r| r.color == 7).unwrap();
        assert_eq!(scourge.win, 1);
        assert_eq!(scourge.stats().get("win").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_duplicate_colors_discarded() {
        let mut stats = DotaStats::new("dota");
        let mut data = encode_packet("2", "id", 2);
        data.extend(encode_packet("3", "id", 2));
        stats.process_action(&data, everyone);
        let records = stats.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].color, 2);
    }
}
