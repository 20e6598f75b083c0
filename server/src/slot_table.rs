//! The lobby slot table and its invariant-preserving mutators
//!
//! All mutators return `false` and leave the table untouched when the request
//! cannot be satisfied. Layout presets work on a copy and only commit once the
//! whole assignment succeeded.

use crate::map::{MapDescriptor, ObserverMode};
use shared::slot::DEFAULT_HANDICAP;
use shared::{ComputerSkill, GameSlot, LayoutStyle, Occupant, Race, SlotStatus};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<GameSlot>,
    layout: LayoutStyle,
    /// Observer team and color
    observer: u8,
    num_teams: u8,
    hmc_slot: Option<u8>,
    observers_allowed: bool,
}

impl SlotTable {
    pub fn new(map: &MapDescriptor) -> Self {
        Self {
            slots: map.slots.clone(),
            layout: map.layout,
            observer: map.observer_sentinel(),
            num_teams: map.num_teams,
            hmc_slot: map.hmc_slot,
            observers_allowed: matches!(map.observers, ObserverMode::Full | ObserverMode::Referees),
        }
    }

    /// Raw access for encoders that rewrite slot fields in place
    pub(crate) fn slots_mut(&mut self) -> &mut [GameSlot] {
        &mut self.slots
    }

    pub fn slots(&self) -> &[GameSlot] {
        &self.slots
    }

    pub fn get(&self, sid: u8) -> Option<&GameSlot> {
        self.slots.get(sid as usize)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn layout(&self) -> LayoutStyle {
        self.layout
    }

    pub fn observer_team(&self) -> u8 {
        self.observer
    }

    pub fn is_observer(&self, sid: u8) -> bool {
        self.get(sid).map(|s| s.team == self.observer).unwrap_or(false)
    }

    pub fn find_by_uid(&self, uid: u8) -> Option<u8> {
        self.slots
            .iter()
            .position(|s| s.is_player_or_fake() && s.uid == uid)
            .map(|i| i as u8)
    }

    /// Slots a join may take, in preference order
    pub fn first_open(&self) -> Option<u8> {
        let usable = |s: &GameSlot| s.is_open() && s.is_selectable();
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, s)| usable(s) && Some(*i as u8) != self.hmc_slot)
            .min_by_key(|(_, s)| s.team == self.observer)
            .map(|(i, _)| i as u8)
    }

    /// Occupied, non-observer slots (players, fakes and computers)
    pub fn controllers(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.is_occupied() && s.team != self.observer)
            .count()
    }

    pub fn occupied_teams(&self) -> HashSet<u8> {
        self.slots
            .iter()
            .filter(|s| s.is_occupied() && s.team != self.observer)
            .map(|s| s.team)
            .collect()
    }

    fn color_in_use(&self, color: u8, except: usize) -> bool {
        self.slots
            .iter()
            .enumerate()
            .any(|(i, s)| i != except && s.is_occupied() && s.team != self.observer && s.color == color)
    }

    fn free_color(&self, except: usize) -> Option<u8> {
        (0..self.observer).find(|&c| !self.color_in_use(c, except))
    }

    fn is_locked(&self, sid: usize) -> bool {
        !self.slots[sid].is_selectable() || Some(sid as u8) == self.hmc_slot
    }

    /// Puts a player, fake user or computer into an open slot
    pub fn occupy(&mut self, sid: u8, uid: u8, occupant: Occupant, download_status: u8) -> bool {
        let index = sid as usize;
        if index >= self.slots.len() || !self.slots[index].is_open() || occupant == Occupant::None {
            return false;
        }
        if self.slots[index].team != self.observer && self.color_in_use(self.slots[index].color, index) {
            match self.free_color(index) {
                Some(color) => self.slots[index].color = color,
                None => return false,
            }
        }
        let slot = &mut self.slots[index];
        slot.status = SlotStatus::Occupied;
        slot.occupant = occupant;
        slot.uid = uid;
        slot.download_status = download_status;
        slot.handicap = DEFAULT_HANDICAP;
        true
    }

    /// Returns an occupied slot to the open state
    pub fn vacate(&mut self, sid: u8) {
        if let Some(slot) = self.slots.get_mut(sid as usize) {
            slot.clear();
        }
    }

    pub fn set_download_status(&mut self, sid: u8, status: u8) -> bool {
        match self.slots.get_mut(sid as usize) {
            Some(slot) if slot.download_status != status => {
                slot.download_status = status;
                true
            }
            _ => false,
        }
    }

    /// Whether occupying or closing `sid` keeps the lobby joinable
    pub fn can_lock_for_joins(&self, sid: u8) -> bool {
        let index = sid as usize;
        match self.slots.get(index) {
            Some(slot) if slot.is_open() => {}
            Some(_) => return true,
            None => return false,
        }
        let other_open = self
            .slots
            .iter()
            .enumerate()
            .any(|(i, s)| i != index && s.is_open() && s.is_selectable());
        other_open || self.slots.iter().any(|s| s.is_occupied() && s.occupant == Occupant::Player)
    }

    /// Like `can_lock_for_joins`, but judged as if the player or fake user in
    /// `sid` had already left
    pub fn can_lock_after_vacate(&self, sid: u8) -> bool {
        let index = sid as usize;
        match self.slots.get(index) {
            Some(slot) if slot.is_player_or_fake() => {}
            Some(_) => return self.can_lock_for_joins(sid),
            None => return false,
        }
        if self.is_locked(index) {
            return false;
        }
        self.slots.iter().enumerate().any(|(i, s)| {
            i != index && ((s.is_open() && s.is_selectable()) || (s.is_occupied() && s.occupant == Occupant::Player))
        })
    }

    /// Whether the host may change what sits in `sid`
    pub fn is_editable(&self, sid: u8) -> bool {
        (sid as usize) < self.slots.len() && !self.is_locked(sid as usize)
    }

    /// Whether a computer could take `sid` once its occupant is removed
    pub fn accepts_computer(&self, sid: u8) -> bool {
        self.is_editable(sid) && self.slots[sid as usize].team != self.observer && self.can_lock_after_vacate(sid)
    }

    /// Closes an unoccupied slot; occupants must be removed by the caller first
    pub fn close(&mut self, sid: u8) -> bool {
        let index = sid as usize;
        if index >= self.slots.len() || self.is_locked(index) || self.slots[index].is_player_or_fake() {
            return false;
        }
        if !self.can_lock_for_joins(sid) {
            return false;
        }
        let slot = &mut self.slots[index];
        slot.clear();
        slot.status = SlotStatus::Closed;
        true
    }

    pub fn open(&mut self, sid: u8) -> bool {
        let index = sid as usize;
        if index >= self.slots.len() || self.is_locked(index) || self.slots[index].is_player_or_fake() {
            return false;
        }
        self.slots[index].clear();
        true
    }

    pub fn set_computer(&mut self, sid: u8, skill: ComputerSkill) -> bool {
        let index = sid as usize;
        if index >= self.slots.len() || self.is_locked(index) || self.slots[index].is_player_or_fake() {
            return false;
        }
        if self.slots[index].team == self.observer {
            return false;
        }
        if self.slots[index].is_computer() {
            self.slots[index].computer_skill = skill;
            return true;
        }
        if self.slots[index].status == SlotStatus::Closed {
            self.slots[index].clear();
        }
        if !self.can_lock_for_joins(sid) || !self.occupy(sid, 0, Occupant::Computer, 100) {
            return false;
        }
        self.slots[index].computer_skill = skill;
        true
    }

    pub fn set_race(&mut self, sid: u8, race: Race) -> bool {
        match self.slots.get_mut(sid as usize) {
            Some(slot) if slot.race_selectable && !self.layout.has_fixed_settings() => {
                slot.race = race;
                true
            }
            _ => false,
        }
    }

    pub fn set_handicap(&mut self, sid: u8, handicap: u8) -> bool {
        if !shared::slot::VALID_HANDICAPS.contains(&handicap) {
            return false;
        }
        match self.slots.get_mut(sid as usize) {
            Some(slot) if slot.is_occupied() => {
                slot.handicap = handicap;
                true
            }
            _ => false,
        }
    }

    /// Exchanges the occupants of two slots
    pub fn swap(&mut self, sid1: u8, sid2: u8) -> bool {
        let (a, b) = (sid1 as usize, sid2 as usize);
        if a == b || a >= self.slots.len() || b >= self.slots.len() {
            return false;
        }
        if self.is_locked(a) || self.is_locked(b) {
            return false;
        }
        self.swap_unchecked(a, b);
        true
    }

    fn swap_unchecked(&mut self, a: usize, b: usize) {
        let first = self.slots[a].clone();
        let second = self.slots[b].clone();
        let mut new_a = second.clone();
        let mut new_b = first.clone();
        new_a.slot_type = first.slot_type;
        new_b.slot_type = second.slot_type;
        if self.layout.has_custom_forces() {
            new_a.team = first.team;
            new_a.color = first.color;
            new_b.team = second.team;
            new_b.color = second.color;
            if self.layout.has_fixed_settings() {
                new_a.race = first.race;
                new_a.race_selectable = first.race_selectable;
                new_b.race = second.race;
                new_b.race_selectable = second.race_selectable;
            }
        }
        self.slots[a] = new_a;
        self.slots[b] = new_b;
    }

    pub fn set_team(&mut self, sid: u8, team: u8, force: bool) -> bool {
        let index = sid as usize;
        if index >= self.slots.len() || self.is_locked(index) {
            return false;
        }
        if team == self.observer {
            if !self.observers_allowed {
                return false;
            }
        } else if team >= self.num_teams {
            return false;
        }
        if self.slots[index].team == team {
            return true;
        }

        if self.layout.has_custom_forces() {
            let candidates = |open: bool| {
                (0..self.slots.len()).find(|&j| {
                    j != index
                        && !self.is_locked(j)
                        && self.slots[j].team == team
                        && if open {
                            self.slots[j].is_open()
                        } else {
                            self.slots[j].is_occupied()
                        }
                })
            };
            let target = candidates(true).or_else(|| if force { candidates(false) } else { None });
            return match target {
                Some(j) => {
                    self.swap_unchecked(index, j);
                    true
                }
                None => false,
            };
        }

        let was_observer = self.slots[index].team == self.observer;
        if team == self.observer {
            let slot = &mut self.slots[index];
            slot.team = team;
            slot.color = self.observer;
            slot.race = Race::Random;
            slot.handicap = DEFAULT_HANDICAP;
        } else if was_observer {
            let Some(color) = self.free_color(index) else {
                return false;
            };
            let slot = &mut self.slots[index];
            slot.team = team;
            slot.color = color;
            slot.race = Race::Random;
        } else {
            self.slots[index].team = team;
        }
        true
    }

    pub fn set_color(&mut self, sid: u8, color: u8, force: bool) -> bool {
        let index = sid as usize;
        if index >= self.slots.len() || color >= self.observer || self.is_locked(index) {
            return false;
        }
        let slot = &self.slots[index];
        if !slot.is_occupied() || slot.team == self.observer {
            return false;
        }
        if slot.color == color {
            return true;
        }
        let holder = (0..self.slots.len())
            .find(|&j| j != index && self.slots[j].color == color && self.slots[j].team != self.observer);

        if self.layout.has_custom_forces() {
            return match holder {
                Some(j) if self.is_locked(j) => false,
                Some(j) if self.slots[j].is_occupied() && !force => false,
                Some(j) => {
                    self.swap_unchecked(index, j);
                    true
                }
                None => false,
            };
        }

        match holder {
            Some(j) if self.slots[j].is_occupied() && !force => false,
            Some(j) => {
                let old = self.slots[index].color;
                self.slots[j].color = old;
                self.slots[index].color = color;
                true
            }
            None => {
                self.slots[index].color = color;
                true
            }
        }
    }

    fn movable_occupants(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].is_occupied() && self.slots[i].team != self.observer)
            .collect()
    }

    fn fixed_computer_teams(&self) -> HashSet<u8> {
        self.slots
            .iter()
            .filter(|s| s.is_computer() && !s.is_selectable())
            .map(|s| s.team)
            .collect()
    }

    /// Finds an open, movable slot on one of the wanted teams
    fn open_slot_on(&self, wanted: impl Fn(u8) -> bool) -> Option<usize> {
        (0..self.slots.len()).rev().find(|&j| {
            self.slots[j].is_open() && !self.is_locked(j) && self.slots[j].team != self.observer && wanted(self.slots[j].team)
        })
    }

    fn commit_if(&mut self, candidate: SlotTable, ok: bool) -> bool {
        if ok {
            self.slots = candidate.slots;
        }
        ok
    }

    /// Every controller on its own team
    pub fn set_layout_ffa(&mut self) -> bool {
        let mut work = self.clone();
        let ok = work.apply_ffa();
        self.commit_if(work, ok)
    }

    fn apply_ffa(&mut self) -> bool {
        let occupants = self.movable_occupants();
        if occupants.len() > self.num_teams as usize {
            return false;
        }
        if !self.layout.has_custom_forces() {
            for (team, &sid) in occupants.iter().enumerate() {
                if self.is_locked(sid) && self.slots[sid].team != team as u8 {
                    return false;
                }
                self.slots[sid].team = team as u8;
            }
            return true;
        }

        // fixed slots claim their teams before anything moves
        let mut used: HashSet<u8> = HashSet::new();
        for &sid in &occupants {
            if self.is_locked(sid) && !used.insert(self.slots[sid].team) {
                return false;
            }
        }
        let mut pending: Vec<usize> = occupants.into_iter().filter(|&sid| !self.is_locked(sid)).collect();
        while let Some(sid) = pending.pop() {
            let team = self.slots[sid].team;
            if used.insert(team) {
                continue;
            }
            let waiting: HashSet<u8> = pending.iter().map(|&p| self.slots[p].team).collect();
            let Some(target) = self.open_slot_on(|t| !used.contains(&t) && !waiting.contains(&t)) else {
                return false;
            };
            used.insert(self.slots[target].team);
            self.swap_unchecked(sid, target);
        }
        true
    }

    /// Humans and fake users on `human_team`, computers on `ai_team`
    pub fn set_layout_humans_vs_ai(&mut self, human_team: u8, ai_team: u8) -> bool {
        let mut work = self.clone();
        let ok = work.apply_humans_vs_ai(human_team, ai_team);
        self.commit_if(work, ok)
    }

    fn apply_humans_vs_ai(&mut self, human_team: u8, ai_team: u8) -> bool {
        if human_team == ai_team || human_team >= self.num_teams || ai_team >= self.num_teams {
            return false;
        }
        let fixed = self.fixed_computer_teams();
        if fixed.len() > 1 || fixed.iter().any(|&t| t != ai_team) {
            return false;
        }
        let wanted = |slot: &GameSlot| if slot.is_computer() { ai_team } else { human_team };
        self.apply_assignment(wanted)
    }

    /// The occupant of `sid` alone against everyone else
    pub fn set_layout_one_vs_all(&mut self, sid: u8) -> bool {
        let mut work = self.clone();
        let ok = work.apply_one_vs_all(sid);
        self.commit_if(work, ok)
    }

    fn apply_one_vs_all(&mut self, sid: u8) -> bool {
        let index = sid as usize;
        if index >= self.slots.len() || !self.slots[index].is_occupied() || self.num_teams < 2 {
            return false;
        }
        let one_team = self.slots[index].team;
        if one_team == self.observer {
            return false;
        }
        let all_team = if one_team == 0 { 1 } else { 0 };
        let one_uid = (self.slots[index].uid, self.slots[index].occupant);
        let wanted = move |slot: &GameSlot| {
            if (slot.uid, slot.occupant) == one_uid {
                one_team
            } else {
                all_team
            }
        };
        self.apply_assignment(wanted)
    }

    /// Moves every controller to the team `wanted` picks for it
    fn apply_assignment(&mut self, wanted: impl Fn(&GameSlot) -> u8) -> bool {
        if !self.layout.has_custom_forces() {
            for sid in self.movable_occupants() {
                let team = wanted(&self.slots[sid]);
                if self.slots[sid].team == team {
                    continue;
                }
                if self.is_locked(sid) {
                    return false;
                }
                self.slots[sid].team = team;
            }
            return true;
        }

        // back to front so that low slots stay put when possible
        for sid in self.movable_occupants().into_iter().rev() {
            let team = wanted(&self.slots[sid]);
            if self.slots[sid].team == team {
                continue;
            }
            if self.is_locked(sid) {
                return false;
            }
            let Some(target) = self.open_slot_on(|t| t == team) else {
                return false;
            };
            self.swap_unchecked(sid, target);
        }
        true
    }

    /// Packs controllers into the lowest usable slots of their team
    pub fn set_layout_compact(&mut self) -> bool {
        let mut work = self.clone();
        let ok = work.apply_compact();
        self.commit_if(work, ok)
    }

    fn apply_compact(&mut self) -> bool {
        let custom = self.layout.has_custom_forces();
        for low in 0..self.slots.len() {
            if !self.slots[low].is_open() || self.is_locked(low) || self.slots[low].team == self.observer {
                continue;
            }
            let team = self.slots[low].team;
            let donor = (low + 1..self.slots.len()).find(|&j| {
                self.slots[j].is_occupied()
                    && !self.is_locked(j)
                    && self.slots[j].team != self.observer
                    && (!custom || self.slots[j].team == team)
            });
            if let Some(j) = donor {
                self.swap_unchecked(low, j);
            }
        }
        true
    }

    /// No two occupied non-observer slots share a color
    pub fn has_unique_colors(&self) -> bool {
        let mut seen = HashSet::new();
        self.slots
            .iter()
            .filter(|s| s.is_occupied() && s.team != self.observer)
            .all(|s| seen.insert(s.color))
    }

    /// No two player or fake slots share a UID
    pub fn has_unique_uids(&self) -> bool {
        let mut seen = HashSet::new();
        self.slots
            .iter()
            .filter(|s| s.is_player_or_fake())
            .all(|s| seen.insert(s.uid))
    }
}
