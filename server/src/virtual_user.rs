//! Occupants without a network connection
//!
//! Fake users hold a slot to keep team sizes or the chat channel alive; the
//! virtual host has no slot at all and only exists as a player entry.

use shared::w3gs::{self, LeaveCode};
use shared::ProtocolError;

/// Which bookkept actions a virtual user may take
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllowedActions {
    pub pause: bool,
    pub resume: bool,
    pub save: bool,
}

impl AllowedActions {
    pub const ANY: Self = Self {
        pause: true,
        resume: true,
        save: true,
    };
    pub const NONE: Self = Self {
        pause: false,
        resume: false,
        save: false,
    };
}

#[derive(Clone, Debug)]
pub struct VirtualUser {
    pub sid: u8,
    pub uid: u8,
    /// UID before the last refresh, 0xFF if never refreshed
    pub old_uid: u8,
    pub pseudonym_uid: u8,
    pub observer: bool,
    pub name: String,
    pub remaining_pauses: u8,
    pub remaining_saves: u8,
    pub allowed_actions: AllowedActions,
    pub left_code: LeaveCode,
    pub left_message_sent: bool,
}

impl VirtualUser {
    pub fn new(sid: u8, uid: u8, name: impl Into<String>, pauses: u8, saves: u8) -> Self {
        Self {
            sid,
            uid,
            old_uid: 0xFF,
            pseudonym_uid: 0xFF,
            observer: false,
            name: name.into(),
            remaining_pauses: pauses,
            remaining_saves: saves,
            allowed_actions: AllowedActions::ANY,
            left_code: LeaveCode::Lobby,
            left_message_sent: false,
        }
    }

    pub fn lower_name(&self) -> String {
        self.name.to_lowercase()
    }

    /// Name shown to players; tells hosts which slot commands to use
    pub fn display_name(&self) -> String {
        format!("User[{}]", self.sid as u16 + 1)
    }

    pub fn can_pause(&self, has_referees: bool) -> bool {
        self.allowed_actions.pause
            && self.remaining_pauses > 0
            && (!self.observer || has_referees)
    }

    pub fn can_resume(&self, has_referees: bool) -> bool {
        self.allowed_actions.resume && (!self.observer || has_referees)
    }

    pub fn can_save(&self, has_referees: bool) -> bool {
        self.allowed_actions.save && self.remaining_saves > 0 && (!self.observer || has_referees)
    }

    pub fn player_info_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        w3gs::player_info_exclude_ip(self.uid, &self.display_name())
    }

    pub fn game_loaded_bytes(&self) -> Vec<u8> {
        w3gs::game_loaded_others(self.uid)
    }

    pub fn game_quit_bytes(&self, code: LeaveCode) -> Vec<u8> {
        w3gs::player_leave_others(self.uid, code)
    }

    /// Moves to a fresh UID, remembering the previous one
    pub fn refresh_uid(&mut self, new_uid: u8) {
        self.old_uid = self.uid;
        self.uid = new_uid;
    }
}
