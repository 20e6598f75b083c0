//! Outside services a session talks to without owning their connections

use log::info;
use std::fmt;

/// Service the game was hosted from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Creator {
    Realm { server: String, user: String },
    Irc { channel: String, user: String },
    Discord { channel_id: u64, user: String },
    None,
}

impl Creator {
    pub fn user(&self) -> Option<&str> {
        match self {
            Creator::Realm { user, .. } | Creator::Irc { user, .. } | Creator::Discord { user, .. } => {
                Some(user)
            }
            Creator::None => None,
        }
    }
}

impl fmt::Display for Creator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Creator::Realm { server, user } => write!(f, "{}@{}", user, server),
            Creator::Irc { channel, user } => write!(f, "{}@irc:{}", user, channel),
            Creator::Discord { channel_id, user } => write!(f, "{}@discord:{}", user, channel_id),
            Creator::None => write!(f, "LAN"),
        }
    }
}

/// Chat surface of a realm, IRC or Discord connection
pub trait Announcer {
    fn is_enabled(&self) -> bool;
    fn queue_chat(&mut self, message: &str);
    fn queue_whisper(&mut self, user: &str, message: &str);
}

/// Announcer that only writes to the log
#[derive(Debug, Default)]
pub struct LogAnnouncer;

impl Announcer for LogAnnouncer {
    fn is_enabled(&self) -> bool {
        true
    }

    fn queue_chat(&mut self, message: &str) {
        info!("[ANNOUNCE] {}", message);
    }

    fn queue_whisper(&mut self, user: &str, message: &str) {
        info!("[ANNOUNCE] to {}: {}", user, message);
    }
}
