//! Per-tick action frames and the ping equalizer
//!
//! Frames live in a deque: index 0 is the next frame to be flushed and the
//! back is the newest. A user with equalizer offset `k` queues actions into
//! the frame at index `k`, so larger offsets are relayed later. The deque is
//! never shorter than the largest offset in use plus one.

use log::error;
use shared::w3gs::{self, LeaveCode, ACTION_BATCH_LIMIT};
use shared::IncomingAction;
use std::collections::VecDeque;

/// Bookkeeping to run once a frame has been relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameCallback {
    #[default]
    None,
    Pause,
    Resume,
}

#[derive(Debug, Clone, Default)]
pub struct ActionFrame {
    pub callback: FrameCallback,
    /// UID responsible for the pending callback
    pub callback_uid: u8,
    batches: Vec<Vec<IncomingAction>>,
    batch_size: usize,
    leavers: Vec<(u8, LeaveCode)>,
}

impl ActionFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an action, opening a new sub-buffer once the current one is full
    pub fn add_action(&mut self, action: IncomingAction) {
        let len = action.wire_len();
        match self.batches.last_mut() {
            Some(batch) if self.batch_size + len <= ACTION_BATCH_LIMIT => {
                batch.push(action);
                self.batch_size += len;
            }
            _ => {
                self.batches.push(vec![action]);
                self.batch_size = len;
            }
        }
    }

    pub fn add_leaver(&mut self, uid: u8, code: LeaveCode) {
        self.leavers.push((uid, code));
    }

    pub fn leavers(&self) -> &[(u8, LeaveCode)] {
        &self.leavers
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty() && self.leavers.is_empty() && self.callback == FrameCallback::None
    }

    pub fn action_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn has_actions_by(&self, uid: u8) -> bool {
        self.batches.iter().flatten().any(|a| a.uid == uid)
    }

    /// Continuation packets first, then the terminating packet.
    /// A batch that cannot be encoded is dropped; the frame still terminates.
    pub fn get_bytes(&self, send_interval: u16) -> Vec<Vec<u8>> {
        let Some((last, rest)) = self.batches.split_last() else {
            return vec![terminator(send_interval)];
        };
        let mut packets = Vec::with_capacity(self.batches.len());
        for batch in rest {
            match w3gs::incoming_action2(batch) {
                Ok(packet) => packets.push(packet),
                Err(e) => error!("dropping {} actions from frame: {}", batch.len(), e),
            }
        }
        match w3gs::incoming_action(last, send_interval) {
            Ok(packet) => packets.push(packet),
            Err(e) => {
                error!("dropping {} actions from frame: {}", last.len(), e);
                packets.push(terminator(send_interval));
            }
        }
        packets
    }

    /// Appends everything `other` carries after this frame's contents
    pub fn merge(&mut self, other: ActionFrame) {
        for action in other.batches.into_iter().flatten() {
            self.add_action(action);
        }
        if other.callback != FrameCallback::None {
            self.callback = other.callback;
            self.callback_uid = other.callback_uid;
        }
        self.leavers.extend(other.leavers);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn terminator(send_interval: u16) -> Vec<u8> {
    let mut packet = w3gs::empty_action();
    packet[4..6].copy_from_slice(&send_interval.to_le_bytes());
    packet
}

/// What a flush produced
#[derive(Debug, Clone)]
pub struct FlushedFrame {
    pub packets: Vec<Vec<u8>>,
    pub callback: FrameCallback,
    pub callback_uid: u8,
    pub leavers: Vec<(u8, LeaveCode)>,
    pub action_count: usize,
}

#[derive(Debug)]
pub struct FrameQueue {
    frames: VecDeque<ActionFrame>,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameQueue {
    pub fn new() -> Self {
        let mut frames = VecDeque::new();
        frames.push_back(ActionFrame::new());
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.iter().all(ActionFrame::is_empty)
    }

    pub fn head(&self) -> &ActionFrame {
        &self.frames[0]
    }

    pub fn frame(&self, offset: u8) -> Option<&ActionFrame> {
        self.frames.get(offset as usize)
    }

    /// Frame a user with the given offset writes to
    pub fn frame_for(&mut self, offset: u8) -> &mut ActionFrame {
        let index = (offset as usize).min(self.frames.len() - 1);
        &mut self.frames[index]
    }

    pub fn back_mut(&mut self) -> &mut ActionFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    pub fn add_action(&mut self, offset: u8, action: IncomingAction) {
        self.frame_for(offset).add_action(action);
    }

    /// Schedules a leave message after everything already queued
    pub fn add_leaver(&mut self, uid: u8, code: LeaveCode) {
        self.back_mut().add_leaver(uid, code);
    }

    pub fn pending_leavers(&self) -> impl Iterator<Item = u8> + '_ {
        self.frames.iter().flat_map(|f| f.leavers.iter().map(|(uid, _)| *uid))
    }

    /// Serializes the head frame and recycles it as the new back frame
    pub fn flush(&mut self, send_interval: u16) -> FlushedFrame {
        let mut head = self.frames.pop_front().unwrap_or_default();
        let flushed = FlushedFrame {
            packets: head.get_bytes(send_interval),
            callback: head.callback,
            callback_uid: head.callback_uid,
            leavers: std::mem::take(&mut head.leavers),
            action_count: head.action_count(),
        };
        head.reset();
        self.frames.push_back(head);
        flushed
    }

    /// Makes room for a user trailing `max_offset` frames behind the head
    pub fn grow(&mut self, max_offset: u8) {
        while self.frames.len() <= max_offset as usize {
            self.frames.push_back(ActionFrame::new());
        }
    }

    /// Merges away frames past `max_offset`; no user may reference them
    pub fn shrink(&mut self, max_offset: u8) {
        while self.frames.len() > max_offset as usize + 1 {
            let Some(last) = self.frames.pop_back() else {
                break;
            };
            match self.frames.back_mut() {
                Some(previous) => previous.merge(last),
                None => self.frames.push_back(last),
            }
        }
    }

    /// Folds every queued frame into the head, e.g. before the game ends
    pub fn collapse(&mut self) {
        self.shrink(0);
    }
}

/// Equalizer offset for one user given the worst measured RTT
///
/// A user as slow as the worst one gets no extra delay; faster users are
/// held back one frame per full latency interval of difference.
pub fn equalizer_target(rtt: u32, worst_rtt: u32, latency_ms: u32, max_frames: u8) -> u8 {
    if latency_ms == 0 {
        return 0;
    }
    let frames = worst_rtt.saturating_sub(rtt) / latency_ms;
    frames.min(max_frames as u32) as u8
}

/// Moves `current` one frame towards `target`
pub fn step_offset(current: u8, target: u8) -> u8 {
    match current.cmp(&target) {
        std::cmp::Ordering::Less => current + 1,
        std::cmp::Ordering::Greater => current - 1,
        std::cmp::Ordering::Equal => current,
    }
}
