//! # Shared Protocol Library
//!
//! Stateless wire codec used by the hosting server and by any tooling that
//! needs to speak to it. Nothing in this crate keeps state between calls:
//! every function either turns bytes into a typed value or a typed value into
//! bytes.
//!
//! ## Modules
//!
//! - [`w3gs`]: game protocol parsers and builders (joins, slots, actions,
//!   chat, lag screens, map transfer)
//! - [`gps`]: the GProxy reconnect extension
//! - [`slot`]: slot descriptors and slot-info encoding
//! - [`discovery`]: LAN beacon template with in-place dynamic fields
//!
//! Multi-byte integers are little-endian unless a field is a network port,
//! which is sent big-endian as in `sockaddr_in`.

mod bytes;
pub mod discovery;
pub mod error;
pub mod gps;
pub mod slot;
pub mod w3gs;

pub use error::ProtocolError;
pub use slot::{ComputerSkill, GameSlot, LayoutStyle, Occupant, Race, SlotStatus, SlotType};
pub use w3gs::{ClientPacket, IncomingAction, IncomingJoinRequest, LeaveCode, RejectReason};
