//! Crimson Protocol - wire framing and message model
//!
//! Length-prefixed segmented frames carrying sequence-numbered request and
//! reply messages for the OSD service.

pub mod frame;
pub mod message;

pub use frame::{read_frame, write_frame, Frame, DEFAULT_MAX_SEGMENT_BYTES};
pub use message::{
    Body, Message, OsdReadArgs, OsdReadRes, OsdWriteArgs, OsdWriteRes, ON_APPLY, ON_COMMIT,
};
