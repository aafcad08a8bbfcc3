//! Wire protocols.
//!
//! Two independent protocols cross process boundaries:
//!
//! - [`signaling`]: JSON text frames between peers and the relay
//!   (presence + opaque connection-setup payloads).
//! - [`channel`]: frames on the per-peer data channel (JSON control frames
//!   interleaved with raw binary chunks).
//!
//! Both are closed enums; anything that does not decode into a known variant
//! is dropped at the boundary.

pub mod channel;
pub mod signaling;

pub use channel::{ChannelFrame, ChannelMessage, FileMeta};
pub use signaling::{ClientFrame, Device, ServerFrame, SignalErrorReason, SignalFrame, SignalType};
