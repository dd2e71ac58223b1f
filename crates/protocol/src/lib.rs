//! Wire types for the rxproxy manager/worker protocol.
//!
//! This crate contains the types exchanged between a proxy manager and its
//! worker subprocesses, plus the binary frame layout that carries them.
//!
//! # Layers
//!
//! - [`types`]: plain data (device descriptors, device arguments, parameter
//!   values, stream formats, worker states)
//! - [`message`]: the command vocabulary: requests, replies, worker events
//! - [`frame`]: length-prefixed binary frames with a raw bulk sub-frame for
//!   sample data, and an incremental decoder that tolerates partial reads
//!
//! Manager and worker must be built from the same version; the frame layout
//! is not versioned.

pub mod frame;
pub mod message;
pub mod types;

pub use frame::{Frame, FrameDecoder, FrameError, FrameKind, MAX_FRAME_LEN, Opcode};
pub use message::{Command, Event, Message, Reply, Request, Response, StreamChunk, WireError, WireErrorKind};
pub use types::*;
