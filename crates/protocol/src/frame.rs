//! Binary frame layout.
//!
//! ```text
//! len:u32le | opcode:u8 | kind:u8 | seq:u64le | body_len:u32le | body (JSON) | bulk (raw)
//! ```
//!
//! `len` counts every byte after itself. The bulk section runs to the end of
//! the frame and is never parsed as JSON; stream chunks put their sample bytes
//! there.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest accepted frame, excluding the length prefix.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;
const HEADER_LEN: usize = 1 + 1 + 8 + 4;

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
	TooLarge { len: usize },

	#[error("stream ended inside a frame ({buffered} bytes buffered)")]
	Truncated { buffered: usize },

	#[error("unknown opcode {0:#04x}")]
	UnknownOpcode(u8),

	#[error("unknown frame kind {0}")]
	UnknownKind(u8),

	#[error("malformed frame: {0}")]
	Malformed(String),

	#[error("frame body is not valid JSON: {0}")]
	Json(#[from] serde_json::Error),
}

/// Operation a frame belongs to. Responses reuse their request's opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
	Enumerate = 0x01,
	Open = 0x02,
	Close = 0x03,
	GetInfo = 0x04,
	SetParam = 0x05,
	GetParam = 0x06,
	StartStream = 0x07,
	StopStream = 0x08,
	ReadStream = 0x09,
	Heartbeat = 0x0a,
	Shutdown = 0x0b,
	Ready = 0x40,
	Failed = 0x41,
	StateChanged = 0x42,
}

impl TryFrom<u8> for Opcode {
	type Error = FrameError;

	fn try_from(value: u8) -> Result<Self, Self::Error> {
		Ok(match value {
			0x01 => Opcode::Enumerate,
			0x02 => Opcode::Open,
			0x03 => Opcode::Close,
			0x04 => Opcode::GetInfo,
			0x05 => Opcode::SetParam,
			0x06 => Opcode::GetParam,
			0x07 => Opcode::StartStream,
			0x08 => Opcode::StopStream,
			0x09 => Opcode::ReadStream,
			0x0a => Opcode::Heartbeat,
			0x0b => Opcode::Shutdown,
			0x40 => Opcode::Ready,
			0x41 => Opcode::Failed,
			0x42 => Opcode::StateChanged,
			other => return Err(FrameError::UnknownOpcode(other)),
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
	Request = 0,
	Response = 1,
	Event = 2,
}

impl TryFrom<u8> for FrameKind {
	type Error = FrameError;

	fn try_from(value: u8) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(FrameKind::Request),
			1 => Ok(FrameKind::Response),
			2 => Ok(FrameKind::Event),
			other => Err(FrameError::UnknownKind(other)),
		}
	}
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
	pub opcode: Opcode,
	pub kind: FrameKind,
	pub seq: u64,
	pub body: Bytes,
	pub bulk: Bytes,
}

impl Frame {
	/// Size of the frame after the length prefix.
	pub fn payload_len(&self) -> usize {
		HEADER_LEN + self.body.len() + self.bulk.len()
	}

	pub fn encode(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
		let len = self.payload_len();
		if len > MAX_FRAME_LEN {
			return Err(FrameError::TooLarge { len });
		}
		dst.reserve(LEN_PREFIX + len);
		dst.put_u32_le(len as u32);
		dst.put_u8(self.opcode as u8);
		dst.put_u8(self.kind as u8);
		dst.put_u64_le(self.seq);
		dst.put_u32_le(self.body.len() as u32);
		dst.put_slice(&self.body);
		dst.put_slice(&self.bulk);
		Ok(())
	}

	pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
		let mut buf = BytesMut::with_capacity(LEN_PREFIX + self.payload_len());
		self.encode(&mut buf)?;
		Ok(buf.freeze())
	}

	fn parse(mut payload: Bytes) -> Result<Self, FrameError> {
		if payload.len() < HEADER_LEN {
			return Err(FrameError::Malformed(format!(
				"{} byte frame is shorter than the {HEADER_LEN} byte header",
				payload.len()
			)));
		}
		let opcode = Opcode::try_from(payload.get_u8())?;
		let kind = FrameKind::try_from(payload.get_u8())?;
		let seq = payload.get_u64_le();
		let body_len = payload.get_u32_le() as usize;
		if body_len > payload.len() {
			return Err(FrameError::Malformed(format!(
				"body length {body_len} exceeds remaining {} bytes",
				payload.len()
			)));
		}
		let body = payload.split_to(body_len);
		Ok(Frame {
			opcode,
			kind,
			seq,
			body,
			bulk: payload,
		})
	}
}

/// Incremental decoder: feed it whatever the pipe produced, take whole frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
	buf: BytesMut,
}

impl FrameDecoder {
	pub fn new() -> Self {
		Self {
			buf: BytesMut::with_capacity(64 * 1024),
		}
	}

	/// Direct access for `AsyncReadExt::read_buf`.
	pub fn buffer_mut(&mut self) -> &mut BytesMut {
		&mut self.buf
	}

	pub fn extend_from_slice(&mut self, data: &[u8]) {
		self.buf.extend_from_slice(data);
	}

	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	/// Returns the next complete frame, or `None` until more bytes arrive.
	pub fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
		if self.buf.len() < LEN_PREFIX {
			return Ok(None);
		}
		let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
		if len > MAX_FRAME_LEN {
			return Err(FrameError::TooLarge { len });
		}
		if self.buf.len() < LEN_PREFIX + len {
			self.buf.reserve(LEN_PREFIX + len - self.buf.len());
			return Ok(None);
		}
		self.buf.advance(LEN_PREFIX);
		let payload = self.buf.split_to(len).freeze();
		Frame::parse(payload).map(Some)
	}

	/// Call at end of stream: leftover bytes mean the peer died mid-frame.
	pub fn finish(&self) -> Result<(), FrameError> {
		if self.buf.is_empty() {
			Ok(())
		} else {
			Err(FrameError::Truncated {
				buffered: self.buf.len(),
			})
		}
	}
}
