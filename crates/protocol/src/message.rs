//! Command vocabulary exchanged between manager and worker.
//!
//! A [`Request`] carries a [`Command`] and a sequence number; the matching
//! [`Response`] echoes that sequence number and carries either a [`Reply`] or
//! a [`WireError`]. Workers also emit unsolicited [`Event`]s (the startup
//! handshake and terminal failures) which use sequence number zero.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::frame::{Frame, FrameError, FrameKind, Opcode};
use crate::types::{DeviceArgs, DeviceDescriptor, ParamValue, StreamFormat, WorkerState};

/// Requests understood by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
	/// List devices matching a filter. Only meaningful to a probe worker.
	Enumerate {
		#[serde(default)]
		filter: DeviceArgs,
	},
	/// Open the worker's device; returns a worker-local device id.
	Open { serial: String, args: DeviceArgs },
	Close { device_id: u32 },
	GetInfo { device_id: u32 },
	SetParam { device_id: u32, key: String, value: ParamValue },
	GetParam { device_id: u32, key: String },
	StartStream {
		device_id: u32,
		channel: u32,
		format: StreamFormat,
	},
	StopStream { session_id: u32 },
	/// Returns at most `max_samples` samples; possibly fewer, possibly none.
	ReadStream { session_id: u32, max_samples: u32 },
	Heartbeat,
	/// Orderly stop: close everything, release the device, exit 0.
	Shutdown,
}

impl Command {
	pub fn opcode(&self) -> Opcode {
		match self {
			Command::Enumerate { .. } => Opcode::Enumerate,
			Command::Open { .. } => Opcode::Open,
			Command::Close { .. } => Opcode::Close,
			Command::GetInfo { .. } => Opcode::GetInfo,
			Command::SetParam { .. } => Opcode::SetParam,
			Command::GetParam { .. } => Opcode::GetParam,
			Command::StartStream { .. } => Opcode::StartStream,
			Command::StopStream { .. } => Opcode::StopStream,
			Command::ReadStream { .. } => Opcode::ReadStream,
			Command::Heartbeat => Opcode::Heartbeat,
			Command::Shutdown => Opcode::Shutdown,
		}
	}

	/// Worker-local device id the command targets, if any.
	pub fn device_id(&self) -> Option<u32> {
		match self {
			Command::Close { device_id }
			| Command::GetInfo { device_id }
			| Command::SetParam { device_id, .. }
			| Command::GetParam { device_id, .. }
			| Command::StartStream { device_id, .. } => Some(*device_id),
			_ => None,
		}
	}
}

/// Successful results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
	Devices { devices: Vec<DeviceDescriptor> },
	Opened { device_id: u32 },
	/// `remaining` is the number of handles still open in the worker.
	Closed { remaining: u32 },
	Info { info: BTreeMap<String, String> },
	/// Value after native rounding/clamping.
	Param { value: ParamValue },
	Ack,
	StreamStarted { session_id: u32 },
	StreamChunk(StreamChunk),
	Heartbeat { state: WorkerState, open_handles: u32 },
}

/// A block of samples read from a stream session.
///
/// The JSON body carries the metadata; the samples themselves travel in the
/// frame's bulk section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
	pub session_id: u32,
	/// Increments by one per chunk within a session, starting at zero.
	pub sequence: u64,
	/// Samples the session delivered before this chunk.
	#[serde(default)]
	pub offset: u64,
	pub format: StreamFormat,
	/// Samples the native layer dropped since the previous chunk.
	#[serde(default)]
	pub dropped: u64,
	/// Set on the final chunk of a session that is being flushed.
	#[serde(default)]
	pub end: bool,
	#[serde(skip)]
	pub data: Bytes,
}

impl StreamChunk {
	pub fn sample_count(&self) -> usize {
		self.data.len() / self.format.bytes_per_sample()
	}
}

/// Error classes a worker can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
	DeviceBusy,
	DeviceNotFound,
	/// Native driver rejected the call; `code` carries its status.
	Native,
	InvalidRequest,
	InvalidHandle,
	UnknownSession,
	StreamActive,
	/// The worker is draining and accepts no new work.
	Draining,
	UnknownDriver,
	DiscoveryUnavailable,
	/// The worker could not get ready for a reason other than the device.
	StartupFailed,
}

/// Error payload of a failed response or a `Failed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct WireError {
	pub kind: WireErrorKind,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub code: Option<i32>,
}

impl WireError {
	pub fn new(kind: WireErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
			code: None,
		}
	}

	pub fn native(code: i32, message: impl Into<String>) -> Self {
		Self {
			kind: WireErrorKind::Native,
			message: message.into(),
			code: Some(code),
		}
	}
}

/// Unsolicited worker notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
	/// Device claimed; the worker accepts commands.
	Ready { driver: String, serial: String, pid: u32 },
	/// Startup failed; the worker exits right after sending this.
	Failed { error: WireError },
	/// The worker moved to a new lifecycle state on its own.
	State { state: WorkerState },
}

impl Event {
	pub fn opcode(&self) -> Opcode {
		match self {
			Event::Ready { .. } => Opcode::Ready,
			Event::Failed { .. } => Opcode::Failed,
			Event::State { .. } => Opcode::StateChanged,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
	pub seq: u64,
	pub command: Command,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
	pub seq: u64,
	/// Opcode of the request this answers.
	pub opcode: Opcode,
	pub result: Result<Reply, WireError>,
}

impl Response {
	pub fn ok(seq: u64, opcode: Opcode, reply: Reply) -> Self {
		Self {
			seq,
			opcode,
			result: Ok(reply),
		}
	}

	pub fn err(seq: u64, opcode: Opcode, error: WireError) -> Self {
		Self {
			seq,
			opcode,
			result: Err(error),
		}
	}
}

/// Any message that can cross the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	Request(Request),
	Response(Response),
	Event(Event),
}

impl Message {
	pub fn seq(&self) -> u64 {
		match self {
			Message::Request(req) => req.seq,
			Message::Response(resp) => resp.seq,
			Message::Event(_) => 0,
		}
	}

	pub fn into_frame(self) -> Result<Frame, FrameError> {
		match self {
			Message::Request(req) => Ok(Frame {
				opcode: req.command.opcode(),
				kind: FrameKind::Request,
				seq: req.seq,
				body: Bytes::from(serde_json::to_vec(&req.command)?),
				bulk: Bytes::new(),
			}),
			Message::Response(resp) => {
				let bulk = match &resp.result {
					Ok(Reply::StreamChunk(chunk)) => chunk.data.clone(),
					_ => Bytes::new(),
				};
				Ok(Frame {
					opcode: resp.opcode,
					kind: FrameKind::Response,
					seq: resp.seq,
					body: Bytes::from(serde_json::to_vec(&resp.result)?),
					bulk,
				})
			}
			Message::Event(event) => Ok(Frame {
				opcode: event.opcode(),
				kind: FrameKind::Event,
				seq: 0,
				body: Bytes::from(serde_json::to_vec(&event)?),
				bulk: Bytes::new(),
			}),
		}
	}

	pub fn from_frame(frame: Frame) -> Result<Self, FrameError> {
		match frame.kind {
			FrameKind::Request => {
				let command: Command = serde_json::from_slice(&frame.body)?;
				if command.opcode() != frame.opcode {
					return Err(FrameError::Malformed(format!(
						"header opcode {:?} does not match body {:?}",
						frame.opcode,
						command.opcode()
					)));
				}
				Ok(Message::Request(Request { seq: frame.seq, command }))
			}
			FrameKind::Response => {
				let mut result: Result<Reply, WireError> = serde_json::from_slice(&frame.body)?;
				if let Ok(Reply::StreamChunk(chunk)) = &mut result {
					chunk.data = frame.bulk;
				}
				Ok(Message::Response(Response {
					seq: frame.seq,
					opcode: frame.opcode,
					result,
				}))
			}
			FrameKind::Event => Ok(Message::Event(serde_json::from_slice(&frame.body)?)),
		}
	}
}

impl From<Request> for Message {
	fn from(req: Request) -> Self {
		Message::Request(req)
	}
}

impl From<Response> for Message {
	fn from(resp: Response) -> Self {
		Message::Response(resp)
	}
}

impl From<Event> for Message {
	fn from(event: Event) -> Self {
		Message::Event(event)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn command_json_is_tagged_by_op() {
		let cmd = Command::SetParam {
			device_id: 1,
			key: "gain".into(),
			value: ParamValue::Float(30.0),
		};
		let json = serde_json::to_value(&cmd).unwrap();
		assert_eq!(json["op"], "set_param");
		assert_eq!(json["key"], "gain");
		assert_eq!(cmd.device_id(), Some(1));
		assert_eq!(Command::ReadStream { session_id: 1, max_samples: 8 }.device_id(), None);
	}

	#[test]
	fn stream_chunk_samples_travel_as_bulk() {
		let chunk = StreamChunk {
			session_id: 3,
			sequence: 9,
			offset: 4_096,
			format: StreamFormat::Cs16,
			dropped: 0,
			end: false,
			data: Bytes::from_static(&[1, 0, 2, 0, 3, 0, 4, 0]),
		};
		let frame = Message::Response(Response::ok(42, Opcode::ReadStream, Reply::StreamChunk(chunk.clone())))
			.into_frame()
			.unwrap();
		assert_eq!(frame.bulk.len(), 8);
		// the JSON body never contains sample data
		assert!(!String::from_utf8_lossy(&frame.body).contains("data"));

		match Message::from_frame(frame).unwrap() {
			Message::Response(Response {
				seq: 42,
				result: Ok(Reply::StreamChunk(decoded)),
				..
			}) => {
				assert_eq!(decoded, chunk);
				assert_eq!(decoded.sample_count(), 2);
			}
			other => panic!("unexpected message: {other:?}"),
		}
	}

	#[test]
	fn error_response_keeps_kind_and_code() {
		let frame = Message::Response(Response::err(7, Opcode::SetParam, WireError::native(-5, "out of range")))
			.into_frame()
			.unwrap();
		match Message::from_frame(frame).unwrap() {
			Message::Response(resp) => {
				let err = resp.result.unwrap_err();
				assert_eq!(err.kind, WireErrorKind::Native);
				assert_eq!(err.code, Some(-5));
				assert_eq!(err.to_string(), "out of range");
			}
			other => panic!("unexpected message: {other:?}"),
		}
	}

	#[test]
	fn mismatched_request_opcode_is_rejected() {
		let mut frame = Message::Request(Request {
			seq: 1,
			command: Command::Heartbeat,
		})
		.into_frame()
		.unwrap();
		frame.opcode = Opcode::Open;
		assert!(matches!(Message::from_frame(frame), Err(FrameError::Malformed(_))));
	}
}
