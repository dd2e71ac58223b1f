use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use num_complex::Complex32;
use rxproxy_protocol::{
	Command, DeviceArgs, Event, Reply, Request, StreamChunk, StreamFormat, WireError, WireErrorKind,
	WorkerState,
};
use rxproxy_runtime::EndpointSender;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::{Shared, WorkerOutcome, respond, wire_error};
use crate::claim::ClaimLock;
use crate::native::{NativeDevice, NativeError, NativeRead};
use crate::samples;

/// Caps one chunk well below the frame size limit.
const MAX_CHUNK_SAMPLES: u32 = 1 << 20;

struct Session {
	device_id: u32,
	channel: u32,
	format: StreamFormat,
	sequence: u64,
	/// Samples delivered so far.
	offset: u64,
}

enum Step {
	Reply(Result<Reply, WireError>),
	/// Reply, then drain and stop.
	Drain(Reply),
	Fault(String),
}

impl From<Result<Reply, WireError>> for Step {
	fn from(result: Result<Reply, WireError>) -> Self {
		Step::Reply(result)
	}
}

/// Executes device commands one at a time against the claimed device.
pub(super) struct Executor {
	device: Option<Box<dyn NativeDevice>>,
	serial: String,
	channels: u32,
	shared: Arc<Shared>,
	out: EndpointSender,
	read_wait: Duration,
	claim_lock: ClaimLock,
	handles: BTreeSet<u32>,
	next_handle: u32,
	sessions: HashMap<u32, Session>,
	next_session: u32,
}

impl Executor {
	pub(super) fn new(
		device: Box<dyn NativeDevice>,
		serial: String,
		shared: Arc<Shared>,
		out: EndpointSender,
		read_wait: Duration,
		claim_lock: ClaimLock,
	) -> Self {
		Self {
			channels: device.channels(),
			device: Some(device),
			serial,
			shared,
			out,
			read_wait,
			claim_lock,
			handles: BTreeSet::new(),
			next_handle: 1,
			sessions: HashMap::new(),
			next_session: 1,
		}
	}

	pub(super) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>) -> WorkerOutcome {
		while let Some(req) = rx.recv().await {
			let Request { seq, command } = req;
			let step = self.execute(&command).await;
			match step {
				Step::Reply(result) => respond(&self.out, seq, &command, result),
				Step::Drain(reply) => {
					respond(&self.out, seq, &command, Ok(reply));
					return self.drain(rx).await;
				}
				Step::Fault(msg) => {
					error!(target = "rxproxy.worker", serial = %self.serial, %msg, "native fault");
					self.shared.set_state(WorkerState::Crashed);
					return WorkerOutcome::Faulted(msg);
				}
			}
		}
		self.drain(rx).await
	}

	/// Runs a blocking native call off the async threads.
	async fn native<T, F>(&mut self, call: F) -> Result<T, NativeError>
	where
		T: Send + 'static,
		F: FnOnce(&mut dyn NativeDevice) -> Result<T, NativeError> + Send + 'static,
	{
		let Some(mut device) = self.device.take() else {
			return Err(NativeError::Fault("device already released".into()));
		};
		match tokio::task::spawn_blocking(move || {
			let result = call(device.as_mut());
			(device, result)
		})
		.await
		{
			Ok((device, result)) => {
				self.device = Some(device);
				result
			}
			Err(join) => Err(NativeError::Fault(format!("native call panicked: {join}"))),
		}
	}

	fn check_handle(&self, device_id: u32) -> Result<(), WireError> {
		if self.handles.contains(&device_id) {
			Ok(())
		} else {
			Err(WireError::new(
				WireErrorKind::InvalidHandle,
				format!("worker has no open device {device_id}"),
			))
		}
	}

	async fn execute(&mut self, command: &Command) -> Step {
		trace!(target = "rxproxy.worker", opcode = ?command.opcode(), "execute");
		if let Some(device_id) = command.device_id() {
			if let Err(e) = self.check_handle(device_id) {
				return Err(e).into();
			}
		}
		match command {
			Command::Open { serial, args } => self.open(serial, args).into(),
			Command::Close { device_id } => self.close(*device_id).await,
			Command::GetInfo { .. } => {
				match self.native(|dev| Ok(dev.info())).await {
					Ok(mut info) => {
						info.insert("worker_pid".into(), std::process::id().to_string());
						Ok(Reply::Info { info }).into()
					}
					Err(err) => native_step(err),
				}
			}
			Command::SetParam { key, value, .. } => {
				let (key, value) = (key.clone(), value.clone());
				match self.native(move |dev| dev.set_param(&key, &value)).await {
					Ok(value) => Ok(Reply::Param { value }).into(),
					Err(err) => native_step(err),
				}
			}
			Command::GetParam { key, .. } => {
				let key = key.clone();
				match self.native(move |dev| dev.get_param(&key)).await {
					Ok(value) => Ok(Reply::Param { value }).into(),
					Err(err) => native_step(err),
				}
			}
			Command::StartStream {
				device_id,
				channel,
				format,
			} => self.start_stream(*device_id, *channel, *format).await,
			Command::StopStream { session_id } => self.stop_stream(*session_id).await,
			Command::ReadStream {
				session_id,
				max_samples,
			} => self.read_stream(*session_id, *max_samples).await,
			Command::Heartbeat => Ok(Reply::Heartbeat {
				state: self.shared.state(),
				open_handles: self.handles.len() as u32,
			})
			.into(),
			Command::Shutdown => {
				info!(target = "rxproxy.worker", serial = %self.serial, "shutdown requested");
				Step::Drain(Reply::Ack)
			}
			Command::Enumerate { .. } => Err(WireError::new(
				WireErrorKind::InvalidRequest,
				"device worker does not enumerate; use a probe worker",
			))
			.into(),
		}
	}

	fn open(&mut self, serial: &str, args: &DeviceArgs) -> Result<Reply, WireError> {
		if serial != self.serial {
			return Err(WireError::new(
				WireErrorKind::DeviceNotFound,
				format!("worker for '{}' cannot open '{serial}'", self.serial),
			));
		}
		if args.hints().next().is_some() {
			debug!(target = "rxproxy.worker", %args, "open hints apply only when the device is claimed");
		}
		let device_id = self.next_handle;
		self.next_handle += 1;
		self.handles.insert(device_id);
		self.shared.set_open_handles(self.handles.len() as u32);
		self.shared.set_state(WorkerState::Active);
		debug!(target = "rxproxy.worker", device_id, open = self.handles.len(), "device opened");
		Ok(Reply::Opened { device_id })
	}

	async fn close(&mut self, device_id: u32) -> Step {
		let owned: Vec<u32> = self
			.sessions
			.iter()
			.filter(|(_, s)| s.device_id == device_id)
			.map(|(id, _)| *id)
			.collect();
		for session_id in owned {
			if let Step::Fault(msg) = self.stop_stream(session_id).await {
				return Step::Fault(msg);
			}
		}

		self.handles.remove(&device_id);
		let remaining = self.handles.len() as u32;
		self.shared.set_open_handles(remaining);
		debug!(target = "rxproxy.worker", device_id, remaining, "device closed");
		if remaining == 0 {
			Step::Drain(Reply::Closed { remaining })
		} else {
			Ok(Reply::Closed { remaining }).into()
		}
	}

	async fn start_stream(&mut self, device_id: u32, channel: u32, format: StreamFormat) -> Step {
		if channel >= self.channels {
			return Err(WireError::new(
				WireErrorKind::InvalidRequest,
				format!("channel {channel} out of range; '{}' has {} channel(s)", self.serial, self.channels),
			))
			.into();
		}
		if self.sessions.values().any(|s| s.channel == channel) {
			return Err(WireError::new(
				WireErrorKind::StreamActive,
				format!("channel {channel} already has an active stream"),
			))
			.into();
		}
		if let Err(err) = self.native(move |dev| dev.start_stream(channel)).await {
			return native_step(err);
		}
		let session_id = self.next_session;
		self.next_session += 1;
		self.sessions.insert(
			session_id,
			Session {
				device_id,
				channel,
				format,
				sequence: 0,
				offset: 0,
			},
		);
		debug!(target = "rxproxy.worker", session_id, channel, %format, "stream started");
		Ok(Reply::StreamStarted { session_id }).into()
	}

	async fn stop_stream(&mut self, session_id: u32) -> Step {
		let Some(session) = self.sessions.remove(&session_id) else {
			return Err(unknown_session(session_id)).into();
		};
		let channel = session.channel;
		match self.native(move |dev| dev.stop_stream(channel)).await {
			Ok(()) => {
				debug!(target = "rxproxy.worker", session_id, channel, "stream stopped");
				Ok(Reply::Ack).into()
			}
			Err(err) => native_step(err),
		}
	}

	async fn read_stream(&mut self, session_id: u32, max_samples: u32) -> Step {
		let Some(session) = self.sessions.get(&session_id) else {
			return Err(unknown_session(session_id)).into();
		};
		let channel = session.channel;
		let max = max_samples.min(MAX_CHUNK_SAMPLES) as usize;
		let wait = self.read_wait;

		let read = self
			.native(move |dev| {
				let mut buf: Vec<Complex32> = Vec::with_capacity(max);
				let NativeRead { dropped, .. } = dev.read_stream(channel, &mut buf, max, wait)?;
				Ok((buf, dropped))
			})
			.await;
		let (buf, dropped) = match read {
			Ok(read) => read,
			Err(err) => return native_step(err),
		};

		let Some(session) = self.sessions.get_mut(&session_id) else {
			return Err(unknown_session(session_id)).into();
		};
		let (sequence, offset) = (session.sequence, session.offset);
		session.sequence += 1;
		session.offset += buf.len() as u64;
		Ok(Reply::StreamChunk(StreamChunk {
			session_id,
			sequence,
			offset,
			format: session.format,
			dropped,
			end: false,
			data: samples::encode(&buf, session.format),
		}))
		.into()
	}

	/// Refuses queued work, stops streams, releases the device.
	async fn drain(mut self, mut rx: mpsc::UnboundedReceiver<Request>) -> WorkerOutcome {
		self.shared.set_state(WorkerState::Draining);
		let _ = self.out.send(Event::State {
			state: WorkerState::Draining,
		});
		info!(target = "rxproxy.worker", serial = %self.serial, "draining");

		rx.close();
		while let Some(Request { seq, command }) = rx.recv().await {
			let result = match &command {
				Command::ReadStream { session_id, .. } => match self.sessions.get(session_id) {
					Some(session) => Ok(Reply::StreamChunk(StreamChunk {
						session_id: *session_id,
						sequence: session.sequence,
						offset: session.offset,
						format: session.format,
						dropped: 0,
						end: true,
						data: Bytes::new(),
					})),
					None => Err(unknown_session(*session_id)),
				},
				_ => Err(WireError::new(WireErrorKind::Draining, "worker is draining")),
			};
			respond(&self.out, seq, &command, result);
		}

		let channels: Vec<u32> = self.sessions.drain().map(|(_, s)| s.channel).collect();
		if !channels.is_empty() {
			let stopped = self
				.native(move |dev| {
					for channel in channels {
						dev.stop_stream(channel)?;
					}
					Ok(())
				})
				.await;
			if let Err(NativeError::Fault(msg)) = stopped {
				return WorkerOutcome::Faulted(msg);
			}
		}

		if let Some(device) = self.device.take() {
			let lock = self.claim_lock.clone();
			match tokio::task::spawn_blocking(move || lock.hold(move || drop(device))).await {
				Ok(Ok(())) => {}
				// the device went with the unused closure
				Ok(Err(err)) => warn!(target = "rxproxy.worker", serial = %self.serial, error = %err, "released without claim lock"),
				Err(join) => debug!(target = "rxproxy.worker", error = %join, "release task failed"),
			}
		}
		self.shared.set_state(WorkerState::Terminated);
		info!(target = "rxproxy.worker", serial = %self.serial, "device released");
		WorkerOutcome::Drained
	}
}

fn native_step(err: NativeError) -> Step {
	match err {
		NativeError::Fault(msg) => Step::Fault(msg),
		other => Step::Reply(Err(wire_error(&other))),
	}
}

fn unknown_session(session_id: u32) -> WireError {
	WireError::new(WireErrorKind::UnknownSession, format!("worker has no stream session {session_id}"))
}
