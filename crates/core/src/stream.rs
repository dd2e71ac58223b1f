//! Stream sessions on the manager side.
//!
//! Each session owns a [`SampleRing`] and a pump task that keeps issuing
//! `ReadStream` to the worker and pushes the decoded chunks into the ring.
//! Readers take samples out of the ring and never talk to the worker
//! directly, so a reader blocked on an empty ring is woken by new samples, by
//! the session being stopped, or by the pump failing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use num_complex::Complex32;
use parking_lot::Mutex;
use rxproxy_protocol::{Command, Reply, StreamChunk, StreamFormat};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::OverrunPolicy;
use crate::error::{Error, Result};
use crate::samples;
use crate::supervisor::WorkerHandle;

/// Result of one [`SampleRing::read`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamRead {
	/// Samples appended to the caller's buffer.
	pub count: usize,
	/// Samples lost since the previous read, in the worker or in the ring.
	pub dropped: u64,
	/// Chunks received so far in this session.
	pub chunks: u64,
}

struct RingState {
	samples: VecDeque<Complex32>,
	dropped: u64,
	/// Sequence number the next chunk must carry.
	expected: u64,
	/// Session offset the next chunk should start at.
	next_offset: u64,
	/// Reads given up on after a timeout; their chunks never arrive.
	abandoned: u64,
	/// Error the next read reports once, then streaming continues.
	pending: Option<Error>,
	/// Set once no more samples will arrive.
	terminal: Option<Error>,
}

/// Bounded sample buffer between a pump and its readers.
pub struct SampleRing {
	state: Mutex<RingState>,
	readable: Notify,
	writable: Notify,
	capacity: usize,
	policy: OverrunPolicy,
	overrun_is_error: bool,
}

impl SampleRing {
	pub fn new(capacity: usize, policy: OverrunPolicy, overrun_is_error: bool) -> Self {
		let capacity = capacity.max(1);
		Self {
			state: Mutex::new(RingState {
				samples: VecDeque::with_capacity(capacity.min(1 << 20)),
				dropped: 0,
				expected: 0,
				next_offset: 0,
				abandoned: 0,
				pending: None,
				terminal: None,
			}),
			readable: Notify::new(),
			writable: Notify::new(),
			capacity,
			policy,
			overrun_is_error,
		}
	}

	pub fn len(&self) -> usize {
		self.state.lock().samples.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn is_closed(&self) -> bool {
		self.state.lock().terminal.is_some()
	}

	/// Appends one chunk starting at session sample `offset`.
	///
	/// Samples between the previous chunk and `offset` count as dropped. A
	/// sequence jump not explained by [`abandon`](Self::abandon) is still
	/// buffered, and the next read reports the gap.
	pub fn push(&self, sequence: u64, offset: u64, worker_dropped: u64, chunk: &[Complex32]) {
		{
			let mut st = self.state.lock();
			if st.terminal.is_some() {
				return;
			}
			if sequence != st.expected {
				let skipped = sequence.saturating_sub(st.expected);
				if skipped > 0 && skipped <= st.abandoned {
					st.abandoned -= skipped;
					debug!(target = "rxproxy.manager", skipped, "chunks of abandoned reads counted as dropped");
				} else {
					warn!(target = "rxproxy.manager", expected = st.expected, got = sequence, "stream chunk sequence gap");
					st.pending = Some(Error::Protocol(format!(
						"stream chunk sequence jumped from {} to {sequence}",
						st.expected
					)));
				}
			}
			st.expected = sequence + 1;
			st.dropped += offset.saturating_sub(st.next_offset) + worker_dropped;
			st.next_offset = offset + chunk.len() as u64;

			st.samples.extend(chunk.iter().copied());
			let excess = st.samples.len().saturating_sub(self.capacity);
			if excess > 0 {
				st.samples.drain(..excess);
				st.dropped += excess as u64;
				trace!(target = "rxproxy.manager", excess, "ring overrun; oldest samples dropped");
			}
		}
		self.readable.notify_waiters();
	}

	/// Records a read whose reply will never be pushed.
	pub fn abandon(&self) {
		self.state.lock().abandoned += 1;
	}

	/// Waits until `incoming` more samples fit. Returns false once closed.
	pub async fn wait_room(&self, incoming: usize) -> bool {
		loop {
			let notified = self.writable.notified();
			{
				let st = self.state.lock();
				if st.terminal.is_some() {
					return false;
				}
				if st.samples.len() + incoming.min(self.capacity) <= self.capacity {
					return true;
				}
			}
			notified.await;
		}
	}

	/// Ends the stream normally: buffered samples stay readable, then reads
	/// report [`Error::StreamClosed`].
	pub fn finish(&self) {
		self.terminate(Error::StreamClosed, false);
	}

	/// Ends the stream with `err`, discarding anything buffered.
	pub fn fail(&self, err: Error) {
		self.terminate(err, true);
	}

	fn terminate(&self, err: Error, discard: bool) {
		{
			let mut st = self.state.lock();
			if st.terminal.is_none() {
				st.terminal = Some(err);
			}
			if discard {
				st.samples.clear();
			}
		}
		self.readable.notify_waiters();
		self.writable.notify_waiters();
	}

	/// Moves up to `max` samples into `out`, waiting at most `timeout` for
	/// the first one. A timeout is not an error: the read returns no samples.
	pub async fn read(&self, out: &mut Vec<Complex32>, max: usize, timeout: Duration) -> Result<StreamRead> {
		let deadline = Instant::now() + timeout;
		loop {
			let notified = self.readable.notified();
			{
				let mut st = self.state.lock();
				if let Some(err) = st.pending.take() {
					return Err(err);
				}
				if self.overrun_is_error && st.dropped > 0 {
					let dropped = std::mem::take(&mut st.dropped);
					return Err(Error::StreamOverrun { dropped });
				}
				let chunks = st.expected;
				if !st.samples.is_empty() && max > 0 {
					let n = max.min(st.samples.len());
					out.extend(st.samples.drain(..n));
					let dropped = std::mem::take(&mut st.dropped);
					drop(st);
					if self.policy == OverrunPolicy::BlockProducer {
						self.writable.notify_waiters();
					}
					return Ok(StreamRead {
						count: n,
						dropped,
						chunks,
					});
				}
				if let Some(err) = &st.terminal {
					return Err(err.clone());
				}
				if max == 0 {
					return Ok(StreamRead {
						count: 0,
						dropped: std::mem::take(&mut st.dropped),
						chunks,
					});
				}
			}
			if tokio::time::timeout_at(deadline, notified).await.is_err() {
				let mut st = self.state.lock();
				return Ok(StreamRead {
					count: 0,
					dropped: std::mem::take(&mut st.dropped),
					chunks: st.expected,
				});
			}
		}
	}
}

/// Manager-side handle to an active stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamHandle {
	pub(crate) id: u64,
	pub(crate) serial: String,
	pub(crate) channel: u32,
	pub(crate) format: StreamFormat,
}

impl StreamHandle {
	pub fn serial(&self) -> &str {
		&self.serial
	}

	pub fn channel(&self) -> u32 {
		self.channel
	}

	pub fn format(&self) -> StreamFormat {
		self.format
	}
}

/// Pulls chunks for `session_id` into `ring` until the ring closes or the
/// worker stops answering.
pub(crate) async fn pump(
	worker: Arc<WorkerHandle>,
	session_id: u32,
	format: StreamFormat,
	ring: Arc<SampleRing>,
	chunk_samples: u32,
	policy: OverrunPolicy,
) {
	let serial = worker.serial().to_string();
	let mut decoded = Vec::with_capacity(chunk_samples as usize);
	loop {
		if ring.is_closed() {
			break;
		}
		if policy == OverrunPolicy::BlockProducer && !ring.wait_room(chunk_samples as usize).await {
			break;
		}

		let read = Command::ReadStream {
			session_id,
			max_samples: chunk_samples,
		};
		match worker.call(read).await {
			Ok(Reply::StreamChunk(chunk)) => {
				let StreamChunk {
					sequence,
					offset,
					dropped,
					end,
					data,
					..
				} = chunk;
				decoded.clear();
				samples::decode_into(data, format, &mut decoded);
				ring.push(sequence, offset, dropped, &decoded);
				if end {
					debug!(target = "rxproxy.manager", %serial, session_id, "stream flushed by worker");
					ring.finish();
					break;
				}
			}
			Ok(other) => {
				ring.fail(Error::Protocol(format!("unexpected reply to ReadStream: {other:?}")));
				break;
			}
			Err(Error::StreamClosed | Error::InvalidHandle) => {
				ring.finish();
				break;
			}
			Err(err) if err.is_timeout() => {
				// the worker still answers the abandoned read, consuming a sequence number
				ring.abandon();
				warn!(target = "rxproxy.manager", %serial, session_id, error = %err, "stream read timed out; retrying");
			}
			Err(err) => {
				debug!(target = "rxproxy.manager", %serial, session_id, error = %err, "stream pump stopped");
				ring.fail(err);
				break;
			}
		}
	}
	trace!(target = "rxproxy.manager", %serial, session_id, "pump exited");
}
