//! Request/response correlation on top of the pipe transport.
//!
//! Every outbound request gets a fresh sequence number and a oneshot callback
//! keyed by it. The dispatch loop completes callbacks as responses arrive and
//! forwards worker events on a separate channel. When the reader stops, every
//! pending request is released with [`Error::ConnectionClosed`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rxproxy_protocol::{Command, Event, Message, Reply, Request, Response};
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::TransportParts;

/// Pending request callbacks keyed by sequence number.
type CallbackMap = Arc<DashMap<u64, oneshot::Sender<Result<Reply>>>>;

/// Removes the callback of a request whose future was dropped or timed out.
struct CancelGuard {
	seq: u64,
	callbacks: CallbackMap,
	completed: bool,
}

impl CancelGuard {
	fn new(seq: u64, callbacks: CallbackMap) -> Self {
		Self {
			seq,
			callbacks,
			completed: false,
		}
	}

	fn complete(&mut self) {
		self.completed = true;
	}
}

impl Drop for CancelGuard {
	fn drop(&mut self) {
		if !self.completed && self.callbacks.remove(&self.seq).is_some() {
			debug!(target = "rxproxy.transport", seq = self.seq, "dropped orphaned callback");
		}
	}
}

struct ResponseFuture {
	rx: oneshot::Receiver<Result<Reply>>,
	guard: CancelGuard,
}

impl Future for ResponseFuture {
	type Output = Result<Reply>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(result) => {
				self.guard.complete();
				Poll::Ready(result.map_err(|_| Error::ConnectionClosed).and_then(|r| r))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

/// Manager-side connection to one worker.
pub struct Connection {
	last_seq: AtomicU64,
	callbacks: CallbackMap,
	outbound_tx: mpsc::UnboundedSender<Message>,
	/// Transport halves and channels, taken once by [`run`](Self::run).
	parts: Mutex<Option<(TransportParts, mpsc::UnboundedReceiver<Message>)>>,
	events_tx: mpsc::UnboundedSender<Event>,
	events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
	/// Serializes ordinary commands; heartbeats bypass it.
	command_lock: tokio::sync::Mutex<()>,
	closed: AtomicBool,
	closed_notify: Notify,
}

impl Connection {
	pub fn new(parts: TransportParts) -> Self {
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		let (events_tx, events_rx) = mpsc::unbounded_channel();

		Self {
			last_seq: AtomicU64::new(1),
			callbacks: Arc::new(DashMap::new()),
			outbound_tx,
			parts: Mutex::new(Some((parts, outbound_rx))),
			events_tx,
			events_rx: Mutex::new(Some(events_rx)),
			command_lock: tokio::sync::Mutex::new(()),
			closed: AtomicBool::new(false),
			closed_notify: Notify::new(),
		}
	}

	/// Worker events (`Ready`, `Failed`, state changes). Available once.
	pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<Event>> {
		self.events_rx.lock().take()
	}

	/// Sends a command and waits for its reply, one command at a time.
	pub async fn request(&self, command: Command, timeout: Duration) -> Result<Reply> {
		let _turn = self.command_lock.lock().await;
		self.send_command(command, timeout).await
	}

	/// Sends a command without waiting for the per-connection turn.
	///
	/// Used for heartbeats, which the worker answers from its reader.
	pub async fn request_unordered(&self, command: Command, timeout: Duration) -> Result<Reply> {
		self.send_command(command, timeout).await
	}

	async fn send_command(&self, command: Command, timeout: Duration) -> Result<Reply> {
		let seq = self.last_seq.fetch_add(1, Ordering::SeqCst);
		let opcode = command.opcode();

		let (tx, rx) = oneshot::channel();
		self.callbacks.insert(seq, tx);
		let guard = CancelGuard::new(seq, Arc::clone(&self.callbacks));

		if self.is_closed() {
			return Err(Error::ConnectionClosed);
		}

		debug!(target = "rxproxy.transport", seq, ?opcode, "request");
		if self.outbound_tx.send(Message::Request(Request { seq, command })).is_err() {
			return Err(Error::ConnectionClosed);
		}

		tokio::time::timeout(timeout, ResponseFuture { rx, guard })
			.await
			.map_err(|_| Error::Timeout(format!("{opcode:?} reply after {}ms", timeout.as_millis())))?
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Resolves once the dispatch loop has ended.
	pub async fn closed(&self) {
		loop {
			let notified = self.closed_notify.notified();
			if self.is_closed() {
				return;
			}
			notified.await;
		}
	}

	/// Drives the transport until the worker closes its end.
	///
	/// Can only be called once; later calls return immediately.
	pub async fn run(self: &Arc<Self>) {
		let Some((parts, mut outbound_rx)) = self.parts.lock().take() else {
			warn!(target = "rxproxy.transport", "connection run() called twice");
			return;
		};
		let TransportParts {
			mut sender,
			receiver,
			mut message_rx,
		} = parts;

		let reader_handle = tokio::spawn(async move {
			if let Err(e) = receiver.run().await {
				warn!(target = "rxproxy.transport", error = %e, "worker transport read error");
			}
		});

		let writer_handle = tokio::spawn(async move {
			while let Some(message) = outbound_rx.recv().await {
				if let Err(e) = sender.send(message).await {
					debug!(target = "rxproxy.transport", error = %e, "worker transport write error");
					break;
				}
			}
		});

		while let Some(message) = message_rx.recv().await {
			self.dispatch(message);
		}

		let _ = reader_handle.await;
		writer_handle.abort();
		self.fail_pending();
	}

	fn dispatch(&self, message: Message) {
		match message {
			Message::Response(Response { seq, result, .. }) => match self.callbacks.remove(&seq) {
				Some((_, tx)) => {
					let _ = tx.send(result.map_err(Error::Remote));
				}
				None => debug!(target = "rxproxy.transport", seq, "reply for abandoned request"),
			},
			Message::Event(event) => {
				let _ = self.events_tx.send(event);
			}
			Message::Request(req) => {
				warn!(target = "rxproxy.transport", seq = req.seq, "worker sent a request; ignoring");
			}
		}
	}

	fn fail_pending(&self) {
		self.closed.store(true, Ordering::SeqCst);
		let pending: Vec<u64> = self.callbacks.iter().map(|entry| *entry.key()).collect();
		for seq in pending {
			if let Some((_, tx)) = self.callbacks.remove(&seq) {
				let _ = tx.send(Err(Error::ConnectionClosed));
			}
		}
		self.closed_notify.notify_waiters();
	}
}

#[cfg(test)]
mod tests;
