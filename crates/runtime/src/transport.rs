//! Framed duplex transport over a pair of byte pipes.
//!
//! [`PipeTransport`] splits into a sender (encodes and writes frames) and a
//! receiver (reads, buffers partial frames, forwards decoded messages on an
//! unbounded channel). [`Endpoint`] wires both halves to background tasks and
//! offers the `send` / `receive(timeout)` surface used by the worker.

use std::time::Duration;

use bytes::BytesMut;
use rxproxy_protocol::{FrameDecoder, Message};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{Error, Result};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both halves of a pipe transport before they are handed to tasks.
pub struct PipeTransport {
	sender: PipeTransportSender,
	receiver: PipeTransportReceiver,
}

impl PipeTransport {
	/// Creates a transport writing to `writer` and reading from `reader`.
	///
	/// Decoded messages are delivered on the returned channel once
	/// [`run`](Self::run) (or the receiver half's `run`) is driving the reader.
	pub fn new<W, R>(writer: W, reader: R) -> (Self, mpsc::UnboundedReceiver<Message>)
	where
		W: AsyncWrite + Send + Unpin + 'static,
		R: AsyncRead + Send + Unpin + 'static,
	{
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		let transport = Self {
			sender: PipeTransportSender {
				writer: Box::new(writer),
				scratch: BytesMut::new(),
			},
			receiver: PipeTransportReceiver {
				reader: Box::new(reader),
				decoder: FrameDecoder::new(),
				message_tx,
			},
		};
		(transport, message_rx)
	}

	pub fn into_parts(self) -> (PipeTransportSender, PipeTransportReceiver) {
		(self.sender, self.receiver)
	}

	pub fn into_transport_parts(self, message_rx: mpsc::UnboundedReceiver<Message>) -> TransportParts {
		TransportParts {
			sender: self.sender,
			receiver: self.receiver,
			message_rx,
		}
	}

	pub async fn send(&mut self, message: Message) -> Result<()> {
		self.sender.send(message).await
	}

	/// Reads until the peer closes; see [`PipeTransportReceiver::run`].
	pub async fn run(&mut self) -> Result<()> {
		self.receiver.read_loop().await
	}
}

/// Everything a connection or endpoint needs to own a transport.
pub struct TransportParts {
	pub sender: PipeTransportSender,
	pub receiver: PipeTransportReceiver,
	pub message_rx: mpsc::UnboundedReceiver<Message>,
}

/// Write half.
pub struct PipeTransportSender {
	writer: BoxedWriter,
	scratch: BytesMut,
}

impl PipeTransportSender {
	/// Encodes and writes one frame, flushing so short writes never strand it.
	pub async fn send(&mut self, message: Message) -> Result<()> {
		let frame = message.into_frame()?;
		self.scratch.clear();
		frame.encode(&mut self.scratch)?;
		trace!(
			target = "rxproxy.transport",
			opcode = ?frame.opcode,
			seq = frame.seq,
			len = self.scratch.len(),
			"send frame"
		);
		self.writer.write_all(&self.scratch).await.map_err(map_write_error)?;
		self.writer.flush().await.map_err(map_write_error)?;
		Ok(())
	}

	pub async fn shutdown(&mut self) -> Result<()> {
		self.writer.shutdown().await.map_err(map_write_error)
	}
}

/// Read half.
pub struct PipeTransportReceiver {
	reader: BoxedReader,
	decoder: FrameDecoder,
	message_tx: mpsc::UnboundedSender<Message>,
}

impl PipeTransportReceiver {
	/// Reads frames until EOF or until the message channel is dropped.
	///
	/// A clean EOF on a frame boundary returns `Ok(())`. EOF in the middle of
	/// a frame, an oversized frame, or an undecodable body is a protocol error.
	pub async fn run(mut self) -> Result<()> {
		self.read_loop().await
	}

	async fn read_loop(&mut self) -> Result<()> {
		loop {
			while let Some(frame) = self.decoder.decode()? {
				trace!(
					target = "rxproxy.transport",
					opcode = ?frame.opcode,
					seq = frame.seq,
					bulk = frame.bulk.len(),
					"recv frame"
				);
				let message = Message::from_frame(frame)?;
				if self.message_tx.send(message).is_err() {
					debug!(target = "rxproxy.transport", "message channel dropped; reader exiting");
					return Ok(());
				}
			}

			let n = self.reader.read_buf(self.decoder.buffer_mut()).await?;
			if n == 0 {
				self.decoder.finish()?;
				debug!(target = "rxproxy.transport", "peer closed pipe");
				return Ok(());
			}
		}
	}
}

fn map_write_error(err: std::io::Error) -> Error {
	match err.kind() {
		std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::WriteZero => {
			Error::ConnectionClosed
		}
		_ => Error::Io(err),
	}
}

/// A transport driven by background reader and writer tasks.
pub struct Endpoint {
	outbound: mpsc::UnboundedSender<Message>,
	inbox: mpsc::UnboundedReceiver<Message>,
	reader: Option<JoinHandle<Result<()>>>,
	writer: JoinHandle<Result<()>>,
}

/// Cloneable handle for queueing outbound messages on an [`Endpoint`].
#[derive(Clone)]
pub struct EndpointSender {
	outbound: mpsc::UnboundedSender<Message>,
}

impl EndpointSender {
	pub fn send(&self, message: impl Into<Message>) -> Result<()> {
		self.outbound.send(message.into()).map_err(|_| Error::ConnectionClosed)
	}
}

impl Endpoint {
	pub fn connect<W, R>(writer: W, reader: R) -> Self
	where
		W: AsyncWrite + Send + Unpin + 'static,
		R: AsyncRead + Send + Unpin + 'static,
	{
		let (transport, message_rx) = PipeTransport::new(writer, reader);
		Self::new(transport.into_transport_parts(message_rx))
	}

	pub fn new(parts: TransportParts) -> Self {
		let TransportParts {
			mut sender,
			receiver,
			message_rx,
		} = parts;
		let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

		let reader = tokio::spawn(receiver.run());
		let writer = tokio::spawn(async move {
			while let Some(message) = outbound_rx.recv().await {
				sender.send(message).await?;
			}
			sender.shutdown().await
		});

		Self {
			outbound,
			inbox: message_rx,
			reader: Some(reader),
			writer,
		}
	}

	pub fn sender(&self) -> EndpointSender {
		EndpointSender {
			outbound: self.outbound.clone(),
		}
	}

	/// Queues a message for the writer task.
	pub fn send(&self, message: impl Into<Message>) -> Result<()> {
		self.outbound.send(message.into()).map_err(|_| Error::ConnectionClosed)
	}

	/// Waits for the next inbound message.
	///
	/// `None` waits indefinitely. Returns [`Error::Timeout`] when the wait
	/// elapses, [`Error::ConnectionClosed`] after a clean close, and the
	/// reader's protocol error if the stream broke mid-frame.
	pub async fn receive(&mut self, timeout: Option<Duration>) -> Result<Message> {
		let next = match timeout {
			Some(limit) => tokio::time::timeout(limit, self.inbox.recv())
				.await
				.map_err(|_| Error::Timeout(format!("message after {}ms", limit.as_millis())))?,
			None => self.inbox.recv().await,
		};
		match next {
			Some(message) => Ok(message),
			None => Err(self.reader_outcome().await),
		}
	}

	async fn reader_outcome(&mut self) -> Error {
		match self.reader.take() {
			Some(handle) => match handle.await {
				Ok(Err(err)) => err,
				_ => Error::ConnectionClosed,
			},
			None => Error::ConnectionClosed,
		}
	}

	/// Flushes queued messages and closes the write side.
	///
	/// Outstanding [`EndpointSender`] clones keep the writer alive; drop them
	/// first.
	pub async fn close(self) -> Result<()> {
		let Endpoint {
			outbound,
			inbox,
			reader,
			writer,
		} = self;
		drop(outbound);
		drop(inbox);
		let result = match writer.await {
			Ok(result) => result,
			Err(join) => Err(Error::Io(std::io::Error::other(join))),
		};
		if let Some(reader) = reader {
			reader.abort();
		}
		result
	}
}

#[cfg(test)]
mod tests;
