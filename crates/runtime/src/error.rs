//! Error types for the transport and worker process layer.

use rxproxy_protocol::{FrameError, WireError};
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	/// Peer closed its end of the pipe.
	#[error("worker connection closed")]
	ConnectionClosed,

	/// No message or response arrived in time.
	#[error("timed out waiting for {0}")]
	Timeout(String),

	/// Bytes on the pipe do not form valid frames.
	#[error("worker protocol error: {0}")]
	Protocol(#[from] FrameError),

	/// Well-formed response of the wrong shape.
	#[error("worker sent unexpected {got} reply to {expected}")]
	UnexpectedReply { expected: &'static str, got: String },

	/// Error reported by the worker itself.
	#[error(transparent)]
	Remote(#[from] WireError),

	/// Worker executable could not be located.
	#[error("worker executable not found: {0}")]
	WorkerNotFound(String),

	/// Worker process could not be started.
	#[error("failed to launch worker subprocess: {0}")]
	LaunchFailed(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::Timeout(_))
	}

	pub fn is_closed(&self) -> bool {
		matches!(self, Error::ConnectionClosed)
	}

	/// The worker's error payload, if this came from the worker.
	pub fn remote(&self) -> Option<&WireError> {
		match self {
			Error::Remote(err) => Some(err),
			_ => None,
		}
	}
}
