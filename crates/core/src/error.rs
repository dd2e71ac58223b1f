//! Error taxonomy for proxy operations.
//!
//! Every variant raised by the proxy layer renders with one of the words
//! `proxy`, `worker` or `subprocess` so callers that only see text can still
//! tell a proxy failure from a driver failure. Code should prefer
//! [`Error::origin`].

use rxproxy_protocol::{WireError, WireErrorKind};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Where a failure was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
	/// Proxy machinery: spawning, supervision, transport, handle bookkeeping.
	Proxy,
	/// The native driver, relayed unchanged.
	Native,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
	#[error("proxy: failed to spawn worker subprocess for '{serial}': {reason}")]
	SpawnFailure { serial: String, reason: String },

	#[error("proxy: worker for '{serial}' did not report ready within {timeout_ms}ms")]
	HandshakeTimeout { serial: String, timeout_ms: u64 },

	#[error("proxy: worker for '{serial}' crashed ({reason})")]
	WorkerCrash { serial: String, reason: String },

	#[error("proxy: device '{serial}' is busy; worker subprocess could not claim it ({detail})")]
	DeviceBusy { serial: String, detail: String },

	#[error("proxy: device '{serial}' not found by worker subprocess ({detail})")]
	DeviceNotFound { serial: String, detail: String },

	#[error("proxy: no serial given and {count} '{driver}' devices are present; pass serial=<serial>")]
	AmbiguousSerial { driver: String, count: usize },

	#[error("proxy: stream overrun, {dropped} samples lost")]
	StreamOverrun { dropped: u64 },

	#[error("proxy: transport to worker for '{serial}' closed")]
	TransportClosed { serial: String },

	#[error("proxy: worker for '{serial}' timed out waiting for {operation}")]
	Timeout { serial: String, operation: String },

	#[error("{message} (driver error {code})")]
	NativeDriverError { code: i32, message: String },

	#[error("proxy: device handle is closed or unknown")]
	InvalidHandle,

	#[error("proxy: stream session is closed")]
	StreamClosed,

	#[error("proxy: channel {channel} of '{serial}' already has an active stream")]
	StreamActive { serial: String, channel: u32 },

	#[error("proxy: invalid argument: {0}")]
	InvalidArgument(String),

	#[error("proxy: worker protocol error: {0}")]
	Protocol(String),
}

impl Error {
	pub fn origin(&self) -> Origin {
		match self {
			Error::NativeDriverError { .. } => Origin::Native,
			_ => Origin::Proxy,
		}
	}

	pub fn is_proxy_originated(&self) -> bool {
		self.origin() == Origin::Proxy
	}

	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::HandshakeTimeout { .. } | Error::Timeout { .. })
	}

	/// True when the worker behind the call is gone.
	pub fn is_worker_lost(&self) -> bool {
		matches!(self, Error::WorkerCrash { .. } | Error::TransportClosed { .. })
	}

	/// Translates an error reported by the worker for `serial`.
	pub fn from_wire(serial: &str, err: WireError) -> Self {
		let serial = serial.to_string();
		match err.kind {
			WireErrorKind::DeviceBusy => Error::DeviceBusy {
				serial,
				detail: err.message,
			},
			WireErrorKind::DeviceNotFound => Error::DeviceNotFound {
				serial,
				detail: err.message,
			},
			WireErrorKind::Native => Error::NativeDriverError {
				code: err.code.unwrap_or(-1),
				message: err.message,
			},
			WireErrorKind::InvalidRequest | WireErrorKind::StreamActive => Error::InvalidArgument(err.message),
			WireErrorKind::InvalidHandle | WireErrorKind::Draining => Error::InvalidHandle,
			WireErrorKind::UnknownSession => Error::StreamClosed,
			WireErrorKind::UnknownDriver | WireErrorKind::StartupFailed => Error::SpawnFailure {
				serial,
				reason: err.message,
			},
			WireErrorKind::DiscoveryUnavailable => Error::Protocol(format!("discovery unavailable: {}", err.message)),
		}
	}

	/// Translates a transport-level failure talking to the worker for `serial`.
	pub fn from_runtime(serial: &str, err: rxproxy_runtime::Error) -> Self {
		use rxproxy_runtime::Error as R;
		match err {
			R::ConnectionClosed => Error::TransportClosed {
				serial: serial.to_string(),
			},
			R::Timeout(what) => Error::Timeout {
				serial: serial.to_string(),
				operation: what,
			},
			R::Remote(wire) => Error::from_wire(serial, wire),
			R::Protocol(e) => Error::Protocol(e.to_string()),
			R::UnexpectedReply { expected, got } => Error::Protocol(format!("unexpected {got} reply to {expected}")),
			R::Json(e) => Error::Protocol(e.to_string()),
			R::WorkerNotFound(reason) | R::LaunchFailed(reason) => Error::SpawnFailure {
				serial: serial.to_string(),
				reason,
			},
			R::Io(e) => Error::SpawnFailure {
				serial: serial.to_string(),
				reason: e.to_string(),
			},
		}
	}
}
