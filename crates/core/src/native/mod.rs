//! Boundary to the vendor driver.
//!
//! Vendor receiver APIs are blocking and allow a single open device per OS
//! process. [`NativeDriver`] and [`NativeDevice`] model exactly that surface;
//! the worker calls them from blocking threads and never shares a device
//! across processes.

pub mod sim;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use num_complex::Complex32;
use rxproxy_protocol::{DeviceArgs, DeviceDescriptor, ParamValue};
use thiserror::Error;

pub use sim::SimDriver;

/// Well-known receiver setting keys.
pub mod keys {
	pub const FREQUENCY: &str = "frequency";
	pub const SAMPLE_RATE: &str = "sample_rate";
	pub const GAIN: &str = "gain";
	pub const AGC: &str = "agc";
	pub const ANTENNA: &str = "antenna";
	pub const BANDWIDTH: &str = "bandwidth";
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NativeError {
	/// Device is claimed by someone else.
	#[error("device busy: {0}")]
	Busy(String),

	#[error("device not found: {0}")]
	NotFound(String),

	/// Discovery service cannot be reached.
	#[error("discovery unavailable: {0}")]
	DiscoveryUnavailable(String),

	/// The call failed; the device is still usable.
	#[error("{message}")]
	Call { code: i32, message: String },

	/// Unrecoverable driver state; the hosting process must not continue.
	#[error("native fault: {0}")]
	Fault(String),
}

impl NativeError {
	pub fn call(code: i32, message: impl Into<String>) -> Self {
		NativeError::Call {
			code,
			message: message.into(),
		}
	}
}

/// Result of one native stream read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeRead {
	/// Samples the driver discarded since the previous read.
	pub dropped: u64,
}

/// A driver family: discovery and claiming.
pub trait NativeDriver: Send + Sync {
	fn name(&self) -> &str;

	/// Lists devices visible right now. Must not claim anything.
	fn enumerate(&self, filter: &DeviceArgs) -> Result<Vec<DeviceDescriptor>, NativeError>;

	/// Claims the device with `serial`. `hints` are the open-time extras from
	/// the device arguments.
	fn open(&self, serial: &str, hints: &DeviceArgs) -> Result<Box<dyn NativeDevice>, NativeError>;
}

/// An open, claimed device. Dropping it releases the claim.
pub trait NativeDevice: Send {
	fn info(&self) -> BTreeMap<String, String>;

	fn channels(&self) -> u32;

	/// Applies a setting and returns the value actually in effect.
	fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<ParamValue, NativeError>;

	fn get_param(&self, key: &str) -> Result<ParamValue, NativeError>;

	fn start_stream(&mut self, channel: u32) -> Result<(), NativeError>;

	/// Appends up to `max` samples to `out`, waiting at most `timeout` for
	/// the first one.
	fn read_stream(
		&mut self,
		channel: u32,
		out: &mut Vec<Complex32>,
		max: usize,
		timeout: Duration,
	) -> Result<NativeRead, NativeError>;

	fn stop_stream(&mut self, channel: u32) -> Result<(), NativeError>;
}

/// Resolves a driver name to an implementation.
pub type DriverRegistry = Arc<dyn Fn(&str) -> Option<Arc<dyn NativeDriver>> + Send + Sync>;

/// Drivers compiled into this build.
pub fn builtin_drivers() -> DriverRegistry {
	Arc::new(|name: &str| match name {
		sim::DRIVER_NAME => Some(SimDriver::shared() as Arc<dyn NativeDriver>),
		_ => None,
	})
}
