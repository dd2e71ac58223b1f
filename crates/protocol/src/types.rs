//! Plain data types shared by the manager and its workers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Key naming the driver family in [`DeviceArgs`].
pub const DRIVER_KEY: &str = "driver";
/// Key naming the device serial in [`DeviceArgs`].
pub const SERIAL_KEY: &str = "serial";

/// A device found by enumeration.
///
/// Descriptors are snapshots: they are produced by a probe, handed to the
/// caller and never treated as an authoritative cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
	pub driver: String,
	/// Unique per physical device.
	pub serial: String,
	pub label: String,
	#[serde(default)]
	pub attributes: BTreeMap<String, String>,
}

impl DeviceDescriptor {
	pub fn new(driver: impl Into<String>, serial: impl Into<String>, label: impl Into<String>) -> Self {
		Self {
			driver: driver.into(),
			serial: serial.into(),
			label: label.into(),
			attributes: BTreeMap::new(),
		}
	}

	pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.attributes.insert(key.into(), value.into());
		self
	}

	/// Flattens the descriptor into a key/value map, attributes included.
	pub fn to_args(&self) -> DeviceArgs {
		let mut args = DeviceArgs::new();
		for (key, value) in &self.attributes {
			args.insert(key.clone(), value.clone());
		}
		args.insert("label", self.label.clone());
		args.insert(DRIVER_KEY, self.driver.clone());
		args.insert(SERIAL_KEY, self.serial.clone());
		args
	}
}

/// Device arguments: `driver`, `serial`, plus opaque open-time hints.
///
/// Keys other than `driver` and `serial` are passed through to the worker
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceArgs(BTreeMap<String, String>);

impl DeviceArgs {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn for_driver(driver: impl Into<String>) -> Self {
		let mut args = Self::new();
		args.insert(DRIVER_KEY, driver);
		args
	}

	pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.insert(key, value);
		self
	}

	pub fn with_serial(self, serial: impl Into<String>) -> Self {
		self.with(SERIAL_KEY, serial)
	}

	pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
		self.0.insert(key.into(), value.into());
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).map(String::as_str)
	}

	pub fn driver(&self) -> Option<&str> {
		self.get(DRIVER_KEY).filter(|d| !d.is_empty())
	}

	pub fn serial(&self) -> Option<&str> {
		self.get(SERIAL_KEY).filter(|s| !s.is_empty())
	}

	/// Everything except `driver` and `serial`.
	pub fn hints(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0
			.iter()
			.filter(|(k, _)| k.as_str() != DRIVER_KEY && k.as_str() != SERIAL_KEY)
			.map(|(k, v)| (k.as_str(), v.as_str()))
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// True when every filter key present here equals the descriptor's value.
	///
	/// `driver`, `serial` and `label` compare against the descriptor fields;
	/// other keys compare against attributes. Hints a descriptor does not
	/// carry are ignored so open-time hints never hide a device.
	pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
		self.0.iter().all(|(key, value)| match key.as_str() {
			DRIVER_KEY => value.is_empty() || *value == descriptor.driver,
			SERIAL_KEY => value.is_empty() || *value == descriptor.serial,
			"label" => *value == descriptor.label,
			other => descriptor.attributes.get(other).is_none_or(|v| v == value),
		})
	}
}

impl FromIterator<(String, String)> for DeviceArgs {
	fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl fmt::Display for DeviceArgs {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut first = true;
		for (key, value) in &self.0 {
			if !first {
				f.write_str(",")?;
			}
			first = false;
			write!(f, "{key}={value}")?;
		}
		Ok(())
	}
}

/// Parses `key=value,key=value`. Empty segments are skipped.
impl FromStr for DeviceArgs {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut args = Self::new();
		for segment in s.split(',').map(str::trim).filter(|seg| !seg.is_empty()) {
			let (key, value) = segment
				.split_once('=')
				.ok_or_else(|| format!("expected key=value, got '{segment}'"))?;
			let key = key.trim();
			if key.is_empty() {
				return Err(format!("empty key in '{segment}'"));
			}
			args.insert(key, value.trim());
		}
		Ok(args)
	}
}

/// Typed parameter value carried by `SetParam`/`GetParam`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
	Bool(bool),
	Int(i64),
	Float(f64),
	Text(String),
}

impl ParamValue {
	pub fn as_f64(&self) -> Option<f64> {
		match self {
			ParamValue::Int(v) => Some(*v as f64),
			ParamValue::Float(v) => Some(*v),
			ParamValue::Text(s) => s.parse().ok(),
			ParamValue::Bool(_) => None,
		}
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			ParamValue::Bool(v) => Some(*v),
			ParamValue::Int(v) => Some(*v != 0),
			ParamValue::Text(s) => match s.to_ascii_lowercase().as_str() {
				"1" | "true" | "yes" | "on" => Some(true),
				"0" | "false" | "no" | "off" => Some(false),
				_ => None,
			},
			ParamValue::Float(_) => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			ParamValue::Text(s) => Some(s),
			_ => None,
		}
	}

	/// Parses command-line text: bool, then integer, then float, else text.
	pub fn parse_loose(s: &str) -> Self {
		if let Ok(v) = s.parse::<bool>() {
			return ParamValue::Bool(v);
		}
		if let Ok(v) = s.parse::<i64>() {
			return ParamValue::Int(v);
		}
		if let Ok(v) = s.parse::<f64>() {
			return ParamValue::Float(v);
		}
		ParamValue::Text(s.to_string())
	}
}

impl fmt::Display for ParamValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ParamValue::Bool(v) => write!(f, "{v}"),
			ParamValue::Int(v) => write!(f, "{v}"),
			ParamValue::Float(v) => write!(f, "{v}"),
			ParamValue::Text(v) => f.write_str(v),
		}
	}
}

impl From<bool> for ParamValue {
	fn from(v: bool) -> Self {
		ParamValue::Bool(v)
	}
}

impl From<i64> for ParamValue {
	fn from(v: i64) -> Self {
		ParamValue::Int(v)
	}
}

impl From<f64> for ParamValue {
	fn from(v: f64) -> Self {
		ParamValue::Float(v)
	}
}

impl From<&str> for ParamValue {
	fn from(v: &str) -> Self {
		ParamValue::Text(v.to_string())
	}
}

impl From<String> for ParamValue {
	fn from(v: String) -> Self {
		ParamValue::Text(v)
	}
}

/// Sample encoding used on the wire for a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamFormat {
	/// Interleaved little-endian f32 I/Q pairs, full scale 1.0.
	#[default]
	Cf32,
	/// Interleaved little-endian i16 I/Q pairs, full scale 32767.
	Cs16,
}

impl StreamFormat {
	pub const fn bytes_per_sample(self) -> usize {
		match self {
			StreamFormat::Cf32 => 8,
			StreamFormat::Cs16 => 4,
		}
	}
}

impl fmt::Display for StreamFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StreamFormat::Cf32 => f.write_str("CF32"),
			StreamFormat::Cs16 => f.write_str("CS16"),
		}
	}
}

impl FromStr for StreamFormat {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_uppercase().as_str() {
			"CF32" => Ok(StreamFormat::Cf32),
			"CS16" => Ok(StreamFormat::Cs16),
			other => Err(format!("unsupported stream format '{other}' (expected CF32 or CS16)")),
		}
	}
}

/// Lifecycle state of a worker process.
///
/// `Crashed` is absorbing and is only ever assigned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
	Starting,
	Ready,
	Active,
	Draining,
	Terminated,
	Crashed,
}

impl WorkerState {
	/// True once the worker can no longer serve commands.
	pub fn is_final(self) -> bool {
		matches!(self, WorkerState::Terminated | WorkerState::Crashed)
	}
}

impl fmt::Display for WorkerState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			WorkerState::Starting => "starting",
			WorkerState::Ready => "ready",
			WorkerState::Active => "active",
			WorkerState::Draining => "draining",
			WorkerState::Terminated => "terminated",
			WorkerState::Crashed => "crashed",
		};
		f.write_str(s)
	}
}
