//! Simulated receiver driver.
//!
//! Behaves like a vendor driver that allows one claimed device per process:
//! a second `open` in the same claim scope fails with `Busy` regardless of
//! serial. Samples are a complex tone paced by wall-clock time at the
//! configured sample rate; a reader that falls behind loses samples at the
//! "hardware" buffer and sees them counted as dropped.
//!
//! Environment (read by [`SimDriver::from_env`]):
//! - `RXPROXY_SIM_SERIALS`: comma separated serials, default `SIM0001,SIM0002`
//! - `RXPROXY_SIM_DISCOVERY=down`: enumeration reports discovery unavailable
//!
//! Open-time hints:
//! - `sim_delay_ms=<n>`: every settings call sleeps this long
//! - `sim_fault=open|set|start|read`: that call reports a native fault
//! - `sim_channels=<1|2>`: number of receive channels

use std::collections::{BTreeMap, HashMap};
use std::f32::consts::TAU;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use num_complex::Complex32;
use parking_lot::Mutex;
use rxproxy_protocol::{DeviceArgs, DeviceDescriptor, ParamValue};
use tracing::debug;

use super::{NativeDevice, NativeDriver, NativeError, NativeRead, keys};

pub const DRIVER_NAME: &str = "sim";
pub const SERIALS_ENV: &str = "RXPROXY_SIM_SERIALS";
pub const DISCOVERY_ENV: &str = "RXPROXY_SIM_DISCOVERY";
const DEFAULT_SERIALS: &str = "SIM0001,SIM0002";

pub const SAMPLE_RATES: [f64; 16] = [
	62_500.0, 96_000.0, 125_000.0, 192_000.0, 250_000.0, 500_000.0, 1e6, 2e6, 3e6, 4e6, 5e6, 6e6, 7e6, 8e6, 9e6, 10e6,
];
pub const BANDWIDTHS: [f64; 8] = [200_000.0, 300_000.0, 600_000.0, 1_536_000.0, 5e6, 6e6, 7e6, 8e6];
pub const ANTENNAS: [&str; 3] = ["Antenna A", "Antenna B", "Hi-Z"];
pub const FREQUENCY_RANGE: (f64, f64) = (1e3, 2e9);
pub const GAIN_RANGE: (f64, f64) = (0.0, 59.0);

/// Samples the simulated hardware buffers before it starts dropping.
const HARDWARE_BUFFER: u64 = 1 << 20;
const TONE_OFFSET_HZ: f32 = 10_000.0;

/// Serial currently claimed in one claim scope.
type Claim = Arc<Mutex<Option<String>>>;

pub struct SimDriver {
	serials: Vec<String>,
	discovery_up: bool,
	claim: Claim,
}

impl SimDriver {
	/// A driver with its own claim scope.
	pub fn new<I, S>(serials: I, discovery_up: bool) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			serials: serials.into_iter().map(Into::into).collect(),
			discovery_up,
			claim: Arc::new(Mutex::new(None)),
		}
	}

	pub fn from_env() -> Self {
		let serials = std::env::var(SERIALS_ENV).unwrap_or_else(|_| DEFAULT_SERIALS.to_string());
		let discovery_up = !std::env::var(DISCOVERY_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("down"));
		Self::new(parse_serials(&serials), discovery_up)
	}

	/// The process-wide instance: one claim scope for the whole process, as
	/// with real hardware.
	pub fn shared() -> Arc<SimDriver> {
		static SHARED: OnceLock<Arc<SimDriver>> = OnceLock::new();
		Arc::clone(SHARED.get_or_init(|| Arc::new(SimDriver::from_env())))
	}

	pub fn claimed(&self) -> Option<String> {
		self.claim.lock().clone()
	}

	fn descriptor(serial: &str) -> DeviceDescriptor {
		DeviceDescriptor::new(DRIVER_NAME, serial, format!("Sim RX {serial}")).with_attribute("hardware", "SimRX")
	}
}

fn parse_serials(list: &str) -> Vec<String> {
	list.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(String::from)
		.collect()
}

impl NativeDriver for SimDriver {
	fn name(&self) -> &str {
		DRIVER_NAME
	}

	fn enumerate(&self, filter: &DeviceArgs) -> Result<Vec<DeviceDescriptor>, NativeError> {
		if !self.discovery_up {
			return Err(NativeError::DiscoveryUnavailable("sim discovery service is down".into()));
		}
		let claimed = self.claimed();
		Ok(self
			.serials
			.iter()
			.filter(|serial| claimed.as_deref() != Some(serial.as_str()))
			.map(|serial| Self::descriptor(serial))
			.filter(|desc| filter.matches(desc))
			.collect())
	}

	fn open(&self, serial: &str, hints: &DeviceArgs) -> Result<Box<dyn NativeDevice>, NativeError> {
		let options = SimOptions::from_hints(hints)?;
		if options.fault == Some(FaultPoint::Open) {
			return Err(NativeError::Fault(format!("injected fault opening {serial}")));
		}
		if !self.serials.iter().any(|s| s == serial) {
			return Err(NativeError::NotFound(format!("no sim device with serial '{serial}'")));
		}

		let mut claim = self.claim.lock();
		if let Some(held) = claim.as_deref() {
			return Err(NativeError::Busy(format!("this process already holds '{held}'")));
		}
		*claim = Some(serial.to_string());
		drop(claim);

		debug!(target = "rxproxy.worker", serial, "sim device claimed");
		Ok(Box::new(SimDevice {
			serial: serial.to_string(),
			claim: Arc::clone(&self.claim),
			options,
			settings: Settings::default(),
			streams: HashMap::new(),
		}))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultPoint {
	Open,
	Set,
	Start,
	Read,
}

#[derive(Debug, Clone)]
struct SimOptions {
	delay: Duration,
	fault: Option<FaultPoint>,
	channels: u32,
}

impl SimOptions {
	fn from_hints(hints: &DeviceArgs) -> Result<Self, NativeError> {
		let delay = match hints.get("sim_delay_ms") {
			Some(v) => Duration::from_millis(
				v.parse()
					.map_err(|_| NativeError::call(-3, format!("sim_delay_ms must be an integer, got '{v}'")))?,
			),
			None => Duration::ZERO,
		};
		let fault = match hints.get("sim_fault") {
			None => None,
			Some("open") => Some(FaultPoint::Open),
			Some("set") => Some(FaultPoint::Set),
			Some("start") => Some(FaultPoint::Start),
			Some("read") => Some(FaultPoint::Read),
			Some(other) => return Err(NativeError::call(-3, format!("unknown sim_fault '{other}'"))),
		};
		let channels = match hints.get("sim_channels") {
			None => 1,
			Some("1") => 1,
			Some("2") => 2,
			Some(other) => return Err(NativeError::call(-3, format!("sim_channels must be 1 or 2, got '{other}'"))),
		};
		Ok(Self { delay, fault, channels })
	}
}

#[derive(Debug, Clone)]
struct Settings {
	frequency: f64,
	sample_rate: f64,
	gain: f64,
	agc: bool,
	antenna: String,
	bandwidth: f64,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			frequency: 100e6,
			sample_rate: 250_000.0,
			gain: 40.0,
			agc: false,
			antenna: ANTENNAS[0].to_string(),
			bandwidth: 200_000.0,
		}
	}
}

struct SimStream {
	started: Instant,
	produced: u64,
	phase: f32,
	dropped: u64,
}

impl SimStream {
	fn new() -> Self {
		Self {
			started: Instant::now(),
			produced: 0,
			phase: 0.0,
			dropped: 0,
		}
	}

	/// Samples the hardware has produced that nobody has read yet.
	fn due(&mut self, rate: f64) -> u64 {
		let total = (self.started.elapsed().as_secs_f64() * rate) as u64;
		let mut due = total.saturating_sub(self.produced);
		if due > HARDWARE_BUFFER {
			let lost = due - HARDWARE_BUFFER;
			self.produced += lost;
			self.dropped += lost;
			due = HARDWARE_BUFFER;
		}
		due
	}
}

struct SimDevice {
	serial: String,
	claim: Claim,
	options: SimOptions,
	settings: Settings,
	streams: HashMap<u32, SimStream>,
}

impl SimDevice {
	fn settle(&self) {
		if !self.options.delay.is_zero() {
			std::thread::sleep(self.options.delay);
		}
	}

	fn check_channel(&self, channel: u32) -> Result<(), NativeError> {
		if channel >= self.options.channels {
			return Err(NativeError::call(
				-4,
				format!("channel {channel} out of range (device has {})", self.options.channels),
			));
		}
		Ok(())
	}
}

fn number(key: &str, value: &ParamValue) -> Result<f64, NativeError> {
	value
		.as_f64()
		.ok_or_else(|| NativeError::call(-3, format!("{key} must be numeric, got '{value}'")))
}

fn nearest(options: &[f64], value: f64) -> f64 {
	options
		.iter()
		.copied()
		.min_by(|a, b| (a - value).abs().total_cmp(&(b - value).abs()))
		.unwrap_or(value)
}

impl NativeDevice for SimDevice {
	fn info(&self) -> BTreeMap<String, String> {
		let mut info = BTreeMap::new();
		info.insert("driver".into(), DRIVER_NAME.into());
		info.insert("serial".into(), self.serial.clone());
		info.insert("label".into(), format!("Sim RX {}", self.serial));
		info.insert("hardware".into(), "SimRX".into());
		info.insert("firmware".into(), "1.0".into());
		info.insert("channels".into(), self.options.channels.to_string());
		info
	}

	fn channels(&self) -> u32 {
		self.options.channels
	}

	fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<ParamValue, NativeError> {
		self.settle();
		if self.options.fault == Some(FaultPoint::Set) {
			return Err(NativeError::Fault(format!("injected fault setting {key}")));
		}
		let s = &mut self.settings;
		match key {
			keys::FREQUENCY => {
				s.frequency = number(key, value)?.clamp(FREQUENCY_RANGE.0, FREQUENCY_RANGE.1).round();
			}
			keys::SAMPLE_RATE => {
				let rate = nearest(&SAMPLE_RATES, number(key, value)?);
				if rate != s.sample_rate {
					// unread samples at the old rate are lost; pacing restarts
					for stream in self.streams.values_mut() {
						let lost = stream.due(s.sample_rate);
						*stream = SimStream {
							dropped: stream.dropped + lost,
							..SimStream::new()
						};
					}
					s.sample_rate = rate;
				}
			}
			keys::GAIN => {
				s.gain = number(key, value)?.clamp(GAIN_RANGE.0, GAIN_RANGE.1).round();
			}
			keys::AGC => {
				s.agc = value
					.as_bool()
					.ok_or_else(|| NativeError::call(-3, format!("agc must be a boolean, got '{value}'")))?;
			}
			keys::ANTENNA => {
				let name = value.to_string();
				if !ANTENNAS.contains(&name.as_str()) {
					return Err(NativeError::call(-2, format!("invalid antenna '{name}'")));
				}
				s.antenna = name;
			}
			keys::BANDWIDTH => {
				s.bandwidth = nearest(&BANDWIDTHS, number(key, value)?);
			}
			other => return Err(NativeError::call(-1, format!("unknown setting '{other}'"))),
		}
		self.get_param(key)
	}

	fn get_param(&self, key: &str) -> Result<ParamValue, NativeError> {
		let s = &self.settings;
		Ok(match key {
			keys::FREQUENCY => ParamValue::Float(s.frequency),
			keys::SAMPLE_RATE => ParamValue::Float(s.sample_rate),
			keys::GAIN => ParamValue::Float(s.gain),
			keys::AGC => ParamValue::Bool(s.agc),
			keys::ANTENNA => ParamValue::Text(s.antenna.clone()),
			keys::BANDWIDTH => ParamValue::Float(s.bandwidth),
			other => return Err(NativeError::call(-1, format!("unknown setting '{other}'"))),
		})
	}

	fn start_stream(&mut self, channel: u32) -> Result<(), NativeError> {
		self.check_channel(channel)?;
		if self.options.fault == Some(FaultPoint::Start) {
			return Err(NativeError::Fault(format!("injected fault starting channel {channel}")));
		}
		if self.streams.contains_key(&channel) {
			return Err(NativeError::call(-5, format!("channel {channel} already streaming")));
		}
		self.streams.insert(channel, SimStream::new());
		Ok(())
	}

	fn read_stream(
		&mut self,
		channel: u32,
		out: &mut Vec<Complex32>,
		max: usize,
		timeout: Duration,
	) -> Result<NativeRead, NativeError> {
		if self.options.fault == Some(FaultPoint::Read) {
			return Err(NativeError::Fault(format!("injected fault reading channel {channel}")));
		}
		let rate = self.settings.sample_rate;
		let stream = self
			.streams
			.get_mut(&channel)
			.ok_or_else(|| NativeError::call(-4, format!("channel {channel} is not streaming")))?;

		let deadline = Instant::now() + timeout;
		loop {
			let due = stream.due(rate);
			if due > 0 && max > 0 {
				let n = due.min(max as u64) as usize;
				let step = TAU * TONE_OFFSET_HZ / rate as f32;
				out.reserve(n);
				for _ in 0..n {
					out.push(Complex32::from_polar(0.5, stream.phase));
					stream.phase = (stream.phase + step) % TAU;
				}
				stream.produced += n as u64;
				return Ok(NativeRead {
					dropped: std::mem::take(&mut stream.dropped),
				});
			}
			let now = Instant::now();
			if now >= deadline || max == 0 {
				return Ok(NativeRead {
					dropped: std::mem::take(&mut stream.dropped),
				});
			}
			let next_sample = Duration::from_secs_f64(1.0 / rate).max(Duration::from_millis(1));
			std::thread::sleep(next_sample.min(deadline - now));
		}
	}

	fn stop_stream(&mut self, channel: u32) -> Result<(), NativeError> {
		self.check_channel(channel)?;
		self.streams.remove(&channel);
		Ok(())
	}
}

impl Drop for SimDevice {
	fn drop(&mut self) {
		let mut claim = self.claim.lock();
		if claim.as_deref() == Some(self.serial.as_str()) {
			*claim = None;
		}
		debug!(target = "rxproxy.worker", serial = %self.serial, "sim device released");
	}
}
