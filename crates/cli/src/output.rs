//! Stdout rendering for command results.

use std::collections::BTreeMap;

use rxproxy::{DeviceDescriptor, WorkerRecord};
use serde::Serialize;

use crate::error::Result;

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
	println!("{}", serde_json::to_string_pretty(value)?);
	Ok(())
}

/// Current settings of an open device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
	pub frequency: f64,
	pub sample_rate: f64,
	pub gain: f64,
	pub agc: bool,
	pub antenna: String,
	pub bandwidth: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReport {
	pub serial: String,
	pub info: BTreeMap<String, String>,
	pub settings: Settings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSummary {
	pub serial: String,
	pub channel: u32,
	pub format: String,
	pub samples: usize,
	pub dropped: u64,
	pub elapsed_ms: u128,
}

pub fn devices_text(devices: &[DeviceDescriptor]) -> String {
	let width = devices.iter().map(|d| d.serial.len()).max().unwrap_or(0);
	devices
		.iter()
		.map(|d| format!("{:<width$}  {}  ({})", d.serial, d.label, d.driver))
		.collect::<Vec<_>>()
		.join("\n")
}

pub fn report_text(report: &DeviceReport) -> String {
	let s = &report.settings;
	let mut lines = vec![report.serial.clone()];
	lines.extend(report.info.iter().map(|(k, v)| format!("  {k}: {v}")));
	lines.push(format!("  frequency: {} Hz", s.frequency));
	lines.push(format!("  sample_rate: {} S/s", s.sample_rate));
	lines.push(format!("  gain: {} dB (agc {})", s.gain, if s.agc { "on" } else { "off" }));
	lines.push(format!("  antenna: {}", s.antenna));
	lines.push(format!("  bandwidth: {} Hz", s.bandwidth));
	lines.join("\n")
}

pub fn records_text(records: &[WorkerRecord]) -> String {
	let mut lines = vec![format!("{:<12} {:<8} {:<12} {:>4} {:>7} {}", "SERIAL", "DRIVER", "STATE", "GEN", "HANDLES", "ENDPOINT")];
	lines.extend(records.iter().map(|r| {
		format!(
			"{:<12} {:<8} {:<12} {:>4} {:>7} {}",
			r.serial,
			r.driver,
			r.state.to_string(),
			r.generation,
			r.open_handles,
			r.endpoint
		)
	}));
	lines.join("\n")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn device_list_aligns_serials() {
		let devices = [
			DeviceDescriptor::new("sim", "A1", "Sim RX A1"),
			DeviceDescriptor::new("sim", "SIM0002", "Sim RX SIM0002"),
		];
		assert_eq!(
			devices_text(&devices),
			"A1       Sim RX A1  (sim)\nSIM0002  Sim RX SIM0002  (sim)"
		);
		assert_eq!(devices_text(&[]), "");
	}
}
