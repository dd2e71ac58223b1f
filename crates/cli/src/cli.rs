use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rxproxy::{DeviceArgs, OverrunPolicy, ProxyConfig, StreamFormat};

#[derive(Parser, Debug)]
#[command(name = "rxproxy")]
#[command(about = "Use several single-handle receivers at once through worker subprocesses")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Print machine-readable JSON on stdout
	#[arg(long, global = true)]
	pub json: bool,

	#[command(flatten)]
	pub proxy: ProxyArgs,

	#[command(subcommand)]
	pub command: Commands,
}

/// Overrides for the environment-derived [`ProxyConfig`].
#[derive(Args, Debug, Default, Clone)]
pub struct ProxyArgs {
	/// Serve each device from its own worker subprocess (same as RXPROXY_MULTIDEV=1)
	#[arg(long, global = true)]
	pub proxy: bool,

	/// Run workers in this process even if RXPROXY_MULTIDEV is set
	#[arg(long, global = true, conflicts_with = "proxy")]
	pub no_proxy: bool,

	/// Worker executable (defaults to this binary)
	#[arg(long, global = true, value_name = "PATH")]
	pub worker: Option<PathBuf>,

	/// Milliseconds to wait for a worker to report ready
	#[arg(long, global = true, value_name = "MS")]
	pub handshake_timeout: Option<u64>,

	/// Milliseconds between worker heartbeats
	#[arg(long, global = true, value_name = "MS")]
	pub heartbeat_interval: Option<u64>,

	/// Lock file serializing device claims across workers
	#[arg(long, global = true, value_name = "PATH")]
	pub claim_lock: Option<PathBuf>,

	/// Milliseconds a worker waits after another one released the claim lock
	#[arg(long, global = true, value_name = "MS")]
	pub claim_cooldown: Option<u64>,
}

impl ProxyArgs {
	pub fn apply(&self, mut config: ProxyConfig) -> ProxyConfig {
		if self.proxy {
			config.proxy_mode = true;
		}
		if self.no_proxy {
			config.proxy_mode = false;
		}
		if let Some(path) = &self.worker {
			config.worker_executable = Some(path.clone());
		}
		if let Some(ms) = self.handshake_timeout {
			config.handshake_timeout_ms = ms;
		}
		if let Some(ms) = self.heartbeat_interval {
			config.heartbeat_interval_ms = ms;
		}
		if let Some(path) = &self.claim_lock {
			config.claim_lock_path = Some(path.clone());
		}
		if let Some(ms) = self.claim_cooldown {
			config.claim_cooldown_ms = ms;
		}
		config
	}
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// List attached devices
	Enumerate {
		/// Filter, e.g. `driver=sim` or `driver=sim,serial=SIM0001`
		#[arg(default_value = "driver=sim")]
		filter: DeviceArgs,
	},

	/// Open devices and print their hardware info and current settings
	Info {
		/// Device arguments, e.g. `driver=sim,serial=SIM0001` (repeatable)
		#[arg(required = true)]
		devices: Vec<DeviceArgs>,

		#[command(flatten)]
		tune: TuneArgs,
	},

	/// Stream samples from one device
	Stream {
		/// Device arguments, e.g. `driver=sim,serial=SIM0001`
		device: DeviceArgs,

		#[command(flatten)]
		tune: TuneArgs,

		/// Channel to stream
		#[arg(long, default_value_t = 0)]
		channel: u32,

		/// Sample format on the wire and in the output file
		#[arg(long, value_enum, default_value = "cf32")]
		format: FormatArg,

		/// Stop after this many samples
		#[arg(short = 'n', long, default_value_t = 262_144)]
		samples: usize,

		/// Write raw interleaved samples to this file
		#[arg(short, long, value_name = "FILE")]
		output: Option<PathBuf>,

		/// What to do when the reader falls behind
		#[arg(long, value_enum, default_value = "drop-oldest")]
		overrun: OverrunArg,
	},

	/// Open devices concurrently and print the worker table
	Status {
		/// Device arguments (repeatable)
		devices: Vec<DeviceArgs>,
	},

	/// Worker process entry point (spawned by the manager)
	#[command(hide = true)]
	Worker(WorkerArgs),
}

/// Settings applied right after open.
#[derive(Args, Debug, Default, Clone)]
pub struct TuneArgs {
	/// Center frequency in Hz
	#[arg(long)]
	pub frequency: Option<f64>,

	/// Sample rate in samples per second
	#[arg(long)]
	pub sample_rate: Option<f64>,

	/// Gain in dB
	#[arg(long)]
	pub gain: Option<f64>,

	/// Automatic gain control
	#[arg(long)]
	pub agc: Option<bool>,

	/// Antenna port name
	#[arg(long)]
	pub antenna: Option<String>,

	/// Analog bandwidth in Hz
	#[arg(long)]
	pub bandwidth: Option<f64>,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
	#[arg(long)]
	pub driver: String,

	#[arg(long)]
	pub serial: Option<String>,

	/// Open-time hint passed to the driver, `key=value` (repeatable)
	#[arg(long = "hint", value_name = "KEY=VALUE", value_parser = parse_hint)]
	pub hints: Vec<(String, String)>,

	/// Enumerate devices instead of claiming one
	#[arg(long)]
	pub probe: bool,

	#[arg(long = "claim-timeout-ms", value_name = "MS")]
	pub claim_timeout_ms: Option<u64>,

	#[arg(long = "claim-cooldown-ms", value_name = "MS")]
	pub claim_cooldown_ms: Option<u64>,
}

fn parse_hint(s: &str) -> Result<(String, String), String> {
	let (key, value) = s
		.split_once('=')
		.ok_or_else(|| format!("expected key=value, got '{s}'"))?;
	if key.is_empty() {
		return Err(format!("empty key in '{s}'"));
	}
	Ok((key.to_string(), value.to_string()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
	Cf32,
	Cs16,
}

impl From<FormatArg> for StreamFormat {
	fn from(format: FormatArg) -> Self {
		match format {
			FormatArg::Cf32 => StreamFormat::Cf32,
			FormatArg::Cs16 => StreamFormat::Cs16,
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OverrunArg {
	DropOldest,
	BlockProducer,
}

impl From<OverrunArg> for OverrunPolicy {
	fn from(policy: OverrunArg) -> Self {
		match policy {
			OverrunArg::DropOldest => OverrunPolicy::DropOldest,
			OverrunArg::BlockProducer => OverrunPolicy::BlockProducer,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn worker_invocation_parses() {
		let cli = Cli::try_parse_from([
			"rxproxy", "worker", "--driver", "sim", "--serial", "SIM0001", "--hint", "sim_delay_ms=5", "--hint", "x=a=b",
		])
		.unwrap();
		let Commands::Worker(args) = cli.command else {
			panic!("expected worker subcommand");
		};
		assert_eq!(args.serial.as_deref(), Some("SIM0001"));
		assert_eq!(
			args.hints,
			[("sim_delay_ms".into(), "5".into()), ("x".into(), "a=b".into())]
		);
		assert!(!args.probe);
		assert_eq!(args.claim_timeout_ms, None);
	}

	#[test]
	fn claim_lock_flags_reach_worker_and_config() {
		let cli = Cli::try_parse_from([
			"rxproxy",
			"worker",
			"--driver",
			"sim",
			"--claim-lock",
			"/run/rxproxy/sim.lock",
			"--claim-timeout-ms",
			"250",
			"--claim-cooldown-ms",
			"1000",
		])
		.unwrap();
		assert_eq!(cli.proxy.claim_lock.as_deref(), Some(std::path::Path::new("/run/rxproxy/sim.lock")));
		let Commands::Worker(args) = cli.command else {
			panic!("expected worker subcommand");
		};
		assert_eq!(args.claim_timeout_ms, Some(250));
		assert_eq!(args.claim_cooldown_ms, Some(1_000));

		let cli = Cli::try_parse_from(["rxproxy", "--claim-cooldown", "500", "status"]).unwrap();
		assert_eq!(cli.proxy.apply(ProxyConfig::default()).claim_cooldown_ms, 500);
	}

	#[test]
	fn device_arguments_parse_as_key_value_lists() {
		let cli = Cli::try_parse_from(["rxproxy", "--proxy", "info", "driver=sim,serial=SIM0002", "--gain", "20"]).unwrap();
		let Commands::Info { devices, tune } = cli.command else {
			panic!("expected info subcommand");
		};
		assert_eq!(devices[0].serial(), Some("SIM0002"));
		assert_eq!(tune.gain, Some(20.0));
		assert!(cli.proxy.apply(ProxyConfig::default()).proxy_mode);
	}

	#[test]
	fn proxy_flags_conflict() {
		assert!(Cli::try_parse_from(["rxproxy", "--proxy", "--no-proxy", "status"]).is_err());
	}

	#[test]
	fn enumerate_defaults_to_sim() {
		let cli = Cli::try_parse_from(["rxproxy", "enumerate"]).unwrap();
		let Commands::Enumerate { filter } = cli.command else {
			panic!("expected enumerate subcommand");
		};
		assert_eq!(filter.driver(), Some("sim"));
	}
}
