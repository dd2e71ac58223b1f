mod enumerate;
mod info;
mod status;
mod stream;
mod worker;

use rxproxy::{DeviceArgs, DeviceHandle, ProxyConfig, ProxyManager};
use tracing::debug;

use crate::cli::{Cli, Commands, TuneArgs};
use crate::error::Result;
use crate::output::Settings;

/// Runs the parsed command line; returns the process exit status.
pub async fn dispatch(cli: Cli) -> Result<i32> {
	let Cli {
		json,
		proxy,
		command,
		..
	} = cli;

	let command = match command {
		Commands::Worker(args) => return Ok(worker::execute(args, &proxy).await),
		other => other,
	};

	let mut config = proxy.apply(ProxyConfig::from_env());
	if let Commands::Stream { overrun, .. } = &command {
		config.overrun_policy = (*overrun).into();
	}
	debug!(target = "rxproxy.cli", proxy_mode = config.proxy_mode, "starting manager");
	let manager = ProxyManager::new(config);

	match command {
		Commands::Enumerate { filter } => enumerate::execute(&manager, &filter, json).await?,
		Commands::Info { devices, tune } => info::execute(&manager, &devices, &tune, json).await?,
		Commands::Stream {
			device,
			tune,
			channel,
			format,
			samples,
			output,
			..
		} => {
			let request = stream::StreamRequest {
				channel,
				format: format.into(),
				samples,
				output,
			};
			stream::execute(&manager, &device, &tune, request, json).await?
		}
		Commands::Status { devices } => status::execute(manager, devices, json).await?,
		Commands::Worker(_) => {}
	}
	Ok(0)
}

/// Opens `args` and applies the requested settings.
async fn open_tuned(manager: &ProxyManager, args: &DeviceArgs, tune: &TuneArgs) -> Result<DeviceHandle> {
	let handle = manager.open(args).await?;
	if let Err(err) = apply(manager, &handle, tune).await {
		let _ = manager.close(&handle).await;
		return Err(err);
	}
	Ok(handle)
}

async fn apply(manager: &ProxyManager, handle: &DeviceHandle, tune: &TuneArgs) -> Result<()> {
	if let Some(rate) = tune.sample_rate {
		manager.set_sample_rate(handle, rate).await?;
	}
	if let Some(hz) = tune.frequency {
		manager.set_frequency(handle, hz).await?;
	}
	if let Some(on) = tune.agc {
		manager.set_agc(handle, on).await?;
	}
	if let Some(db) = tune.gain {
		manager.set_gain(handle, db).await?;
	}
	if let Some(name) = &tune.antenna {
		manager.set_antenna(handle, name).await?;
	}
	if let Some(hz) = tune.bandwidth {
		manager.set_bandwidth(handle, hz).await?;
	}
	Ok(())
}

async fn settings(manager: &ProxyManager, handle: &DeviceHandle) -> Result<Settings> {
	Ok(Settings {
		frequency: manager.frequency(handle).await?,
		sample_rate: manager.sample_rate(handle).await?,
		gain: manager.gain(handle).await?,
		agc: manager.agc(handle).await?,
		antenna: manager.antenna(handle).await?,
		bandwidth: manager.bandwidth(handle).await?,
	})
}
