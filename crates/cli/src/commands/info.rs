use rxproxy::{DeviceArgs, ProxyManager};

use super::{open_tuned, settings};
use crate::cli::TuneArgs;
use crate::error::Result;
use crate::output::{self, DeviceReport};

pub async fn execute(manager: &ProxyManager, devices: &[DeviceArgs], tune: &TuneArgs, json: bool) -> Result<()> {
	let result = reports(manager, devices, tune).await;
	manager.shutdown().await;
	let reports = result?;

	if json {
		output::print_json(&reports)?;
	} else {
		let text: Vec<String> = reports.iter().map(output::report_text).collect();
		println!("{}", text.join("\n\n"));
	}
	Ok(())
}

async fn reports(manager: &ProxyManager, devices: &[DeviceArgs], tune: &TuneArgs) -> Result<Vec<DeviceReport>> {
	let mut reports = Vec::with_capacity(devices.len());
	for args in devices {
		let handle = open_tuned(manager, args, tune).await?;
		reports.push(DeviceReport {
			serial: handle.serial().to_string(),
			info: manager.info(&handle).await?,
			settings: settings(manager, &handle).await?,
		});
	}
	Ok(reports)
}
