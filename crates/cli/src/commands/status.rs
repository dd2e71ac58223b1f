use std::sync::Arc;

use rxproxy::{DeviceArgs, ProxyManager};
use tokio::task::JoinSet;

use crate::error::{CliError, Result};
use crate::output;

/// Opens every device concurrently, prints the worker table and closes them.
pub async fn execute(manager: ProxyManager, devices: Vec<DeviceArgs>, json: bool) -> Result<()> {
	if devices.is_empty() {
		return Err(CliError::NoDevices);
	}
	let manager = Arc::new(manager);

	let mut opens = JoinSet::new();
	for args in devices {
		let manager = Arc::clone(&manager);
		opens.spawn(async move { manager.open(&args).await });
	}

	let mut handles = Vec::new();
	let mut failure = None;
	while let Some(joined) = opens.join_next().await {
		match joined.map_err(anyhow::Error::from)? {
			Ok(handle) => handles.push(handle),
			Err(err) => {
				failure.get_or_insert(err);
			}
		}
	}

	let records = manager.status();
	for handle in &handles {
		let _ = manager.close(handle).await;
	}
	manager.shutdown().await;

	if let Some(err) = failure {
		return Err(err.into());
	}
	if json {
		output::print_json(&records)?;
	} else {
		println!("{}", output::records_text(&records));
	}
	Ok(())
}
