use rxproxy::{DeviceArgs, ProxyManager};

use crate::error::Result;
use crate::output;

pub async fn execute(manager: &ProxyManager, filter: &DeviceArgs, json: bool) -> Result<()> {
	let devices = manager.enumerate(filter).await;
	manager.shutdown().await;
	if json {
		output::print_json(&devices)?;
	} else if devices.is_empty() {
		match manager.last_enumerate_failure() {
			Some(reason) => eprintln!("no devices found ({reason})"),
			None => eprintln!("no devices found"),
		}
	} else {
		println!("{}", output::devices_text(&devices));
	}
	Ok(())
}
