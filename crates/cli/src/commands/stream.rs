use std::path::PathBuf;
use std::time::{Duration, Instant};

use rxproxy::{DeviceArgs, ProxyManager, StreamFormat, samples};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{info, warn};

use super::open_tuned;
use crate::cli::TuneArgs;
use crate::error::Result;
use crate::output::{self, StreamSummary};

const READ_BLOCK: usize = 16_384;

pub struct StreamRequest {
	pub channel: u32,
	pub format: StreamFormat,
	pub samples: usize,
	pub output: Option<PathBuf>,
}

pub async fn execute(
	manager: &ProxyManager,
	device: &DeviceArgs,
	tune: &TuneArgs,
	request: StreamRequest,
	json: bool,
) -> Result<()> {
	let result = capture(manager, device, tune, &request).await;
	manager.shutdown().await;
	let summary = result?;

	if json {
		output::print_json(&summary)?;
	} else {
		println!(
			"{}: {} samples on channel {} ({}), {} dropped, {} ms",
			summary.serial, summary.samples, summary.channel, summary.format, summary.dropped, summary.elapsed_ms
		);
	}
	Ok(())
}

async fn capture(
	manager: &ProxyManager,
	device: &DeviceArgs,
	tune: &TuneArgs,
	request: &StreamRequest,
) -> Result<StreamSummary> {
	let handle = open_tuned(manager, device, tune).await?;
	let stream = manager.start_stream(&handle, request.channel, request.format).await?;
	let mut sink = match &request.output {
		Some(path) => Some(BufWriter::new(File::create(path).await?)),
		None => None,
	};

	let started = Instant::now();
	let mut total = 0usize;
	let mut dropped = 0u64;
	let mut block = Vec::with_capacity(READ_BLOCK);
	let interrupted = tokio::signal::ctrl_c();
	tokio::pin!(interrupted);

	while total < request.samples {
		block.clear();
		let want = (request.samples - total).min(READ_BLOCK);
		let read = tokio::select! {
			_ = &mut interrupted => {
				info!(target = "rxproxy.cli", total, "interrupted");
				break;
			}
			read = manager.read_stream(&stream, &mut block, want, Some(Duration::from_secs(1))) => read?,
		};
		if read.dropped > 0 {
			warn!(target = "rxproxy.cli", dropped = read.dropped, "samples dropped");
		}
		dropped += read.dropped;
		total += read.count;
		if let Some(sink) = sink.as_mut() {
			sink.write_all(&samples::encode(&block, request.format)).await?;
		}
	}

	if let Some(mut sink) = sink {
		sink.flush().await?;
	}
	manager.stop_stream(&stream).await?;
	manager.close(&handle).await?;

	Ok(StreamSummary {
		serial: handle.serial().to_string(),
		channel: request.channel,
		format: request.format.to_string(),
		samples: total,
		dropped,
		elapsed_ms: started.elapsed().as_millis(),
	})
}
