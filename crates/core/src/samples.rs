//! Sample encoding for stream chunks.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_complex::Complex32;
use rxproxy_protocol::StreamFormat;

/// Full-scale value for CS16.
const CS16_SCALE: f32 = 32767.0;

pub fn encode(samples: &[Complex32], format: StreamFormat) -> Bytes {
	let mut buf = BytesMut::with_capacity(samples.len() * format.bytes_per_sample());
	match format {
		StreamFormat::Cf32 => {
			for s in samples {
				buf.put_f32_le(s.re);
				buf.put_f32_le(s.im);
			}
		}
		StreamFormat::Cs16 => {
			for s in samples {
				buf.put_i16_le(to_i16(s.re));
				buf.put_i16_le(to_i16(s.im));
			}
		}
	}
	buf.freeze()
}

/// Appends the samples in `data` to `out`. Trailing partial samples are ignored.
pub fn decode_into(mut data: Bytes, format: StreamFormat, out: &mut Vec<Complex32>) {
	let width = format.bytes_per_sample();
	out.reserve(data.len() / width);
	while data.remaining() >= width {
		let sample = match format {
			StreamFormat::Cf32 => Complex32::new(data.get_f32_le(), data.get_f32_le()),
			StreamFormat::Cs16 => Complex32::new(
				f32::from(data.get_i16_le()) / CS16_SCALE,
				f32::from(data.get_i16_le()) / CS16_SCALE,
			),
		};
		out.push(sample);
	}
}

fn to_i16(v: f32) -> i16 {
	(v * CS16_SCALE).round().clamp(-CS16_SCALE, CS16_SCALE) as i16
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cs16_scales_and_clamps() {
		let bytes = encode(&[Complex32::new(0.5, -2.0)], StreamFormat::Cs16);
		assert_eq!(bytes.len(), 4);
		assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 16384);
		assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -32767);

		let mut out = Vec::new();
		decode_into(bytes, StreamFormat::Cs16, &mut out);
		assert!((out[0].re - 0.5).abs() < 1e-4);
		assert_eq!(out[0].im, -1.0);
	}

	#[test]
	fn cf32_is_exact_and_ignores_trailing_bytes() {
		let input = [Complex32::new(0.25, -0.125), Complex32::new(1.0, 0.0)];
		let mut bytes = BytesMut::from(&encode(&input, StreamFormat::Cf32)[..]);
		bytes.put_u8(0xff);
		let mut out = Vec::new();
		decode_into(bytes.freeze(), StreamFormat::Cf32, &mut out);
		assert_eq!(out, input);
	}
}
