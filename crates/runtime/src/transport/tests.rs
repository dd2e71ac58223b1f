use std::time::Duration;

use bytes::Bytes;
use rxproxy_protocol::{Command, Event, Frame, FrameKind, Opcode, Reply, Request, Response, StreamChunk, StreamFormat};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::*;

fn heartbeat_request(seq: u64) -> Message {
	Message::Request(Request {
		seq,
		command: Command::Heartbeat,
	})
}

#[tokio::test]
async fn test_send_writes_length_prefixed_frame() {
	let (mut peer_read, transport_write) = tokio::io::duplex(1024);
	let (transport_read, _peer_write) = tokio::io::duplex(1024);

	let (transport, _rx) = PipeTransport::new(transport_write, transport_read);
	let (mut sender, _receiver) = transport.into_parts();

	sender.send(heartbeat_request(7)).await.unwrap();

	let mut len_buf = [0u8; 4];
	peer_read.read_exact(&mut len_buf).await.unwrap();
	let length = u32::from_le_bytes(len_buf) as usize;
	let mut payload = vec![0u8; length];
	peer_read.read_exact(&mut payload).await.unwrap();

	assert_eq!(payload[0], Opcode::Heartbeat as u8);
	assert_eq!(payload[1], FrameKind::Request as u8);
	assert_eq!(u64::from_le_bytes(payload[2..10].try_into().unwrap()), 7);
}

#[tokio::test]
async fn test_frames_split_across_tiny_writes() {
	let (_peer_read, transport_write) = tokio::io::duplex(4096);
	let (transport_read, mut peer_write) = tokio::io::duplex(4096);

	let (mut transport, mut rx) = PipeTransport::new(transport_write, transport_read);
	let read_task = tokio::spawn(async move { transport.run().await });

	let mut wire = Vec::new();
	for seq in 1..=3 {
		let frame = heartbeat_request(seq).into_frame().unwrap();
		wire.extend_from_slice(&frame.to_bytes().unwrap());
	}
	for chunk in wire.chunks(3) {
		peer_write.write_all(chunk).await.unwrap();
		peer_write.flush().await.unwrap();
		tokio::task::yield_now().await;
	}

	for seq in 1..=3 {
		let received = rx.recv().await.unwrap();
		assert_eq!(received.seq(), seq);
	}

	drop(peer_write);
	assert!(read_task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_bulk_samples_arrive_intact() {
	let (_peer_read, transport_write) = tokio::io::duplex(1024 * 1024);
	let (transport_read, mut peer_write) = tokio::io::duplex(1024 * 1024);

	let (mut transport, mut rx) = PipeTransport::new(transport_write, transport_read);
	let read_task = tokio::spawn(async move { transport.run().await });

	let samples: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
	let chunk = StreamChunk {
		session_id: 1,
		sequence: 0,
		offset: 0,
		format: StreamFormat::Cf32,
		dropped: 0,
		end: false,
		data: Bytes::from(samples.clone()),
	};
	let message = Message::Response(Response::ok(5, Opcode::ReadStream, Reply::StreamChunk(chunk)));
	peer_write
		.write_all(&message.into_frame().unwrap().to_bytes().unwrap())
		.await
		.unwrap();

	match rx.recv().await.unwrap() {
		Message::Response(Response {
			result: Ok(Reply::StreamChunk(received)),
			..
		}) => assert_eq!(received.data.as_ref(), samples.as_slice()),
		other => panic!("unexpected message: {other:?}"),
	}

	drop(peer_write);
	drop(rx);
	let _ = read_task.await;
}

#[tokio::test]
async fn test_clean_eof_is_not_an_error() {
	let (_peer_read, transport_write) = tokio::io::duplex(1024);
	let (transport_read, peer_write) = tokio::io::duplex(1024);

	let (mut transport, _rx) = PipeTransport::new(transport_write, transport_read);
	drop(peer_write);

	assert!(transport.run().await.is_ok());
}

#[tokio::test]
async fn test_eof_inside_frame_is_protocol_error() {
	let (_peer_read, transport_write) = tokio::io::duplex(1024);
	let (transport_read, mut peer_write) = tokio::io::duplex(1024);

	let (mut transport, _rx) = PipeTransport::new(transport_write, transport_read);

	let bytes = heartbeat_request(1).into_frame().unwrap().to_bytes().unwrap();
	peer_write.write_all(&bytes[..bytes.len() - 2]).await.unwrap();
	drop(peer_write);

	let err = transport.run().await.unwrap_err();
	assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
}

#[tokio::test]
async fn test_oversized_frame_is_rejected() {
	let (_peer_read, transport_write) = tokio::io::duplex(1024);
	let (transport_read, mut peer_write) = tokio::io::duplex(1024);

	let (mut transport, _rx) = PipeTransport::new(transport_write, transport_read);
	peer_write.write_all(&u32::MAX.to_le_bytes()).await.unwrap();

	let err = transport.run().await.unwrap_err();
	assert!(err.to_string().contains("exceeds"), "got {err}");
}

#[tokio::test]
async fn test_endpoint_receive_distinguishes_timeout_from_close() {
	let (a_to_b_read, a_to_b_write) = tokio::io::duplex(4096);
	let (b_to_a_read, b_to_a_write) = tokio::io::duplex(4096);

	let mut a = Endpoint::connect(a_to_b_write, b_to_a_read);
	let b = Endpoint::connect(b_to_a_write, a_to_b_read);

	let err = a.receive(Some(Duration::from_millis(20))).await.unwrap_err();
	assert!(err.is_timeout(), "got {err:?}");

	b.send(Event::Ready {
		driver: "sim".into(),
		serial: "SIM0001".into(),
		pid: 1,
	})
	.unwrap();
	let message = a.receive(Some(Duration::from_secs(1))).await.unwrap();
	assert!(matches!(message, Message::Event(Event::Ready { .. })));

	b.close().await.unwrap();
	let err = a.receive(Some(Duration::from_secs(1))).await.unwrap_err();
	assert!(err.is_closed(), "got {err:?}");
}

#[tokio::test]
async fn test_endpoint_send_after_peer_gone_reports_closed() {
	let (peer_read, write) = tokio::io::duplex(64);
	let (read, _peer_write) = tokio::io::duplex(64);
	drop(peer_read);

	let endpoint = Endpoint::connect(write, read);
	endpoint.send(heartbeat_request(1)).unwrap();
	let err = endpoint.close().await.unwrap_err();
	assert!(err.is_closed(), "got {err:?}");
}

#[test]
fn test_raw_frame_header_matches_encoder() {
	let frame = Frame {
		opcode: Opcode::Ready,
		kind: FrameKind::Event,
		seq: 0,
		body: Bytes::from_static(b"{}"),
		bulk: Bytes::new(),
	};
	let bytes = frame.to_bytes().unwrap();
	assert_eq!(u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize, bytes.len() - 4);
}
