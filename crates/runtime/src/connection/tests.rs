use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rxproxy_protocol::{Opcode, ParamValue, WireError, WireErrorKind, WorkerState};
use tokio::io::duplex;

use super::*;
use crate::transport::{Endpoint, PipeTransport};

/// Connection plus the worker-side endpoint of the same pipes.
fn create_test_connection() -> (Arc<Connection>, Endpoint) {
	let (manager_read, worker_write) = duplex(64 * 1024);
	let (worker_read, manager_write) = duplex(64 * 1024);

	let (transport, message_rx) = PipeTransport::new(manager_write, manager_read);
	let connection = Arc::new(Connection::new(transport.into_transport_parts(message_rx)));
	let worker = Endpoint::connect(worker_write, worker_read);

	(connection, worker)
}

async fn next_request(worker: &mut Endpoint) -> Request {
	match worker.receive(Some(Duration::from_secs(2))).await.unwrap() {
		Message::Request(req) => req,
		other => panic!("expected request, got {other:?}"),
	}
}

#[tokio::test]
async fn test_sequence_numbers_start_at_one_and_increment() {
	let (connection, _worker) = create_test_connection();

	let s1 = connection.last_seq.fetch_add(1, Ordering::SeqCst);
	let s2 = connection.last_seq.fetch_add(1, Ordering::SeqCst);

	assert_eq!(s1, 1);
	assert_eq!(s2, 2);
}

#[tokio::test]
async fn test_reply_is_routed_by_sequence_number() {
	let (connection, mut worker) = create_test_connection();
	let runner = Arc::clone(&connection);
	tokio::spawn(async move { runner.run().await });

	let conn = Arc::clone(&connection);
	let call = tokio::spawn(async move {
		conn.request(
			Command::GetParam {
				device_id: 1,
				key: "gain".into(),
			},
			Duration::from_secs(2),
		)
		.await
	});

	let req = next_request(&mut worker).await;
	assert!(matches!(req.command, Command::GetParam { .. }));
	worker
		.send(Response::ok(
			req.seq,
			Opcode::GetParam,
			Reply::Param {
				value: ParamValue::Float(40.0),
			},
		))
		.unwrap();

	let reply = call.await.unwrap().unwrap();
	assert_eq!(
		reply,
		Reply::Param {
			value: ParamValue::Float(40.0)
		}
	);
}

#[tokio::test]
async fn test_worker_error_becomes_remote_error() {
	let (connection, mut worker) = create_test_connection();
	let runner = Arc::clone(&connection);
	tokio::spawn(async move { runner.run().await });

	let conn = Arc::clone(&connection);
	let call = tokio::spawn(async move { conn.request(Command::GetInfo { device_id: 9 }, Duration::from_secs(2)).await });

	let req = next_request(&mut worker).await;
	worker
		.send(Response::err(
			req.seq,
			Opcode::GetInfo,
			WireError::new(WireErrorKind::InvalidHandle, "no device 9"),
		))
		.unwrap();

	let err = call.await.unwrap().unwrap_err();
	assert_eq!(err.remote().map(|e| e.kind), Some(WireErrorKind::InvalidHandle));
}

#[tokio::test]
async fn test_timeout_removes_callback_and_late_reply_is_ignored() {
	let (connection, mut worker) = create_test_connection();
	let runner = Arc::clone(&connection);
	tokio::spawn(async move { runner.run().await });

	let err = connection
		.request(Command::Heartbeat, Duration::from_millis(30))
		.await
		.unwrap_err();
	assert!(err.is_timeout(), "got {err:?}");
	assert!(connection.callbacks.is_empty());

	let stale = next_request(&mut worker).await;
	worker
		.send(Response::ok(
			stale.seq,
			Opcode::Heartbeat,
			Reply::Heartbeat {
				state: WorkerState::Ready,
				open_handles: 0,
			},
		))
		.unwrap();

	// the connection keeps working after the stale reply
	let conn = Arc::clone(&connection);
	let call = tokio::spawn(async move { conn.request(Command::Heartbeat, Duration::from_secs(2)).await });
	let req = next_request(&mut worker).await;
	assert!(req.seq > stale.seq);
	worker.send(Response::ok(req.seq, Opcode::Heartbeat, Reply::Ack)).unwrap();
	assert_eq!(call.await.unwrap().unwrap(), Reply::Ack);
}

#[tokio::test]
async fn test_worker_close_releases_pending_requests() {
	let (connection, mut worker) = create_test_connection();
	let runner = Arc::clone(&connection);
	tokio::spawn(async move { runner.run().await });

	let conn = Arc::clone(&connection);
	let call = tokio::spawn(async move {
		conn.request(
			Command::ReadStream {
				session_id: 1,
				max_samples: 1024,
			},
			Duration::from_secs(30),
		)
		.await
	});

	let _ = next_request(&mut worker).await;
	worker.close().await.unwrap();

	let err = tokio::time::timeout(Duration::from_secs(2), call)
		.await
		.expect("pending request was not released")
		.unwrap()
		.unwrap_err();
	assert!(err.is_closed(), "got {err:?}");

	connection.closed().await;
	let err = connection.request(Command::Heartbeat, Duration::from_secs(1)).await.unwrap_err();
	assert!(err.is_closed());
}

#[tokio::test]
async fn test_unordered_request_overtakes_a_blocked_command() {
	let (connection, mut worker) = create_test_connection();
	let runner = Arc::clone(&connection);
	tokio::spawn(async move { runner.run().await });

	let conn = Arc::clone(&connection);
	let slow = tokio::spawn(async move { conn.request(Command::GetInfo { device_id: 1 }, Duration::from_secs(5)).await });
	let slow_req = next_request(&mut worker).await;

	let conn = Arc::clone(&connection);
	let beat = tokio::spawn(async move { conn.request_unordered(Command::Heartbeat, Duration::from_secs(2)).await });
	let beat_req = next_request(&mut worker).await;
	assert_eq!(beat_req.command, Command::Heartbeat);

	worker
		.send(Response::ok(
			beat_req.seq,
			Opcode::Heartbeat,
			Reply::Heartbeat {
				state: WorkerState::Active,
				open_handles: 1,
			},
		))
		.unwrap();
	assert!(beat.await.unwrap().is_ok());
	assert!(!slow.is_finished());

	worker.send(Response::ok(slow_req.seq, Opcode::GetInfo, Reply::Ack)).unwrap();
	assert_eq!(slow.await.unwrap().unwrap(), Reply::Ack);
}

#[tokio::test]
async fn test_events_are_forwarded() {
	let (connection, worker) = create_test_connection();
	let mut events = connection.take_events().unwrap();
	assert!(connection.take_events().is_none());
	let runner = Arc::clone(&connection);
	tokio::spawn(async move { runner.run().await });

	worker
		.send(Event::Ready {
			driver: "sim".into(),
			serial: "SIM0001".into(),
			pid: 42,
		})
		.unwrap();

	match tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
		Some(Event::Ready { pid, .. }) => assert_eq!(pid, 42),
		other => panic!("unexpected event: {other:?}"),
	}
}
