//! APNs connection tests against an in-process HTTP/2 server
//!
//! These tests verify:
//! - Request shape (method, path, priority, topic, JSON body)
//! - apns-id on success, reason and apns-id on rejection
//! - Coalescing of concurrent connect attempts
//! - Reconnect after GOAWAY and after disconnect

mod support;

use apns_h2::apns::{ApnsConnection, ApnsError, NotificationPriority, Payload, PayloadAlert};
use apns_h2::http::h2::{ErrorCode, Settings};
use futures::future::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use support::{init_tracing, DuplexConnector, MockServer, Request};
use tokio::sync::mpsc;

/// Accepts every token except "bad"
async fn serve_apns(mut server: MockServer, seen: Option<mpsc::UnboundedSender<Request>>) {
    server.handshake(Settings::new()).await;
    while let Some(req) = server.next_request().await {
        let stream_id = req.stream_id;
        let bad = req.path() == "/3/device/bad";
        if let Some(seen) = &seen {
            let _ = seen.send(req);
        }
        if bad {
            server
                .respond(stream_id, 400, &[("apns-id", "E")], br#"{"reason":"BadDeviceToken"}"#)
                .await;
        } else {
            server.respond(stream_id, 200, &[("apns-id", "X")], b"").await;
        }
    }
}

/// Closes the connection with GOAWAY on the first request
async fn serve_goaway(mut server: MockServer) {
    server.handshake(Settings::new()).await;
    if server.next_request().await.is_some() {
        server
            .send_goaway(0, ErrorCode::NoError, br#"{"reason":"Shutdown"}"#)
            .await;
    }
    while server.read_frame().await.is_some() {}
}

fn apns_connection() -> (ApnsConnection, Arc<AtomicUsize>) {
    let (connector, attempts) = DuplexConnector::new(|server| serve_apns(server, None).boxed());
    (ApnsConnection::with_connector("api.push.apple.com", connector), attempts)
}

#[tokio::test]
async fn test_success_returns_apns_id() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (connector, _) = DuplexConnector::new(move |server| serve_apns(server, Some(tx.clone())).boxed());
    let conn = ApnsConnection::with_connector("api.push.apple.com", connector);

    let payload = Payload::new().alert(PayloadAlert::new().body("hello")).badge(1);
    let apns_id = conn
        .send_message(payload, "a1b2c3", NotificationPriority::Delayed, Some("com.example.app"))
        .await
        .unwrap();
    assert_eq!(apns_id.as_deref(), Some("X"));
    assert!(conn.connected());

    let req = rx.recv().await.unwrap();
    assert_eq!(req.header(":method"), Some("POST"));
    assert_eq!(req.header(":scheme"), Some("https"));
    assert_eq!(req.header(":authority"), Some("api.push.apple.com"));
    assert_eq!(req.path(), "/3/device/a1b2c3");
    assert_eq!(req.header("apns-priority"), Some("5"));
    assert_eq!(req.header("apns-topic"), Some("com.example.app"));
    assert_eq!(req.header("content-length"), Some(req.body.len().to_string().as_str()));

    let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
    assert_eq!(body, serde_json::json!({"aps": {"alert": {"body": "hello"}, "badge": 1}}));
}

#[tokio::test]
async fn test_bad_device_token_is_rejected() {
    init_tracing();
    let (conn, _) = apns_connection();

    let result = conn
        .send_message("hi", "bad", NotificationPriority::Immediate, None)
        .await;
    match result {
        Err(ApnsError::Rejected { status, reason, apns_id }) => {
            assert_eq!(status, 400);
            assert_eq!(reason.as_deref(), Some("BadDeviceToken"));
            assert_eq!(apns_id.as_deref(), Some("E"));
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // A rejection leaves the connection usable
    assert!(conn.connected());
    conn.send_message("hi", "good", NotificationPriority::Immediate, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_callers_share_one_connect() {
    init_tracing();
    let (conn, attempts) = apns_connection();
    let conn = Arc::new(conn);
    assert!(!conn.connected());

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.send_message("hi", &format!("token{}", i), NotificationPriority::Immediate, None)
                    .await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().as_deref(), Some("X"));
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(conn.connected());
}

#[tokio::test]
async fn test_goaway_reason_and_reconnect() {
    init_tracing();
    let served = Arc::new(AtomicUsize::new(0));
    let (connector, attempts) = DuplexConnector::new(move |server| {
        if served.fetch_add(1, Ordering::SeqCst) == 0 {
            serve_goaway(server).boxed()
        } else {
            serve_apns(server, None).boxed()
        }
    });
    let conn = ApnsConnection::with_connector("api.push.apple.com", connector);

    let result = conn
        .send_message("hi", "token", NotificationPriority::Immediate, None)
        .await;
    match result {
        Err(ApnsError::Disconnected { reason }) => assert_eq!(reason.as_deref(), Some("Shutdown")),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!conn.connected());

    let apns_id = conn
        .send_message("hi", "token", NotificationPriority::Immediate, None)
        .await
        .unwrap();
    assert_eq!(apns_id.as_deref(), Some("X"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_reconnects_lazily() {
    init_tracing();
    let (conn, attempts) = apns_connection();

    conn.ensure_connected().await.unwrap();
    let client = conn.ensure_connected().await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    conn.disconnect();
    assert!(!conn.connected());
    conn.disconnect();
    client.closed().await;

    conn.send_message("hi", "token", NotificationPriority::Immediate, None)
        .await
        .unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
