//! End-to-end tests driving the real dummy discovery through the client.
//!
//! Each test spawns its own `portscout-dummy` process and talks to it
//! over real pipes, covering the full handshake, both session modes, and
//! the crash paths the client has to survive.

use std::time::Duration;

use portscout_client::{Client, ClientError, Event};
use tokio::time::timeout;

fn dummy_client(id: &str, extra_args: &[&str]) -> Client {
    let mut args = vec![env!("CARGO_BIN_EXE_portscout-dummy").to_string()];
    args.extend(extra_args.iter().map(ToString::to_string));
    let mut client = Client::new(id, args);
    client.set_user_agent("portscout-e2e/1.0");
    client
}

#[tokio::test]
async fn test_handshake_and_quit() {
    let mut client = dummy_client("1", &[]);
    client.run().await.unwrap();
    assert!(client.alive());

    client.quit().await;
    assert!(!client.alive());
}

#[tokio::test]
async fn test_discovery_crashing_on_startup() {
    let mut client = dummy_client("1", &["--invalid"]);
    assert!(client.run().await.is_err());
    assert!(!client.alive());
}

#[tokio::test]
async fn test_polling_mode_lists_initial_ports() {
    let mut client = dummy_client("1", &[]);
    client.run().await.unwrap();
    client.start().await.unwrap();

    // The dummy reports its two connected ports right after START.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let ports = client.list().await.unwrap();
    assert_eq!(ports.len(), 2);
    for port in &ports {
        assert_eq!(port.protocol.as_deref(), Some("dummy"));
        assert_eq!(port.address_label.as_deref(), Some("Dummy upload port"));
    }

    client.stop().await.unwrap();
    client.quit().await;
}

#[tokio::test]
async fn test_sync_mode_streams_initial_events() {
    let mut client = dummy_client("1", &[]);
    client.run().await.unwrap();
    let mut events = client.start_sync(20).await.unwrap();

    for _ in 0..2 {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("initial add within two seconds")
            .unwrap();
        match event {
            Event::Add { port, discovery_id } => {
                assert_eq!(discovery_id, "1");
                assert_eq!(port.protocol.as_deref(), Some("dummy"));
            }
            other => panic!("expected add event, got {other:?}"),
        }
    }

    client.stop().await.unwrap();
    // After a successful STOP the channel ends with the marker and
    // closes; no further events may follow.
    let mut last = None;
    while let Some(event) = events.recv().await {
        last = Some(event);
    }
    assert!(matches!(last, Some(Event::Stop { .. })));

    client.quit().await;
}

#[tokio::test]
async fn test_start_sync_fails_every_fifth_attempt() {
    let mut client = dummy_client("1", &[]);
    client.run().await.unwrap();

    let mut failures = 0;
    for _ in 1..=5 {
        match client.start_sync(10).await {
            Ok(_events) => client.stop().await.unwrap(),
            Err(ClientError::CommandFailed(msg)) => {
                assert_eq!(msg, "Cannot START_SYNC: could not start_sync every 5 times");
                failures += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(failures, 1);

    client.quit().await;
}

#[tokio::test]
async fn test_discovery_crashing_while_streaming_closes_channel() {
    let mut client = dummy_client("1", &["-k"]);
    client.run().await.unwrap();
    let mut events = client.start_sync(20).await.unwrap();

    // The process kills itself after about a second; the event channel
    // must drain and close shortly after, without any consumer action.
    let drained = timeout(Duration::from_secs(5), async {
        while events.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "event channel not closed after crash");
    assert!(!client.alive());

    client.quit().await;
}

#[tokio::test]
async fn test_commands_after_crash_fail() {
    let mut client = dummy_client("1", &["-k"]);
    client.run().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!client.alive());
    assert!(client.start().await.is_err());
}
