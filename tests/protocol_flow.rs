//! End-to-end protocol flows over real TCP sockets.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use resonate::config::Config;
use resonate::group::AppAdapter;
use resonate::protocol::field::Field;
use resonate::protocol::messages::{ClientMessage, ServerMessage};
use resonate::protocol::metadata::{Metadata, MetadataUpdate};
use resonate::protocol::types::MediaCommand;
use resonate::server::Server;
use resonate::stream::{AudioSource, PcmEncoderFactory};

struct NoApp;

impl AppAdapter for NoApp {
    fn capabilities(&self) -> Vec<MediaCommand> {
        vec![MediaCommand::Play, MediaCommand::Pause, MediaCommand::Stop]
    }
    fn open_source(&self, _group_id: &str) -> Option<Box<dyn AudioSource>> {
        None
    }
    fn media_command(&self, _group_id: &str, _command: MediaCommand) {}
}

/// Boots a server on an ephemeral port and returns its URL.
async fn boot_server() -> (Arc<Server>, String) {
    let config = Config {
        id: "s1".to_string(),
        name: "Living Room Server".to_string(),
        ..Config::default()
    };
    let (server, _events) = Server::new(config, Arc::new(NoApp), Arc::new(PcmEncoderFactory));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn({
        let server = Arc::clone(&server);
        async move {
            let _ = server.serve(listener).await;
        }
    });
    (server, format!("ws://{addr}/resonate"))
}

// The handshake scenario: the literal client/hello seed, the expected
// server/hello reply as the first server-origin frame, then the
// client's initial state.
#[tokio::test]
async fn handshake_completes_with_ordered_frames() {
    let (server, url) = boot_server().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    socket
        .send(WsMessage::text(
            r#"{"type":"client/hello","payload":{"client_id":"c1","name":"Kitchen","version":1,"supported_roles":["player"],"player_support":{"support_formats":[{"codec":"pcm","channels":2,"sample_rate":48000,"bit_depth":16}],"buffer_capacity":262144,"supported_commands":["volume","mute"]}}}"#,
        ))
        .await
        .unwrap();

    // First server-origin text frame must be server/hello.
    let first = loop {
        match socket.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => break ServerMessage::from_json(&text).unwrap(),
            _ => continue,
        }
    };
    let ServerMessage::Hello(hello) = first else {
        panic!("first frame was {first}, not server/hello");
    };
    assert_eq!(hello.server_id, "s1");
    assert_eq!(hello.name, "Living Room Server");
    assert_eq!(hello.version, 1);

    // The player reports its initial state.
    socket
        .send(WsMessage::text(
            r#"{"type":"client/state","payload":{"player":{"state":"synchronized","volume":80,"muted":false}}}"#,
        ))
        .await
        .unwrap();

    // A clock probe round-trips with both server stamps.
    socket
        .send(WsMessage::text(
            r#"{"type":"client/time","payload":{"client_transmitted":1000000}}"#,
        ))
        .await
        .unwrap();
    let time = loop {
        match socket.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => {
                if let Ok(ServerMessage::Time(time)) = ServerMessage::from_json(&text) {
                    break time;
                }
            }
            _ => continue,
        }
    };
    assert_eq!(time.client_transmitted, 1_000_000);
    assert!(time.server_transmitted >= time.server_received);

    assert_eq!(server.endpoint_count(), 1);
    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn text_before_hello_terminates_the_connection() {
    let (_server, url) = boot_server().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    socket
        .send(WsMessage::text(
            r#"{"type":"client/time","payload":{"client_transmitted":1}}"#,
        ))
        .await
        .unwrap();

    // The endpoint closes without a server/hello ever arriving.
    let mut got_hello = false;
    while let Some(Ok(message)) = socket.next().await {
        if let WsMessage::Text(text) = message {
            if matches!(ServerMessage::from_json(&text), Ok(ServerMessage::Hello(_))) {
                got_hello = true;
            }
        }
    }
    assert!(!got_hello, "server answered a pre-hello message");
}

#[tokio::test]
async fn unknown_upgrade_paths_are_rejected() {
    let (_server, url) = boot_server().await;
    let wrong = url.replace("/resonate", "/other");
    assert!(tokio_tungstenite::connect_async(&wrong).await.is_err());
}

#[tokio::test]
async fn duplicate_client_ids_keep_only_the_newer_connection() {
    let (server, url) = boot_server().await;
    let hello = r#"{"type":"client/hello","payload":{"client_id":"dup","name":"A","version":1,"supported_roles":["metadata"]}}"#;

    let (mut first, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    first.send(WsMessage::text(hello)).await.unwrap();
    // Wait for the handshake to complete.
    loop {
        if let WsMessage::Text(text) = first.next().await.unwrap().unwrap() {
            if matches!(ServerMessage::from_json(&text), Ok(ServerMessage::Hello(_))) {
                break;
            }
        }
    }

    let (mut second, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    second.send(WsMessage::text(hello)).await.unwrap();

    // The first connection is closed by the server; the second lives.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, first.next()).await {
            Ok(Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None) => break,
            Ok(_) => continue,
            Err(_) => panic!("older duplicate endpoint was not closed"),
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.endpoint_count(), 1);
}

// Delta round-trip: for any interleaving of absent/null/present across
// a sequence of updates, the merged state equals the value dictated by
// the last non-absent occurrence.
#[test]
fn delta_merge_honors_the_trichotomy() {
    let updates = [
        // title set, year set.
        MetadataUpdate {
            timestamp: 1,
            title: Field::Value("First".to_string()),
            year: Field::Value(1999),
            ..MetadataUpdate::default()
        },
        // title absent (retained), year cleared.
        MetadataUpdate {
            timestamp: 2,
            year: Field::Null,
            ..MetadataUpdate::default()
        },
        // title replaced, year still absent.
        MetadataUpdate {
            timestamp: 3,
            title: Field::Value("Second".to_string()),
            ..MetadataUpdate::default()
        },
    ];

    let mut merged = Metadata::default();
    for update in updates {
        // Through the wire and back, so serde's absent/null handling is
        // part of the property.
        let wire = serde_json::to_string(&update).unwrap();
        let decoded: MetadataUpdate = serde_json::from_str(&wire).unwrap();
        merged.apply(decoded);
    }

    assert_eq!(merged.title.as_deref(), Some("Second"));
    assert_eq!(merged.year, None);
}

// Both envelope layers compose: a full client message survives the
// typed enum round trip.
#[test]
fn typed_envelopes_round_trip_via_serde() {
    let json = r#"{"type":"client/command","payload":{"controller":{"command":"volume","volume":55}}}"#;
    let message: ClientMessage = serde_json::from_str(json).unwrap();
    let back = serde_json::to_string(&message).unwrap();
    let again: ClientMessage = serde_json::from_str(&back).unwrap();
    assert_eq!(message, again);
}
