//! Transport integration tests: bridge listener → gateway → topic call
//! round-trips against a fake engine endpoint.

mod common;

use common::{free_port, FakeTopicServer};
use engine_warden::transport::codec::encode_reply;
use engine_warden::transport::{BridgeEvent, BridgeServer, TopicCommand, TransportGateway};
use engine_warden::types::TransportConfig;
use engine_warden::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

async fn transport_config() -> TransportConfig {
    TransportConfig {
        topic_port: free_port().await,
        bridge_port: free_port().await,
        call_timeout: Duration::from_secs(2),
        ..TransportConfig::default()
    }
}

/// Helper: serve the bridge on the configured port.
async fn start_bridge(
    config: TransportConfig,
) -> (
    TransportGateway,
    mpsc::UnboundedReceiver<BridgeEvent>,
    Arc<BridgeServer>,
) {
    let (gateway, events) = TransportGateway::new(config.clone());
    let addr = SocketAddr::from(([127, 0, 0, 1], config.bridge_port));
    let server = Arc::new(BridgeServer::new(gateway.clone(), addr));
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });

    // Give the server a moment to bind
    tokio::time::sleep(Duration::from_millis(100)).await;

    (gateway, events, server)
}

/// Helper: one bridge command, one reply line.
async fn bridge_call(port: u16, command: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(command.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    reply
}

#[tokio::test]
async fn test_version_negotiation_over_the_wire() {
    let config = transport_config().await;
    let engine = FakeTopicServer::start(config.topic_port, "ok").await;
    let (gateway, mut events, server) = start_bridge(config.clone()).await;
    let secret = gateway.begin_session();

    // Callbacks before the engine reports its version are dropped
    assert_eq!(bridge_call(config.bridge_port, "irc too early").await, "\n");
    assert!(events.try_recv().is_err());

    assert_eq!(bridge_call(config.bridge_port, "api_ver 5.1.2").await, "ok\n");
    assert!(gateway.is_negotiated());

    // The compatibility acknowledgment carries the session secret
    engine.wait_for_calls(1).await;
    let calls = engine.calls();
    let ack = &calls[0];
    assert!(ack.contains(&("secret".to_string(), secret.as_str().to_string())));
    assert!(ack.contains(&("command".to_string(), "api_compat".to_string())));
    assert!(ack.contains(&("version".to_string(), "5.1.2".to_string())));

    assert_eq!(bridge_call(config.bridge_port, "irc round over").await, "ok\n");
    assert_eq!(
        events.recv().await,
        Some(BridgeEvent::Broadcast("round over".to_string()))
    );

    assert_eq!(bridge_call(config.bridge_port, "no_such_command").await, "\n");

    server.shutdown();
}

#[tokio::test]
async fn test_incompatible_engine_gets_no_callbacks() {
    let config = transport_config().await;
    let engine = FakeTopicServer::start(config.topic_port, "ok").await;
    let (gateway, mut events, server) = start_bridge(config.clone()).await;
    gateway.begin_session();

    bridge_call(config.bridge_port, "api_ver 4.9.0").await;
    assert!(!gateway.is_negotiated());
    assert_eq!(bridge_call(config.bridge_port, "worldreboot").await, "\n");
    assert!(events.try_recv().is_err());

    let err = gateway
        .send_topic(TopicCommand::GracefulRestart)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    // Nothing ever reached the engine
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.calls().is_empty());

    server.shutdown();
}

#[tokio::test]
async fn test_chat_message_survives_escaping() {
    let config = transport_config().await;
    let engine = FakeTopicServer::start(config.topic_port, "delivered").await;
    let (gateway, _events) = TransportGateway::new(config);
    gateway.begin_session();
    gateway.handle_bridge("api_ver 5.1.0");
    engine.wait_for_calls(1).await;

    let message = "vote=yes; 50% & +1";
    let reply = gateway
        .send_topic(TopicCommand::ChatMessage {
            message: message.to_string(),
        })
        .await
        .unwrap();
    assert_eq!(reply, "delivered");
    assert_eq!(engine.values_of("message"), vec![message.to_string()]);
}

#[tokio::test]
async fn test_raw_command_gets_secret_appended() {
    let config = transport_config().await;
    let engine = FakeTopicServer::start(config.topic_port, "ok").await;
    let (gateway, _events) = TransportGateway::new(config);
    let secret = gateway.begin_session();
    gateway.handle_bridge("api_ver 5.1.0");
    engine.wait_for_calls(1).await;

    gateway
        .send_topic(TopicCommand::Raw("adminwho=1;ckey=someone".to_string()))
        .await
        .unwrap();
    engine.wait_for_calls(2).await;

    let calls = engine.calls();
    let raw = &calls[1];
    assert_eq!(
        raw,
        &vec![
            ("adminwho".to_string(), "1".to_string()),
            ("ckey".to_string(), "someone".to_string()),
            ("secret".to_string(), secret.as_str().to_string()),
        ]
    );
}

#[tokio::test]
async fn test_silent_engine_times_out() {
    let mut config = transport_config().await;
    config.call_timeout = Duration::from_millis(200);

    // Accepts and reads but never answers
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.topic_port))
        .await
        .unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let (gateway, _events) = TransportGateway::new(config);
    gateway.begin_session();
    gateway.handle_bridge("api_ver 5.1.0");

    let err = gateway
        .send_topic(TopicCommand::GracefulShutdown)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
}

#[tokio::test]
async fn test_partial_reply_is_kept_on_timeout() {
    let mut config = transport_config().await;
    config.call_timeout = Duration::from_millis(300);

    // Announces a longer reply than it ever sends
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.topic_port))
        .await
        .unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut stream, _)) = listener.accept().await {
            let reply = encode_reply("hello world").unwrap();
            let _ = stream.write_all(&reply[..7]).await;
            held.push(stream);
        }
    });

    let (gateway, _events) = TransportGateway::new(config);
    gateway.begin_session();
    gateway.handle_bridge("api_ver 5.1.0");

    let reply = gateway
        .send_topic(TopicCommand::GracefulRestart)
        .await
        .unwrap();
    assert_eq!(reply, "he");
}
