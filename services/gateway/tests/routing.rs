
use std::time::{Duration, Instant};

use harness::{
    http_get, mqtt_connect, read_exact_timeout, read_to_end_timeout, stomp_connect,
    GatewayHandle, GatewayOptions, TcpEchoBackend,
};
use protogate_gateway::Strategy;
use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Open a STOMP session for `host` and wait for the echoed CONNECT.
async fn stomp_roundtrip(gateway: &GatewayHandle, host: &str) {
    let frame = stomp_connect(host);
    let mut client = gateway.connect().await;
    client.write_all(&frame).await.unwrap();
    let echoed = read_exact_timeout(&mut client, frame.len()).await.unwrap();
    assert_eq!(echoed, frame);
}

#[tokio::test]
async fn stomp_connect_replayed_then_relayed() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let gateway = GatewayHandle::spawn().await.unwrap();
    gateway.add_service("broker0", vec![backend.uri("stomp")], &[]);

    let mut client = gateway.connect().await;
    let frame = stomp_connect("broker0");
    client.write_all(&frame).await.unwrap();
    assert_eq!(read_exact_timeout(&mut client, frame.len()).await.unwrap(), frame);

    let send = b"SEND\ndestination:/queue/a\n\nhello\0";
    client.write_all(send).await.unwrap();
    assert_eq!(read_exact_timeout(&mut client, send.len()).await.unwrap(), send);

    client.shutdown().await.unwrap();
    read_to_end_timeout(&mut client).await.unwrap();

    // Everything the client sent, in order.
    let mut expected = frame.clone();
    expected.extend_from_slice(send);
    assert_eq!(backend.received(), expected);
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn stomp_connect_split_into_single_bytes() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let gateway = GatewayHandle::spawn().await.unwrap();
    gateway.add_service("broker0", vec![backend.uri("stomp")], &[]);

    let frame = stomp_connect("broker0");
    let mut client = gateway.connect().await;
    client.set_nodelay(true).unwrap();
    for byte in &frame {
        client.write_all(&[*byte]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(read_exact_timeout(&mut client, frame.len()).await.unwrap(), frame);
    assert_eq!(backend.received(), frame);
}

#[tokio::test]
async fn amqp_header_then_stall_closes_after_idle_timeout() {
    let mut config = GatewayHandle::config();
    config.idle_timeout = Duration::from_millis(300);
    let gateway = GatewayHandle::spawn_with(config, GatewayOptions::default())
        .await
        .unwrap();

    let mut client = gateway.connect().await;
    client.write_all(b"AMQP").await.unwrap();
    let started = Instant::now();

    let received = read_to_end_timeout(&mut client).await.unwrap();
    assert!(received.is_empty(), "closed silently");
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(gateway.stat(|s| &s.idle_timeouts), 1);
}

#[tokio::test]
async fn trickled_http_head_closed_at_idle_deadline() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut config = GatewayHandle::config();
    config.idle_timeout = Duration::from_millis(300);
    let gateway = GatewayHandle::spawn_with(config, GatewayOptions::default())
        .await
        .unwrap();
    gateway.add_service("api", vec![backend.uri("http")], &[]);

    let (mut reader, mut writer) = gateway.connect().await.into_split();
    let started = Instant::now();
    // Every gap is shorter than the idle timeout.
    tokio::spawn(async move {
        for byte in http_get("api", "/") {
            if writer.write_all(&[byte]).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
    });

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(3), reader.read(&mut buf))
        .await
        .expect("gateway kept the trickling client open");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_eq!(gateway.stat(|s| &s.idle_timeouts), 1);
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn http_unknown_host_gets_404() {
    let gateway = GatewayHandle::spawn().await.unwrap();

    let mut client = gateway.connect().await;
    client.write_all(&http_get("foo", "/")).await.unwrap();
    let response = read_to_end_timeout(&mut client).await.unwrap();
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 404 "), "got {text:?}");
}

#[tokio::test]
async fn zero_candidates_never_dials() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let gateway = GatewayHandle::spawn().await.unwrap();
    // Same backend, other virtual host and other protocol.
    gateway.add_service("other", vec![backend.uri("stomp")], &[]);
    gateway.add_service("broker0", vec![backend.uri("mqtt")], &[]);

    let mut client = gateway.connect().await;
    client.write_all(&stomp_connect("broker0")).await.unwrap();
    let response = read_to_end_timeout(&mut client).await.unwrap();

    assert!(response.starts_with(b"ERROR\n"));
    assert_eq!(backend.connection_count(), 0);
    assert_eq!(gateway.stat(|s| &s.routes_failed), 1);
    assert_eq!(gateway.stat(|s| &s.backend_connected), 0);
}

#[tokio::test]
async fn mqtt_without_service_gets_connack_refusal() {
    let gateway = GatewayHandle::spawn().await.unwrap();

    let mut client = gateway.connect().await;
    client.write_all(&mqtt_connect("tenant-a/alice")).await.unwrap();
    let response = read_to_end_timeout(&mut client).await.unwrap();
    // CONNACK, return code 3 (server unavailable)
    assert_eq!(response, vec![0x20, 0x02, 0x00, 0x03]);
}

#[tokio::test]
async fn mqtt_routes_on_username_virtual_host() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let gateway = GatewayHandle::spawn().await.unwrap();
    gateway.add_service("mqtt-tenants", vec![backend.uri("mqtt")], &["tenant-*"]);

    let packet = mqtt_connect("tenant-a/alice");
    let mut client = gateway.connect().await;
    client.write_all(&packet).await.unwrap();
    assert_eq!(read_exact_timeout(&mut client, packet.len()).await.unwrap(), packet);
}

#[rstest]
#[case::random(Strategy::Random)]
#[case::round_robin(Strategy::RoundRobin)]
#[case::sticky(Strategy::sticky(Strategy::Random, 16))]
#[tokio::test]
async fn single_candidate_selected_under_every_strategy(#[case] strategy: Strategy) {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let gateway = GatewayHandle::spawn_with(
        GatewayHandle::config(),
        GatewayOptions {
            strategy: Some(strategy),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    gateway.add_service("broker0", vec![backend.uri("stomp")], &[]);

    for _ in 0..3 {
        stomp_roundtrip(&gateway, "broker0").await;
    }
    assert_eq!(backend.connection_count(), 3);
}

#[tokio::test]
async fn sticky_follows_client_until_endpoint_removed() {
    let first = TcpEchoBackend::spawn().await.unwrap();
    let second = TcpEchoBackend::spawn().await.unwrap();
    let gateway = GatewayHandle::spawn_with(
        GatewayHandle::config(),
        GatewayOptions {
            strategy: Some(Strategy::sticky(Strategy::RoundRobin, 16)),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    gateway.add_service("broker0-a", vec![first.uri("stomp")], &["broker0"]);
    gateway.add_service("broker0-b", vec![second.uri("stomp")], &["broker0"]);

    for _ in 0..4 {
        stomp_roundtrip(&gateway, "broker0").await;
    }
    let (chosen_id, chosen, other) = if first.connection_count() > 0 {
        ("broker0-a", &first, &second)
    } else {
        ("broker0-b", &second, &first)
    };
    assert_eq!(chosen.connection_count(), 4);
    assert_eq!(other.connection_count(), 0);

    gateway.registry.remove(chosen_id);
    stomp_roundtrip(&gateway, "broker0").await;
    assert_eq!(other.connection_count(), 1);
    assert_eq!(chosen.connection_count(), 4);
}

#[tokio::test]
async fn dead_backend_is_retried_on_another_candidate() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let live = TcpEchoBackend::spawn().await.unwrap();
    let gateway = GatewayHandle::spawn().await.unwrap();
    gateway.add_service("broker0-dead", vec![format!("stomp://{dead_addr}")], &["broker0"]);
    gateway.add_service("broker0-live", vec![live.uri("stomp")], &["broker0"]);

    for _ in 0..4 {
        stomp_roundtrip(&gateway, "broker0").await;
    }
    assert_eq!(live.connection_count(), 4);
    assert_eq!(gateway.stat(|s| &s.backend_failed), 0);
}

#[tokio::test]
async fn all_backends_dead_refuses_with_error_frame() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let gateway = GatewayHandle::spawn().await.unwrap();
    gateway.add_service("broker0", vec![format!("stomp://{dead_addr}")], &[]);

    let mut client = gateway.connect().await;
    client.write_all(&stomp_connect("broker0")).await.unwrap();
    let response = read_to_end_timeout(&mut client).await.unwrap();
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("ERROR\n"));
    assert!(text.contains("reachable"));
    assert_eq!(gateway.stat(|s| &s.backend_failed), 1);
}

#[tokio::test]
async fn garbage_is_closed_without_reply() {
    let gateway = GatewayHandle::spawn().await.unwrap();

    let mut client = gateway.connect().await;
    client.write_all(&[0u8; 64]).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(gateway.stat(|s| &s.detection_failed), 1);
}
