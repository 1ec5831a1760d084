mod common;

use std::time::Duration;

use cmd_relay::{now_millis, publish, Packet, ServerConfig, TunnelConfig};
use common::{next_packet, start_server, SioClient};
use serde_json::json;

#[tokio::test]
async fn test_ping_gets_pong_with_server_time() {
    let server = start_server(ServerConfig::default()).await;
    let mut client = SioClient::connect(server.addr).await;

    let before = now_millis();
    let time = client.ping().await;
    let after = now_millis();

    assert!(time >= before && time <= after, "{} not in {}..={}", time, before, after);

    // 1回のpingにpongは1つだけ
    assert!(client
        .next_event_within(Duration::from_millis(300))
        .await
        .is_none());
}

#[tokio::test]
async fn test_unknown_commands_get_no_reply() {
    let server = start_server(ServerConfig::default()).await;
    let mut client = SioClient::connect(server.addr).await;

    client.emit("cmd", json!({"cmd": "status"})).await;
    client.emit("cmd", json!({"type": "cmd"})).await;
    client.emit("cmd", json!("ping")).await;
    client.send_raw("42[\"cmd\",{broken").await;
    client.emit("other", json!({"cmd": "ping"})).await;

    assert!(client
        .next_event_within(Duration::from_millis(300))
        .await
        .is_none());

    // 接続内では順番に処理されるので、最初に届くのはこのpingへの応答
    client.ping().await;
}

#[tokio::test]
async fn test_concurrent_connections_do_not_leak() {
    let server = start_server(ServerConfig::default()).await;
    let mut a = SioClient::connect(server.addr).await;
    let mut b = SioClient::connect(server.addr).await;
    assert_ne!(a.sid, b.sid);

    a.ping().await;
    assert!(b.next_event_within(Duration::from_millis(300)).await.is_none());

    let (ta, tb) = tokio::join!(a.ping(), b.ping());
    assert!(ta > 0 && tb > 0);

    assert!(a.next_event_within(Duration::from_millis(200)).await.is_none());
    assert!(b.next_event_within(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_any_origin_is_accepted() {
    let server = start_server(ServerConfig::default()).await;

    for origin in [
        Some("http://localhost:8080"),
        Some("https://evil.example.com"),
        Some("null"),
        None,
    ] {
        let mut client = SioClient::connect_with_origin(server.addr, origin).await;
        client.ping().await;
    }
}

#[tokio::test]
async fn test_server_survives_tunnel_failure() {
    let server = start_server(ServerConfig::default()).await;

    // トークン未設定で失敗させる
    let config = TunnelConfig {
        relay_addr: Some("127.0.0.1:1".to_string()),
        ..Default::default()
    };
    publish(server.addr.port(), config).await.unwrap();

    let mut client = SioClient::connect(server.addr).await;
    client.ping().await;
}

#[tokio::test]
async fn test_server_sends_heartbeat() {
    let server = start_server(common::fast_heartbeat_config()).await;
    let mut client = SioClient::connect(server.addr).await;

    // pingに応答し続けていれば interval + timeout を過ぎても接続は維持される
    assert!(client
        .next_event_within(Duration::from_millis(1000))
        .await
        .is_none());
    client.ping().await;
}

#[tokio::test]
async fn test_missing_pong_closes_connection() {
    let server = start_server(common::fast_heartbeat_config()).await;
    let mut ws = SioClient::open(server.addr, None).await;

    assert!(matches!(next_packet(&mut ws).await, Some(Packet::Open(_))));

    // pingに応答しないと interval + timeout 後に切断される
    let mut pings = 0;
    while let Some(packet) = next_packet(&mut ws).await {
        if packet == Packet::Ping(None) {
            pings += 1;
        }
    }
    assert!(pings >= 1);
}

#[tokio::test]
async fn test_missing_pong_closes_after_ping_timeout() {
    // 期限は ping を送ってから ping_timeout。次の interval まで待たない
    let config = ServerConfig {
        ping_interval: Duration::from_millis(500),
        ping_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let server = start_server(config).await;
    let mut ws = SioClient::open(server.addr, None).await;
    assert!(matches!(next_packet(&mut ws).await, Some(Packet::Open(_))));
    let started = tokio::time::Instant::now();

    let mut closed = false;
    while let Some(packet) = next_packet(&mut ws).await {
        if packet == Packet::Close {
            closed = true;
        }
    }
    let elapsed = started.elapsed();

    assert!(closed);
    assert!(elapsed >= Duration::from_millis(450), "closed too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(900), "closed too late: {:?}", elapsed);
}

#[tokio::test]
async fn test_client_close_packet_ends_session() {
    let server = start_server(ServerConfig::default()).await;
    let mut ws = SioClient::open(server.addr, None).await;
    assert!(matches!(next_packet(&mut ws).await, Some(Packet::Open(_))));

    use futures::SinkExt;
    ws.send(tokio_tungstenite::tungstenite::Message::Text(
        Packet::Close.encode(),
    ))
    .await
    .unwrap();

    // サーバーは close を返して接続を閉じる
    let mut packets = Vec::new();
    while let Some(packet) = next_packet(&mut ws).await {
        packets.push(packet);
    }
    assert!(packets.iter().all(|p| *p == Packet::Close), "{:?}", packets);

    // 他の接続は影響を受けない
    let mut client = SioClient::connect(server.addr).await;
    client.ping().await;
}
