#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use cmd_relay::{run_server, Handshake, Packet, ServerConfig, SocketPacket, RECORD_SEPARATOR};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// テスト用に起動したサーバー。ドロップするとシャットダウン
pub struct TestServer {
    pub addr: SocketAddr,
    _shutdown_tx: broadcast::Sender<()>,
}

pub async fn start_server(config: ServerConfig) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(run_server(listener, config, shutdown_rx));
    TestServer {
        addr,
        _shutdown_tx: shutdown_tx,
    }
}

pub fn fast_heartbeat_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        ping_interval: Duration::from_millis(200),
        ping_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

/// 最小限のSocket.IOクライアント（WebSocketトランスポートのみ）
pub struct SioClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub sid: String,
    /// サーバーからのpingに自動で応答するか
    pub auto_pong: bool,
}

impl SioClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::connect_with_origin(addr, None).await
    }

    pub async fn connect_with_origin(addr: SocketAddr, origin: Option<&str>) -> Self {
        let mut ws = Self::open(addr, origin).await;

        let sid = match next_packet(&mut ws).await {
            Some(Packet::Open(handshake)) => handshake.sid,
            other => panic!("Expected open packet, got {:?}", other),
        };

        ws.send(WsMessage::Text("40".to_string())).await.unwrap();
        match next_packet(&mut ws).await {
            Some(Packet::Message(SocketPacket::Connect { data, .. })) => {
                assert!(data.unwrap()["sid"].is_string());
            }
            other => panic!("Expected connect packet, got {:?}", other),
        }

        Self {
            ws,
            sid,
            auto_pong: true,
        }
    }

    /// WebSocketだけ開く（Socket.IOのハンドシェイクはしない）
    pub async fn open(
        addr: SocketAddr,
        origin: Option<&str>,
    ) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
        let url = format!("ws://{}/socket.io/?EIO=4&transport=websocket", addr);
        let mut request = url.into_client_request().unwrap();
        if let Some(origin) = origin {
            request
                .headers_mut()
                .insert("Origin", HeaderValue::from_str(origin).unwrap());
        }
        let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        ws
    }

    pub async fn emit(&mut self, name: &str, arg: Value) {
        self.send_raw(&Packet::event(name, arg).encode()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(WsMessage::Text(text.to_string()))
            .await
            .unwrap();
    }

    /// 次のイベントを待つ。時間内に来なければ None
    pub async fn next_event_within(&mut self, wait: Duration) -> Option<(String, Vec<Value>)> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let packet = match timeout(remaining, next_packet(&mut self.ws)).await {
                Ok(Some(packet)) => packet,
                Ok(None) | Err(_) => return None,
            };
            match packet {
                Packet::Ping(data) if self.auto_pong => {
                    self.send_raw(&Packet::Pong(data).encode()).await;
                }
                Packet::Message(SocketPacket::Event { name, args, .. }) => {
                    return Some((name, args));
                }
                _ => {}
            }
        }
    }

    pub async fn next_event(&mut self) -> (String, Vec<Value>) {
        self.next_event_within(RECV_TIMEOUT)
            .await
            .expect("Timed out waiting for event")
    }

    /// ping を送り pong の time を返す
    pub async fn ping(&mut self) -> u64 {
        self.emit("cmd", serde_json::json!({"type": "cmd", "cmd": "ping", "payload": {}}))
            .await;
        let (name, args) = self.next_event().await;
        assert_eq!(name, "event");
        assert_eq!(args.len(), 1);
        assert_eq!(args[0]["event"], "pong");
        args[0]["payload"]["time"].as_u64().unwrap()
    }
}

/// 次のテキストフレームをパケットとして読む。切断されたら None
pub async fn next_packet(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> Option<Packet> {
    loop {
        match timeout(RECV_TIMEOUT, ws.next()).await.ok()?? {
            Ok(WsMessage::Text(text)) => return Some(Packet::decode(&text).unwrap()),
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// 生のHTTPレスポンス
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP/1.1 のリクエストを1つ送り、接続が閉じるまでレスポンスを読む
pub async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    origin: Option<&str>,
    body: &str,
) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Type: text/plain;charset=UTF-8\r\nContent-Length: {}\r\n",
        method,
        path,
        addr,
        body.len()
    );
    if let Some(origin) = origin {
        request.push_str(&format!("Origin: {}\r\n", origin));
    }
    request.push_str("\r\n");
    request.push_str(body);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    timeout(RECV_TIMEOUT, stream.read_to_end(&mut raw))
        .await
        .expect("Timed out waiting for HTTP response")
        .unwrap();
    let raw = String::from_utf8(raw).unwrap();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    HttpResponse {
        status,
        headers,
        body: body.to_string(),
    }
}

/// HTTPロングポーリングで話す最小限のクライアント
#[derive(Debug, Clone)]
pub struct PollingClient {
    pub addr: SocketAddr,
    pub sid: String,
    origin: Option<String>,
}

impl PollingClient {
    /// ハンドシェイクを行う。レスポンスとハンドシェイク内容も返す
    pub async fn handshake(
        addr: SocketAddr,
        origin: Option<&str>,
    ) -> (Self, HttpResponse, Handshake) {
        let response = http_request(
            addr,
            "GET",
            "/socket.io/?EIO=4&transport=polling",
            origin,
            "",
        )
        .await;
        assert_eq!(response.status, 200, "handshake failed: {:?}", response);

        let handshake = match Packet::decode(&response.body).unwrap() {
            Packet::Open(handshake) => handshake,
            other => panic!("Expected open packet, got {:?}", other),
        };
        let client = Self {
            addr,
            sid: handshake.sid.clone(),
            origin: origin.map(str::to_string),
        };
        (client, response, handshake)
    }

    pub fn path(&self) -> String {
        format!("/socket.io/?EIO=4&transport=polling&sid={}", self.sid)
    }

    pub async fn get(&self) -> Vec<Packet> {
        let response =
            http_request(self.addr, "GET", &self.path(), self.origin.as_deref(), "").await;
        assert_eq!(response.status, 200, "poll failed: {:?}", response);
        response
            .body
            .split(RECORD_SEPARATOR)
            .map(|text| Packet::decode(text).unwrap())
            .collect()
    }

    pub async fn post(&self, packets: &[Packet]) {
        let body = Packet::encode_payload(packets);
        let response =
            http_request(self.addr, "POST", &self.path(), self.origin.as_deref(), &body).await;
        assert_eq!(response.status, 200, "post failed: {:?}", response);
        assert_eq!(response.body, "ok");
    }

    /// 次のイベントが来るまでポーリングする。pingには応答する
    pub async fn next_event(&self) -> (String, Vec<Value>) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            for packet in self.get().await {
                match packet {
                    Packet::Ping(data) => self.post(&[Packet::Pong(data)]).await,
                    Packet::Message(SocketPacket::Event { name, args, .. }) => {
                        return (name, args);
                    }
                    _ => {}
                }
            }
        }
        panic!("Timed out waiting for event");
    }
}
