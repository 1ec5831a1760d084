use anyhow::{bail, Context, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::codec::{Packet, RECORD_SEPARATOR};
use crate::config::ServerConfig;
use crate::engine::{drain, Engine, SessionHandle, Transport};

const ENGINE_PATH: &str = "/socket.io/";
const PROTOCOL_VERSION: &str = "4";
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);
// アップグレード中に待機中のGETを返させる間隔
const UPGRADE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// 設定のポートで全インターフェースにバインド
pub async fn bind_server(config: &ServerConfig) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind to port {}", config.port))
}

/// リレーサーバーを実行
///
/// バインド済みのリスナーで Engine.IO のポーリングと WebSocket を受け付ける。
/// 接続ごとにセッションタスクが動き、1つの接続のエラーは他の接続に影響しない。
pub async fn run_server(
    listener: TcpListener,
    config: ServerConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .context("Failed to get listening address")?;
    info!("Socket.IO listening on port {}", local_addr.port());

    let engine = Engine::new(config);
    let app = router(engine.clone());

    let signal = async move {
        let _ = shutdown_rx.recv().await;
        info!("Server shutdown requested");
        engine.shutdown();
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await
    .context("Socket.IO server failed")
}

fn router(engine: Arc<Engine>) -> Router {
    let max_payload = engine.config().max_payload;
    Router::new()
        .route(
            ENGINE_PATH,
            get(engine_get).post(engine_post).options(preflight),
        )
        .layer(DefaultBodyLimit::max(max_payload))
        .with_state(engine)
}

#[derive(Debug, Deserialize)]
struct EngineQuery {
    #[serde(rename = "EIO")]
    eio: Option<String>,
    transport: Option<String>,
    sid: Option<String>,
}

/// Engine.IO のエラー応答
#[derive(Debug, Clone, Copy)]
enum EngineError {
    UnknownTransport,
    UnknownSid,
    BadHandshakeMethod,
    BadRequest,
    UnsupportedVersion,
}

impl EngineError {
    fn code(self) -> u8 {
        match self {
            EngineError::UnknownTransport => 0,
            EngineError::UnknownSid => 1,
            EngineError::BadHandshakeMethod => 2,
            EngineError::BadRequest => 3,
            EngineError::UnsupportedVersion => 5,
        }
    }

    fn message(self) -> &'static str {
        match self {
            EngineError::UnknownTransport => "Transport unknown",
            EngineError::UnknownSid => "Session ID unknown",
            EngineError::BadHandshakeMethod => "Bad handshake method",
            EngineError::BadRequest => "Bad request",
            EngineError::UnsupportedVersion => "Unsupported protocol version",
        }
    }
}

/// ハンドシェイク、ポーリングのGET、WebSocketへの接続とアップグレード
async fn engine_get(
    State(engine): State<Arc<Engine>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<EngineQuery>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if query.eio.as_deref() != Some(PROTOCOL_VERSION) {
        return error_response(EngineError::UnsupportedVersion, &headers);
    }
    // Originは記録するだけで制限しない
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match (query.transport.as_deref(), query.sid) {
        (Some("polling"), None) => {
            let handle = engine
                .open(Transport::Polling, addr, origin.as_deref())
                .await;
            poll(&handle, &headers).await
        }
        (Some("polling"), Some(sid)) => match engine.get(&sid).await {
            Some(handle) => poll(&handle, &headers).await,
            None => error_response(EngineError::UnknownSid, &headers),
        },
        (Some("websocket"), sid) => {
            let ws = match ws {
                Some(ws) => ws,
                None => return error_response(EngineError::BadRequest, &headers),
            };
            let existing = match sid {
                Some(sid) => match engine.get(&sid).await {
                    Some(handle) if !handle.is_upgraded() => Some(handle),
                    Some(_) => return error_response(EngineError::BadRequest, &headers),
                    None => return error_response(EngineError::UnknownSid, &headers),
                },
                None => None,
            };

            let max_payload = engine.config().max_payload;
            ws.max_message_size(max_payload)
                .on_upgrade(move |socket| async move {
                    match existing {
                        Some(handle) => {
                            if let Err(e) = upgrade_websocket(socket, handle, addr).await {
                                debug!("Upgrade failed for {}: {:#}", addr, e);
                            }
                        }
                        None => {
                            let handle = engine
                                .open(Transport::WebSocket, addr, origin.as_deref())
                                .await;
                            serve_websocket(socket, handle, addr).await;
                        }
                    }
                })
        }
        _ => error_response(EngineError::UnknownTransport, &headers),
    }
}

/// ポーリングのPOST: クライアントからのパケットを受け取る
async fn engine_post(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<EngineQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if query.eio.as_deref() != Some(PROTOCOL_VERSION) {
        return error_response(EngineError::UnsupportedVersion, &headers);
    }
    if query.transport.as_deref() != Some("polling") {
        return error_response(EngineError::UnknownTransport, &headers);
    }
    let handle = match query.sid {
        Some(sid) => match engine.get(&sid).await {
            Some(handle) => handle,
            None => return error_response(EngineError::UnknownSid, &headers),
        },
        None => return error_response(EngineError::BadHandshakeMethod, &headers),
    };
    if handle.is_upgraded() {
        return error_response(EngineError::BadRequest, &headers);
    }

    for text in body.split(RECORD_SEPARATOR) {
        let packet = match Packet::decode(text) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Ignoring malformed packet (sid: {}): {:#}", handle.sid(), e);
                continue;
            }
        };
        if handle.deliver(packet).await.is_err() {
            return error_response(EngineError::UnknownSid, &headers);
        }
    }

    text_response(StatusCode::OK, &headers, "ok".to_string())
}

/// CORSのプリフライト
async fn preflight(headers: HeaderMap) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let out = response.headers_mut();
    allow_origin(out, &headers);
    out.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    if let Some(requested) = headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
        out.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }
    response
}

/// 送信キューに溜まったパケットを1回のGETで返す
async fn poll(handle: &SessionHandle, headers: &HeaderMap) -> Response {
    if handle.is_upgraded() {
        return error_response(EngineError::BadRequest, headers);
    }
    let mut outbound = match handle.try_outbound() {
        Some(outbound) => outbound,
        None => {
            debug!("Overlapping poll (sid: {})", handle.sid());
            return error_response(EngineError::BadRequest, headers);
        }
    };

    let packets = drain(&mut outbound).await;
    text_response(StatusCode::OK, headers, Packet::encode_payload(&packets))
}

fn text_response(status: StatusCode, headers: &HeaderMap, body: String) -> Response {
    let mut response = (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
        body,
    )
        .into_response();
    allow_origin(response.headers_mut(), headers);
    response
}

fn error_response(error: EngineError, headers: &HeaderMap) -> Response {
    debug!("Rejecting request: {}", error.message());
    let body = Json(json!({ "code": error.code(), "message": error.message() }));
    let mut response = (StatusCode::BAD_REQUEST, body).into_response();
    allow_origin(response.headers_mut(), headers);
    response
}

/// どのOriginからのリクエストも許可する
fn allow_origin(out: &mut HeaderMap, request: &HeaderMap) {
    match request.get(header::ORIGIN) {
        Some(origin) => {
            out.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
            out.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        None => {
            out.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
        }
    }
}

/// ポーリングからWebSocketへ切り替える
///
/// データ付きの ping に同じデータの pong を返し、upgrade パケットを待つ。
/// その間は待機中のGETを noop で返させ、切り替え後は送信キューをWebSocketが読む。
async fn upgrade_websocket(
    mut socket: WebSocket,
    handle: Arc<SessionHandle>,
    addr: SocketAddr,
) -> Result<()> {
    debug!("Upgrade requested by {} (sid: {})", addr, handle.sid());

    let upgraded = timeout(UPGRADE_TIMEOUT, negotiate_upgrade(&mut socket, &handle))
        .await
        .context("Timeout waiting for upgrade")??;
    if !upgraded {
        debug!("Upgrade aborted by {} (sid: {})", addr, handle.sid());
        return Ok(());
    }

    handle.set_upgraded();
    handle.wake_poller();
    info!("Upgraded to websocket: {} (sid: {})", addr, handle.sid());

    serve_websocket(socket, handle, addr).await;
    Ok(())
}

async fn negotiate_upgrade(socket: &mut WebSocket, handle: &SessionHandle) -> Result<bool> {
    let mut check = tokio::time::interval(UPGRADE_CHECK_INTERVAL);
    let mut checking = false;

    loop {
        tokio::select! {
            frame = socket.recv() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(false),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e).context("WebSocket error during upgrade"),
                };
                match Packet::decode(&text)? {
                    Packet::Ping(data) => {
                        socket
                            .send(WsMessage::Text(Packet::Pong(data).encode()))
                            .await
                            .context("Failed to answer upgrade ping")?;
                        handle.wake_poller();
                        checking = true;
                    }
                    Packet::Upgrade => return Ok(true),
                    other => bail!("Unexpected packet during upgrade: {:?}", other),
                }
            }
            _ = check.tick(), if checking => handle.wake_poller(),
        }
    }
}

/// WebSocketトランスポート。送信キューを読み、受信パケットをセッションに渡す
async fn serve_websocket(socket: WebSocket, handle: Arc<SessionHandle>, addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut outbound = handle.take_outbound().await;

    let reason = loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Binary(_))) => {
                        debug!("Ignoring binary frame from {}", addr);
                        continue;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break "transport close",
                    // WebSocketレベルのping/pongはaxum側で処理される
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("WebSocket error from {}: {}", addr, e);
                        break "transport error";
                    }
                };

                match Packet::decode(&text) {
                    Ok(packet) => {
                        if handle.deliver(packet).await.is_err() {
                            break "session closed";
                        }
                    }
                    Err(e) => debug!("Ignoring malformed packet from {}: {:#}", addr, e),
                }
            }
            packet = outbound.recv() => {
                let packet = packet.unwrap_or(Packet::Close);
                let closing = packet == Packet::Close;
                if let Err(e) = ws_tx.send(WsMessage::Text(packet.encode())).await {
                    debug!("WebSocket error from {}: {}", addr, e);
                    break "transport error";
                }
                if closing {
                    break "session closed";
                }
            }
        }
    };

    handle.transport_closed(reason).await;
    let _ = ws_tx.close().await;
    debug!(
        "WebSocket closed for {} (sid: {}, reason: {})",
        addr,
        handle.sid(),
        reason
    );
}
