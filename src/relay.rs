use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::port_allocator::PortAllocator;
use crate::protocol::{random_hex, spawn_reader, verify_digest, Message};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// リレーサービスの設定
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub authtoken: String,
    /// クライアントに通知する公開ホスト名
    pub public_host: Option<String>,
    /// 公開ポートをバインドするホスト
    pub bind_host: String,
    /// 公開ポートの範囲（両端を含む）
    pub port_range: RangeInclusive<u16>,
}

/// データチャネルを待っている訪問者
struct PendingChannel {
    session: String,
    visitor: oneshot::Sender<TcpStream>,
}

struct RelayState {
    options: RelayOptions,
    allocator: PortAllocator,
    // データチャネルID -> 待っている訪問者
    pending: Mutex<HashMap<String, PendingChannel>>,
}

/// リレーサービスを実行
pub async fn run_relay(
    listener: TcpListener,
    options: RelayOptions,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    info!(
        "Relay listening on {}",
        listener.local_addr().context("Failed to get relay address")?
    );
    info!(
        "Port range: {}-{} (inclusive)",
        options.port_range.start(),
        options.port_range.end()
    );

    let state = Arc::new(RelayState {
        allocator: PortAllocator::new(options.bind_host.clone(), options.port_range.clone()),
        options,
        pending: Mutex::new(HashMap::new()),
    });

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!("New relay connection from {}", addr);
                        let state = state.clone();
                        let shutdown_rx = shutdown_rx.resubscribe();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state, shutdown_rx).await {
                                error!("Relay connection error from {}: {:#}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Relay shutdown requested");
                return Ok(());
            }
        }
    }
}

/// 最初のメッセージでコントロールチャネルかデータチャネルかを判定
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let msg = timeout(HANDSHAKE_TIMEOUT, Message::read_from(&mut stream))
        .await
        .context("Timeout waiting for initial message")??;

    match msg {
        Message::TunnelRequest { local_port, proto } => {
            info!(
                "Tunnel request from {} (local port: {}, proto: {:?})",
                addr, local_port, proto
            );
            handle_control_channel(stream, addr, state, shutdown_rx).await
        }
        Message::DataChannelHello { session, channel } => {
            handle_data_channel(stream, addr, &session, &channel, state).await
        }
        other => {
            warn!("Unexpected initial message from {}: {:?}", addr, other);
            Ok(())
        }
    }
}

/// トークンを検証する。失敗時は Rejected を送って false
async fn authenticate(stream: &mut TcpStream, addr: SocketAddr, token: &str) -> Result<bool> {
    let nonce = random_hex(16);
    Message::Challenge {
        nonce: nonce.clone(),
    }
    .write_to(stream)
    .await
    .context("Failed to send Challenge")?;

    let reply = timeout(HANDSHAKE_TIMEOUT, Message::read_from(stream))
        .await
        .context("Timeout waiting for Auth")??;

    let ok = match reply {
        Message::Auth { digest } => verify_digest(token, &nonce, &digest),
        other => {
            warn!("Expected Auth from {}, got {:?}", addr, other);
            false
        }
    };

    if !ok {
        warn!("Authentication failed for {}", addr);
        Message::Rejected {
            reason: "Invalid authtoken".to_string(),
        }
        .write_to(stream)
        .await?;
    }

    Ok(ok)
}

/// コントロールチャネルを処理
async fn handle_control_channel(
    mut stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    if !authenticate(&mut stream, addr, &state.options.authtoken).await? {
        return Ok(());
    }

    let (assigned_port, listener) = match state.allocator.allocate().await {
        Ok(allocated) => allocated,
        Err(e) => {
            Message::Rejected {
                reason: e.to_string(),
            }
            .write_to(&mut stream)
            .await?;
            return Err(e).context("Failed to allocate port");
        }
    };

    let session = random_hex(16);
    let (control_tx, control_rx) = mpsc::channel::<Message>(32);

    let result: Result<()> = async {
        Message::TunnelResponse {
            assigned_port,
            session: session.clone(),
            public_host: state.options.public_host.clone(),
        }
        .write_to(&mut stream)
        .await
        .context("Failed to send TunnelResponse")?;

        info!("Tunnel established for {} on port {}", addr, assigned_port);

        let visitors = tokio::spawn(accept_visitors(
            listener,
            assigned_port,
            session.clone(),
            control_tx,
            state.clone(),
        ));
        let result = control_loop(stream, addr, control_rx, shutdown_rx).await;
        visitors.abort();
        result
    }
    .await;

    info!("Cleaning up tunnel for {}", addr);
    // 待っている訪問者は送信側が消えるので切断される
    state
        .pending
        .lock()
        .await
        .retain(|_, pending| pending.session != session);
    state.allocator.release(assigned_port).await;
    info!("Released port {}", assigned_port);

    result
}

/// ハートビートと制御メッセージの送受信
async fn control_loop(
    stream: TcpStream,
    addr: SocketAddr,
    mut control_rx: mpsc::Receiver<Message>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let (mut incoming, reader_handle) = spawn_reader(reader);
    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);

    let result = loop {
        tokio::select! {
            msg_result = incoming.recv() => {
                match msg_result {
                    Some(Ok(Message::Heartbeat)) => {
                        debug!("Received heartbeat from {}", addr);
                    }
                    Some(Ok(msg)) => {
                        warn!("Unexpected message from {}: {:?}", addr, msg);
                    }
                    Some(Err(e)) => {
                        info!("Control channel closed for {}: {}", addr, e);
                        break Ok(());
                    }
                    None => break Ok(()),
                }
            }
            Some(msg) = control_rx.recv() => {
                if let Err(e) = msg.write_to(&mut writer).await {
                    break Err(e).with_context(|| format!("Failed to send message to {}", addr));
                }
            }
            _ = heartbeat_interval.tick() => {
                debug!("Sending heartbeat to {}", addr);
                if let Err(e) = Message::Heartbeat.write_to(&mut writer).await {
                    break Err(e).with_context(|| format!("Failed to send heartbeat to {}", addr));
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Closing control channel for {}", addr);
                break Ok(());
            }
        }
    };

    reader_handle.abort();
    result
}

/// 公開ポートで訪問者を待つ
///
/// 訪問者ごとにデータチャネルIDを発行して待つので、遅れて届いたデータチャネルが
/// 別の訪問者に渡ることはない。
async fn accept_visitors(
    listener: TcpListener,
    port: u16,
    session: String,
    control_tx: mpsc::Sender<Message>,
    state: Arc<RelayState>,
) {
    loop {
        let (visitor, visitor_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept visitor on port {}: {}", port, e);
                break;
            }
        };
        info!("Visitor connected to port {} from {}", port, visitor_addr);

        let channel = random_hex(8);
        let (tx, rx) = oneshot::channel();
        state.pending.lock().await.insert(
            channel.clone(),
            PendingChannel {
                session: session.clone(),
                visitor: tx,
            },
        );

        let request = Message::CreateDataChannel {
            channel: channel.clone(),
        };
        if control_tx.send(request).await.is_err() {
            state.pending.lock().await.remove(&channel);
            break;
        }

        let state = state.clone();
        tokio::spawn(async move {
            match timeout(DATA_CHANNEL_TIMEOUT, rx).await {
                Ok(Ok(data)) => forward_traffic(visitor, data).await,
                Ok(Err(_)) => debug!("Data channel {} cancelled", channel),
                Err(_) => {
                    warn!("Timeout waiting for data channel on port {}", port);
                    state.pending.lock().await.remove(&channel);
                }
            }
        });
    }
    debug!("Visitor listener for port {} stopped", port);
}

/// データチャネルを待っている訪問者に渡す
async fn handle_data_channel(
    stream: TcpStream,
    addr: SocketAddr,
    session: &str,
    channel: &str,
    state: Arc<RelayState>,
) -> Result<()> {
    let pending = {
        let mut pending = state.pending.lock().await;
        match pending.get(channel) {
            Some(entry) if entry.session == session => pending.remove(channel),
            _ => None,
        }
    };

    match pending {
        Some(pending) => {
            if pending.visitor.send(stream).is_err() {
                debug!("Visitor for data channel {} is gone", channel);
            } else {
                debug!("Data channel {} from {} paired", channel, addr);
            }
        }
        None => warn!("Unknown data channel from {}", addr),
    }

    Ok(())
}

async fn forward_traffic(mut visitor: TcpStream, mut data: TcpStream) {
    match tokio::io::copy_bidirectional(&mut visitor, &mut data).await {
        Ok((up, down)) => debug!("Visitor closed ({} bytes up, {} bytes down)", up, down),
        Err(e) => debug!("Traffic forwarding error: {}", e),
    }
}
