use anyhow::{anyhow, bail, Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::protocol::{auth_digest, spawn_reader, Message, Proto};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// トンネルクライアントの接続設定
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// リレーサービスのアドレス (例: relay.example.com:2333)
    pub relay_addr: String,
    pub authtoken: Option<String>,
    /// 公開するローカルポート
    pub local_port: u16,
    /// 公開アドレスに使うホスト名。リレーの通知より優先する
    pub public_host: Option<String>,
}

/// 確立済みのコントロールチャネル
#[derive(Debug)]
pub struct Established {
    pub assigned_port: u16,
    pub session: String,
    pub public_host: Option<String>,
    stream: TcpStream,
}

impl Established {
    /// 公開アドレス (tcp://host:port)
    ///
    /// ホストの優先順位: 設定の公開ホスト > リレーの通知 > リレーアドレスのホスト部
    pub fn public_url(&self, options: &ClientOptions) -> Result<Url> {
        let host = options
            .public_host
            .as_deref()
            .or(self.public_host.as_deref())
            .unwrap_or_else(|| host_part(&options.relay_addr));
        Url::parse(&format!("tcp://{}:{}", host, self.assigned_port))
            .with_context(|| format!("Invalid public address {}:{}", host, self.assigned_port))
    }
}

/// "host:port" のホスト部分
fn host_part(addr: &str) -> &str {
    match addr.rsplit_once(':') {
        Some((host, _)) if !host.is_empty() => host,
        _ => addr,
    }
}

/// リレーに1回だけ接続してポートを割り当ててもらう（リトライなし）
pub async fn connect_and_get_port(options: &ClientOptions) -> Result<Established> {
    let token = options
        .authtoken
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| anyhow!("Authentication token is not configured"))?;

    debug!("Connecting to relay: {}", options.relay_addr);
    let mut stream = TcpStream::connect(&options.relay_addr)
        .await
        .with_context(|| format!("Failed to connect to relay {}", options.relay_addr))?;

    Message::TunnelRequest {
        local_port: options.local_port,
        proto: Proto::Tcp,
    }
    .write_to(&mut stream)
    .await
    .context("Failed to send TunnelRequest")?;

    let nonce = match read_reply(&mut stream).await? {
        Message::Challenge { nonce } => nonce,
        Message::Rejected { reason } => bail!("Relay rejected the tunnel: {}", reason),
        other => bail!("Unexpected response from relay: {:?}", other),
    };

    Message::Auth {
        digest: auth_digest(token, &nonce),
    }
    .write_to(&mut stream)
    .await
    .context("Failed to send Auth")?;

    match read_reply(&mut stream).await? {
        Message::TunnelResponse {
            assigned_port,
            session,
            public_host,
        } => {
            info!("Tunnel established! Remote port: {}", assigned_port);
            Ok(Established {
                assigned_port,
                session,
                public_host,
                stream,
            })
        }
        Message::Rejected { reason } => bail!("Relay rejected the tunnel: {}", reason),
        other => bail!("Unexpected response from relay: {:?}", other),
    }
}

async fn read_reply(stream: &mut TcpStream) -> Result<Message> {
    timeout(HANDSHAKE_TIMEOUT, Message::read_from(stream))
        .await
        .context("Timeout waiting for relay response")?
}

/// 確立済みトンネルを維持する（メインループ）
///
/// コントロールチャネルが切れたら指数バックオフで再接続する。
/// 再接続で公開アドレスが変わったら `public_url` に流す。
pub async fn run_client(
    options: ClientOptions,
    established: Established,
    public_url: watch::Sender<Url>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let mut current = Some(established);
    let mut backoff = ExponentialBackoff {
        max_interval: MAX_RETRY_INTERVAL,
        max_elapsed_time: None,
        ..Default::default()
    };

    loop {
        let established = match current.take() {
            Some(established) => established,
            None => {
                tokio::select! {
                    result = connect_and_get_port(&options) => match result {
                        Ok(established) => {
                            backoff.reset();
                            match established.public_url(&options) {
                                Ok(url) => {
                                    info!("Reconnected! Public URL: {}", url);
                                    let changed = public_url.send_if_modified(|current| {
                                        if *current == url {
                                            return false;
                                        }
                                        *current = url.clone();
                                        true
                                    });
                                    if changed {
                                        warn!("Public URL changed to {}", url);
                                    }
                                }
                                Err(e) => error!("Reconnected with an unusable address: {:#}", e),
                            }
                            established
                        }
                        Err(e) => {
                            let wait = backoff.next_backoff().unwrap_or(MAX_RETRY_INTERVAL);
                            warn!("Reconnect failed: {:#}, retrying in {:?}...", e, wait);
                            tokio::select! {
                                _ = tokio::time::sleep(wait) => continue,
                                _ = shutdown_rx.recv() => {
                                    info!("Tunnel client shutdown requested");
                                    return Ok(());
                                }
                            }
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Tunnel client shutdown requested");
                        return Ok(());
                    }
                }
            }
        };

        tokio::select! {
            result = control_channel_loop(established, &options) => {
                match result {
                    Ok(()) => info!("Control channel closed by relay"),
                    Err(e) => error!("Control channel error: {:#}", e),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Tunnel client shutdown requested");
                return Ok(());
            }
        }
    }
}

/// コントロールチャネルのメインループ
async fn control_channel_loop(established: Established, options: &ClientOptions) -> Result<()> {
    let session = established.session;
    let (reader, mut writer) = established.stream.into_split();
    let (mut incoming, reader_handle) = spawn_reader(reader);
    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut last_seen = Instant::now();

    let result = loop {
        tokio::select! {
            msg_result = incoming.recv() => {
                last_seen = Instant::now();
                match msg_result {
                    Some(Ok(Message::CreateDataChannel { channel })) => {
                        debug!("Received CreateDataChannel request ({})", channel);
                        let relay_addr = options.relay_addr.clone();
                        let session = session.clone();
                        let local_port = options.local_port;
                        tokio::spawn(async move {
                            if let Err(e) = create_data_channel(&relay_addr, session, channel, local_port).await {
                                error!("Data channel error: {:#}", e);
                            }
                        });
                    }
                    Some(Ok(Message::Heartbeat)) => debug!("Received heartbeat"),
                    Some(Ok(msg)) => warn!("Unexpected message: {:?}", msg),
                    Some(Err(e)) => break Err(e).context("Failed to read message"),
                    None => break Ok(()),
                }
            }
            _ = heartbeat_interval.tick() => {
                if last_seen.elapsed() > HEARTBEAT_TIMEOUT {
                    break Err(anyhow!("Heartbeat timeout"));
                }
                debug!("Sending heartbeat");
                if let Err(e) = Message::Heartbeat.write_to(&mut writer).await {
                    break Err(e).context("Failed to send heartbeat");
                }
            }
        }
    };

    reader_handle.abort();
    result
}

/// データチャネルを作成してローカルサービスと接続
async fn create_data_channel(
    relay_addr: &str,
    session: String,
    channel: String,
    local_port: u16,
) -> Result<()> {
    debug!("Creating data channel to {}", relay_addr);

    let mut relay_stream = TcpStream::connect(relay_addr)
        .await
        .with_context(|| format!("Failed to connect to relay at {}", relay_addr))?;
    Message::DataChannelHello { session, channel }
        .write_to(&mut relay_stream)
        .await
        .context("Failed to send DataChannelHello")?;

    let mut local_stream = TcpStream::connect(("127.0.0.1", local_port))
        .await
        .with_context(|| format!("Failed to connect to local service at port {}", local_port))?;

    match tokio::io::copy_bidirectional(&mut local_stream, &mut relay_stream).await {
        Ok((up, down)) => debug!("Data channel closed ({} bytes up, {} bytes down)", up, down),
        Err(e) => debug!("Data channel forwarding error: {}", e),
    }

    Ok(())
}
