use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::codec::{Handshake, Packet, SocketPacket};
use crate::config::ServerConfig;
use crate::message::{now_millis, respond, Command, COMMAND_EVENT, REPLY_EVENT};
use crate::protocol::random_hex;

const INBOUND_CAPACITY: usize = 32;
// ポーリングのクライアントが取りに来ない間に溜められる数
const OUTBOUND_CAPACITY: usize = 128;

/// セッションを開いたトランスポート
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    Polling,
    WebSocket,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Polling => write!(f, "polling"),
            Transport::WebSocket => write!(f, "websocket"),
        }
    }
}

enum Inbound {
    Packet(Packet),
    TransportClosed(&'static str),
}

/// トランスポート側から見たセッション
///
/// 受信パケットは `deliver` でセッションタスクに渡す。送信パケットは
/// `outbound` のキューに溜まり、ポーリングのGETかWebSocketが取り出す。
/// キューを読めるのは同時に1つだけ。
pub(crate) struct SessionHandle {
    sid: String,
    inbound: mpsc::Sender<Inbound>,
    // セッションタスクが終わるとキューも閉じるように弱参照で持つ
    outbound_tx: mpsc::WeakSender<Packet>,
    outbound: Arc<Mutex<mpsc::Receiver<Packet>>>,
    upgraded: AtomicBool,
}

impl SessionHandle {
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// 受信パケットをセッションに渡す
    pub async fn deliver(&self, packet: Packet) -> Result<()> {
        self.inbound
            .send(Inbound::Packet(packet))
            .await
            .map_err(|_| anyhow!("Session {} is closed", self.sid))
    }

    /// トランスポートが切れたことを通知
    pub async fn transport_closed(&self, reason: &'static str) {
        let _ = self.inbound.send(Inbound::TransportClosed(reason)).await;
    }

    /// 送信キューを取る。他が読んでいれば None
    pub fn try_outbound(&self) -> Option<OwnedMutexGuard<mpsc::Receiver<Packet>>> {
        self.outbound.clone().try_lock_owned().ok()
    }

    /// 送信キューが空くまで待って取る
    pub async fn take_outbound(&self) -> OwnedMutexGuard<mpsc::Receiver<Packet>> {
        self.outbound.clone().lock_owned().await
    }

    /// 待機中のGETを noop で返させる
    pub fn wake_poller(&self) {
        if let Some(tx) = self.outbound_tx.upgrade() {
            let _ = tx.try_send(Packet::Noop);
        }
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::SeqCst)
    }

    pub fn set_upgraded(&self) {
        self.upgraded.store(true, Ordering::SeqCst);
    }
}

/// 送信キューから取り出す
///
/// 1つ目が来るまで待ち、その時点で溜まっている分をまとめて返す。
/// キューが閉じていれば close パケットだけを返す。
pub(crate) async fn drain(outbound: &mut mpsc::Receiver<Packet>) -> Vec<Packet> {
    let mut packets = match outbound.recv().await {
        Some(packet) => vec![packet],
        None => return vec![Packet::Close],
    };
    while let Ok(packet) = outbound.try_recv() {
        packets.push(packet);
    }
    packets
}

/// Engine.IOセッションの管理
///
/// どちらのトランスポートで開いたセッションも同じタスクで動かす。
pub(crate) struct Engine {
    config: ServerConfig,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Engine {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn get(&self, sid: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(sid).cloned()
    }

    /// 全セッションに close を送って終わらせる
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// 新しいセッションを開く。送信キューの先頭は open パケット
    pub async fn open(
        self: &Arc<Self>,
        transport: Transport,
        addr: SocketAddr,
        origin: Option<&str>,
    ) -> Arc<SessionHandle> {
        let sid = random_hex(10);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let upgrades = match transport {
            Transport::Polling => vec![Transport::WebSocket.to_string()],
            Transport::WebSocket => vec![],
        };
        let handshake = Packet::Open(Handshake {
            sid: sid.clone(),
            upgrades,
            ping_interval: self.config.ping_interval.as_millis() as u64,
            ping_timeout: self.config.ping_timeout.as_millis() as u64,
            max_payload: self.config.max_payload as u64,
        });
        // 空のキューなので失敗しない
        let _ = outbound_tx.try_send(handshake);

        let handle = Arc::new(SessionHandle {
            sid: sid.clone(),
            inbound: inbound_tx,
            outbound_tx: outbound_tx.downgrade(),
            outbound: Arc::new(Mutex::new(outbound_rx)),
            upgraded: AtomicBool::new(transport == Transport::WebSocket),
        });
        self.sessions
            .write()
            .await
            .insert(sid.clone(), handle.clone());

        info!(
            "Client connected: {} (sid: {}, transport: {}, origin: {})",
            addr,
            sid,
            transport,
            origin.unwrap_or("-")
        );

        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(self.clone().drive(
            Session::new(sid),
            addr,
            inbound_rx,
            outbound_tx,
            shutdown_rx,
        ));

        handle
    }

    /// セッションのメインループ。受信パケットの処理とハートビート
    async fn drive(
        self: Arc<Self>,
        mut session: Session,
        addr: SocketAddr,
        mut inbound_rx: mpsc::Receiver<Inbound>,
        outbound_tx: mpsc::Sender<Packet>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let interval = self.config.ping_interval;
        let mut ping_interval = tokio::time::interval_at(Instant::now() + interval, interval);

        let reason = 'session: loop {
            let pong_deadline = session.pong_deadline;
            tokio::select! {
                inbound = inbound_rx.recv() => {
                    let packet = match inbound {
                        Some(Inbound::Packet(packet)) => packet,
                        Some(Inbound::TransportClosed(reason)) => break reason,
                        None => break "transport close",
                    };
                    match session.on_packet(packet, now_millis()) {
                        Step::Reply(replies) => {
                            for reply in replies {
                                if let Err(reason) = push(&outbound_tx, reply) {
                                    break 'session reason;
                                }
                            }
                        }
                        Step::Close => break "client close",
                    }
                }
                _ = ping_interval.tick() => {
                    if let Err(reason) = push(&outbound_tx, Packet::Ping(None)) {
                        break reason;
                    }
                    session.ping_sent(Instant::now(), self.config.ping_timeout);
                }
                _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    warn!("Ping timeout for {} (sid: {})", addr, session.sid);
                    break "ping timeout";
                }
                _ = shutdown_rx.recv() => break "server shutdown",
            }
        };

        // 登録を外してから close を送り、キューを閉じる
        self.sessions.write().await.remove(&session.sid);
        let _ = outbound_tx.try_send(Packet::Close);
        drop(outbound_tx);

        info!(
            "Client disconnected: {} (sid: {}, reason: {})",
            addr, session.sid, reason
        );
    }
}

fn push(outbound_tx: &mpsc::Sender<Packet>, packet: Packet) -> Result<(), &'static str> {
    outbound_tx.try_send(packet).map_err(|e| match e {
        TrySendError::Full(_) => "transport buffer full",
        TrySendError::Closed(_) => "transport close",
    })
}

/// パケット処理の結果
#[derive(Debug, PartialEq)]
enum Step {
    Reply(Vec<Packet>),
    Close,
}

/// 1セッション分のSocket.IO状態
struct Session {
    sid: String,
    namespaces: HashSet<String>,
    /// 送った ping への pong の期限
    pong_deadline: Option<Instant>,
}

impl Session {
    fn new(sid: String) -> Self {
        Self {
            sid,
            namespaces: HashSet::new(),
            pong_deadline: None,
        }
    }

    /// ping を送ったら期限を設定する。未応答の ping があれば最初の期限のまま
    fn ping_sent(&mut self, now: Instant, timeout: Duration) {
        self.pong_deadline.get_or_insert(now + timeout);
    }

    /// 受信パケットを処理して返信を決める
    fn on_packet(&mut self, packet: Packet, now_ms: u64) -> Step {
        match packet {
            Packet::Pong(_) => {
                self.pong_deadline = None;
                Step::Reply(vec![])
            }
            Packet::Ping(data) => Step::Reply(vec![Packet::Pong(data)]),
            Packet::Close => Step::Close,
            Packet::Message(packet) => Step::Reply(self.on_socket_packet(packet, now_ms)),
            Packet::Open(_) | Packet::Upgrade | Packet::Noop => Step::Reply(vec![]),
        }
    }

    fn on_socket_packet(&mut self, packet: SocketPacket, now_ms: u64) -> Vec<Packet> {
        match packet {
            SocketPacket::Connect { nsp, .. } => {
                debug!("Namespace {} connected (sid: {})", nsp, self.sid);
                self.namespaces.insert(nsp.clone());
                vec![Packet::Message(SocketPacket::Connect {
                    nsp,
                    data: Some(serde_json::json!({ "sid": self.sid })),
                })]
            }
            SocketPacket::Disconnect { nsp } => {
                debug!("Namespace {} disconnected (sid: {})", nsp, self.sid);
                self.namespaces.remove(&nsp);
                vec![]
            }
            SocketPacket::Event { nsp, name, args, .. } => {
                if !self.namespaces.contains(&nsp) {
                    debug!("Ignoring event on unconnected namespace {}", nsp);
                    return vec![];
                }
                if name != COMMAND_EVENT {
                    debug!("Ignoring event {:?} (sid: {})", name, self.sid);
                    return vec![];
                }

                let payload = args.into_iter().next().unwrap_or(Value::Null);
                info!("CMD (sid: {}): {}", self.sid, payload);

                let command = Command::from_value(&payload);
                match respond(&command, now_ms) {
                    Some(event) => match serde_json::to_value(&event) {
                        Ok(value) => vec![Packet::Message(SocketPacket::Event {
                            nsp,
                            id: None,
                            name: REPLY_EVENT.to_string(),
                            args: vec![value],
                        })],
                        Err(e) => {
                            error!("Failed to serialize event: {}", e);
                            vec![]
                        }
                    },
                    None => vec![],
                }
            }
            SocketPacket::Ack { .. } | SocketPacket::ConnectError { .. } => vec![],
        }
    }
}
