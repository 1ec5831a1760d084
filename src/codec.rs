use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// デフォルトの名前空間
pub const DEFAULT_NAMESPACE: &str = "/";

/// Engine.IO の open パケットで送るハンドシェイク情報
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    pub max_payload: u64,
}

/// ポーリングのペイロードでパケットを区切る文字
pub const RECORD_SEPARATOR: char = '\x1e';

/// Engine.IO パケット
///
/// WebSocketのテキストフレーム1つ、またはポーリングのペイロードの1要素に対応する。
/// フォーマット: `<type digit><data>`
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Handshake),
    Close,
    /// アップグレード確認ではデータ付きで送られ、pong で同じデータを返す
    Ping(Option<String>),
    Pong(Option<String>),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

/// Socket.IO パケット（Engine.IO の message に載る）
///
/// フォーマット: `<type digit>[/namespace,][ack id][json]`
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        nsp: String,
        data: Option<Value>,
    },
    Disconnect {
        nsp: String,
    },
    Event {
        nsp: String,
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        nsp: String,
        id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        nsp: String,
        data: Value,
    },
}

impl Packet {
    /// テキストフレームをデコード
    pub fn decode(text: &str) -> Result<Self> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or_else(|| anyhow!("Empty packet"))?;
        let rest = chars.as_str();

        let data = if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        };

        let packet = match kind {
            '0' => {
                let handshake = serde_json::from_str(rest)
                    .with_context(|| format!("Invalid open packet: {}", rest))?;
                Packet::Open(handshake)
            }
            '1' => Packet::Close,
            '2' => Packet::Ping(data),
            '3' => Packet::Pong(data),
            '4' => Packet::Message(SocketPacket::decode(rest)?),
            '5' => Packet::Upgrade,
            '6' => Packet::Noop,
            other => bail!("Unsupported engine.io packet type: {}", other),
        };

        Ok(packet)
    }

    /// テキストフレームにエンコード
    pub fn encode(&self) -> String {
        match self {
            Packet::Open(handshake) => {
                // Handshake は文字列と数値だけなので失敗しない
                format!("0{}", serde_json::to_string(handshake).unwrap_or_default())
            }
            Packet::Close => "1".to_string(),
            Packet::Ping(data) => format!("2{}", data.as_deref().unwrap_or_default()),
            Packet::Pong(data) => format!("3{}", data.as_deref().unwrap_or_default()),
            Packet::Message(packet) => format!("4{}", packet.encode()),
            Packet::Upgrade => "5".to_string(),
            Packet::Noop => "6".to_string(),
        }
    }

    /// ポーリングのペイロードにまとめる
    pub fn encode_payload(packets: &[Packet]) -> String {
        packets
            .iter()
            .map(Packet::encode)
            .collect::<Vec<_>>()
            .join(&RECORD_SEPARATOR.to_string())
    }

    /// デフォルト名前空間でイベントを作成
    pub fn event(name: &str, arg: Value) -> Self {
        Packet::Message(SocketPacket::Event {
            nsp: DEFAULT_NAMESPACE.to_string(),
            id: None,
            name: name.to_string(),
            args: vec![arg],
        })
    }
}

impl SocketPacket {
    fn decode(text: &str) -> Result<Self> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or_else(|| anyhow!("Empty socket.io packet"))?;
        let mut rest = chars.as_str();

        // 名前空間: "/chat," のように ',' まで
        let nsp = if rest.starts_with('/') {
            match rest.find(',') {
                Some(pos) => {
                    let nsp = &rest[..pos];
                    rest = &rest[pos + 1..];
                    nsp.to_string()
                }
                None => {
                    let nsp = rest.to_string();
                    rest = "";
                    nsp
                }
            }
        } else {
            DEFAULT_NAMESPACE.to_string()
        };

        // ack id: 先頭の数字列
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let id = if digits > 0 {
            let id = rest[..digits]
                .parse::<u64>()
                .with_context(|| format!("Invalid ack id: {}", &rest[..digits]))?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let data: Option<Value> = if rest.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(rest)
                    .with_context(|| format!("Invalid socket.io payload: {}", rest))?,
            )
        };

        let packet = match kind {
            '0' => SocketPacket::Connect { nsp, data },
            '1' => SocketPacket::Disconnect { nsp },
            '2' => {
                let mut args = match data {
                    Some(Value::Array(args)) => args,
                    _ => bail!("Event payload must be an array"),
                };
                if args.is_empty() {
                    bail!("Event without a name");
                }
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    other => bail!("Event name must be a string, got {}", other),
                };
                SocketPacket::Event { nsp, id, name, args }
            }
            '3' => {
                let id = id.ok_or_else(|| anyhow!("Ack without id"))?;
                let args = match data {
                    Some(Value::Array(args)) => args,
                    _ => bail!("Ack payload must be an array"),
                };
                SocketPacket::Ack { nsp, id, args }
            }
            '4' => SocketPacket::ConnectError {
                nsp,
                data: data.unwrap_or(Value::Null),
            },
            other => bail!("Unsupported socket.io packet type: {}", other),
        };

        Ok(packet)
    }

    fn encode(&self) -> String {
        let (kind, nsp, id, data) = match self {
            SocketPacket::Connect { nsp, data } => ('0', nsp, None, data.clone()),
            SocketPacket::Disconnect { nsp } => ('1', nsp, None, None),
            SocketPacket::Event { nsp, id, name, args } => {
                let mut array = Vec::with_capacity(args.len() + 1);
                array.push(Value::String(name.clone()));
                array.extend(args.iter().cloned());
                ('2', nsp, *id, Some(Value::Array(array)))
            }
            SocketPacket::Ack { nsp, id, args } => {
                ('3', nsp, Some(*id), Some(Value::Array(args.clone())))
            }
            SocketPacket::ConnectError { nsp, data } => ('4', nsp, None, Some(data.clone())),
        };

        let mut out = String::new();
        out.push(kind);
        if nsp != DEFAULT_NAMESPACE {
            out.push_str(nsp);
            out.push(',');
        }
        if let Some(id) = id {
            out.push_str(&id.to_string());
        }
        if let Some(data) = data {
            out.push_str(&data.to_string());
        }
        out
    }
}
