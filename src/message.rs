use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// クライアントから届くイベント名
pub const COMMAND_EVENT: &str = "cmd";

/// クライアントへ返すイベント名
pub const REPLY_EVENT: &str = "event";

/// 受信コマンド
///
/// `cmd` フィールドでタグ付けされる。知らないタグ、`cmd` の欠落、
/// オブジェクト以外のペイロードはすべて `Unknown` になる。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Unknown,
}

impl Command {
    /// JSONペイロードからコマンドを判定
    pub fn from_value(value: &Value) -> Self {
        match value.get("cmd").and_then(Value::as_str) {
            Some("ping") => Command::Ping,
            _ => Command::Unknown,
        }
    }
}

/// 送信イベント: `{ event, payload }`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Event {
    pub event: String,
    pub payload: Value,
}

impl Event {
    pub fn pong(time: u64) -> Self {
        Self {
            event: "pong".to_string(),
            payload: serde_json::json!({ "time": time }),
        }
    }
}

/// コマンドに対する応答を決める
///
/// 応答が不要なコマンドには `None` を返す（エラーではない）。
pub fn respond(command: &Command, now_ms: u64) -> Option<Event> {
    match command {
        Command::Ping => Some(Event::pong(now_ms)),
        Command::Unknown => None,
    }
}

/// 現在時刻（UNIXエポックからのミリ秒）
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
