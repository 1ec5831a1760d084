use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// メッセージの最大サイズ
const MAX_MESSAGE_LEN: u32 = 1024 * 1024;

/// トンネルのプロトコル種別（現状TCPのみ）
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
}

/// トンネル制御メッセージ
/// JSON形式でシリアライズされ、言語非依存
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Message {
    /// クライアント → リレー: トンネル作成リクエスト
    TunnelRequest { local_port: u16, proto: Proto },

    /// リレー → クライアント: 認証チャレンジ
    Challenge { nonce: String },

    /// クライアント → リレー: hex(sha256(token || nonce))
    Auth { digest: String },

    /// リレー → クライアント: 割り当てたポートとセッションID
    TunnelResponse {
        assigned_port: u16,
        session: String,
        public_host: Option<String>,
    },

    /// リレー → クライアント: リクエスト拒否
    Rejected { reason: String },

    /// クライアント → リレー: データチャネルの最初のメッセージ
    DataChannelHello { session: String, channel: String },

    /// リレー → クライアント: 訪問者1人分のデータチャネルを作成して
    CreateDataChannel { channel: String },

    /// 双方向: ハートビート
    Heartbeat,
}

impl Message {
    /// メッセージを送信
    /// フォーマット: [length: u32 little-endian][json_data: UTF-8 bytes]
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let json = serde_json::to_vec(self)
            .with_context(|| format!("Failed to serialize message to JSON: {:?}", self))?;

        writer
            .write_u32_le(json.len() as u32)
            .await
            .with_context(|| "Failed to write message length")?;
        writer
            .write_all(&json)
            .await
            .with_context(|| "Failed to write message data")?;
        writer.flush().await?;

        Ok(())
    }

    /// メッセージを受信
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let len = reader
            .read_u32_le()
            .await
            .with_context(|| "Failed to read message length")?;

        if len > MAX_MESSAGE_LEN {
            anyhow::bail!("Message too large: {} bytes", len);
        }

        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .await
            .with_context(|| "Failed to read message data")?;

        serde_json::from_slice(&buf).with_context(|| {
            format!(
                "Failed to deserialize JSON: {}",
                String::from_utf8_lossy(&buf)
            )
        })
    }
}

/// 受信を専用タスクで行い、メッセージをチャネルに流す
///
/// `read_from` はキャンセル安全ではないので、`select!` の分岐に直接置かない。
/// 読み込みエラーを1つ流した時点でタスクは終了する。
pub fn spawn_reader<R>(mut reader: R) -> (mpsc::Receiver<Result<Message>>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(32);
    let handle = tokio::spawn(async move {
        loop {
            let result = Message::read_from(&mut reader).await;
            let failed = result.is_err();
            if tx.send(result).await.is_err() || failed {
                break;
            }
        }
    });
    (rx, handle)
}

/// チャレンジに対する応答ダイジェスト
pub fn auth_digest(token: &str, nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(nonce.as_bytes());
    hex::encode(hasher.finalize())
}

/// ダイジェストを定数時間で比較
pub fn verify_digest(token: &str, nonce: &str, digest: &str) -> bool {
    let expected = auth_digest(token, nonce);
    if expected.len() != digest.len() {
        return false;
    }
    expected
        .bytes()
        .zip(digest.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// ランダムなhex文字列（nonce・セッションID用）
pub fn random_hex(bytes: usize) -> String {
    let buf: Vec<u8> = (0..bytes).map(|_| rand::random::<u8>()).collect();
    hex::encode(buf)
}
