use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_PORT: u16 = 3000;

pub const PORT_ENV: &str = "PORT";
pub const RELAY_ADDR_ENV: &str = "CMD_RELAY_ADDR";
pub const AUTHTOKEN_ENV: &str = "CMD_RELAY_AUTHTOKEN";

const CONFIG_DIR: &str = "cmd-relay";
const CONFIG_FILE: &str = "cmd-relay.toml";

// Socket.IO サーバーのデフォルト値に合わせる
const PING_INTERVAL: Duration = Duration::from_secs(25);
const PING_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_PAYLOAD: usize = 1_000_000;

/// リレーサーバーの設定
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub max_payload: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            ping_interval: PING_INTERVAL,
            ping_timeout: PING_TIMEOUT,
            max_payload: MAX_PAYLOAD,
        }
    }
}

impl ServerConfig {
    /// 環境変数 `PORT` から設定を作成
    pub fn from_env() -> Result<Self> {
        let port = parse_port(std::env::var(PORT_ENV).ok().as_deref())?;
        Ok(Self {
            port,
            ..Default::default()
        })
    }
}

/// `PORT` の値を解釈する。未設定・空文字列はデフォルトポート。
pub fn parse_port(value: Option<&str>) -> Result<u16> {
    match value.map(str::trim) {
        None | Some("") => Ok(DEFAULT_PORT),
        Some(v) => v
            .parse::<u16>()
            .with_context(|| format!("Invalid {} value: {:?}", PORT_ENV, v)),
    }
}

/// トンネル設定（設定ファイル + 環境変数）
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    /// リレーサービスのアドレス (例: relay.example.com:2333)
    pub relay_addr: Option<String>,
    pub authtoken: Option<String>,
    /// 公開URLに使うホスト名。リレーが通知しない場合に使う
    pub public_host: Option<String>,
    /// 案内メッセージに表示するURL
    pub signup_url: Option<Url>,
    pub authtoken_url: Option<Url>,
}

impl TunnelConfig {
    /// 設定ファイルを読み込む。ファイルが無ければデフォルト
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&s).with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// 設定ファイルに書き込む
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        }
        let s = toml::to_string(self).context("Failed to serialize config")?;
        std::fs::write(path, s)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    /// 環境変数で上書き
    pub fn with_env(mut self) -> Self {
        self.apply_overrides(
            std::env::var(RELAY_ADDR_ENV).ok(),
            std::env::var(AUTHTOKEN_ENV).ok(),
        );
        self
    }

    fn apply_overrides(&mut self, relay_addr: Option<String>, authtoken: Option<String>) {
        if let Some(addr) = relay_addr.filter(|s| !s.trim().is_empty()) {
            self.relay_addr = Some(addr);
        }
        if let Some(token) = authtoken.filter(|s| !s.trim().is_empty()) {
            self.authtoken = Some(token);
        }
    }
}

/// デフォルトの設定ファイルパス
///
/// `$XDG_CONFIG_HOME/cmd-relay/cmd-relay.toml`、無ければ `$HOME/.config/...`
pub fn default_config_path() -> Result<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => {
            let home = std::env::var_os("HOME")
                .filter(|v| !v.is_empty())
                .context("Neither XDG_CONFIG_HOME nor HOME is set; pass --config")?;
            PathBuf::from(home).join(".config")
        }
    };
    Ok(base.join(CONFIG_DIR).join(CONFIG_FILE))
}

/// 設定ファイルの1項目だけ更新する（他の項目は保持）
pub fn update_config_file(path: &Path, f: impl FnOnce(&mut TunnelConfig)) -> Result<()> {
    let mut config = TunnelConfig::load(path)?;
    f(&mut config);
    config.save(path)
}
