use anyhow::{anyhow, Context, Result};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};
use url::Url;

use crate::client::{self, ClientOptions};
use crate::config::TunnelConfig;

/// 確立されたトンネル
pub struct Tunnel {
    // 再接続で変わることがある
    public_url: watch::Receiver<Url>,
    local_port: u16,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

impl Tunnel {
    /// 現在の公開アドレス (tcp://host:port)
    pub fn public_url(&self) -> Url {
        self.public_url.borrow().clone()
    }

    /// 割り当てられたリモートポートを取得
    pub fn remote_port(&self) -> u16 {
        self.public_url.borrow().port().unwrap_or_default()
    }

    /// 再接続で公開アドレスが変わるまで待つ
    pub async fn public_url_changed(&mut self) -> Result<Url> {
        self.public_url
            .changed()
            .await
            .context("Tunnel client stopped")?;
        Ok(self.public_url())
    }

    /// ローカルポートを取得
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// バックグラウンドのクライアントが終わるまで待つ
    pub async fn wait(self) -> Result<()> {
        let Tunnel {
            shutdown_tx, handle, ..
        } = self;
        let result = handle.await?;
        drop(shutdown_tx);
        result
    }

    /// トンネルをシャットダウン
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.handle.await??;
        Ok(())
    }
}

/// トンネルを開始
///
/// 接続は1回だけ試みる。確立後の切断はバックグラウンドで再接続する。
///
/// # 戻り値
/// 確立されたトンネル。公開アドレスを含む。
///
/// # 例
/// ```no_run
/// use cmd_relay::{start_tunnel, ClientOptions};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let options = ClientOptions {
///         relay_addr: "relay.example.com:2333".to_string(),
///         authtoken: Some("secret".to_string()),
///         local_port: 3000,
///         public_host: None,
///     };
///     let tunnel = start_tunnel(options).await?;
///     println!("Public URL: {}", tunnel.public_url());
///
///     tokio::signal::ctrl_c().await?;
///     tunnel.shutdown().await?;
///     Ok(())
/// }
/// ```
pub async fn start_tunnel(options: ClientOptions) -> Result<Tunnel> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let established = client::connect_and_get_port(&options).await?;
    let (url_tx, url_rx) = watch::channel(established.public_url(&options)?);

    let local_port = options.local_port;
    let handle = tokio::spawn(client::run_client(options, established, url_tx, shutdown_rx));

    Ok(Tunnel {
        public_url: url_rx,
        local_port,
        shutdown_tx,
        handle,
    })
}

/// サーバーのポートをトンネルで公開する（fire-and-forget）
///
/// 失敗してもエラーと設定手順をログに出すだけで、呼び出し側には伝えない。
pub fn publish(local_port: u16, config: TunnelConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let tunnel = match open(local_port, &config).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                error!("Failed to start tunnel: {:#}", e);
                println!("{}", guidance(&config));
                return;
            }
        };

        let public_url = tunnel.public_url();
        info!("Tunnel published at {}", public_url);
        println!("{}", banner(local_port, &public_url));

        // Tunnel をドロップするとクライアントが止まるので保持したまま待つ
        if let Err(e) = tunnel.wait().await {
            error!("Tunnel client stopped: {:#}", e);
        }
    })
}

async fn open(local_port: u16, config: &TunnelConfig) -> Result<Tunnel> {
    let relay_addr = config
        .relay_addr
        .clone()
        .ok_or_else(|| anyhow!("Relay address is not configured"))?;
    let options = ClientOptions {
        relay_addr,
        authtoken: config.authtoken.clone(),
        local_port,
        public_host: config.public_host.clone(),
    };
    start_tunnel(options).await
}

/// 成功時のバナー
pub fn banner(local_port: u16, public_url: &Url) -> String {
    let local = format!("http://localhost:{}", local_port);
    let lines = [
        "Socket.IO relay running".to_string(),
        format!("LOCAL URL:  {}", local),
        format!("PUBLIC URL: {}", public_url),
    ];
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 2;
    let bar = "═".repeat(width);

    let mut out = format!("╔{}╗\n", bar);
    for (i, line) in lines.iter().enumerate() {
        out.push_str(&format!("║ {:<w$} ║\n", line, w = width - 2));
        if i == 0 {
            out.push_str(&format!("╠{}╣\n", bar));
        }
    }
    out.push_str(&format!("╚{}╝", bar));
    out
}

/// 失敗時の設定手順
pub fn guidance(config: &TunnelConfig) -> String {
    let mut steps = Vec::new();
    match &config.signup_url {
        Some(url) => steps.push(format!("Sign up at {}", url)),
        None => steps.push("Ask your relay operator for an account".to_string()),
    }
    match &config.authtoken_url {
        Some(url) => steps.push(format!("Get your authtoken at {}", url)),
        None => steps.push("Get an authtoken from your relay operator".to_string()),
    }
    steps.push("Configure the token: cmd-relay config add-authtoken <TOKEN>".to_string());
    if config.relay_addr.is_none() {
        steps.push("Configure the relay: cmd-relay config add-relay <HOST:PORT>".to_string());
    }

    let mut out = String::from("\nTo publish this server you need a relay authtoken:\n");
    for (i, step) in steps.iter().enumerate() {
        out.push_str(&format!("   {}. {}\n", i + 1, step));
    }
    out.push_str("\nMeanwhile, the Socket.IO server keeps running locally.");
    out
}
