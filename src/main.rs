use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cmd_relay::{
    bind_server, default_config_path, parse_port_range, publish, run_relay, run_server,
    update_config_file, RelayOptions, ServerConfig, TunnelConfig, AUTHTOKEN_ENV,
};

#[derive(Parser)]
#[clap(name = "cmd-relay")]
#[clap(about = "A minimal Socket.IO command relay with optional tunneling", long_about = None)]
struct Cli {
    /// 設定ファイルのパス
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// サーバーモード: Socket.IOで待ち受け、トンネルで公開（デフォルト）
    Serve,

    /// リレーモード: トンネルクライアントを受け付ける
    Relay {
        /// バインドアドレス (例: 0.0.0.0:2333)
        #[clap(default_value = "0.0.0.0:2333")]
        bind_addr: String,

        /// クライアント認証用トークン（省略時は CMD_RELAY_AUTHTOKEN）
        #[clap(long)]
        authtoken: Option<String>,

        /// クライアントに通知する公開ホスト名
        #[clap(long)]
        public_host: Option<String>,

        /// 公開ポートの範囲 START-END（両端を含む）
        #[clap(long, default_value = "35100-35200")]
        port_range: String,
    },

    /// 設定ファイルを編集
    Config {
        #[clap(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 認証トークンを保存
    AddAuthtoken { token: String },

    /// リレーのアドレスを保存
    AddRelay { addr: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // ロギング設定
    let is_atty = atty::is(atty::Stream::Stdout);
    let level = "info";
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::from(level)),
        )
        .with_ansi(is_atty)
        .init();

    #[cfg(unix)]
    {
        let _ = fdlimit::raise_fd_limit();
    }

    let cli = Cli::parse();

    // Ctrl+Cハンドラー
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            panic!("Failed to listen for ctrl-c signal: {:?}", e);
        }
        let _ = shutdown_tx.send(());
    });

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cli.config, shutdown_rx).await?,
        Commands::Relay {
            bind_addr,
            authtoken,
            public_host,
            port_range,
        } => {
            let authtoken = authtoken
                .or_else(|| std::env::var(AUTHTOKEN_ENV).ok())
                .filter(|t| !t.trim().is_empty())
                .context("An authtoken is required: pass --authtoken or set CMD_RELAY_AUTHTOKEN")?;
            let bind_host = bind_addr
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            let options = RelayOptions {
                authtoken,
                public_host,
                bind_host,
                port_range: parse_port_range(&port_range)?,
            };

            let listener = TcpListener::bind(&bind_addr)
                .await
                .with_context(|| format!("Failed to bind to {}", bind_addr))?;
            run_relay(listener, options, shutdown_rx).await?;
        }
        Commands::Config { action } => {
            let path = match cli.config {
                Some(path) => path,
                None => default_config_path()?,
            };
            match action {
                ConfigAction::AddAuthtoken { token } => {
                    update_config_file(&path, |c| c.authtoken = Some(token))?;
                    println!("Authtoken saved to {}", path.display());
                }
                ConfigAction::AddRelay { addr } => {
                    update_config_file(&path, |c| c.relay_addr = Some(addr))?;
                    println!("Relay address saved to {}", path.display());
                }
            }
        }
    }

    Ok(())
}

/// サーバーを起動し、トンネル公開をバックグラウンドで開始
async fn serve(config_path: Option<PathBuf>, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    let server_config = ServerConfig::from_env()?;

    let listener = bind_server(&server_config).await?;
    let port = listener.local_addr()?.port();

    let tunnel_config = load_tunnel_config(config_path)?;
    // 待たない: 失敗はタスク内でログに出る
    publish(port, tunnel_config);

    run_server(listener, server_config, shutdown_rx).await?;
    info!("Bye");
    Ok(())
}

fn load_tunnel_config(config_path: Option<PathBuf>) -> Result<TunnelConfig> {
    let path = match config_path {
        Some(path) => path,
        None => match default_config_path() {
            Ok(path) => path,
            Err(e) => {
                warn!("{:#}", e);
                return Ok(TunnelConfig::default().with_env());
            }
        },
    };
    Ok(TunnelConfig::load(&path)?.with_env())
}
