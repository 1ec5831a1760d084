mod common;

use std::net::SocketAddr;

use cmd_relay::{bind_server, run_server, ServerConfig, TunnelConfig, DEFAULT_PORT};
use common::SioClient;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

// 環境変数はプロセス全体で共有されるので、1つのテストにまとめる
#[tokio::test]
async fn test_config_from_env() {
    std::env::remove_var("PORT");
    assert_eq!(ServerConfig::from_env().unwrap().port, DEFAULT_PORT);
    assert_eq!(DEFAULT_PORT, 3000);

    std::env::set_var("PORT", "");
    assert_eq!(ServerConfig::from_env().unwrap().port, 3000);

    std::env::set_var("PORT", "8080");
    assert_eq!(ServerConfig::from_env().unwrap().port, 8080);

    std::env::set_var("PORT", "not-a-port");
    assert!(ServerConfig::from_env().is_err());

    // PORT で指定したポートで実際に待ち受ける
    let free_port = {
        let scratch = TcpListener::bind("0.0.0.0:0").await.unwrap();
        scratch.local_addr().unwrap().port()
    };
    std::env::set_var("PORT", free_port.to_string());
    let config = ServerConfig::from_env().unwrap();
    let listener = bind_server(&config).await.unwrap();
    assert_eq!(listener.local_addr().unwrap().port(), free_port);
    std::env::remove_var("PORT");

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(run_server(listener, config, shutdown_rx));
    let addr: SocketAddr = format!("127.0.0.1:{}", free_port).parse().unwrap();
    let mut client = SioClient::connect(addr).await;
    client.ping().await;

    std::env::set_var("CMD_RELAY_ADDR", "relay.example.com:2333");
    std::env::set_var("CMD_RELAY_AUTHTOKEN", "env-token");
    let config = TunnelConfig::default().with_env();
    assert_eq!(config.relay_addr.as_deref(), Some("relay.example.com:2333"));
    assert_eq!(config.authtoken.as_deref(), Some("env-token"));
    std::env::remove_var("CMD_RELAY_ADDR");
    std::env::remove_var("CMD_RELAY_AUTHTOKEN");
}
