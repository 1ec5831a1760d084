// Socket.IO コマンド/イベントリレー
// ping を受け取って pong を返し、必要ならトンネルでポートを公開する

mod client;
mod codec;
mod config;
mod engine;
mod message;
mod port_allocator;
mod protocol;
mod relay;
mod server;
mod tunnel;

// パブリックAPI
pub use client::ClientOptions;
pub use codec::{Handshake, Packet, SocketPacket, RECORD_SEPARATOR};
pub use config::{
    default_config_path, parse_port, update_config_file, ServerConfig, TunnelConfig, AUTHTOKEN_ENV,
    DEFAULT_PORT,
};
pub use message::{now_millis, respond, Command, Event};
pub use port_allocator::parse_port_range;
pub use relay::{run_relay, RelayOptions};
pub use server::{bind_server, run_server};
pub use tunnel::{publish, start_tunnel, Tunnel};
