//! Transparent WebSocket Tunnel Relay
//!
//! Disguises arbitrary TCP traffic (typically to a VPN daemon) as a WebSocket
//! session. Inbound connections are classified by their first bytes: clients
//! that already performed a WebSocket upgrade are relayed verbatim, while
//! clients that did not get a forged upgrade response before the relay begins.
//! Payloads are never framed or inspected beyond the initial header scan.

pub mod config;
pub mod handshake;
pub mod server;
pub mod session;

// Re-export commonly used types and functions
pub use config::{Config, ListenConfig, TargetConfig, load_config};
pub use handshake::{Classification, HandshakeFields, accept_token, upgrade_response};
pub use server::Registry;
pub use session::{BUFFER_SIZE, Session};
