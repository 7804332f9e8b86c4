//! mailpipe - TCP tunnel disguised as SMTP submission
//!
//! A relay node keeps one outbound session to a server node that looks like a
//! normal SMTP+STARTTLS submission dialogue on the wire. After `AUTH` the
//! session switches into a private binary mode that multiplexes any number of
//! TCP channels over the single TLS stream.
//!
//! ## Topology
//!
//! ```text
//! ┌───────────┐      ┌─────────────┐      ┌─────────────┐      ┌─────────┐
//! │ Local app │─────▶│   Relay     │─────▶│   Server    │─────▶│ Target  │
//! │           │ TCP  │ listeners   │ SMTP │  port 587   │ TCP  │ host    │
//! │           │◀─────│ (forwards)  │ +TLS │             │◀─────│         │
//! └───────────┘      └─────────────┘      └─────────────┘      └─────────┘
//! ```

pub mod auth;
pub mod config;
pub mod proto;
pub mod relay;
pub mod server;
pub mod tls;

// Re-export commonly used items
pub use config::{Config, ForwardRule, RelayConfig, ServerConfig, User};
pub use proto::{Frame, FrameType};

use thiserror::Error;

/// Error types for the tunnel core
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("tunnel not connected")]
    NotConnected,

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for the tunnel core
pub type Result<T> = std::result::Result<T, Error>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
