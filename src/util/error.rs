use thiserror::Error;

/// Tunnel errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("DNS resolution failed for {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("No IPv4 address found for {0}")]
    NoAddress(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tunnel is closed")]
    Closed,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TunnelError>;
