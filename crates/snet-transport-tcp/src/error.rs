//! 传输层错误分类，对应 §7 的 `FatalIo` / `ConfigFailure` 两行。

use snet_core::ErrorCategory;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("listen on {addr} failed: {source}")]
    Listen {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("socket syscall failed: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransportError::Listen { .. } => ErrorCategory::ConfigFailure,
            TransportError::Connect { .. } | TransportError::Io(_) => ErrorCategory::FatalIo,
        }
    }
}
