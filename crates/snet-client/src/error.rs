//! 客户端编排层错误分类，覆盖配置解析与握手失败两类场景。

use snet_core::ErrorCategory;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to bind the local SOCKS5 listener on {addr}: {source}")]
    Listen {
        addr: std::net::SocketAddr,
        #[source]
        source: snet_transport_tcp::TransportError,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl ClientError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ClientError::Listen { .. } => ErrorCategory::ConfigFailure,
            ClientError::Config(_) => ErrorCategory::ConfigFailure,
        }
    }
}
