//! 服务端编排层错误分类，覆盖监听绑定与配置解析两类场景。

use snet_core::ErrorCategory;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind the tunnel listener on {addr}: {source}")]
    Listen {
        addr: std::net::SocketAddr,
        #[source]
        source: snet_transport_tcp::TransportError,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl ServerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ServerError::Listen { .. } => ErrorCategory::ConfigFailure,
            ServerError::Config(_) => ErrorCategory::ConfigFailure,
        }
    }
}
