//! 隧道层错误分类，覆盖 §7 中与握手/保活/成帧相关的条目。

use snet_core::ErrorCategory;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("peer closed the tunnel connection")]
    PeerClosed,

    #[error("tunnel socket I/O failed: {0}")]
    Io(std::io::Error),

    #[error("VERIFY_DATA mismatch during handshake")]
    VerifyMismatch,

    #[error("malformed tunnel record: {0}")]
    Protocol(String),

    #[error("alive timeout: no inbound bytes within the configured window")]
    AliveTimeout,

    #[error(transparent)]
    Cipher(#[from] snet_cipher::CipherError),
}

impl TunnelError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TunnelError::PeerClosed => ErrorCategory::PeerClosed,
            TunnelError::Io(_) => ErrorCategory::FatalIo,
            TunnelError::VerifyMismatch | TunnelError::Protocol(_) => {
                ErrorCategory::ProtocolViolation
            }
            TunnelError::AliveTimeout => ErrorCategory::Timeout,
            TunnelError::Cipher(_) => ErrorCategory::ConfigFailure,
        }
    }
}
