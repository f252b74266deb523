//! SOCKS5 会话层错误分类，覆盖 §7 中与方法协商/地址解析相关的条目。

use snet_core::ErrorCategory;

#[derive(Debug, thiserror::Error)]
pub enum Socks5Error {
    #[error("peer closed the SOCKS5 connection")]
    PeerClosed,

    #[error("SOCKS5 socket I/O failed: {0}")]
    Io(std::io::Error),

    #[error("unsupported SOCKS5 version byte {0:#x}")]
    UnsupportedVersion(u8),

    #[error("no acceptable authentication method offered by the client")]
    NoAcceptableMethod,

    #[error("unsupported SOCKS5 command byte {0:#x} (only CONNECT is implemented)")]
    UnsupportedCommand(u8),

    #[error("unsupported address type byte {0:#x} (only DOMAIN-NAME is implemented)")]
    UnsupportedAddressType(u8),
}

impl Socks5Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Socks5Error::PeerClosed => ErrorCategory::PeerClosed,
            Socks5Error::Io(_) => ErrorCategory::FatalIo,
            Socks5Error::UnsupportedVersion(_)
            | Socks5Error::NoAcceptableMethod
            | Socks5Error::UnsupportedCommand(_)
            | Socks5Error::UnsupportedAddressType(_) => ErrorCategory::ProtocolViolation,
        }
    }
}
