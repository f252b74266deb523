//! 错误分类法：把 §7 描述的故障分层落地成一个可匹配的枚举。

use std::io;

/// 驱动日志字段与自动化处置策略的粗粒度分类。
///
/// `TransientSyscall`（EAGAIN/EINTR）刻意不出现在这里：它从不对用户可见，而是
/// 被完全吸收进 `Recv`/`Send` 的返回值里。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    PeerClosed,
    FatalIo,
    ProtocolViolation,
    ResolveFailure,
    Timeout,
    ConfigFailure,
}

/// `snet-core` 自身能产生的错误：主要来自套接字配置与资源限制调整。
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to raise RLIMIT_NOFILE to {requested}")]
    RlimitRaise { requested: u64 },

    #[error("reactor backend initialisation failed: {0}")]
    BackendInit(String),
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Io { .. } => ErrorCategory::FatalIo,
            Error::RlimitRaise { .. } => ErrorCategory::ConfigFailure,
            Error::BackendInit(_) => ErrorCategory::ConfigFailure,
        }
    }

    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        Error::Io { op, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
