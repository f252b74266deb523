//! 反应器后端的统一接口：epoll 与 kqueue 实现同一份语义。

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::{Event, HandlerToken};

pub trait Backend {
    fn register(&mut self, fd: RawFd, token: HandlerToken, interest: Event) -> io::Result<()>;
    fn deregister(&mut self, fd: RawFd, token: HandlerToken) -> io::Result<()>;
    fn modify(&mut self, fd: RawFd, token: HandlerToken, interest: Event) -> io::Result<()>;

    /// 等待至多 `timeout`，返回就绪的 `(句柄, 事件)` 对。
    fn poll(&mut self, timeout: Duration) -> Vec<(HandlerToken, Event)>;
}

/// 后端初始化失败时的退化实现：从不注册任何兴趣，`poll` 只是睡眠整个超时
/// 窗口。反应器因此表现为“活着但从不派发”，与规范里“后端创建失败只表现
/// 为一个惰性反应器”的失败语义一致。
pub struct InertBackend;

impl Backend for InertBackend {
    fn register(&mut self, _fd: RawFd, _token: HandlerToken, _interest: Event) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _fd: RawFd, _token: HandlerToken) -> io::Result<()> {
        Ok(())
    }

    fn modify(&mut self, _fd: RawFd, _token: HandlerToken, _interest: Event) -> io::Result<()> {
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Vec<(HandlerToken, Event)> {
        std::thread::sleep(timeout);
        Vec::new()
    }
}
