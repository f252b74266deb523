//! 就绪事件反应器：单线程、基于 slab 句柄的事件循环。
//!
//! ## 设计动机（Why）
//! - 原始实现以注册对象的裸指针作为反应器索引键；在 Rust 里这会立刻引入悬垂
//!   指针风险。本实现改用 slab 分配的 [`HandlerToken`]：删除一个句柄会立即
//!   清空其 arena 槽位，哪怕当前这一批就绪事件里还带着该句柄的编号。
//! - 处理器本身以 `Weak<RefCell<dyn EventHandler>>` 形式保存：反应器不拥有
//!   处理器的生存期，真正的所有者（例如一个 `Connection`）随时可能被丢弃；
//!   派发前先尝试升级弱引用，升级失败就静默丢弃这次事件。
//!
//! ## 契约（What）
//! - 每次 `run_once` 最多等待 [`POLL_TIMEOUT`]，保证定时器和循环处理器有
//!   固定的服务间隔；
//! - 同一次迭代里，每个就绪句柄先收到一次 `on_readable`，再收到一次
//!   `on_writable`，随后所有循环处理器各被 tick 一次。

mod backend;
#[cfg(target_os = "linux")]
mod epoll;
#[cfg(not(target_os = "linux"))]
mod kqueue;

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use slab::Slab;

use backend::Backend;

/// 反应器每次等待就绪事件的超时上限，保证定时器和循环处理器的服务间隔。
pub const POLL_TIMEOUT: Duration = Duration::from_millis(20);

/// 一个 fd 上关心的读/写就绪位掩码。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event(u8);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READ: Event = Event(0b01);
    pub const WRITE: Event = Event(0b10);

    pub fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Event {
    type Output = Event;
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for Event {
    type Output = Event;
    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl std::ops::Not for Event {
    type Output = Event;
    fn not(self) -> Event {
        Event(!self.0 & 0b11)
    }
}

/// 一个已注册 fd 的读写就绪回调。
///
/// 实现者通常是某个拥有 fd 的类型（如 `Connection`）背后的内部状态，经由
/// `Rc<RefCell<_>>` 共享；反应器只持有弱引用。
pub trait EventHandler {
    fn fd(&self) -> RawFd;
    fn interest(&self) -> Event;
    fn on_readable(&mut self);
    fn on_writable(&mut self);
}

/// 每次反应器迭代都会被调用一次的钩子，与具体 fd 无关。
pub trait LoopHandler {
    fn on_tick(&mut self);
    fn on_shutdown(&mut self);
}

/// 一个已注册 [`EventHandler`] 的不透明句柄。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(usize);

/// 一个已注册 [`LoopHandler`] 的不透明句柄。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopHandlerToken(usize);

struct HandlerSlot {
    fd: RawFd,
    handler: Weak<RefCell<dyn EventHandler>>,
}

/// 单线程就绪反应器：epoll（Linux）或 kqueue（其余类 Unix）。
pub struct EventLoop {
    backend: Box<dyn Backend>,
    handlers: Slab<HandlerSlot>,
    loop_handlers: Slab<Weak<RefCell<dyn LoopHandler>>>,
    stopped: bool,
}

impl EventLoop {
    /// 构造反应器，按目标平台选择后端。创建失败时退化为一个永不派发事件的
    /// 惰性反应器（镜像原始实现把后端创建失败当作“静默失效”处理）。
    pub fn new() -> Self {
        let backend = Self::create_backend();
        Self {
            backend,
            handlers: Slab::new(),
            loop_handlers: Slab::new(),
            stopped: false,
        }
    }

    #[cfg(target_os = "linux")]
    fn create_backend() -> Box<dyn Backend> {
        match epoll::EpollBackend::new() {
            Ok(b) => Box::new(b),
            Err(err) => {
                tracing::error!(%err, "failed to initialise epoll backend, reactor is inert");
                Box::new(backend::InertBackend)
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn create_backend() -> Box<dyn Backend> {
        match kqueue::KqueueBackend::new() {
            Ok(b) => Box::new(b),
            Err(err) => {
                tracing::error!(%err, "failed to initialise kqueue backend, reactor is inert");
                Box::new(backend::InertBackend)
            }
        }
    }

    /// 注册一个事件处理器，返回可用于后续 update/del 调用的句柄。
    pub fn add_event_handler(&mut self, handler: &Rc<RefCell<dyn EventHandler>>) -> HandlerToken {
        let (fd, interest) = {
            let h = handler.borrow();
            (h.fd(), h.interest())
        };
        let index = self.handlers.insert(HandlerSlot {
            fd,
            handler: Rc::downgrade(handler),
        });
        let token = HandlerToken(index);
        if let Err(err) = self.backend.register(fd, token, interest) {
            tracing::warn!(%err, fd, "register failed, swallowed per reactor contract");
        }
        token
    }

    /// 注销一个事件处理器。调用返回后，该句柄不会再收到任何回调，即便本次
    /// 迭代里已经取到了包含它的就绪批次——派发时会发现槽位已清空而跳过。
    pub fn del_event_handler(&mut self, token: HandlerToken) {
        if let Some(slot) = self.handlers.try_remove(token.0) {
            if let Err(err) = self.backend.deregister(slot.fd, token) {
                tracing::warn!(%err, fd = slot.fd, "deregister failed, swallowed per reactor contract");
            }
        }
    }

    /// 重新同步内核关心的事件位与处理器当前的 `interest()`。
    pub fn update_events(&mut self, token: HandlerToken) {
        let Some(slot) = self.handlers.get(token.0) else {
            return;
        };
        let fd = slot.fd;
        let Some(handler) = slot.handler.upgrade() else {
            return;
        };
        let interest = handler.borrow().interest();
        if let Err(err) = self.backend.modify(fd, token, interest) {
            tracing::warn!(%err, fd, "update failed, swallowed per reactor contract");
        }
    }

    pub fn add_loop_handler(&mut self, handler: &Rc<RefCell<dyn LoopHandler>>) -> LoopHandlerToken {
        LoopHandlerToken(self.loop_handlers.insert(Rc::downgrade(handler)))
    }

    pub fn del_loop_handler(&mut self, token: LoopHandlerToken) {
        self.loop_handlers.try_remove(token.0);
    }

    /// 阻塞运行，直到 [`Self::stop`] 被调用。
    ///
    /// 以关联函数的形式接收 `&Rc<RefCell<EventLoop>>` 而非 `&mut self`：
    /// 派发期间任何处理器都可能通过同一个 `Rc<RefCell<EventLoop>>` 重入反应器
    /// （注册新连接、更新事件位、注销自己），如果这里像早期实现那样在整个循环
    /// 期间持有一个 `borrow_mut()` guard，第一次重入就会 panic。因此这里只在
    /// 每一步短暂借用一次，绝不跨越处理器回调持有借用。
    pub fn run(reactor: &Rc<RefCell<EventLoop>>) {
        loop {
            if reactor.borrow().stopped {
                break;
            }
            Self::run_once(reactor);
        }
        Self::dispatch_shutdown(reactor);
    }

    /// 执行恰好一次迭代：等待就绪、按 Read-before-Write 派发，然后 tick 所有
    /// 循环处理器。供测试和需要与其他事件源交叉驱动的调用方使用。
    ///
    /// 同 [`Self::run`]：每一次借用都在用完即放，派发处理器回调时不持有任何
    /// 反应器借用，回调内部重入 `reactor.borrow_mut()` 才是安全的。
    pub fn run_once(reactor: &Rc<RefCell<EventLoop>>) {
        let ready = reactor.borrow_mut().backend.poll(POLL_TIMEOUT);
        for (token, event) in ready {
            let handler = {
                let r = reactor.borrow();
                match r.handlers.get(token.0) {
                    Some(slot) => slot.handler.upgrade(),
                    None => None, // 槽位已在本批次取出之后被删除，静默丢弃。
                }
            };
            let Some(handler) = handler else {
                continue;
            };
            if event.contains(Event::READ) {
                handler.borrow_mut().on_readable();
            }
            // 重新检查槽位：on_readable 可能已经把自己从反应器上摘下。
            let still_registered = reactor.borrow().handlers.contains(token.0);
            if event.contains(Event::WRITE) && still_registered {
                handler.borrow_mut().on_writable();
            }
        }

        let loop_handlers: Vec<Weak<RefCell<dyn LoopHandler>>> = reactor
            .borrow()
            .loop_handlers
            .iter()
            .map(|(_, weak)| weak.clone())
            .collect();
        for weak in loop_handlers {
            if let Some(handler) = weak.upgrade() {
                handler.borrow_mut().on_tick();
            }
        }
    }

    /// 请求退出：`run()` 会在当前迭代结束后返回，并派发一次 shutdown 钩子。
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    fn dispatch_shutdown(reactor: &Rc<RefCell<EventLoop>>) {
        let loop_handlers: Vec<Weak<RefCell<dyn LoopHandler>>> = reactor
            .borrow()
            .loop_handlers
            .iter()
            .map(|(_, weak)| weak.clone())
            .collect();
        for weak in loop_handlers {
            if let Some(handler) = weak.upgrade() {
                handler.borrow_mut().on_shutdown();
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingLoopHandler {
        ticks: usize,
        shutdowns: usize,
    }

    impl LoopHandler for CountingLoopHandler {
        fn on_tick(&mut self) {
            self.ticks += 1;
        }
        fn on_shutdown(&mut self) {
            self.shutdowns += 1;
        }
    }

    #[test]
    fn loop_handler_ticks_once_per_iteration() {
        let reactor = Rc::new(RefCell::new(EventLoop::new()));
        let handler = Rc::new(RefCell::new(CountingLoopHandler {
            ticks: 0,
            shutdowns: 0,
        }));
        let dyn_handler: Rc<RefCell<dyn LoopHandler>> = handler.clone();
        reactor.borrow_mut().add_loop_handler(&dyn_handler);

        EventLoop::run_once(&reactor);
        EventLoop::run_once(&reactor);
        EventLoop::run_once(&reactor);

        assert_eq!(handler.borrow().ticks, 3);
        assert_eq!(handler.borrow().shutdowns, 0);
    }

    #[test]
    fn dropped_loop_handler_is_silently_skipped() {
        let reactor = Rc::new(RefCell::new(EventLoop::new()));
        {
            let handler = Rc::new(RefCell::new(CountingLoopHandler {
                ticks: 0,
                shutdowns: 0,
            }));
            let dyn_handler: Rc<RefCell<dyn LoopHandler>> = handler.clone();
            reactor.borrow_mut().add_loop_handler(&dyn_handler);
        } // handler dropped here, only the weak ref remains registered

        // Must not panic despite the dangling weak reference.
        EventLoop::run_once(&reactor);
    }

    #[test]
    fn stop_runs_shutdown_hook_exactly_once() {
        let reactor = Rc::new(RefCell::new(EventLoop::new()));
        let handler = Rc::new(RefCell::new(CountingLoopHandler {
            ticks: 0,
            shutdowns: 0,
        }));
        let dyn_handler: Rc<RefCell<dyn LoopHandler>> = handler.clone();
        reactor.borrow_mut().add_loop_handler(&dyn_handler);

        reactor.borrow_mut().stop();
        EventLoop::run(&reactor);

        assert_eq!(handler.borrow().shutdowns, 1);
    }

    #[test]
    fn reentrant_registration_during_dispatch_does_not_panic() {
        // A loop handler that registers another loop handler from inside
        // on_tick, simulating a connection callback that reaches back into
        // the reactor it was dispatched from.
        struct Reentrant {
            reactor: Rc<RefCell<EventLoop>>,
            registered: bool,
        }
        impl LoopHandler for Reentrant {
            fn on_tick(&mut self) {
                if !self.registered {
                    self.registered = true;
                    let inert: Rc<RefCell<dyn LoopHandler>> =
                        Rc::new(RefCell::new(CountingLoopHandler {
                            ticks: 0,
                            shutdowns: 0,
                        }));
                    self.reactor.borrow_mut().add_loop_handler(&inert);
                }
            }
            fn on_shutdown(&mut self) {}
        }

        let reactor = Rc::new(RefCell::new(EventLoop::new()));
        let handler = Rc::new(RefCell::new(Reentrant {
            reactor: reactor.clone(),
            registered: false,
        }));
        let dyn_handler: Rc<RefCell<dyn LoopHandler>> = handler.clone();
        reactor.borrow_mut().add_loop_handler(&dyn_handler);

        EventLoop::run_once(&reactor);
        EventLoop::run_once(&reactor);
    }
}
