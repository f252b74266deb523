//! 非阻塞 TCP 连接：排队写、读回调、可在反应器之间转移。
//!
//! ## 契约 (What)
//! - 发送队列非空时写就绪位必须打开；队列为空时必须关闭；
//! - 读就绪被关闭后，不会再触发可读回调（对应对端关闭后的防止忙轮询）；
//! - `close` 幂等；`change_event_loop` 保留已启用的事件位，仅切换注册的反应器。

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;

use snet_core::reactor::{Event, EventHandler, EventLoop, HandlerToken};
use snet_core::Buffer;

use crate::error::TransportError;

/// `Connection::recv` 的结果，镜像 §4.2 的判别式。
#[derive(Debug)]
pub enum RecvOutcome {
    /// 读到了 `n > 0` 字节，已写入调用方缓冲区的 `pos..pos+n`。
    Data(usize),
    /// 对端已关闭写端；读就绪已被禁用，不会再触发回调。
    PeerClosed,
    /// EAGAIN/EINTR：当前没有可用数据。
    NoAvailData,
    /// 不可重试的系统调用失败。
    Error(std::io::Error),
}

/// `Connection::send` 的结果。
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Ok,
    Error,
}

struct Raii(RawFd);

impl Drop for Raii {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe {
                libc::close(self.0);
            }
        }
    }
}

struct Inner {
    fd: Raii,
    reactor: Option<Rc<RefCell<EventLoop>>>,
    token: Option<HandlerToken>,
    send_queue: VecDeque<Buffer>,
    enabled: Event,
    on_receivable: Option<Box<dyn FnMut()>>,
    on_error: Option<Box<dyn FnMut()>>,
    on_send_complete: Option<Box<dyn FnMut()>>,
}

impl Inner {
    fn write_one(&mut self, buffer: &mut Buffer) -> Result<(), ()> {
        let bytes = unsafe {
            libc::send(
                self.fd.0,
                buffer.unread().as_ptr() as *const libc::c_void,
                buffer.remaining(),
                0,
            )
        };
        if bytes < 0 {
            let err = std::io::Error::last_os_error();
            let retryable = matches!(
                err.raw_os_error(),
                Some(libc::EAGAIN) | Some(libc::EINTR)
            );
            if !retryable {
                return Err(());
            }
            return Ok(()); // no progress this round, not an error
        }
        buffer.advance(bytes as usize);
        Ok(())
    }
}

impl EventHandler for Inner {
    fn fd(&self) -> RawFd {
        self.fd.0
    }

    fn interest(&self) -> Event {
        self.enabled
    }

    fn on_readable(&mut self) {
        if let Some(cb) = self.on_receivable.as_mut() {
            cb();
        }
    }

    fn on_writable(&mut self) {
        while let Some(front) = self.send_queue.front_mut() {
            match self.write_one(front) {
                Err(()) => {
                    self.enabled = self.enabled & !Event::WRITE;
                    self.sync_events();
                    if let Some(cb) = self.on_error.as_mut() {
                        cb();
                    }
                    return;
                }
                Ok(()) => {
                    if !front.is_drained() {
                        break; // partial write; kernel buffer is full for now
                    }
                }
            }
            self.send_queue.pop_front();
        }

        if self.send_queue.is_empty() {
            self.enabled = self.enabled & !Event::WRITE;
            self.sync_events();
            if let Some(cb) = self.on_send_complete.as_mut() {
                cb();
            }
        }
    }
}

impl Inner {
    fn sync_events(&mut self) {
        if let (Some(reactor), Some(token)) = (&self.reactor, self.token) {
            reactor.borrow_mut().update_events(token);
        }
    }
}

/// A non-blocking TCP connection shared between the reactor's registration
/// and whatever composition layer owns it.
#[derive(Clone)]
pub struct Connection(Rc<RefCell<Inner>>);

impl Connection {
    /// 用一个已经是非阻塞模式的 fd 构造连接，可选地立即挂到一个反应器上。
    pub fn new(fd: RawFd, reactor: Option<Rc<RefCell<EventLoop>>>) -> Self {
        let inner = Rc::new(RefCell::new(Inner {
            fd: Raii(fd),
            reactor: None,
            token: None,
            send_queue: VecDeque::new(),
            enabled: Event::READ,
            on_receivable: None,
            on_error: None,
            on_send_complete: None,
        }));

        let conn = Self(inner);
        if let Some(reactor) = reactor {
            conn.attach(reactor);
        }
        conn
    }

    fn attach(&self, reactor: Rc<RefCell<EventLoop>>) {
        let handler: Rc<RefCell<dyn EventHandler>> = self.0.clone();
        let token = reactor.borrow_mut().add_event_handler(&handler);
        let mut inner = self.0.borrow_mut();
        inner.reactor = Some(reactor);
        inner.token = Some(token);
    }

    pub fn set_on_receivable(&self, cb: impl FnMut() + 'static) {
        self.0.borrow_mut().on_receivable = Some(Box::new(cb));
    }

    pub fn set_on_error(&self, cb: impl FnMut() + 'static) {
        self.0.borrow_mut().on_error = Some(Box::new(cb));
    }

    pub fn set_on_send_complete(&self, cb: impl FnMut() + 'static) {
        self.0.borrow_mut().on_send_complete = Some(Box::new(cb));
    }

    /// 排队发送一个缓冲区。队列为空时先尝试一次立即写入。
    pub fn send(&self, mut buffer: Buffer) -> SendOutcome {
        let mut inner = self.0.borrow_mut();

        if !inner.send_queue.is_empty() {
            inner.send_queue.push_back(buffer);
            return SendOutcome::Ok;
        }

        if inner.write_one(&mut buffer).is_err() {
            return SendOutcome::Error;
        }

        if buffer.is_drained() {
            if let Some(cb) = inner.on_send_complete.as_mut() {
                cb();
            }
            return SendOutcome::Ok;
        }

        inner.send_queue.push_back(buffer);
        inner.enabled = inner.enabled | Event::WRITE;
        inner.sync_events();
        SendOutcome::Ok
    }

    /// 向 `buffer[pos..]` 读取一次，不重试。
    pub fn recv(&self, buffer: &mut Buffer) -> RecvOutcome {
        let mut inner = self.0.borrow_mut();
        let bytes = unsafe {
            libc::recv(
                inner.fd.0,
                buffer.unread_mut().as_mut_ptr() as *mut libc::c_void,
                buffer.remaining(),
                0,
            )
        };

        if bytes == 0 {
            inner.enabled = inner.enabled & !Event::READ;
            inner.sync_events();
            return RecvOutcome::PeerClosed;
        }

        if bytes < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => RecvOutcome::NoAvailData,
                _ => RecvOutcome::Error(err),
            };
        }

        buffer.advance(bytes as usize);
        RecvOutcome::Data(bytes as usize)
    }

    /// 幂等关闭：从反应器注销并关闭底层 fd。
    pub fn close(&self) {
        let mut inner = self.0.borrow_mut();
        if let (Some(reactor), Some(token)) = (inner.reactor.take(), inner.token.take()) {
            reactor.borrow_mut().del_event_handler(token);
        }
        if inner.fd.0 >= 0 {
            unsafe {
                libc::close(inner.fd.0);
            }
            inner.fd.0 = -1;
        }
    }

    /// 把连接从当前反应器转移到 `reactor`，保留已启用的事件位。
    pub fn change_event_loop(&self, reactor: Rc<RefCell<EventLoop>>) {
        {
            let mut inner = self.0.borrow_mut();
            if let (Some(old_reactor), Some(token)) = (inner.reactor.take(), inner.token.take()) {
                old_reactor.borrow_mut().del_event_handler(token);
            }
        }
        self.attach(reactor);
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, TransportError> {
        let fd = self.0.borrow().fd.0;
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        sockaddr_storage_to_std(&storage).ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "unsupported address family",
            ))
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.0.borrow().fd.0
    }
}

fn sockaddr_storage_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let addr: libc::sockaddr_in = unsafe { std::mem::transmute_copy(storage) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Some(SocketAddr::new(ip.into(), u16::from_be(addr.sin_port)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    fn set_nonblocking(stream: &TcpStream) {
        stream.set_nonblocking(true).unwrap();
    }

    #[test]
    fn send_then_recv_round_trips_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_std = TcpStream::connect(addr).unwrap();
        let (server_std, _) = listener.accept().unwrap();

        set_nonblocking(&client_std);
        set_nonblocking(&server_std);

        let client_fd = client_std.as_raw_fd();
        let server_fd = server_std.as_raw_fd();
        std::mem::forget(client_std);
        std::mem::forget(server_std);

        let client = Connection::new(client_fd, None);
        let server = Connection::new(server_fd, None);

        assert_eq!(client.send(Buffer::new(b"PING".to_vec())), SendOutcome::Ok);

        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut buf = Buffer::zeroed(4);
        match server.recv(&mut buf) {
            RecvOutcome::Data(n) => assert_eq!(n, 4),
            other => panic!("unexpected recv outcome: {other:?}"),
        }
        assert_eq!(buf.as_slice(), b"PING");

        client.close();
        server.close();
    }

    #[test]
    fn peer_closed_disables_further_read_callbacks() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_std = TcpStream::connect(addr).unwrap();
        let (server_std, _) = listener.accept().unwrap();
        set_nonblocking(&server_std);

        let server_fd = server_std.as_raw_fd();
        std::mem::forget(server_std);
        drop(client_std);

        std::thread::sleep(std::time::Duration::from_millis(20));

        let server = Connection::new(server_fd, None);
        let mut buf = Buffer::zeroed(4);
        match server.recv(&mut buf) {
            RecvOutcome::PeerClosed => {}
            other => panic!("expected PeerClosed, got {other:?}"),
        }
        assert!(!server.0.borrow().enabled.contains(Event::READ));
        server.close();
    }
}
