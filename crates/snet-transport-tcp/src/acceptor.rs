//! 被动监听套接字：在读就绪时 `accept` 一次，把新连接交给调用方回调。

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;

use snet_core::reactor::{Event, EventHandler, EventLoop, HandlerToken};

use crate::connection::Connection;
use crate::error::TransportError;

const DEFAULT_BACKLOG: i32 = 5;

struct Inner {
    fd: RawFd,
    reactor: Rc<RefCell<EventLoop>>,
    token: Option<HandlerToken>,
    attach_new_connections: bool,
    on_new_connection: Option<Box<dyn FnMut(Connection)>>,
}

impl EventHandler for Inner {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn interest(&self) -> Event {
        Event::READ
    }

    fn on_readable(&mut self) {
        let mut addr: libc::sockaddr = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr>() as libc::socklen_t;
        let new_fd = unsafe { libc::accept(self.fd, &mut addr, &mut len) };
        if new_fd < 0 {
            return; // accept failure: drop the event, matches original semantics
        }

        if set_nonblocking(new_fd).is_err() {
            unsafe {
                libc::close(new_fd);
            }
            return;
        }

        let reactor = if self.attach_new_connections {
            Some(self.reactor.clone())
        } else {
            None
        };
        let conn = Connection::new(new_fd, reactor);
        if let Some(cb) = self.on_new_connection.as_mut() {
            cb(conn);
        }
    }

    fn on_writable(&mut self) {}
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// 一个监听套接字；`accept` 到的新连接经由 [`Self::set_on_new_connection`]
/// 设置的回调交给调用方。
pub struct Acceptor(Rc<RefCell<Inner>>);

impl Acceptor {
    /// 在 `addr` 上监听，立即把监听 fd 注册到 `reactor`。
    pub fn bind(addr: SocketAddr, reactor: Rc<RefCell<EventLoop>>) -> Result<Self, TransportError> {
        Self::bind_with_backlog(addr, reactor, DEFAULT_BACKLOG)
    }

    pub fn bind_with_backlog(
        addr: SocketAddr,
        reactor: Rc<RefCell<EventLoop>>,
        backlog: i32,
    ) -> Result<Self, TransportError> {
        let fd = create_listen_socket(addr, backlog)
            .map_err(|source| TransportError::Listen { addr, source })?;

        let inner = Rc::new(RefCell::new(Inner {
            fd,
            reactor: reactor.clone(),
            token: None,
            attach_new_connections: true,
            on_new_connection: None,
        }));

        let handler: Rc<RefCell<dyn EventHandler>> = inner.clone();
        let token = reactor.borrow_mut().add_event_handler(&handler);
        inner.borrow_mut().token = Some(token);

        Ok(Self(inner))
    }

    pub fn set_on_new_connection(&self, cb: impl FnMut(Connection) + 'static) {
        self.0.borrow_mut().on_new_connection = Some(Box::new(cb));
    }

    /// 若为 `false`，新 accept 到的连接不会被预先挂到本 acceptor 的反应器上，
    /// 供 worker-pool 模式下先经 [`snet_core::MessageQueue`] 转移再
    /// `change_event_loop` 的场景使用。
    pub fn set_new_connection_with_event_loop(&self, flag: bool) {
        self.0.borrow_mut().attach_new_connections = flag;
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.reactor.borrow_mut().del_event_handler(token);
        }
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

fn create_listen_socket(addr: SocketAddr, backlog: i32) -> std::io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if set_nonblocking(fd).is_err() {
        unsafe { libc::close(fd) };
        return Err(std::io::Error::last_os_error());
    }

    let reuse: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const _ as *const libc::c_void,
            std::mem::size_of_val(&reuse) as libc::socklen_t,
        );
    }

    let SocketAddr::V4(v4) = addr else {
        unsafe { libc::close(fd) };
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "only IPv4 listen addresses are supported",
        ));
    };
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: v4.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(v4.ip().octets()),
        },
        sin_zero: [0; 8],
    };

    let bind_ret = unsafe {
        libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if bind_ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    if unsafe { libc::listen(fd, backlog) } < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::net::TcpStream;
    use std::rc::Rc;

    #[test]
    fn accepts_a_connection_and_invokes_callback() {
        let reactor = Rc::new(RefCell::new(EventLoop::new()));
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), reactor.clone()).unwrap();

        let local_addr = {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            unsafe {
                libc::getsockname(
                    acceptor.0.borrow().fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            let addr: libc::sockaddr_in = unsafe { std::mem::transmute_copy(&storage) };
            SocketAddr::from((
                std::net::Ipv4Addr::from(u32::from_ne_bytes(addr.sin_addr.s_addr.to_ne_bytes())),
                u16::from_be(addr.sin_port),
            ))
        };

        let accepted = Rc::new(Cell::new(false));
        let accepted2 = accepted.clone();
        acceptor.set_on_new_connection(move |_conn| {
            accepted2.set(true);
        });

        let _client = TcpStream::connect(local_addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        EventLoop::run_once(&reactor);

        assert!(accepted.get());
    }
}
