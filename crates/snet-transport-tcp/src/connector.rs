//! 非阻塞主动连接：发起 `connect`，在写就绪时检查 `SO_ERROR`，交出 fd。

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;

use snet_core::reactor::{Event, EventHandler, EventLoop, HandlerToken};

use crate::connection::Connection;
use crate::error::TransportError;

enum Outcome {
    Success(Connection),
    Failed(std::io::Error),
}

struct Inner {
    fd: RawFd,
    reactor: Rc<RefCell<EventLoop>>,
    token: Option<HandlerToken>,
    on_complete: Option<Box<dyn FnOnce(Result<Connection, std::io::Error>)>>,
    done: bool,
}

impl Inner {
    fn finish(&mut self, outcome: Outcome) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(token) = self.token.take() {
            self.reactor.borrow_mut().del_event_handler(token);
        }
        if let Some(cb) = self.on_complete.take() {
            match outcome {
                Outcome::Success(conn) => cb(Ok(conn)),
                Outcome::Failed(err) => {
                    unsafe {
                        libc::close(self.fd);
                    }
                    self.fd = -1;
                    cb(Err(err));
                }
            }
        }
    }
}

impl EventHandler for Inner {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn interest(&self) -> Event {
        Event::WRITE
    }

    fn on_readable(&mut self) {}

    fn on_writable(&mut self) {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if ret < 0 || err != 0 {
            let io_err = if ret < 0 {
                std::io::Error::last_os_error()
            } else {
                std::io::Error::from_raw_os_error(err)
            };
            self.finish(Outcome::Failed(io_err));
            return;
        }

        // Deregister the connector's own handler for `fd` before handing the
        // fd to a fresh Connection: constructing the Connection first would
        // register it under a new token while this fd is still registered
        // under the connector's token, so the kernel add fails (EEXIST,
        // swallowed) and finish()'s subsequent deregister then rips out the
        // fd's only working registration, leaving the Connection with a
        // slab slot but no kernel interest.
        if let Some(token) = self.token.take() {
            self.reactor.borrow_mut().del_event_handler(token);
        }
        let fd = self.fd;
        let reactor = self.reactor.clone();
        self.finish(Outcome::Success(Connection::new(fd, Some(reactor))));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.reactor.borrow_mut().del_event_handler(token);
        }
        if !self.done && self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// 一次性的非阻塞连接尝试；完成时（成功或失败）调用一次回调。
pub struct Connector(Rc<RefCell<Inner>>);

impl Connector {
    /// 发起到 `addr` 的连接。若 `connect` 立即成功（极少见，通常发生在
    /// 环回地址上），回调会在本次调用内被同步触发。
    pub fn connect(
        addr: SocketAddr,
        reactor: Rc<RefCell<EventLoop>>,
        on_complete: impl FnOnce(Result<Connection, std::io::Error>) + 'static,
    ) -> Result<Self, TransportError> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(TransportError::Connect {
                addr,
                source: std::io::Error::last_os_error(),
            });
        }
        if set_nonblocking(fd).is_err() {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TransportError::Connect { addr, source: err });
        }

        let SocketAddr::V4(v4) = addr else {
            unsafe { libc::close(fd) };
            return Err(TransportError::Connect {
                addr,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "only IPv4 connect targets are supported",
                ),
            });
        };
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: v4.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            },
            sin_zero: [0; 8],
        };

        let ret = unsafe {
            libc::connect(
                fd,
                &sin as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };

        let inner = Rc::new(RefCell::new(Inner {
            fd,
            reactor: reactor.clone(),
            token: None,
            on_complete: Some(Box::new(on_complete)),
            done: false,
        }));

        if ret == 0 {
            // Connected synchronously (loopback is the common case).
            inner
                .borrow_mut()
                .finish(Outcome::Success(Connection::new(fd, Some(reactor))));
            return Ok(Self(inner));
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            unsafe { libc::close(fd) };
            inner.borrow_mut().done = true; // drop must not double-close
            inner.borrow_mut().finish(Outcome::Failed(err));
            return Ok(Self(inner));
        }

        let handler: Rc<RefCell<dyn EventHandler>> = inner.clone();
        let token = reactor.borrow_mut().add_event_handler(&handler);
        inner.borrow_mut().token = Some(token);

        Ok(Self(inner))
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::net::TcpListener;

    #[test]
    fn connects_to_a_loopback_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();

        let reactor = Rc::new(RefCell::new(EventLoop::new()));
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();

        let _connector = Connector::connect(addr, reactor.clone(), move |r| {
            *result2.borrow_mut() = Some(r.is_ok());
        })
        .unwrap();

        let mut accepted = false;
        for _ in 0..50 {
            EventLoop::run_once(&reactor);
            if listener.accept().is_ok() {
                accepted = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(accepted);

        for _ in 0..50 {
            EventLoop::run_once(&reactor);
            if result.borrow().is_some() {
                break;
            }
        }
        assert_eq!(*result.borrow(), Some(true));
    }

    #[test]
    fn failed_connect_reports_error() {
        // A closed loopback port: bind then drop the listener to free the port,
        // then immediately attempt to connect before anything else claims it.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let reactor = Rc::new(RefCell::new(EventLoop::new()));
        let got_error = Rc::new(Cell::new(false));
        let got_error2 = got_error.clone();

        let _connector = Connector::connect(addr, reactor.clone(), move |r| {
            got_error2.set(r.is_err());
        })
        .unwrap();

        for _ in 0..50 {
            EventLoop::run_once(&reactor);
            if got_error.get() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(got_error.get());
    }
}
