//! 监听包装：在 [`snet_transport_tcp::Acceptor`] 之上叠加一个可随时
//! 启用/禁用的 accept 开关，供客户端编排层在隧道重连期间暂停接入。

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use snet_core::reactor::EventLoop;
use snet_transport_tcp::{Acceptor, TransportError};

use crate::connection::Connection;

struct Inner {
    enable_accept: bool,
    on_new_connection: Option<Box<dyn FnMut(Connection)>>,
}

/// A SOCKS5 listener; new clients only reach the callback while accept is
/// enabled (grounded on `socks5::Server`'s `enable_accept_` flag).
pub struct Server {
    inner: Rc<RefCell<Inner>>,
    // Kept alive only for its Drop impl (deregisters + closes the listen fd);
    // never read directly once bound.
    #[allow(dead_code)]
    acceptor: Acceptor,
}

impl Server {
    pub fn bind(addr: SocketAddr, reactor: Rc<RefCell<EventLoop>>) -> Result<Self, TransportError> {
        let acceptor = Acceptor::bind(addr, reactor)?;
        let inner = Rc::new(RefCell::new(Inner {
            enable_accept: true,
            on_new_connection: None,
        }));

        let wired = inner.clone();
        acceptor.set_on_new_connection(move |transport| {
            let mut inner = wired.borrow_mut();
            if inner.enable_accept {
                let conn = Connection::new(transport);
                if let Some(cb) = inner.on_new_connection.as_mut() {
                    cb(conn);
                }
            }
        });

        Ok(Self { inner, acceptor })
    }

    pub fn set_on_new_connection(&self, cb: impl FnMut(Connection) + 'static) {
        self.inner.borrow_mut().on_new_connection = Some(Box::new(cb));
    }

    pub fn disable_accept(&self) {
        self.inner.borrow_mut().enable_accept = false;
    }

    pub fn enable_accept(&self) {
        self.inner.borrow_mut().enable_accept = true;
    }
}
