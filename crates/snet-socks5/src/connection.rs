//! SOCKS5 会话状态机：方法协商 → 取 CONNECT 地址 → 等待上游结果 → 转发数据。
//!
//! ## 契约 (What)
//! 严格对应 §4.10：`SelectingMethod → GettingConnectAddress → Connecting →
//! Running → Closed`。只接受 `NO_AUTH` 方法与 `CONNECT`+`DOMAIN-NAME` 请求，
//! 其余一律拒绝并关闭连接。`Connecting` 态不期望收到对端字节：上游通过
//! [`Connection::reply_connect_success`] 异步驱动到 `Running`。

use std::cell::RefCell;
use std::rc::Rc;

use snet_core::Buffer;
use snet_transport_tcp::{Connection as Transport, RecvOutcome, SendOutcome};

use crate::error::Socks5Error;

const VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const METHOD_NO_ACCEPT: u8 = 0xFF;
const CMD_CONNECT: u8 = 1;
const RSV: u8 = 0;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN_NAME: u8 = 3;
const REPLY_SUCCESS: u8 = 0;
const REPLY_FAILURE: u8 = 1;

const MAX_SELECT_METHOD_SIZE: usize = 257;
const REPLY_METHOD_SIZE: usize = 2;
const GET_CONNECT_ADDRESS_SIZE: usize = 262;
const REPLY_SIZE: usize = 10;
const RUNNING_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SelectingMethod,
    GettingConnectAddress,
    Connecting,
    Running,
    Closed,
}

struct Inner {
    state: State,
    connection: Transport,
    buffer: Option<Buffer>,
    on_close: Option<Box<dyn FnOnce()>>,
    on_connect_address: Option<Box<dyn FnOnce(String, u16)>>,
    on_data: Option<Box<dyn FnMut(Vec<u8>)>>,
    on_eof: Option<Box<dyn FnOnce()>>,
}

/// One accepted SOCKS5 client, driving it through method negotiation and
/// CONNECT address parsing until the upstream side takes over.
#[derive(Clone)]
pub struct Connection(Rc<RefCell<Inner>>);

impl Connection {
    pub fn new(connection: Transport) -> Self {
        let inner = Rc::new(RefCell::new(Inner {
            state: State::SelectingMethod,
            connection,
            buffer: None,
            on_close: None,
            on_connect_address: None,
            on_data: None,
            on_eof: None,
        }));
        let conn = Self(inner);
        conn.wire();
        conn
    }

    fn wire(&self) {
        let weak = Rc::downgrade(&self.0);
        let on_read = weak.clone();
        let transport = self.0.borrow().connection.clone();
        transport.set_on_receivable(move || {
            if let Some(inner) = on_read.upgrade() {
                Inner::handle_recv(&inner);
            }
        });
        transport.set_on_error(move || {
            if let Some(inner) = weak.upgrade() {
                Inner::fail(&inner, Socks5Error::Io(std::io::Error::other("transport error")));
            }
        });
    }

    pub fn set_on_close(&self, cb: impl FnOnce() + 'static) {
        self.0.borrow_mut().on_close = Some(Box::new(cb));
    }

    pub fn set_on_connect_address(&self, cb: impl FnOnce(String, u16) + 'static) {
        self.0.borrow_mut().on_connect_address = Some(Box::new(cb));
    }

    pub fn set_on_data(&self, cb: impl FnMut(Vec<u8>) + 'static) {
        self.0.borrow_mut().on_data = Some(Box::new(cb));
    }

    pub fn set_on_eof(&self, cb: impl FnOnce() + 'static) {
        self.0.borrow_mut().on_eof = Some(Box::new(cb));
    }

    /// Upstream (the tunnel client) announces the CONNECT target is reachable
    /// at `ip`/`port`; only acts while `Connecting`.
    pub fn reply_connect_success(&self, ip: u32, port: u16) {
        let should_reply = {
            let mut inner = self.0.borrow_mut();
            if inner.state == State::Connecting {
                inner.state = State::Running;
                true
            } else {
                false
            }
        };
        if should_reply {
            Inner::send_reply(&self.0, ip, port);
        }
    }

    /// Forwards plain application data to the client; only valid in `Running`.
    pub fn send(&self, data: &[u8]) {
        if self.0.borrow().state != State::Running {
            return;
        }
        let transport = self.0.borrow().connection.clone();
        transport.send(Buffer::new(data.to_vec()));
    }

    /// Closes the connection; if still awaiting a CONNECT result, first sends
    /// a failure reply so the client doesn't hang.
    pub fn close(&self) {
        let needs_failure_reply = self.0.borrow().state == State::Connecting;
        if needs_failure_reply {
            Inner::send_reply(&self.0, 0, 0);
        }
        Inner::close_connection(&self.0);
    }
}

impl Inner {
    fn handle_recv(this: &Rc<RefCell<Inner>>) {
        let state = this.borrow().state;
        match state {
            State::SelectingMethod => Inner::select_method(this),
            State::GettingConnectAddress => Inner::get_connect_address(this),
            State::Connecting => {
                // Reads are not expected here; leave any buffered kernel data
                // untouched until the upstream result arrives.
            }
            State::Running => Inner::recv_data(this),
            State::Closed => {}
        }
    }

    fn select_method(this: &Rc<RefCell<Inner>>) {
        let transport = this.borrow().connection.clone();
        let outcome = {
            let mut inner = this.borrow_mut();
            let buf = inner
                .buffer
                .get_or_insert_with(|| Buffer::zeroed(MAX_SELECT_METHOD_SIZE));
            transport.recv(buf)
        };
        match outcome {
            RecvOutcome::NoAvailData => return,
            RecvOutcome::PeerClosed => {
                Inner::fail(this, Socks5Error::PeerClosed);
                return;
            }
            RecvOutcome::Error(err) => {
                Inner::fail(this, Socks5Error::Io(err));
                return;
            }
            RecvOutcome::Data(_) => {}
        }

        let pos = this.borrow().buffer.as_ref().unwrap().pos();
        if pos < 2 {
            return;
        }

        let version = this.borrow().buffer.as_ref().unwrap().as_slice()[0];
        if version != VERSION {
            Inner::fail(this, Socks5Error::UnsupportedVersion(version));
            return;
        }

        let num = this.borrow().buffer.as_ref().unwrap().as_slice()[1] as usize;
        if pos > num + 2 {
            Inner::fail(this, Socks5Error::UnsupportedVersion(version));
            return;
        }
        if pos < num + 2 {
            return;
        }

        let chosen = {
            let inner = this.borrow();
            let methods = &inner.buffer.as_ref().unwrap().as_slice()[2..2 + num];
            methods.contains(&METHOD_NO_AUTH)
        };

        if chosen {
            Inner::reply_method(this, METHOD_NO_AUTH);
        } else {
            Inner::reply_method(this, METHOD_NO_ACCEPT);
            Inner::fail(this, Socks5Error::NoAcceptableMethod);
        }
    }

    fn reply_method(this: &Rc<RefCell<Inner>>, method: u8) {
        let transport = this.borrow().connection.clone();
        let mut reply = Vec::with_capacity(REPLY_METHOD_SIZE);
        reply.push(VERSION);
        reply.push(method);

        {
            let mut inner = this.borrow_mut();
            inner.buffer = None;
            if method == METHOD_NO_AUTH {
                inner.state = State::GettingConnectAddress;
            }
        }
        transport.send(Buffer::new(reply));
    }

    fn get_connect_address(this: &Rc<RefCell<Inner>>) {
        let transport = this.borrow().connection.clone();
        let outcome = {
            let mut inner = this.borrow_mut();
            let buf = inner
                .buffer
                .get_or_insert_with(|| Buffer::zeroed(GET_CONNECT_ADDRESS_SIZE));
            transport.recv(buf)
        };
        match outcome {
            RecvOutcome::NoAvailData => return,
            RecvOutcome::PeerClosed => {
                Inner::fail(this, Socks5Error::PeerClosed);
                return;
            }
            RecvOutcome::Error(err) => {
                Inner::fail(this, Socks5Error::Io(err));
                return;
            }
            RecvOutcome::Data(_) => {}
        }

        let pos = this.borrow().buffer.as_ref().unwrap().pos();
        if pos < 4 {
            return;
        }

        let (cmd, atyp) = {
            let inner = this.borrow();
            let slice = inner.buffer.as_ref().unwrap().as_slice();
            (slice[1], slice[3])
        };
        if cmd != CMD_CONNECT {
            Inner::fail(this, Socks5Error::UnsupportedCommand(cmd));
            return;
        }
        if atyp != ATYP_DOMAIN_NAME {
            Inner::fail(this, Socks5Error::UnsupportedAddressType(atyp));
            return;
        }
        if pos == 4 {
            return;
        }

        let len = this.borrow().buffer.as_ref().unwrap().as_slice()[4] as usize;
        let expected = len + 4 + 2 + 1;
        if pos > expected {
            Inner::fail(this, Socks5Error::UnsupportedCommand(cmd));
            return;
        }
        if pos < expected {
            return;
        }

        let (host, port) = {
            let inner = this.borrow();
            let slice = inner.buffer.as_ref().unwrap().as_slice();
            let host = String::from_utf8_lossy(&slice[5..5 + len]).into_owned();
            let port = u16::from_be_bytes(slice[5 + len..5 + len + 2].try_into().unwrap());
            (host, port)
        };

        let cb = {
            let mut inner = this.borrow_mut();
            inner.buffer = None;
            inner.state = State::Connecting;
            inner.on_connect_address.take()
        };
        if let Some(cb) = cb {
            cb(host, port);
        }
    }

    fn recv_data(this: &Rc<RefCell<Inner>>) {
        let transport = this.borrow().connection.clone();
        let mut buf = Buffer::zeroed(RUNNING_BUFFER_SIZE);
        let outcome = transport.recv(&mut buf);
        match outcome {
            RecvOutcome::NoAvailData => {}
            RecvOutcome::PeerClosed => {
                let cb = this.borrow_mut().on_eof.take();
                if let Some(cb) = cb {
                    cb();
                }
            }
            RecvOutcome::Error(err) => Inner::fail(this, Socks5Error::Io(err)),
            RecvOutcome::Data(n) => {
                let mut cb = this.borrow_mut().on_data.take();
                if let Some(ref mut cb) = cb {
                    cb(buf.as_slice()[..n].to_vec());
                }
                this.borrow_mut().on_data = cb;
            }
        }
    }

    fn send_reply(this: &Rc<RefCell<Inner>>, ip: u32, port: u16) {
        let transport = this.borrow().connection.clone();
        let mut reply = Vec::with_capacity(REPLY_SIZE);
        reply.push(VERSION);
        reply.push(if ip != 0 { REPLY_SUCCESS } else { REPLY_FAILURE });
        reply.push(RSV);
        reply.push(ATYP_IPV4);
        reply.extend_from_slice(&ip.to_be_bytes());
        reply.extend_from_slice(&port.to_be_bytes());
        transport.send(Buffer::new(reply));
    }

    fn close_connection(this: &Rc<RefCell<Inner>>) {
        let transport = this.borrow().connection.clone();
        transport.close();
        this.borrow_mut().state = State::Closed;
    }

    fn fail(this: &Rc<RefCell<Inner>>, err: Socks5Error) {
        if this.borrow().state == State::Closed {
            return;
        }
        tracing::debug!(category = ?err.category(), %err, "socks5 connection failed");
        Inner::close_connection(this);
        let cb = this.borrow_mut().on_close.take();
        if let Some(cb) = cb {
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    fn connected_pair() -> (Transport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).unwrap();
        let (server_std, _) = listener.accept().unwrap();
        server_std.set_nonblocking(true).unwrap();
        let fd = server_std.as_raw_fd();
        std::mem::forget(server_std);
        (Transport::new(fd, None), peer)
    }

    fn pump(conn: &Connection) {
        Inner::handle_recv(&conn.0);
    }

    #[test]
    fn negotiates_no_auth_then_parses_connect_address() {
        use std::io::{Read, Write};

        let (transport, mut peer) = connected_pair();
        peer.set_nonblocking(true).unwrap();
        let conn = Connection::new(transport);

        let got_address = Rc::new(RefCell::new(None));
        let got2 = got_address.clone();
        conn.set_on_connect_address(move |host, port| *got2.borrow_mut() = Some((host, port)));

        peer.write_all(&[0x05, 0x01, 0x00]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        pump(&conn);

        let mut reply = [0u8; 2];
        std::thread::sleep(std::time::Duration::from_millis(20));
        peer.read_exact(&mut reply).unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x09];
        request.extend_from_slice(b"localhost");
        request.extend_from_slice(&80u16.to_be_bytes());
        peer.write_all(&request).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        pump(&conn);

        assert_eq!(
            got_address.borrow().clone(),
            Some(("localhost".to_string(), 80))
        );
    }

    #[test]
    fn rejects_non_no_auth_only_offer() {
        use std::io::Write;

        let (transport, mut peer) = connected_pair();
        let conn = Connection::new(transport);
        let closed = Rc::new(Cell::new(false));
        let c2 = closed.clone();
        conn.set_on_close(move || c2.set(true));

        peer.write_all(&[0x05, 0x01, 0x02]).unwrap(); // only GSSAPI offered
        std::thread::sleep(std::time::Duration::from_millis(20));
        pump(&conn);

        assert!(closed.get());
    }
}
