//! 客户端编排：绑定本地 SOCKS5 监听，驱动隧道客户端连接，把两者按子流 id
//! 相互路由；隧道断开时暂停接入新的 SOCKS5 会话并周期性重连。
//!
//! 镜像原始实现 `Client.cpp`/`STunnel.h` 里 `STunnelClient` 的职责划分：
//! 一个隧道连接承载任意多条 SOCKS5 会话，会话与隧道子流 id 一一对应。

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use snet_core::reactor::{EventLoop, LoopHandler};
use snet_core::TimerList;
use snet_transport_tcp::Connector;
use snet_tunnel::{Message, TunnelConnection};
use snet_socks5::{Connection as Socks5Connection, Server as Socks5Server};

use crate::config::Config;

/// 隧道重连前的等待时间，对应原始实现定时重试的节奏。
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

struct Inner {
    reactor: Rc<RefCell<EventLoop>>,
    timers: TimerList,
    // 仅为保持生命周期：反应器只持有弱引用。
    _timers_handler: Rc<RefCell<dyn LoopHandler>>,
    socks_server: Socks5Server,
    server_addr: SocketAddr,
    key: Vec<u8>,
    tunnel: Option<TunnelConnection>,
    sessions: HashMap<u64, Socks5Connection>,
    next_id: u64,
}

/// 本地 SOCKS5 入口到加密隧道客户端之间的粘合层。
#[derive(Clone)]
pub struct ClientComposition(Rc<RefCell<Inner>>);

impl ClientComposition {
    pub fn start(
        config: Config,
        reactor: Rc<RefCell<EventLoop>>,
    ) -> Result<Self, crate::error::ClientError> {
        let timers = TimerList::new();
        let timers_handler: Rc<RefCell<dyn LoopHandler>> = Rc::new(RefCell::new(timers.clone()));
        reactor.borrow_mut().add_loop_handler(&timers_handler);

        let socks_server = Socks5Server::bind(config.socks_listen_addr, reactor.clone())
            .map_err(|source| crate::error::ClientError::Listen {
                addr: config.socks_listen_addr,
                source,
            })?;
        socks_server.disable_accept();

        let inner = Rc::new(RefCell::new(Inner {
            reactor,
            timers,
            _timers_handler: timers_handler,
            socks_server,
            server_addr: config.server_addr,
            key: config.key,
            tunnel: None,
            sessions: HashMap::new(),
            next_id: 0,
        }));

        let composition = Self(inner);
        composition.wire_socks_accept();
        Self::connect_tunnel(&composition.0);
        Ok(composition)
    }

    fn wire_socks_accept(&self) {
        let weak = Rc::downgrade(&self.0);
        self.0
            .borrow()
            .socks_server
            .set_on_new_connection(move |conn| {
                if let Some(inner) = weak.upgrade() {
                    Self::wire_socks_session(&inner, conn);
                }
            });
    }

    fn connect_tunnel(inner: &Rc<RefCell<Inner>>) {
        let (addr, reactor) = {
            let i = inner.borrow();
            (i.server_addr, i.reactor.clone())
        };
        let weak = Rc::downgrade(inner);
        let connect_result = Connector::connect(addr, reactor, move |result| {
            let Some(inner) = weak.upgrade() else { return };
            match result {
                Ok(transport) => Self::on_tunnel_connected(&inner, transport),
                Err(err) => {
                    tracing::warn!(%err, %addr, "tunnel connect attempt failed, retrying");
                    Self::schedule_reconnect(&inner);
                }
            }
        });
        if let Err(err) = connect_result {
            tracing::warn!(%err, %addr, "failed to start tunnel connect attempt, retrying");
            Self::schedule_reconnect(inner);
        }
    }

    fn schedule_reconnect(inner: &Rc<RefCell<Inner>>) {
        let weak = Rc::downgrade(inner);
        let timers = inner.borrow().timers.clone();
        timers.schedule_after(RECONNECT_DELAY, move || {
            if let Some(inner) = weak.upgrade() {
                Self::connect_tunnel(&inner);
            }
        });
    }

    fn on_tunnel_connected(inner: &Rc<RefCell<Inner>>, transport: snet_transport_tcp::Connection) {
        let (key, timers) = {
            let i = inner.borrow();
            (i.key.clone(), i.timers.clone())
        };
        let tunnel = match TunnelConnection::new_client(transport, &key, timers) {
            Ok(tunnel) => tunnel,
            Err(err) => {
                tracing::warn!(%err, "failed to initialise tunnel cipher, retrying");
                Self::schedule_reconnect(inner);
                return;
            }
        };

        let weak_ok = Rc::downgrade(inner);
        tunnel.set_on_handshake_ok(move || {
            if let Some(inner) = weak_ok.upgrade() {
                tracing::info!("tunnel handshake complete, accepting SOCKS5 sessions");
                inner.borrow().socks_server.enable_accept();
            }
        });

        let weak_data = Rc::downgrade(inner);
        let tunnel_for_data = tunnel.clone();
        tunnel_for_data.set_on_data(move |record| {
            if let Some(inner) = weak_data.upgrade() {
                Self::handle_tunnel_record(&inner, record);
            }
        });

        let weak_err = Rc::downgrade(inner);
        tunnel.set_on_error(move |err| {
            tracing::warn!(%err, "tunnel connection failed, tearing down SOCKS5 sessions");
            if let Some(inner) = weak_err.upgrade() {
                inner.borrow().socks_server.disable_accept();
                let sessions = std::mem::take(&mut inner.borrow_mut().sessions);
                for (_, session) in sessions {
                    session.close();
                }
                inner.borrow_mut().tunnel = None;
                Self::schedule_reconnect(&inner);
            }
        });

        inner.borrow_mut().tunnel = Some(tunnel);
    }

    fn handle_tunnel_record(inner: &Rc<RefCell<Inner>>, record: Vec<u8>) {
        match Message::unpack(&record) {
            Ok(Message::OpenSuccess { id, ip, port }) => {
                if let Some(session) = inner.borrow().sessions.get(&id) {
                    session.reply_connect_success(ip, port);
                }
            }
            Ok(Message::Data { id, payload }) => {
                if let Some(session) = inner.borrow().sessions.get(&id) {
                    session.send(&payload);
                }
            }
            Ok(Message::Close { id }) => {
                if let Some(session) = inner.borrow_mut().sessions.remove(&id) {
                    session.close();
                }
            }
            Ok(Message::ShutdownWrite { .. }) => {
                // Half-close is never emitted by this composition; reserved
                // for a future half-duplex relay mode.
            }
            Ok(Message::Open { id, .. }) => {
                tracing::warn!(id, "client received unexpected Open message, ignoring");
            }
            Err(err) => {
                tracing::warn!(%err, "malformed sub-stream message from tunnel server, ignoring");
            }
        }
    }

    fn wire_socks_session(inner: &Rc<RefCell<Inner>>, session: Socks5Connection) {
        let id = {
            let mut i = inner.borrow_mut();
            let id = i.next_id;
            i.next_id += 1;
            i.sessions.insert(id, session.clone());
            id
        };

        let weak_addr = Rc::downgrade(inner);
        session.set_on_connect_address(move |host, port| {
            if let Some(inner) = weak_addr.upgrade() {
                Self::send_to_tunnel(&inner, &Message::Open { id, host, port });
            }
        });

        let weak_data = Rc::downgrade(inner);
        session.set_on_data(move |payload| {
            if let Some(inner) = weak_data.upgrade() {
                Self::send_to_tunnel(&inner, &Message::Data { id, payload });
            }
        });

        let weak_eof = Rc::downgrade(inner);
        session.set_on_eof(move || {
            if let Some(inner) = weak_eof.upgrade() {
                Self::end_substream(&inner, id);
            }
        });

        let weak_close = Rc::downgrade(inner);
        session.set_on_close(move || {
            if let Some(inner) = weak_close.upgrade() {
                Self::end_substream(&inner, id);
            }
        });
    }

    /// A SOCKS5 session ended locally (EOF or error); tell the peer to tear
    /// down its half of the sub-stream, but only the first time.
    fn end_substream(inner: &Rc<RefCell<Inner>>, id: u64) {
        if inner.borrow_mut().sessions.remove(&id).is_some() {
            Self::send_to_tunnel(inner, &Message::Close { id });
        }
    }

    fn send_to_tunnel(inner: &Rc<RefCell<Inner>>, msg: &Message) {
        if let Some(tunnel) = inner.borrow().tunnel.as_ref() {
            tunnel.send(&msg.pack());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    fn loopback_reactor_pair() -> (Rc<RefCell<EventLoop>>, SocketAddr, std::net::TcpListener) {
        let reactor = Rc::new(RefCell::new(EventLoop::new()));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        (reactor, addr, listener)
    }

    #[test]
    fn socks_accept_disabled_until_handshake_completes() {
        let (reactor, tunnel_addr, tunnel_listener) = loopback_reactor_pair();

        let config = Config {
            server_addr: tunnel_addr,
            key: b"shared-key".to_vec(),
            socks_listen_addr: "127.0.0.1:0".parse().unwrap(),
        };

        let composition = ClientComposition::start(config, reactor.clone()).unwrap();
        let _ = &composition;

        let mut accepted = None;
        for _ in 0..50 {
            EventLoop::run_once(&reactor);
            if let Ok((s, _)) = tunnel_listener.accept() {
                accepted = Some(s);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(accepted.is_some(), "client should attempt a tunnel connection");
    }
}
