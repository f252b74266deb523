#![doc = r#"
# snet-socks5

## 设计动机（Why）
- 隧道客户端需要一个本地代理入口；完整实现 RFC 1928 超出这层的职责,只需要
  覆盖隧道实际驱动的子集：无认证方法协商 + `CONNECT` + 域名地址。

## 核心契约（What）
- [`connection::Connection`] 驱动 §4.10 的状态机；
- [`server::Server`] 在 `snet-transport-tcp::Acceptor` 之上叠加一个
  accept 开关，供客户端编排层在隧道重连期间暂停接入新会话。
"#]

pub mod connection;
pub mod error;
pub mod server;

pub use connection::Connection;
pub use error::Socks5Error;
pub use server::Server;
