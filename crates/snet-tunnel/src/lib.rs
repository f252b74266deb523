#![doc = r#"
# snet-tunnel

## 设计动机（Why）
- 两端之间只有一条 TCP 连接，却要承载任意多条独立的子流（SOCKS5 发起的每一个
  目标连接）。这一层把"一条物理连接"和"多条逻辑子流"解耦成两个正交的协议：
  底层是加密、成帧、保活的隧道记录流，上层是在记录负载里打包的子流控制协议。
- 握手只做"弱鉴权"：两端共享一个预置密钥，握手的目的是协商每个方向独立的
  一次性 IV 并确认对端确实持有同一把密钥,而不是完整的身份认证协议。

## 核心契约（What）
- [`connection::TunnelConnection`] 驱动 §4.8 描述的握手/成帧/保活状态机；
- [`mux::Message`] 是握手完成后记录负载里承载的子流控制消息。

## 实现策略（How）
- 成帧、握手状态机直接构建在 `snet-transport-tcp::Connection` 之上，复用它的
  读写回调和发送队列；加解密状态来自 `snet-cipher`；保活/心跳定时器来自
  `snet-core::timer::TimerList`。
"#]

pub mod connection;
pub mod error;
pub mod mux;

pub use connection::TunnelConnection;
pub use error::TunnelError;
pub use mux::{Message, MuxError};
