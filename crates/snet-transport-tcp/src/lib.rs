#![doc = r#"
# snet-transport-tcp

## 设计动机（Why）
- **定位**：在 `snet-core` 的反应器之上提供非阻塞 TCP 的四块积木——
  [`Connection`]、[`Acceptor`]、[`Connector`]、[`AddrInfoResolver`]——
  它们共同构成隧道协议和 SOCKS5 状态机赖以运行的传输层。
- **架构角色**：每个类型都只关心“一个已连接/监听中的 fd 如何被非阻塞地
  驱动”，协议语义（加密、握手、子流复用）完全留给上层 crate。

## 实现策略（How）
- `Connection` 把自身包装成 `Rc<RefCell<_>>`，向反应器注册一个持有弱引用
  的事件处理器适配层，这样反应器的派发循环和用户侧的直接调用可以并存，
  而不必像原始实现那样依赖裸指针的生存期假设。
- `AddrInfoResolver` 用一个小型线程池执行阻塞的 `getaddrinfo`，通过
  `MessageQueue` 把结果送回反应器线程，再作为循环处理器每个 tick 清空一次。
"#]

pub mod acceptor;
pub mod connection;
pub mod connector;
pub mod error;
pub mod resolver;

pub use acceptor::Acceptor;
pub use connection::{Connection, RecvOutcome, SendOutcome};
pub use connector::Connector;
pub use error::TransportError;
pub use resolver::{AddrInfoResolver, ResolveHandle};
