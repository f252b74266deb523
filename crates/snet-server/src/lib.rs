#![doc = r#"
# snet-server

## 设计动机（Why）
- **定位**：接受加密隧道连接，把每条子流按其请求的目标主机/端口解析、连接，
  并在隧道子流与目标连接之间双向转发字节，对应 §4.9/§6 描述的服务端编排。
- **架构角色**：本 crate 同样不引入新的协议状态机,只是 `snet-tunnel` 握手/
  成帧状态机与 `snet-transport-tcp` 的 `Acceptor`/`Connector`/`AddrInfoResolver`
  之间的粘合层,一条隧道连接对应任意多条独立的中继连接。

## 核心契约（What）
- [`config::Config`] 描述监听地址、预共享密钥、解析线程池大小；
- [`composition::ServerComposition`] 是编排本体：接受隧道连接 → 按子流 id
  解析并连接目标主机 → 双向转发。

## 实现策略（How）
- 每条隧道连接维护一个按子流 id 索引的中继表，表项随 `Open`/`Close` 消息和
  中继连接自身的错误/对端关闭事件推进状态（解析中 / 连接中 / 已连接）。
"#]

pub mod composition;
pub mod config;
pub mod error;

pub use composition::ServerComposition;
pub use config::Config;
pub use error::ServerError;
