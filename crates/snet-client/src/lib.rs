#![doc = r#"
# snet-client

## 设计动机（Why）
- **定位**：把 `snet-socks5` 的本地代理入口和 `snet-tunnel` 的客户端握手粘合成
  §4.9/§4.10 描述的完整客户端编排：浏览器 → SOCKS5 → 隧道客户端 → 远端中继。
- **架构角色**：本 crate 不实现任何新的协议状态机，只负责把两条已经独立可测的
  状态机（SOCKS5 会话、隧道连接）按 id 互相路由，并在隧道断开时执行 §4.9
  "Reconnection" 描述的暂停-重建流程。

## 核心契约（What）
- [`config::Config`] 描述启动参数：隧道服务端地址、预共享密钥、本地 SOCKS5
  监听地址；
- [`composition::ClientComposition`] 是编排本体，`start` 一次性完成绑定 SOCKS5
  监听、发起首次隧道连接两件事，其余全部由回调驱动。

## 实现策略（How）
- 复用 `snet-tunnel`/`snet-socks5` 已经是 `Rc<RefCell<_>>` 包装、弱引用回调的
  风格：编排层自身也以同样的模式组织，保证一个反应器线程内的所有状态都经由
  `Rc<RefCell<Inner>>` 共享，不引入额外的同步原语。
"#]

pub mod composition;
pub mod config;
pub mod error;

pub use composition::ClientComposition;
pub use config::Config;
pub use error::ClientError;
