#![doc = r#"
# snet-core

## 设计动机（Why）
- **定位**：为 snet 的全部网络组件提供最底层的构件——缓冲区、字节序/套接字辅助函数、
  线程安全消息队列、就绪事件反应器与定时器轮——其余 crate 均构建在这些构件之上。
- **架构角色**：本 crate 不知道 TCP、不知道隧道协议，只知道“一个反应器线程如何驱动
  非阻塞 I/O 和定时回调”。上层 crate（`snet-transport-tcp`、`snet-tunnel` 等）把具体的
  协议语义叠加在这层抽象上。

## 核心契约（What）
- **单线程反应器**：每个 [`reactor::EventLoop`] 实例只在一个线程上驱动，句柄注册与派发
  都不是线程安全的；跨线程只能通过 [`queue::MessageQueue`] 传递已分离的连接或任务。
- **句柄而非裸指针**：反应器以 slab 分配的不透明句柄标识已注册的处理器，删除会立即
  使句柄失效，即便当前批次的就绪事件中仍包含该句柄。

## 实现策略（How）
- 反应器有两个后端：Linux 下基于 epoll，其余类 Unix 平台下基于 kqueue，通过
  `cfg(target_os = ...)` 在编译期选择，对外呈现同一套 [`reactor::EventLoop`] trait。
- 定时器用一个按 `(deadline, 生成序号)` 排序的有序集合实现，每个 tick 先抽取到期项、
  再逐一派发，允许回调内部重新调度自身而不破坏遍历。
"#]

pub mod buffer;
pub mod error;
pub mod queue;
pub mod reactor;
pub mod socket;
pub mod timer;

pub use buffer::Buffer;
pub use error::{Error, ErrorCategory, Result};
pub use queue::MessageQueue;
pub use reactor::{Event, EventHandler, EventLoop, HandlerToken, LoopHandler, LoopHandlerToken};
pub use timer::{TimerHandle, TimerList};
