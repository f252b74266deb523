//! 互斥量 + 条件变量实现的 MPSC 队列，用于在反应器线程之间移交连接和结果。
//!
//! `Send` 从不阻塞；`Recv` 阻塞直至队列非空；`TryRecv` 立即返回。
//! 多个生产者可以并发调用 `Send`；通常只有一个消费者（拥有该反应器的线程），
//! 但实现本身并不禁止多个消费者。顺序性：单个生产者的多次 `Send` 以 FIFO
//! 顺序到达消费者。
//!
//! 在 `--cfg loom` 下，底层的 `Mutex`/`Condvar` 换成 `loom::sync` 的等价物，
//! 这样 `loom_tests` 里的模型才真正跑在 loom 的调度器上——`parking_lot` 的锁
//! 不被 loom 插桩，拿它来建模不会探索任何交错。

use std::collections::VecDeque;

#[cfg(not(loom))]
use parking_lot::{Condvar, Mutex};
#[cfg(loom)]
use loom::sync::{Condvar, Mutex};

/// 一个无界的 FIFO，供反应器线程之间传递值 `T`。
pub struct MessageQueue<T> {
    state: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    /// 入队一个值，从不阻塞。
    #[cfg(not(loom))]
    pub fn send(&self, value: T) {
        let mut queue = self.state.lock();
        queue.push_back(value);
        drop(queue);
        self.not_empty.notify_one();
    }

    #[cfg(loom)]
    pub fn send(&self, value: T) {
        let mut queue = self.state.lock().unwrap();
        queue.push_back(value);
        drop(queue);
        self.not_empty.notify_one();
    }

    /// 阻塞直到队列非空，然后弹出队首元素。
    #[cfg(not(loom))]
    pub fn recv(&self) -> T {
        let mut queue = self.state.lock();
        loop {
            if let Some(value) = queue.pop_front() {
                return value;
            }
            self.not_empty.wait(&mut queue);
        }
    }

    #[cfg(loom)]
    pub fn recv(&self) -> T {
        let mut queue = self.state.lock().unwrap();
        loop {
            if let Some(value) = queue.pop_front() {
                return value;
            }
            queue = self.not_empty.wait(queue).unwrap();
        }
    }

    /// 非阻塞地尝试弹出队首元素。
    #[cfg(not(loom))]
    pub fn try_recv(&self) -> Option<T> {
        self.state.lock().pop_front()
    }

    #[cfg(loom)]
    pub fn try_recv(&self) -> Option<T> {
        self.state.lock().unwrap().pop_front()
    }

    #[cfg(not(loom))]
    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    #[cfg(loom)]
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().is_empty()
    }

    #[cfg(not(loom))]
    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    #[cfg(loom)]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_recv_on_empty_queue_is_none() {
        let queue: MessageQueue<i32> = MessageQueue::new();
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn fifo_order_is_preserved_per_producer() {
        let queue = MessageQueue::new();
        for i in 0..10 {
            queue.send(i);
        }
        for i in 0..10 {
            assert_eq!(queue.try_recv(), Some(i));
        }
        assert_eq!(queue.try_recv(), None);
    }

    #[test]
    fn recv_blocks_until_producer_sends() {
        let queue = Arc::new(MessageQueue::new());
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            producer.send(42);
        });
        assert_eq!(queue.recv(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn multiple_producers_all_land() {
        let queue = Arc::new(MessageQueue::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let q = queue.clone();
            handles.push(thread::spawn(move || q.send(i)));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut received: Vec<_> = std::iter::from_fn(|| queue.try_recv()).collect();
        received.sort();
        assert_eq!(received, (0..8).collect::<Vec<_>>());
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use loom::sync::Arc;
    use loom::thread;

    use super::MessageQueue;

    /// The consumer thread runs concurrently with the producer (blocking on
    /// `recv`, not draining only after the producer has already joined), so
    /// loom actually explores interleavings of `send`'s push+notify against
    /// `recv`'s pop+wait, rather than just the one sequential ordering you'd
    /// get by joining the producer before ever calling `recv`.
    #[test]
    fn loom_fifo_per_producer() {
        loom::model(|| {
            let queue = Arc::new(MessageQueue::new());
            let producer = queue.clone();
            let consumer = queue.clone();

            let producer_handle = thread::spawn(move || {
                producer.send(1);
                producer.send(2);
            });
            let consumer_handle = thread::spawn(move || {
                let first = consumer.recv();
                let second = consumer.recv();
                (first, second)
            });

            producer_handle.join().unwrap();
            let seen = consumer_handle.join().unwrap();
            assert_eq!(seen, (1, 2));
        });
    }
}
