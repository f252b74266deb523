//! 定时器轮：一个按 `(deadline, 生成序号)` 排序的有序集合，每个 tick 先抽取
//! 到期项再逐一派发，允许回调在派发过程中重新调度自身或取消同列表里的
//! 其它定时器而不破坏遍历。

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::reactor::LoopHandler;

/// 一个已调度定时器的不透明句柄；用于重新调度或取消。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Entry {
    deadline: Instant,
    callback: Box<dyn FnMut()>,
}

struct Inner {
    // 排序索引：deadline 到 handle 的有序集合，支持按到期时间批量抽取。
    order: BTreeMap<(Instant, u64), ()>,
    entries: BTreeMap<u64, Entry>,
    next_id: u64,
}

/// 一组共享的定时器集合，通常以 [`Rc`] 形式在一个反应器线程内被多处持有。
#[derive(Clone)]
pub struct TimerList {
    inner: Rc<RefCell<Inner>>,
}

impl TimerList {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                order: BTreeMap::new(),
                entries: BTreeMap::new(),
                next_id: 0,
            })),
        }
    }

    /// 安排一个在 `deadline` 到期、到期时调用 `callback` 的定时器。
    pub fn schedule_at(&self, deadline: Instant, callback: impl FnMut() + 'static) -> TimerHandle {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.order.insert((deadline, id), ());
        inner.entries.insert(
            id,
            Entry {
                deadline,
                callback: Box::new(callback),
            },
        );
        TimerHandle(id)
    }

    /// 安排一个在 `duration` 之后（从现在起算）到期的定时器。
    pub fn schedule_after(&self, duration: Duration, callback: impl FnMut() + 'static) -> TimerHandle {
        self.schedule_at(Instant::now() + duration, callback)
    }

    /// 把已有定时器重新调度到一个新的到期时间：先从有序集合移除旧条目，
    /// 再以新的 deadline 重新插入。
    pub fn reschedule(&self, handle: TimerHandle, deadline: Instant) {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.entries.get_mut(&handle.0) {
            let old = entry.deadline;
            entry.deadline = deadline;
            inner.order.remove(&(old, handle.0));
            inner.order.insert((deadline, handle.0), ());
        }
    }

    /// 取消一个定时器；若其回调已经在本次 tick 中被抽取等待派发，本次调用
    /// 不会阻止它触发——抽取先于派发完成，这是文档化的重入安全保证。
    pub fn cancel(&self, handle: TimerHandle) {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.entries.remove(&handle.0) {
            inner.order.remove(&(entry.deadline, handle.0));
        }
    }

    /// 抽取所有到期项（把它们从有序集合里移除），然后在集合之外逐一派发。
    /// 条目本身在 `entries` 里保留——回调里重新调度同一个 handle 只是把它
    /// 重新插回有序集合，而不需要重新分配一个新 handle。
    fn tick(&self) {
        let now = Instant::now();
        let expired_ids: Vec<u64> = {
            let mut inner = self.inner.borrow_mut();
            let split_key = (now, u64::MAX);
            let tail = inner.order.split_off(&split_key);
            let expired_keys: Vec<(Instant, u64)> = std::mem::replace(&mut inner.order, tail)
                .into_keys()
                .collect();
            expired_keys.into_iter().map(|(_, id)| id).collect()
        };

        for id in expired_ids {
            // Borrow scope must not span the callback invocation: the
            // callback may re-borrow `inner` via reschedule()/cancel().
            let mut callback = {
                let mut inner = self.inner.borrow_mut();
                match inner.entries.get_mut(&id) {
                    Some(entry) => std::mem::replace(&mut entry.callback, Box::new(|| {})),
                    None => continue,
                }
            };
            callback();
            if let Some(entry) = self.inner.borrow_mut().entries.get_mut(&id) {
                entry.callback = callback;
            }
        }
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopHandler for TimerList {
    fn on_tick(&mut self) {
        self.tick();
    }

    fn on_shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn earlier_deadline_fires_no_later_than_later_one() {
        let list = TimerList::new();
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let now = Instant::now();
        let o1 = order.clone();
        list.schedule_at(now, move || o1.borrow_mut().push("first"));
        let o2 = order.clone();
        list.schedule_at(now + Duration::from_millis(5), move || {
            o2.borrow_mut().push("second")
        });

        std::thread::sleep(Duration::from_millis(10));
        list.tick();

        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn cancel_removes_pending_timer() {
        let list = TimerList::new();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let handle = list.schedule_after(Duration::from_millis(1), move || f.set(true));
        list.cancel(handle);
        std::thread::sleep(Duration::from_millis(5));
        list.tick();
        assert!(!fired.get());
    }

    #[test]
    fn timer_can_reschedule_itself_during_dispatch() {
        let list = TimerList::new();
        let list2 = list.clone();
        let calls = Rc::new(Cell::new(0));
        let calls2 = calls.clone();

        let handle = Rc::new(RefCell::new(None));
        let handle2 = handle.clone();
        *handle.borrow_mut() = Some(list.schedule_after(Duration::from_millis(1), move || {
            calls2.set(calls2.get() + 1);
            if calls2.get() < 2 {
                let h = handle2.borrow().unwrap();
                list2.reschedule(h, Instant::now());
            }
        }));

        std::thread::sleep(Duration::from_millis(5));
        list.tick();
        // First tick both extracts and fires once; the reschedule inside the
        // callback targets the already-removed entry, so a second tick is
        // needed to observe it.
        list.tick();
        assert_eq!(calls.get(), 2);
    }
}
