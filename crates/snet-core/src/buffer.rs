//! 带游标的拥有型字节缓冲区。
//!
//! ## 契约 (What)
//! - `pos` 始终满足 `0 <= pos <= len`；缓冲区被完全消费时 `pos == len`。
//! - 缓冲区独占所有权，从不共享；释放钩子（如果设置）会在 `Drop` 时调用一次。

/// 析构时触发的回调，用于把底层存储归还给调用方管理的池或 arena。
pub type ReleaseHook = Box<dyn FnOnce(&mut [u8]) + Send>;

/// 一段拥有的字节区域，附带一个 `[0, len]` 范围内的位置游标。
///
/// `Send` 但不是 `Sync`：缓冲区在单个反应器线程内流转，跨线程移交整块所有权
/// （例如经由 [`crate::MessageQueue`]）是允许的，并发共享引用则不是。
pub struct Buffer {
    storage: Box<[u8]>,
    pos: usize,
    release: Option<ReleaseHook>,
}

impl Buffer {
    /// 用给定字节内容构造一个新缓冲区，游标位于 0。
    pub fn new(storage: impl Into<Box<[u8]>>) -> Self {
        Self {
            storage: storage.into(),
            pos: 0,
            release: None,
        }
    }

    /// 构造一个全零的缓冲区，常用于接收缓冲。
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len].into_boxed_slice())
    }

    /// 附加一个释放钩子，在缓冲区被丢弃时调用一次。
    pub fn with_release_hook(mut self, hook: ReleaseHook) -> Self {
        self.release = Some(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// 缓冲区是否已被完全消费（`pos == len`）。
    pub fn is_drained(&self) -> bool {
        self.pos == self.storage.len()
    }

    /// 游标之后尚未消费的字节数。
    pub fn remaining(&self) -> usize {
        self.storage.len() - self.pos
    }

    /// 尚未消费的切片，从 `pos` 到末尾。
    pub fn unread(&self) -> &[u8] {
        &self.storage[self.pos..]
    }

    pub fn unread_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.pos..]
    }

    /// 整个底层存储，忽略游标。
    pub fn as_slice(&self) -> &[u8] {
        &self.storage
    }

    /// 把游标前进 `n` 字节；调用方必须保证 `pos + n <= len`。
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.storage.len());
        self.pos += n;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(hook) = self.release.take() {
            hook(&mut self.storage);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.storage.len())
            .field("pos", &self.pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_within_bounds() {
        let mut buf = Buffer::new(b"hello".to_vec());
        assert_eq!(buf.remaining(), 5);
        buf.advance(2);
        assert_eq!(buf.unread(), b"llo");
        assert!(!buf.is_drained());
        buf.advance(3);
        assert!(buf.is_drained());
    }

    #[test]
    fn release_hook_runs_once_on_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let buf = Buffer::new(b"x".to_vec()).with_release_hook(Box::new(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        drop(buf);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
