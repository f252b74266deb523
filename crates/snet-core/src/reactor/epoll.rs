//! Linux 后端：直接通过 `libc::epoll_*` 系统调用驱动。

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::backend::Backend;
use super::{Event, HandlerToken};

const MAX_EVENTS: usize = 256;

pub struct EpollBackend {
    epoll_fd: RawFd,
    events_buf: Vec<libc::epoll_event>,
}

impl EpollBackend {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            events_buf: vec![unsafe { std::mem::zeroed() }; MAX_EVENTS],
        })
    }

    fn to_epoll_events(interest: Event) -> u32 {
        let mut bits = 0u32;
        if interest.contains(Event::READ) {
            bits |= libc::EPOLLIN as u32;
        }
        if interest.contains(Event::WRITE) {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: HandlerToken, interest: Event) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: Self::to_epoll_events(interest),
            u64: token.0 as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Backend for EpollBackend {
    fn register(&mut self, fd: RawFd, token: HandlerToken, interest: Event) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    fn deregister(&mut self, fd: RawFd, token: HandlerToken) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, token, Event::NONE)
    }

    fn modify(&mut self, fd: RawFd, token: HandlerToken, interest: Event) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    fn poll(&mut self, timeout: Duration) -> Vec<(HandlerToken, Event)> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events_buf.as_mut_ptr(),
                self.events_buf.len() as i32,
                timeout_ms,
            )
        };
        if n <= 0 {
            return Vec::new(); // timeout, EINTR, or an error — all treated as "nothing ready"
        }

        let mut ready = Vec::with_capacity(n as usize);
        for ev in &self.events_buf[..n as usize] {
            let mut event = Event::NONE;
            if ev.events & (libc::EPOLLIN as u32) != 0 {
                event = event | Event::READ;
            }
            if ev.events & (libc::EPOLLOUT as u32) != 0 {
                event = event | Event::WRITE;
            }
            if ev.events & ((libc::EPOLLERR | libc::EPOLLHUP) as u32) != 0 {
                event = event | Event::READ | Event::WRITE;
            }
            ready.push((HandlerToken(ev.u64 as usize), event));
        }
        ready
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}
