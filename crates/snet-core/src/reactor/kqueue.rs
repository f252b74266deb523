//! BSD/Darwin 后端：通过 `libc::kqueue`/`kevent` 驱动，语义与 epoll 后端一致。

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::backend::Backend;
use super::{Event, HandlerToken};

const MAX_EVENTS: usize = 256;

pub struct KqueueBackend {
    kq_fd: RawFd,
    events_buf: Vec<libc::kevent>,
    // kqueue identifies filters by (ident, filter) pairs, not a single combined
    // registration; we track which filters are currently active per fd so
    // `modify`/`deregister` know which EV_DELETE calls to issue.
    active: HashMap<RawFd, Event>,
}

impl KqueueBackend {
    pub fn new() -> io::Result<Self> {
        let kq_fd = unsafe { libc::kqueue() };
        if kq_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            kq_fd,
            events_buf: vec![unsafe { std::mem::zeroed() }; MAX_EVENTS],
            active: HashMap::new(),
        })
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16, token: HandlerToken) -> io::Result<()> {
        let change = libc::kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: token.0 as *mut libc::c_void,
        };
        let ret = unsafe {
            libc::kevent(
                self.kq_fd,
                &change,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn sync_filters(&mut self, fd: RawFd, token: HandlerToken, want: Event) -> io::Result<()> {
        let have = self.active.get(&fd).copied().unwrap_or(Event::NONE);

        if want.contains(Event::READ) && !have.contains(Event::READ) {
            self.change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR as u16, token)?;
        } else if !want.contains(Event::READ) && have.contains(Event::READ) {
            self.change(fd, libc::EVFILT_READ, libc::EV_DELETE, token)?;
        }

        if want.contains(Event::WRITE) && !have.contains(Event::WRITE) {
            self.change(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_CLEAR as u16, token)?;
        } else if !want.contains(Event::WRITE) && have.contains(Event::WRITE) {
            self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, token)?;
        }

        if want.is_empty() {
            self.active.remove(&fd);
        } else {
            self.active.insert(fd, want);
        }
        Ok(())
    }
}

impl Backend for KqueueBackend {
    fn register(&mut self, fd: RawFd, token: HandlerToken, interest: Event) -> io::Result<()> {
        self.sync_filters(fd, token, interest)
    }

    fn deregister(&mut self, fd: RawFd, token: HandlerToken) -> io::Result<()> {
        self.sync_filters(fd, token, Event::NONE)
    }

    fn modify(&mut self, fd: RawFd, token: HandlerToken, interest: Event) -> io::Result<()> {
        self.sync_filters(fd, token, interest)
    }

    fn poll(&mut self, timeout: Duration) -> Vec<(HandlerToken, Event)> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let n = unsafe {
            libc::kevent(
                self.kq_fd,
                std::ptr::null(),
                0,
                self.events_buf.as_mut_ptr(),
                self.events_buf.len() as i32,
                &ts,
            )
        };
        if n <= 0 {
            return Vec::new();
        }

        let mut ready: HashMap<HandlerToken, Event> = HashMap::new();
        for ev in &self.events_buf[..n as usize] {
            let token = HandlerToken(ev.udata as usize);
            let bit = if ev.filter == libc::EVFILT_READ {
                Event::READ
            } else if ev.filter == libc::EVFILT_WRITE {
                Event::WRITE
            } else {
                Event::NONE
            };
            let entry = ready.entry(token).or_insert(Event::NONE);
            *entry = *entry | bit;
        }
        ready.into_iter().collect()
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq_fd);
        }
    }
}
