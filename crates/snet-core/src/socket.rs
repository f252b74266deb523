//! 套接字层面的辅助函数：非阻塞标志、地址复用、rlimit 提升。
//!
//! 对应原始实现中的 `SocketOps`；这里改用 `libc` 直接操作 fd 标志位，
//! 以贴合反应器对裸 fd 的掌控方式（而不是引入一个完整的异步套接字库）。

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::error::Error;

/// 把 `fd` 设置为非阻塞模式。
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// 设置 `SO_REUSEADDR`；原始实现里失败被静默忽略，这里保留同样的语义。
pub fn set_reuse_addr(fd: RawFd) {
    unsafe {
        let reuse: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const _ as *const libc::c_void,
            std::mem::size_of_val(&reuse) as libc::socklen_t,
        );
    }
}

/// 一次性忽略 `SIGPIPE`；进程启动时调用一次即可。
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// 尝试把 `RLIMIT_NOFILE` 提升到至少 `requested`。
///
/// 镜像原始实现的回退策略：若没有权限把 hard limit 提到 `requested`，
/// 退而求其次，把 soft limit 提到当前 hard limit 和 `requested` 中较小者。
pub fn raise_max_open_files(requested: u64) -> Result<(), Error> {
    unsafe {
        let mut limits = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limits) != 0 {
            return Err(Error::io("getrlimit", io::Error::last_os_error()));
        }

        let original_max = limits.rlim_max;
        limits.rlim_max = requested.max(original_max as u64) as libc::rlim_t;
        limits.rlim_cur = requested as libc::rlim_t;

        if libc::setrlimit(libc::RLIMIT_NOFILE, &limits) == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            limits.rlim_max = original_max;
            limits.rlim_cur = requested.min(original_max as u64) as libc::rlim_t;
            if libc::setrlimit(libc::RLIMIT_NOFILE, &limits) == 0 {
                return Ok(());
            }
        }

        Err(Error::RlimitRaise { requested })
    }
}

/// 把一个 IPv4 套接字地址转换成 `(ip_be, port_be)`，即 OpenSuccess 负载需要的
/// 网络字节序整数对。
pub fn addr_to_network_order(addr: SocketAddr) -> Option<(u32, u16)> {
    match addr {
        SocketAddr::V4(v4) => Some((u32::from(*v4.ip()).to_be(), v4.port().to_be())),
        SocketAddr::V6(_) => None,
    }
}

/// 反过来，把网络字节序的 `(ip_be, port_be)` 还原成一个 `SocketAddrV4`。
pub fn network_order_to_addr(ip_be: u32, port_be: u16) -> std::net::SocketAddrV4 {
    std::net::SocketAddrV4::new(std::net::Ipv4Addr::from(u32::from_be(ip_be)), u16::from_be(port_be))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn network_order_round_trips() {
        let addr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080);
        let (ip_be, port_be) = addr_to_network_order(addr).unwrap();
        let back = network_order_to_addr(ip_be, port_be);
        assert_eq!(back.ip(), &Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(back.port(), 8080);
    }
}
