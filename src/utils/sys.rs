//! Thin syscall wrappers.
//!
//! Raw `libc` calls mapped through `Errno::result` so callers get a typed
//! errno back. `EINTR` is retried here; everything else, including
//! `EAGAIN`/`EWOULDBLOCK`/`EINPROGRESS`, is the callers' retry policy.

use nix::errno::Errno;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

macro_rules! retry_eintr {
    ($call:expr) => {
        loop {
            match Errno::result($call) {
                Err(Errno::EINTR) => continue,
                other => break other,
            }
        }
    };
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), Errno> {
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    let n = retry_eintr!(unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })?;
    Ok(n as usize)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> Result<usize, Errno> {
    let n = retry_eintr!(unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })?;
    Ok(n as usize)
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    let n = retry_eintr!(unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
    })?;
    Ok(n as usize)
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> Result<usize, Errno> {
    // MSG_NOSIGNAL: a peer reset must surface as EPIPE, not kill the process.
    let n = retry_eintr!(unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    })?;
    Ok(n as usize)
}

pub(crate) fn accept(fd: RawFd) -> Result<RawFd, Errno> {
    retry_eintr!(unsafe {
        libc::accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_CLOEXEC)
    })
}

pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> Result<(), Errno> {
    let (storage, len) = sockaddr_from(addr);
    Errno::result(unsafe {
        libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
    })?;
    Ok(())
}

/// Reads and clears `SO_ERROR`, for checking the outcome of a non-blocking
/// connect once the socket reports writable.
pub(crate) fn take_socket_error(fd: RawFd) -> Result<Option<Errno>, Errno> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    Errno::result(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })?;
    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(Errno::from_raw(err)))
    }
}

pub(crate) fn writev(fd: RawFd, iov: &[libc::iovec]) -> Result<usize, Errno> {
    let n = retry_eintr!(unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) })?;
    Ok(n as usize)
}

pub(crate) fn splice(src: RawFd, dest: RawFd, len: usize) -> Result<usize, Errno> {
    let n = retry_eintr!(unsafe {
        libc::splice(
            src,
            std::ptr::null_mut(),
            dest,
            std::ptr::null_mut(),
            len,
            libc::SPLICE_F_NONBLOCK,
        )
    })?;
    Ok(n as usize)
}

/// Non-blocking close-on-exec pipe pair `(read, write)`.
pub(crate) fn pipe() -> Result<(OwnedFd, OwnedFd), Errno> {
    let mut fds = [0 as libc::c_int; 2];
    Errno::result(unsafe {
        libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK)
    })?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

pub(crate) fn eventfd() -> Result<OwnedFd, Errno> {
    let fd = Errno::result(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Posts one wakeup tick. A bare `write` on an eventfd is async-signal-safe,
/// which is what makes [`Reactor::wakeup`](crate::reactor::Reactor::wakeup)
/// callable from arbitrary threads.
pub(crate) fn eventfd_write(fd: RawFd) {
    let one: u64 = 1;
    unsafe {
        libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
    }
}

pub(crate) fn eventfd_drain(fd: RawFd) {
    let mut buf = [0u8; 8];
    loop {
        match read(fd, &mut buf) {
            Ok(_) => continue,
            Err(_) => return,
        }
    }
}

pub(crate) fn pidfd_open(pid: libc::pid_t) -> Result<OwnedFd, Errno> {
    let fd = Errno::result(unsafe {
        libc::syscall(libc::SYS_pidfd_open, pid as libc::c_long, 0 as libc::c_long)
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Reaps an exited child. Called after its pidfd reports readable, so
/// `WNOHANG` never races an unfinished child.
pub(crate) fn reap(pid: libc::pid_t) -> Result<(i32, i32), Errno> {
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};

    match waitpid(nix::unistd::Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG))? {
        WaitStatus::Exited(p, code) => Ok((p.as_raw(), code)),
        WaitStatus::Signaled(p, sig, _) => Ok((p.as_raw(), 128 + sig as i32)),
        _ => Ok((pid, 0)),
    }
}

pub(crate) fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> Result<usize, Errno> {
    let n = retry_eintr!(unsafe {
        libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms)
    })?;
    Ok(n as usize)
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    // Octets are already network order.
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Unix stream socketpair, used by the I/O tests.
#[cfg(test)]
pub(crate) fn socketpair() -> Result<(OwnedFd, OwnedFd), Errno> {
    let mut fds = [0 as libc::c_int; 2];
    Errno::result(unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    })?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}
