//! Suspending I/O operations.
//!
//! Every operation follows the same shape: make the fd non-blocking
//! (idempotent), attempt the syscall, and on `EAGAIN`/`EWOULDBLOCK` park on
//! the reactor until the fd is ready, then retry. Multi-byte transfers that
//! made partial progress snooze between iterations so one busy fd cannot
//! starve the scheduler. Readers return `0` at EOF; writers complete the
//! full buffer unless unwound by an injected error.

use crate::fiber::Error;
use crate::ops::{snooze, wait_fd, wait_fd_rw, wait_io};
use crate::reactor::Interest;
use crate::utils::sys;
use nix::errno::Errno;
use smallvec::SmallVec;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

// Chain batches rarely exceed a handful of ops; keep them off the heap.
const CHAIN_INLINE_OPS: usize = 8;

fn nonblocking(fd: RawFd) -> Result<(), Error> {
    sys::set_nonblocking(fd).map_err(|e| Error::syscall("fcntl", e))
}

/// Reads once into `buf`, suspending until at least one byte is available.
/// Returns `0` at EOF.
pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize, Error> {
    nonblocking(fd)?;
    loop {
        match sys::read(fd, buf) {
            Ok(n) => return Ok(n),
            Err(Errno::EAGAIN) => wait_fd(fd, Interest::READ).map(drop)?,
            Err(e) => return Err(Error::syscall("read", e)),
        }
    }
}

/// Reads until EOF, appending to `buf`; returns the number of bytes read.
pub fn read_to_end(fd: RawFd, buf: &mut Vec<u8>) -> Result<usize, Error> {
    nonblocking(fd)?;
    let mut chunk = [0u8; 8192];
    let mut total = 0;
    loop {
        match sys::read(fd, &mut chunk) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                total += n;
                snooze()?;
            }
            Err(Errno::EAGAIN) => wait_fd(fd, Interest::READ).map(drop)?,
            Err(e) => return Err(Error::syscall("read", e)),
        }
    }
}

/// Writes the whole of `buf`.
pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize, Error> {
    write_all(fd, buf, true)
}

/// Receives once, suspending until data is available. Returns `0` when the
/// peer shut down.
pub fn recv(fd: RawFd, buf: &mut [u8]) -> Result<usize, Error> {
    nonblocking(fd)?;
    loop {
        match sys::recv(fd, buf) {
            Ok(n) => return Ok(n),
            Err(Errno::EAGAIN) => wait_fd(fd, Interest::READ).map(drop)?,
            Err(e) => return Err(Error::syscall("recv", e)),
        }
    }
}

/// Sends the whole of `buf`.
pub fn send(fd: RawFd, buf: &[u8]) -> Result<usize, Error> {
    send_all(fd, buf, true)
}

/// Accepts one connection, suspending until a peer arrives. The returned fd
/// is close-on-exec; ownership passes to the caller.
pub fn accept(fd: RawFd) -> Result<RawFd, Error> {
    nonblocking(fd)?;
    loop {
        match sys::accept(fd) {
            Ok(conn) => return Ok(conn),
            Err(Errno::EAGAIN) => wait_fd(fd, Interest::READ).map(drop)?,
            Err(e) => return Err(Error::syscall("accept", e)),
        }
    }
}

/// Connects `fd` to `addr`, suspending through the in-progress phase.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> Result<(), Error> {
    nonblocking(fd)?;
    match sys::connect(fd, addr) {
        Ok(()) => Ok(()),
        // An interrupted connect keeps going in the background; both cases
        // resolve once the socket reports writable.
        Err(Errno::EINPROGRESS) | Err(Errno::EINTR) => {
            wait_io(fd, true)?;
            match sys::take_socket_error(fd).map_err(|e| Error::syscall("getsockopt", e))? {
                None => Ok(()),
                Some(errno) => Err(Error::syscall("connect", errno)),
            }
        }
        Err(e) => Err(Error::syscall("connect", e)),
    }
}

/// Gather-writes every buffer in `bufs`, completing all of them.
pub fn writev(fd: RawFd, bufs: &[&[u8]]) -> Result<usize, Error> {
    nonblocking(fd)?;
    let total: usize = bufs.iter().map(|b| b.len()).sum();
    if total == 0 {
        return Ok(0);
    }

    let mut iovecs: SmallVec<[libc::iovec; CHAIN_INLINE_OPS]> = bufs
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();

    let mut written = 0;
    let mut first = 0;
    while written < total {
        match sys::writev(fd, &iovecs[first..]) {
            Ok(n) => {
                written += n;
                if written == total {
                    break;
                }
                // Skip fully written buffers and trim the partial one.
                let mut n = n;
                while n >= iovecs[first].iov_len {
                    n -= iovecs[first].iov_len;
                    first += 1;
                }
                if n > 0 {
                    iovecs[first].iov_base =
                        unsafe { (iovecs[first].iov_base as *mut u8).add(n) as *mut libc::c_void };
                    iovecs[first].iov_len -= n;
                }
                snooze()?;
            }
            Err(Errno::EAGAIN) => wait_fd(fd, Interest::WRITE).map(drop)?,
            Err(e) => return Err(Error::syscall("writev", e)),
        }
    }
    Ok(total)
}

/// Splices up to `maxlen` bytes from `src` to `dest` (one of them a pipe),
/// suspending until either side can move data. Returns `0` at EOF.
pub fn splice(src: RawFd, dest: RawFd, maxlen: usize) -> Result<usize, Error> {
    nonblocking(src)?;
    nonblocking(dest)?;
    loop {
        match sys::splice(src, dest, maxlen) {
            Ok(n) => return Ok(n),
            Err(Errno::EAGAIN) => wait_fd_rw(src, dest).map(drop)?,
            Err(e) => return Err(Error::syscall("splice", e)),
        }
    }
}

/// One step of a [`chain`].
pub enum ChainOp<'a> {
    Write { fd: RawFd, buf: &'a [u8] },
    Send { fd: RawFd, buf: &'a [u8] },
    Splice { src: RawFd, dest: RawFd, maxlen: usize },
}

/// Executes `ops` back-to-back without intermediate scheduling, failing fast
/// on the first failing op. Returns the total bytes moved.
pub fn chain(ops: &[ChainOp<'_>]) -> Result<usize, Error> {
    let mut total = 0;
    for op in ops {
        total += match op {
            ChainOp::Write { fd, buf } => write_all(*fd, buf, false)?,
            ChainOp::Send { fd, buf } => send_all(*fd, buf, false)?,
            ChainOp::Splice { src, dest, maxlen } => splice(*src, *dest, *maxlen)?,
        };
    }
    Ok(total)
}

/// Framing for [`splice_chunks`]: a fixed buffer, or one computed from the
/// chunk length.
pub enum ChunkMarker<'a> {
    Fixed(&'a [u8]),
    Dynamic(&'a (dyn Fn(usize) -> Vec<u8> + Sync)),
}

/// Splices `src` into `dest` through a pipe in chunks of at most
/// `chunk_size` bytes, wrapping the stream in optional `prefix`/`postfix`
/// and each chunk in optional markers. Returns the total bytes spliced
/// (markers excluded).
#[allow(clippy::too_many_arguments)]
pub fn splice_chunks(
    src: RawFd,
    dest: RawFd,
    prefix: Option<&[u8]>,
    postfix: Option<&[u8]>,
    chunk_prefix: Option<&ChunkMarker<'_>>,
    chunk_postfix: Option<&ChunkMarker<'_>>,
    chunk_size: usize,
) -> Result<usize, Error> {
    nonblocking(src)?;
    nonblocking(dest)?;
    let (pipe_read, pipe_write) = sys::pipe().map_err(|e| Error::syscall("pipe2", e))?;

    let mut total = 0;
    if let Some(prefix) = prefix {
        write_all(dest, prefix, false)?;
    }
    loop {
        // The pipe is drained at this point, so a would-block can only mean
        // the source is empty; wait on it alone.
        let chunk_len = splice_once(src, pipe_write.as_raw_fd(), chunk_size, src, Interest::READ)?;
        if chunk_len == 0 {
            break;
        }
        if let Some(marker) = chunk_prefix {
            write_marker(dest, marker, chunk_len)?;
        }

        let mut left = chunk_len;
        while left > 0 {
            // The pipe holds `left` bytes, so a would-block can only mean
            // the destination is full.
            let moved =
                splice_once(pipe_read.as_raw_fd(), dest, left, dest, Interest::WRITE)?;
            if moved == 0 {
                return Err(Error::failure("pipe drained early during splice_chunks"));
            }
            left -= moved;
        }

        if let Some(marker) = chunk_postfix {
            write_marker(dest, marker, chunk_len)?;
        }
        total += chunk_len;
        snooze()?;
    }
    if let Some(postfix) = postfix {
        write_all(dest, postfix, false)?;
    }
    Ok(total)
}

// Splice with a known bottleneck side to park on.
fn splice_once(
    src: RawFd,
    dest: RawFd,
    maxlen: usize,
    wait_target: RawFd,
    interest: Interest,
) -> Result<usize, Error> {
    loop {
        match sys::splice(src, dest, maxlen) {
            Ok(n) => return Ok(n),
            Err(Errno::EAGAIN) => wait_fd(wait_target, interest).map(drop)?,
            Err(e) => return Err(Error::syscall("splice", e)),
        }
    }
}

fn write_marker(fd: RawFd, marker: &ChunkMarker<'_>, chunk_len: usize) -> Result<(), Error> {
    match marker {
        ChunkMarker::Fixed(buf) => write_all(fd, buf, false)?,
        ChunkMarker::Dynamic(f) => write_all(fd, &f(chunk_len), false)?,
    };
    Ok(())
}

// `fair` controls the snooze between partial writes; chained ops run
// back-to-back and skip it.
fn write_all(fd: RawFd, buf: &[u8], fair: bool) -> Result<usize, Error> {
    nonblocking(fd)?;
    let mut written = 0;
    while written < buf.len() {
        match sys::write(fd, &buf[written..]) {
            Ok(n) => {
                written += n;
                if fair && written < buf.len() {
                    snooze()?;
                }
            }
            Err(Errno::EAGAIN) => wait_fd(fd, Interest::WRITE).map(drop)?,
            Err(e) => return Err(Error::syscall("write", e)),
        }
    }
    Ok(written)
}

fn send_all(fd: RawFd, buf: &[u8], fair: bool) -> Result<usize, Error> {
    nonblocking(fd)?;
    let mut sent = 0;
    while sent < buf.len() {
        match sys::send(fd, &buf[sent..]) {
            Ok(n) => {
                sent += n;
                if fair && sent < buf.len() {
                    snooze()?;
                }
            }
            Err(Errno::EAGAIN) => wait_fd(fd, Interest::WRITE).map(drop)?,
            Err(e) => return Err(Error::syscall("send", e)),
        }
    }
    Ok(sent)
}
