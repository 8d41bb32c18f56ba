//! Fiber-yielding equivalents of the blocking syscalls.
//!
//! Each entry point keeps the kernel's own semantics for return values while
//! replacing "block the thread" with "park the fiber": `EINTR` is retried,
//! `EAGAIN` registers a readiness interest on the ambient
//! [`IoManager`](crate::io::IoManager) and yields, and a configured
//! per-direction timeout arms a condition timer whose firing cancels the
//! wait with `ETIMEDOUT`.
//!
//! Interception is gated by a thread-local flag; the scheduler enables it on
//! every worker before user code runs. With the flag off (or outside a
//! worker) every function degrades to the plain libc call.

use std::any::Any;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{error, info};
use once_cell::sync::Lazy;

use crate::address::Address;
use crate::config::{self, ConfigVar};
use crate::error::cvt;
use crate::fd_manager::{self, FdEntry, TimeoutKind};
use crate::fiber;
use crate::io::{Event, IoManager};

std::thread_local! {
    static HOOK_ENABLED: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

#[inline(always)]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|h| h.get())
}

#[inline(always)]
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|h| h.set(enabled));
}

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(5_000);

static CONNECT_TIMEOUT: Lazy<Arc<ConfigVar<u64>>> = Lazy::new(|| {
    let var = config::lookup("tcp.connect.timeout", 5_000u64, "tcp connect timeout");
    CONNECT_TIMEOUT_MS.store(var.value(), Ordering::SeqCst);
    var.add_listener(|old, new| {
        info!("tcp connect timeout changed from {} to {}", old, new);
        CONNECT_TIMEOUT_MS.store(*new, Ordering::SeqCst);
    });
    var
});

fn connect_timeout_ms() -> u64 {
    Lazy::force(&CONNECT_TIMEOUT);
    CONNECT_TIMEOUT_MS.load(Ordering::SeqCst)
}

#[inline(always)]
fn cvt_size(n: libc::ssize_t) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Parks the current fiber until `fd` reports `event`, is cancelled, or the
/// timeout fires. A fired timeout surfaces as `ETIMEDOUT`.
fn wait_readiness(
    iom: &Arc<IoManager>,
    fd: RawFd,
    event: Event,
    timeout_ms: Option<u64>,
) -> io::Result<()> {
    // The shared "cancelled?" cell: the condition timer holds only a weak
    // reference, so a waiter that is gone disarms the timer by itself.
    let cancelled = Arc::new(AtomicBool::new(false));
    let timer = timeout_ms.map(|ms| {
        let cell = Arc::downgrade(&cancelled);
        let iom2 = iom.clone();
        iom.add_condition_timer(
            ms,
            move || {
                let cell = match cell.upgrade() {
                    Some(c) => c,
                    None => return,
                };
                if cell.swap(true, Ordering::SeqCst) {
                    return;
                }
                iom2.cancel_event(fd, event);
            },
            Arc::downgrade(&cancelled) as Weak<dyn Any + Send + Sync>,
            false,
        )
    });

    if let Err(e) = iom.add_event(fd, event, None) {
        if let Some(timer) = &timer {
            timer.cancel();
        }
        error!("add_event({}, {:?}) failed: {}", fd, event, e);
        return Err(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()));
    }
    fiber::yield_hold();

    if let Some(timer) = &timer {
        timer.cancel();
    }
    if cancelled.load(Ordering::SeqCst) {
        return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
    }
    Ok(())
}

/// The shared retry/park template of every hooked i/o call.
fn do_io<F>(fd: RawFd, event: Event, kind: TimeoutKind, mut op: F) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    if !is_hook_enabled() {
        return cvt_size(op());
    }
    let entry = match fd_manager::global().get(fd, true) {
        Some(e) => e,
        None => return cvt_size(op()),
    };
    if entry.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return cvt_size(op());
    }
    let timeout_ms = entry.timeout(kind);

    loop {
        let n = op();
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => {}
            _ => return Err(err),
        }
        let iom = match IoManager::current() {
            Some(iom) => iom,
            None => return Err(err),
        };
        wait_readiness(&iom, fd, event, timeout_ms)?;
    }
}

// -- reads ------------------------------------------------------------------

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, Event::READ, TimeoutKind::Recv, || {
        // SAFETY: the buffer is valid for `buf.len()` bytes for the call.
        unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) }
    })
}

pub fn readv(fd: RawFd, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
    do_io(fd, Event::READ, TimeoutKind::Recv, || {
        // SAFETY: IoSliceMut is ABI-compatible with iovec.
        unsafe {
            libc::readv(
                fd,
                bufs.as_ptr() as *const libc::iovec,
                bufs.len() as libc::c_int,
            )
        }
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, Event::READ, TimeoutKind::Recv, || {
        // SAFETY: as in `read`.
        unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags) }
    })
}

pub fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
) -> io::Result<(usize, Address)> {
    // SAFETY: zeroed storage filled by the kernel up to `len`.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = do_io(fd, Event::READ, TimeoutKind::Recv, || {
        // SAFETY: valid buffer and out-address of the declared sizes.
        unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        }
    })?;
    Ok((n, Address::from_storage(&storage, len)))
}

/// Scatter-gather receive through a caller-built `msghdr`.
///
/// # Safety
/// Every pointer inside `msg` must be valid for the kernel to fill.
pub unsafe fn recvmsg(fd: RawFd, msg: &mut libc::msghdr, flags: libc::c_int) -> io::Result<usize> {
    let msg = msg as *mut libc::msghdr;
    do_io(fd, Event::READ, TimeoutKind::Recv, || {
        libc::recvmsg(fd, msg, flags)
    })
}

// -- writes -----------------------------------------------------------------

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, Event::WRITE, TimeoutKind::Send, || {
        // SAFETY: the buffer is valid for `buf.len()` bytes for the call.
        unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) }
    })
}

pub fn writev(fd: RawFd, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
    do_io(fd, Event::WRITE, TimeoutKind::Send, || {
        // SAFETY: IoSlice is ABI-compatible with iovec.
        unsafe {
            libc::writev(
                fd,
                bufs.as_ptr() as *const libc::iovec,
                bufs.len() as libc::c_int,
            )
        }
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, Event::WRITE, TimeoutKind::Send, || {
        // SAFETY: as in `write`.
        unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) }
    })
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: libc::c_int, addr: &Address) -> io::Result<usize> {
    let (sockaddr, len) = addr.as_sockaddr();
    do_io(fd, Event::WRITE, TimeoutKind::Send, || {
        // SAFETY: the sockaddr pointer/length pair comes from `Address`.
        unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                flags,
                sockaddr,
                len,
            )
        }
    })
}

/// Scatter-gather send through a caller-built `msghdr`.
///
/// # Safety
/// Every pointer inside `msg` must be valid for the kernel to read.
pub unsafe fn sendmsg(fd: RawFd, msg: &libc::msghdr, flags: libc::c_int) -> io::Result<usize> {
    let msg = msg as *const libc::msghdr;
    do_io(fd, Event::WRITE, TimeoutKind::Send, || {
        libc::sendmsg(fd, msg, flags)
    })
}

// -- connection management --------------------------------------------------

/// Creates a socket and tracks it in the descriptor table.
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<RawFd> {
    let fd = cvt(unsafe { libc::socket(domain, ty, protocol) })?;
    fd_manager::global().get(fd, true);
    Ok(fd)
}

/// Accepts a connection, parking the fiber until one is pending. The new
/// descriptor is tracked (and switched to non-blocking).
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let n = do_io(fd, Event::READ, TimeoutKind::Recv, || {
        // SAFETY: null address out-params are allowed for accept.
        unsafe { libc::accept(fd, ptr::null_mut(), ptr::null_mut()) as libc::ssize_t }
    })?;
    let client = n as RawFd;
    fd_manager::global().get(client, true);
    Ok(client)
}

/// `connect` with the `tcp.connect.timeout` default.
pub fn connect(fd: RawFd, addr: &Address) -> io::Result<()> {
    connect_with_timeout(fd, addr, Some(connect_timeout_ms()))
}

/// The bespoke connect path: one plain attempt, then `EINPROGRESS` parks the
/// fiber on WRITE readiness and the outcome is read back from `SO_ERROR`.
pub fn connect_with_timeout(fd: RawFd, addr: &Address, timeout_ms: Option<u64>) -> io::Result<()> {
    let (sockaddr, addrlen) = addr.as_sockaddr();
    // SAFETY: the sockaddr pointer/length pair comes from `Address`.
    let raw_connect = || cvt(unsafe { libc::connect(fd, sockaddr, addrlen) }).map(|_| ());

    if !is_hook_enabled() {
        return raw_connect();
    }
    let entry = match fd_manager::global().get(fd, true) {
        Some(e) => e,
        None => return raw_connect(),
    };
    if entry.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return raw_connect();
    }

    match raw_connect() {
        Ok(()) => return Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    let iom = match IoManager::current() {
        Some(iom) => iom,
        None => return Err(io::Error::from_raw_os_error(libc::EINPROGRESS)),
    };
    wait_readiness(&iom, fd, Event::WRITE, timeout_ms)?;

    match socket_error(fd)? {
        0 => Ok(()),
        errno => Err(io::Error::from_raw_os_error(errno)),
    }
}

fn socket_error(fd: RawFd) -> io::Result<libc::c_int> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: out-value of the declared size.
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(err)
}

/// Closes `fd`, first cancelling any readiness waiters so no fiber stays
/// parked on a descriptor that has ceased to exist.
pub fn close(fd: RawFd) -> io::Result<()> {
    if is_hook_enabled() {
        if let Some(entry) = fd_manager::global().get(fd, false) {
            // Mark first: a racing registration sees the closed flag and
            // fails instead of parking on a descriptor about to vanish.
            entry.mark_closed();
            if let Some(iom) = IoManager::current() {
                iom.cancel_all(fd);
            }
            fd_manager::global().del(fd);
        }
    }
    // SAFETY: ownership of the descriptor ends here.
    cvt(unsafe { libc::close(fd) }).map(|_| ())
}

// -- sleeping ---------------------------------------------------------------

/// Parks the current fiber for `duration` without blocking its worker.
/// Falls back to `thread::sleep` outside the runtime.
pub fn sleep(duration: Duration) {
    let iom = if is_hook_enabled() {
        IoManager::current()
    } else {
        None
    };
    let iom = match iom {
        Some(iom) => iom,
        None => return std::thread::sleep(duration),
    };
    let cur = fiber::current();
    let sched = iom.scheduler().clone();
    iom.add_timer(
        duration.as_millis() as u64,
        move || sched.schedule_fiber(cur.clone()),
        false,
    );
    fiber::yield_hold();
}

pub fn usleep(micros: u64) {
    sleep(Duration::from_micros(micros));
}

pub fn nanosleep(nanos: u64) {
    sleep(Duration::from_nanos(nanos));
}

// -- descriptor control shims ----------------------------------------------

/// `fcntl(F_SETFL)`: the user's `O_NONBLOCK` preference is recorded, but the
/// kernel descriptor of a tracked socket stays non-blocking.
pub fn fcntl_setfl(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    let mut flags = flags;
    if let Some(entry) = tracked_socket(fd) {
        entry.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
        if entry.sys_nonblock() {
            flags |= libc::O_NONBLOCK;
        } else {
            flags &= !libc::O_NONBLOCK;
        }
    }
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }).map(|_| ())
}

/// `fcntl(F_GETFL)` restoring the user-visible `O_NONBLOCK` bit.
pub fn fcntl_getfl(fd: RawFd) -> io::Result<libc::c_int> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL, 0) })?;
    match tracked_socket(fd) {
        Some(entry) if entry.user_nonblock() => Ok(flags | libc::O_NONBLOCK),
        Some(_) => Ok(flags & !libc::O_NONBLOCK),
        None => Ok(flags),
    }
}

/// `ioctl(FIONBIO)` equivalent, tracked the same way as `F_SETFL`.
pub fn ioctl_fionbio(fd: RawFd, on: bool) -> io::Result<()> {
    if let Some(entry) = tracked_socket(fd) {
        entry.set_user_nonblock(on);
        return Ok(());
    }
    let mut arg: libc::c_int = on as libc::c_int;
    // SAFETY: FIONBIO takes a pointer to int.
    cvt(unsafe { libc::ioctl(fd, libc::FIONBIO, &mut arg) }).map(|_| ())
}

fn tracked_socket(fd: RawFd) -> Option<Arc<FdEntry>> {
    let entry = fd_manager::global().get(fd, false)?;
    if entry.is_closed() || !entry.is_socket() {
        return None;
    }
    Some(entry)
}

/// The `SO_RCVTIMEO`/`SO_SNDTIMEO` shim: the timeout is recorded for the
/// hook layer and forwarded to the kernel for the non-hooked fallback paths.
pub fn set_socket_timeout(
    fd: RawFd,
    kind: TimeoutKind,
    timeout: Option<Duration>,
) -> io::Result<()> {
    if let Some(entry) = fd_manager::global().get(fd, true) {
        entry.set_timeout(kind, timeout);
    }
    let timeout = timeout.unwrap_or(Duration::from_secs(0));
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let optname = match kind {
        TimeoutKind::Recv => libc::SO_RCVTIMEO,
        TimeoutKind::Send => libc::SO_SNDTIMEO,
    };
    // SAFETY: `tv` lives across the call.
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            optname,
            &tv as *const libc::timeval as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    })
    .map(|_| ())
}

/// The recorded per-direction timeout, if any.
pub fn socket_timeout(fd: RawFd, kind: TimeoutKind) -> Option<Duration> {
    fd_manager::global()
        .get(fd, false)?
        .timeout(kind)
        .map(Duration::from_millis)
}
