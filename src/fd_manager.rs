//! Per-descriptor bookkeeping for the hook layer.
//!
//! Every descriptor that goes through [`crate::hook`] gets an [`FdEntry`]
//! recording whether it is a socket, the user-visible `O_NONBLOCK` bit, and
//! the per-direction timeouts. The kernel descriptor of a tracked socket is
//! always switched to non-blocking; the user's own non-blocking preference is
//! only bookkeeping, restored by the `fcntl(F_GETFL)` shim.

use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;

/// Timeout direction, the `SO_RCVTIMEO`/`SO_SNDTIMEO` pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimeoutKind {
    Recv,
    Send,
}

const NO_TIMEOUT: u64 = u64::MAX;

pub struct FdEntry {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdEntry {
    fn init(fd: RawFd) -> FdEntry {
        // SAFETY: zeroed stat buffer filled by the kernel; a failed fstat
        // just means "not a socket" for our purposes.
        let mut st: libc::stat = unsafe { mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut st) } == 0
            && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        let entry = FdEntry {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        };
        if is_socket {
            // SAFETY: querying/setting flags on a descriptor we were handed.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            entry.sys_nonblock.store(true, Ordering::Relaxed);
        }
        entry
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline(always)]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Relaxed);
    }

    /// Per-direction timeout in milliseconds, `None` when unset.
    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let ms = match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Relaxed),
        };
        if ms == NO_TIMEOUT {
            None
        } else {
            Some(ms)
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, timeout: Option<Duration>) {
        let ms = timeout.map(|d| d.as_millis() as u64).unwrap_or(NO_TIMEOUT);
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Relaxed),
        }
    }
}

/// Dense descriptor table, grown by half on demand.
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdEntry>>>>,
}

impl FdTable {
    fn new() -> FdTable {
        FdTable {
            slots: RwLock::new(vec![None; 64]),
        }
    }

    /// Returns the entry for `fd`. With `auto_create`, a missing entry is
    /// initialized (probing the descriptor); without it `None` is returned.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read().expect("fd table lock poisoned");
            match slots.get(fd as usize) {
                Some(Some(entry)) => return Some(entry.clone()),
                Some(None) | None if !auto_create => return None,
                _ => {}
            }
        }
        let mut slots = self.slots.write().expect("fd table lock poisoned");
        if slots.len() <= fd as usize {
            slots.resize(fd as usize * 3 / 2 + 1, None);
        }
        let slot = &mut slots[fd as usize];
        match slot {
            Some(entry) => Some(entry.clone()),
            None => {
                let entry = Arc::new(FdEntry::init(fd));
                *slot = Some(entry.clone());
                Some(entry)
            }
        }
    }

    /// Drops the entry for `fd` (on close).
    pub fn del(&self, fd: RawFd) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        let mut slots = self.slots.write().expect("fd table lock poisoned");
        let entry = slots.get_mut(fd as usize)?.take();
        if let Some(e) = &entry {
            e.mark_closed();
        }
        entry
    }
}

/// The process-wide descriptor table.
pub fn global() -> &'static FdTable {
    static TABLE: Lazy<FdTable> = Lazy::new(FdTable::new);
    &TABLE
}
