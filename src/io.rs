//! The i/o manager: scheduler + timers + an epoll set.
//!
//! [`IoManager`] extends the [`Scheduler`](crate::sched::Scheduler) with
//! readiness tracking. Fibers (or callbacks) register interest in a
//! descriptor becoming readable or writable with [`IoManager::add_event`];
//! when the kernel reports readiness, the waiter is pushed back onto the
//! ready queue. Worker threads with nothing to run sit in `epoll_wait`
//! inside the idle fiber, bounded by the earliest timer deadline.
//!
//! A one-byte write to a non-blocking self-pipe ("tickle") interrupts a
//! blocked `epoll_wait` when new work or an earlier timer arrives.

use std::any::Any;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bitflags::bitflags;
use log::{debug, error, info};

use crate::error::cvt;
use crate::fiber::{self, Fiber};
use crate::sched::{self, Scheduler, Task};
use crate::timer::{TimerHandle, TimerList};

/// Upper bound for one `epoll_wait`, so timers and the stop flag are
/// re-checked even with no traffic at all.
const MAX_TIMEOUT_MS: u64 = 3_000;
const MAX_EVENTS: usize = 256;

bitflags! {
    /// Readiness interests, bit-compatible with the epoll event mask.
    pub struct Event: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

enum Waiter {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

struct EventCtx {
    /// The scheduler that registered the interest; the waiter is requeued
    /// there. Non-owning by design.
    sched: Weak<Scheduler>,
    waiter: Waiter,
}

#[derive(Default)]
struct FdInner {
    events: Option<Event>,
    read: Option<EventCtx>,
    write: Option<EventCtx>,
}

struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

impl FdInner {
    #[inline(always)]
    fn events(&self) -> Event {
        self.events.unwrap_or(Event::empty())
    }

    fn slot(&mut self, event: Event) -> &mut Option<EventCtx> {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

pub struct IoManager {
    sched: Arc<Scheduler>,
    timers: TimerList,
    epfd: RawFd,
    tickle_fds: [RawFd; 2],
    contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Interests registered with the kernel but not yet delivered.
    pending: AtomicUsize,
}

impl IoManager {
    /// Builds the scheduler, the epoll set and the self-pipe, and starts the
    /// workers. See [`Scheduler::new`] for `threads`/`use_caller`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> crate::Result<Arc<IoManager>> {
        let sched = Scheduler::new(threads, use_caller, name);
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let mut pipe = [0 as RawFd; 2];
        // SAFETY: out-array of two descriptors.
        cvt(unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) })?;
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32 | libc::EPOLLET as u32,
            u64: pipe[0] as u64,
        };
        // SAFETY: both descriptors were just created.
        cvt(unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe[0], &mut ev) })?;

        let io = Arc::new(IoManager {
            sched,
            timers: TimerList::new(),
            epfd,
            tickle_fds: pipe,
            contexts: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
        });
        io.resize_contexts(32);
        io.sched.attach_reactor(Arc::downgrade(&io));
        io.sched.start();
        info!("{}: io manager started", io.sched.name());
        Ok(io)
    }

    /// The i/o manager driving the current thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        sched::current()?.reactor()
    }

    #[inline(always)]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    #[inline(always)]
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Runs a callback on any worker.
    #[inline]
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.schedule(f);
    }

    /// Resumes a fiber on any worker.
    #[inline]
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.sched.schedule_fiber(fiber);
    }

    /// Requests shutdown and joins the workers. Pending events and queued
    /// timers keep the workers polling until they drain.
    pub fn stop(&self) {
        self.sched.stop();
    }

    // -- timers ------------------------------------------------------------

    /// Arms a timer; a new earliest deadline interrupts a blocked wait.
    pub fn add_timer<F>(&self, period_ms: u64, callback: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (handle, at_front) = self.timers.add(period_ms, callback, recurring);
        if at_front {
            self.tickle();
        }
        handle
    }

    /// Arms a timer gated on `cond` staying alive.
    pub fn add_condition_timer<F>(
        &self,
        period_ms: u64,
        callback: F,
        cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (handle, at_front) = self.timers.add_condition(period_ms, callback, cond, recurring);
        if at_front {
            self.tickle();
        }
        handle
    }

    // -- readiness interests ----------------------------------------------

    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        {
            let contexts = self.contexts.read().expect("fd table lock poisoned");
            if let Some(ctx) = contexts.get(fd as usize) {
                return ctx.clone();
            }
        }
        self.resize_contexts(fd as usize * 3 / 2 + 1);
        let contexts = self.contexts.read().expect("fd table lock poisoned");
        contexts[fd as usize].clone()
    }

    fn resize_contexts(&self, len: usize) {
        let mut contexts = self.contexts.write().expect("fd table lock poisoned");
        let mut fd = contexts.len() as RawFd;
        while contexts.len() < len {
            contexts.push(Arc::new(FdContext {
                fd,
                inner: Mutex::new(FdInner::default()),
            }));
            fd += 1;
        }
    }

    /// Registers interest in `event` on `fd`. Without a callback the current
    /// fiber is captured and will be rescheduled on readiness. Registering an
    /// interest that is already present is refused.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        callback: Option<Box<dyn FnOnce() + Send>>,
    ) -> crate::Result<()> {
        debug_assert!(event == Event::READ || event == Event::WRITE);
        let ctx = self.fd_context(fd);
        let mut inner = ctx.inner.lock().expect("fd context lock poisoned");
        // Serialized with `hook::close` through this mutex: once the entry
        // is marked closed, no new waiter may park on the descriptor.
        if let Some(entry) = crate::fd_manager::global().get(fd, false) {
            if entry.is_closed() {
                return Err(crate::Error::InvalidArgument(format!(
                    "fd {} is already closed",
                    fd
                )));
            }
        }
        if inner.events().contains(event) {
            return Err(crate::Error::InvalidArgument(format!(
                "event {:?} already registered for fd {}",
                event, fd
            )));
        }

        let op = if inner.events().is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | (inner.events() | event).bits(),
            u64: fd as u64,
        };
        // SAFETY: fd is a live descriptor owned by the caller; `ev` is valid.
        if let Err(e) = cvt(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) }) {
            error!("epoll_ctl({}, {}, {}) failed: {}", self.epfd, op, fd, e);
            return Err(e.into());
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        inner.events = Some(inner.events() | event);
        let waiter = match callback {
            Some(cb) => Waiter::Call(cb),
            None => Waiter::Fiber(fiber::current()),
        };
        let sched = sched::current()
            .map(|s| Arc::downgrade(&s))
            .unwrap_or_else(|| Arc::downgrade(&self.sched));
        *inner.slot(event) = Some(EventCtx { sched, waiter });
        Ok(())
    }

    /// Drops an interest without waking its waiter. `false` if absent.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let ctx = match self.lookup_context(fd) {
            Some(c) => c,
            None => return false,
        };
        let mut inner = ctx.inner.lock().expect("fd context lock poisoned");
        if !inner.events().contains(event) {
            return false;
        }
        if !self.rearm(fd, &mut inner, event) {
            return false;
        }
        inner.slot(event).take();
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Drops an interest and wakes its waiter as if it had become ready.
    /// This is the cancellation primitive: the woken side inspects its own
    /// "cancelled" cell to tell readiness from timeout.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let ctx = match self.lookup_context(fd) {
            Some(c) => c,
            None => return false,
        };
        let mut inner = ctx.inner.lock().expect("fd context lock poisoned");
        if !inner.events().contains(event) {
            return false;
        }
        if !self.rearm(fd, &mut inner, event) {
            return false;
        }
        if let Some(ctx) = inner.slot(event).take() {
            self.trigger(ctx);
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Cancels both interests of `fd`, waking any waiters.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.lookup_context(fd) {
            Some(c) => c,
            None => return false,
        };
        let mut inner = ctx.inner.lock().expect("fd context lock poisoned");
        if inner.events().is_empty() {
            return false;
        }
        let mut ev = libc::epoll_event { events: 0, u64: fd as u64 };
        // SAFETY: removing a registration we own.
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if rc != 0 {
            error!(
                "epoll_ctl(DEL, {}) failed: {}",
                fd,
                io::Error::last_os_error()
            );
        }
        for event in [Event::READ, Event::WRITE] {
            if inner.events().contains(event) {
                if let Some(ctx) = inner.slot(event).take() {
                    self.trigger(ctx);
                }
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
        inner.events = Some(Event::empty());
        true
    }

    fn lookup_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let contexts = self.contexts.read().expect("fd table lock poisoned");
        contexts.get(fd as usize).cloned()
    }

    /// Re-registers `fd` with its interests minus `event`.
    fn rearm(&self, fd: RawFd, inner: &mut FdInner, event: Event) -> bool {
        let left = inner.events() - event;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | left.bits(),
            u64: fd as u64,
        };
        // SAFETY: modifying a registration we own.
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            error!(
                "epoll_ctl({}, {}) failed: {}",
                op,
                fd,
                io::Error::last_os_error()
            );
            return false;
        }
        inner.events = Some(left);
        true
    }

    fn trigger(&self, ctx: EventCtx) {
        let sched = ctx.sched.upgrade().unwrap_or_else(|| self.sched.clone());
        match ctx.waiter {
            Waiter::Fiber(f) => sched.schedule_fiber(f),
            Waiter::Call(cb) => sched.schedule(cb),
        }
    }

    // -- the idle path -----------------------------------------------------

    /// Extends the scheduler's stop condition: no pending events and no
    /// queued timers may remain.
    pub(crate) fn stopping(&self) -> bool {
        self.sched.base_stopping()
            && self.pending.load(Ordering::SeqCst) == 0
            && !self.timers.has_timer()
    }

    /// Wakes one blocked `epoll_wait` if any worker is idle.
    pub(crate) fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        // SAFETY: one byte into our own pipe; overflow of the pipe buffer
        // only means the wake-up is already on its way.
        unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1) };
    }

    /// One turn of the idle fiber: wait for readiness or the next deadline,
    /// fold expired timers and readiness wake-ups back into the ready queue.
    /// Expired timers are enqueued before readiness waiters.
    pub(crate) fn idle_turn(&self) {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let timeout = self
            .timers
            .next_timer()
            .map(|ms| ms.min(MAX_TIMEOUT_MS))
            .unwrap_or(MAX_TIMEOUT_MS);

        let n = loop {
            // SAFETY: `events` outlives the call and the length matches.
            let rc = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    timeout as libc::c_int,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("epoll_wait failed: {}", err);
            break 0;
        };

        let mut expired = Vec::new();
        self.timers.collect_expired(&mut expired);
        if !expired.is_empty() {
            self.sched.submit_batch(
                expired
                    .into_iter()
                    .map(|cb| Task::callback(move || cb())),
            );
        }

        for ev in events.iter().take(n) {
            let (bits, data) = (ev.events, ev.u64);
            let fd = data as RawFd;
            if fd == self.tickle_fds[0] {
                self.drain_tickle_pipe();
                continue;
            }
            let ctx = match self.lookup_context(fd) {
                Some(c) => c,
                None => continue,
            };
            let mut inner = ctx.inner.lock().expect("fd context lock poisoned");
            let mut real = bits;
            if real & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                // An error or hangup wakes every registered interest so no
                // fiber stays parked on a dead descriptor.
                real |= (libc::EPOLLIN as u32 | libc::EPOLLOUT as u32) & inner.events().bits();
            }
            let triggered = Event::from_bits_truncate(real) & inner.events();
            if triggered.is_empty() {
                continue;
            }
            if !self.rearm(ctx.fd, &mut inner, triggered) {
                continue;
            }
            // Dispatch in the order the bits appear in the event mask.
            for event in [Event::READ, Event::WRITE] {
                if triggered.contains(event) {
                    if let Some(ectx) = inner.slot(event).take() {
                        self.trigger(ectx);
                    }
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            // SAFETY: reading our own non-blocking pipe into a local buffer.
            let rc = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rc <= 0 {
                break;
            }
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        debug!("{}: io manager shutting down", self.sched.name());
        // The reactor weak-ref is already dead here; wake any epoll sleeper
        // directly so the workers notice the stop flag promptly.
        // SAFETY: the pipe is still open, closed below after the join.
        unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1) };
        self.sched.stop();
        // SAFETY: workers are joined; nobody polls these descriptors.
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
