//! Stackful cooperative fibers.
//!
//! A [`Fiber`] is a user-mode execution context with its own stack, swapped in
//! and out explicitly with Posix `ucontext` primitives. Exactly one fiber per
//! thread is executing at any time; every thread lazily materializes a
//! *thread-main* fiber the first time [`current`] is called so there is always
//! a resumable root to return to.
//!
//! Two swap pairs exist:
//! - [`Fiber::swap_in`]/[`Fiber::swap_out`] move control between a fiber and
//!   the thread's *scheduler fiber* (installed by the worker loop),
//! - [`Fiber::call`]/[`Fiber::back`] move control between the thread-main
//!   fiber and a use-caller root fiber.
//!
//! A fiber entry that panics is caught at the swap boundary: the panic is
//! logged, the fiber moves to [`State::Except`] and control returns to the
//! scheduler fiber as if the entry had completed.

use std::cell::{RefCell, UnsafeCell};
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error};
use once_cell::sync::Lazy;

use crate::config::{self, ConfigVar};

static STACK_SIZE: Lazy<Arc<ConfigVar<u64>>> =
    Lazy::new(|| config::lookup("fiber.stack_size", 1024 * 1024u64, "fiber stack size"));

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicUsize = AtomicUsize::new(0);

/// Lifecycle state of a fiber.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum State {
    /// Created or reset, never swapped in.
    Init = 0,
    /// Runnable, queued or about to be queued.
    Ready = 1,
    /// Parked; woken explicitly by the i/o manager or a timer.
    Hold = 2,
    /// Currently executing on some thread.
    Exec = 3,
    /// Entry returned normally.
    Term = 4,
    /// Entry panicked.
    Except = 5,
}

impl State {
    #[inline(always)]
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Ready,
            2 => State::Hold,
            3 => State::Exec,
            4 => State::Term,
            _ => State::Except,
        }
    }

    /// `true` for the two terminal states.
    #[inline(always)]
    pub fn is_done(self) -> bool {
        matches!(self, State::Term | State::Except)
    }
}

/// An mmap'ed stack with a `PROT_NONE` guard page below the usable area.
struct Stack {
    base: *mut libc::c_void,
    len: usize,
    page: usize,
}

impl Stack {
    fn alloc(size: usize) -> io::Result<Stack> {
        // SAFETY: plain sysconf query.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = (size + page - 1) / page * page + page;
        // SAFETY: anonymous mapping, address chosen by the kernel.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the first page of the fresh mapping; a stack overflow now
        // faults instead of silently corrupting the neighbouring allocation.
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base, len) };
            return Err(err);
        }
        Ok(Stack { base, len, page })
    }

    #[inline(always)]
    fn usable(&self) -> (*mut libc::c_void, usize) {
        // SAFETY: stays inside the mapping, right above the guard page.
        let sp = unsafe { (self.base as *mut u8).add(self.page) };
        (sp as *mut libc::c_void, self.len - self.page)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: exactly the mapping returned by mmap in `alloc`.
        unsafe { libc::munmap(self.base, self.len) };
    }
}

struct Inner {
    ctx: libc::ucontext_t,
    stack: Option<Stack>,
    entry: Option<Box<dyn FnOnce() + Send>>,
    /// `swap_out` of a use-caller root fiber returns to the thread-main
    /// fiber instead of the scheduler fiber.
    caller_root: bool,
}

/// A stackful fiber. Shared ownership; the scheduler and any waiter wanting
/// to wake the fiber keep clones of the same `Arc<Fiber>`.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    inner: UnsafeCell<Inner>,
}

// SAFETY: the context, stack and entry inside `inner` are only ever touched
// by the thread that currently runs or resumes the fiber, and a fiber runs on
// exactly one thread at a time (the scheduler moves fibers between threads
// only while they are suspended, after `swapcontext` finished saving the
// context on the previous thread).
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static SCHED_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

impl Fiber {
    /// Creates a fiber in [`State::Init`]. A `stack_size` of 0 uses the
    /// `fiber.stack_size` config entry. `caller_root` marks the use-caller
    /// scheduler fiber, whose `swap_out` returns to the thread-main fiber.
    pub fn new<F>(entry: F, stack_size: usize, caller_root: bool) -> crate::Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new_boxed(Box::new(entry), stack_size, caller_root)
    }

    pub(crate) fn new_boxed(
        entry: Box<dyn FnOnce() + Send>,
        stack_size: usize,
        caller_root: bool,
    ) -> crate::Result<Arc<Fiber>> {
        let size = if stack_size == 0 {
            STACK_SIZE.value() as usize
        } else {
            stack_size
        };
        let stack = Stack::alloc(size)?;
        let fiber = Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(State::Init as u8),
            // SAFETY: the context is fully initialized by `make_context`
            // below before the fiber can be swapped in.
            inner: UnsafeCell::new(Inner {
                ctx: unsafe { mem::zeroed() },
                stack: Some(stack),
                entry: Some(entry),
                caller_root,
            }),
        });
        // SAFETY: we are the only reference; nothing runs on this stack yet.
        unsafe { fiber.make_context()? };
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        debug!("fiber {} created", fiber.id);
        Ok(fiber)
    }

    /// The thread-main fiber: no own stack, context filled by the first swap
    /// away from it.
    fn main_fiber() -> Fiber {
        Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(State::Exec as u8),
            // SAFETY: a zeroed ucontext_t is never resumed before a
            // swapcontext call has saved a live context into it.
            inner: UnsafeCell::new(Inner {
                ctx: unsafe { mem::zeroed() },
                stack: None,
                entry: None,
                caller_root: false,
            }),
        }
    }

    unsafe fn make_context(&self) -> io::Result<()> {
        let inner = &mut *self.inner.get();
        if libc::getcontext(&mut inner.ctx) != 0 {
            return Err(io::Error::last_os_error());
        }
        let stack = inner.stack.as_ref().expect("make_context on a stackless fiber");
        let (sp, len) = stack.usable();
        inner.ctx.uc_link = ptr::null_mut();
        inner.ctx.uc_stack.ss_sp = sp;
        inner.ctx.uc_stack.ss_size = len;
        libc::makecontext(&mut inner.ctx, fiber_entry, 0);
        Ok(())
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn is_caller_root(&self) -> bool {
        // SAFETY: `caller_root` is set at construction and never mutated.
        unsafe { (*self.inner.get()).caller_root }
    }

    /// Rearms a finished (or never started) fiber with a new entry, reusing
    /// the stack. Permitted only in Init/Term/Except.
    pub fn reset<F>(&self, entry: F) -> crate::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(entry))
    }

    pub(crate) fn reset_boxed(&self, entry: Box<dyn FnOnce() + Send>) -> crate::Result<()> {
        let state = self.state();
        if !matches!(state, State::Init | State::Term | State::Except) {
            return Err(crate::Error::InvalidArgument(format!(
                "cannot reset fiber {} in state {:?}",
                self.id, state
            )));
        }
        // SAFETY: the fiber is not running (state checked above) and the
        // caller is its unique driver at this point.
        unsafe {
            (*self.inner.get()).entry = Some(entry);
            self.make_context()?;
        }
        self.set_state(State::Init);
        Ok(())
    }

    /// Swaps from the current thread's scheduler fiber into this one.
    /// The callee becomes [`State::Exec`]; the scheduler fiber's context is
    /// the resume point for the next `swap_out`.
    pub fn swap_in(self: &Arc<Self>) {
        let from = scheduler_fiber().expect("swap_in called outside a scheduler thread");
        debug_assert!(self.state() != State::Exec);
        self.set_state(State::Exec);
        set_current(self.clone());
        // SAFETY: `from` is suspended by this very call; `self` holds a
        // context prepared by make_context or a previous swap.
        unsafe { swap(&from, self) };
    }

    /// Returns control to the thread's scheduler fiber (or, for a use-caller
    /// root, to the thread-main fiber). The state is left as-is; the worker
    /// loop decides between requeue and Hold after it regains control, once
    /// this context is fully saved.
    pub fn swap_out(self: &Arc<Self>) {
        if self.is_caller_root() {
            self.back();
            return;
        }
        let to = scheduler_fiber().expect("swap_out called outside a scheduler thread");
        set_current(to.clone());
        // SAFETY: as in `swap_in`, with the roles reversed.
        unsafe { swap(self, &to) };
    }

    /// Use-caller entry: swaps from the thread-main fiber into this one.
    pub fn call(self: &Arc<Self>) {
        let from = thread_main();
        self.set_state(State::Exec);
        set_current(self.clone());
        // SAFETY: see `swap_in`.
        unsafe { swap(&from, self) };
    }

    /// Use-caller exit: swaps back to the thread-main fiber.
    pub fn back(self: &Arc<Self>) {
        let to = thread_main();
        set_current(to.clone());
        // SAFETY: see `swap_out`.
        unsafe { swap(self, &to) };
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        // SAFETY: last reference; nobody can be running on this stack.
        if unsafe { (*self.inner.get()).stack.is_some() } {
            debug_assert!(matches!(
                self.state(),
                State::Init | State::Term | State::Except
            ));
            LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        }
        debug!("fiber {} destroyed", self.id);
    }
}

unsafe fn swap(from: &Fiber, to: &Fiber) {
    let from_ctx = &mut (*from.inner.get()).ctx as *mut libc::ucontext_t;
    let to_ctx = &(*to.inner.get()).ctx as *const libc::ucontext_t;
    if libc::swapcontext(from_ctx, to_ctx) != 0 {
        panic!("swapcontext failed: {}", io::Error::last_os_error());
    }
}

/// Entry trampoline for every fiber with a stack.
extern "C" fn fiber_entry() {
    let cur = current();
    // SAFETY: only this thread runs the fiber; the entry is consumed once.
    let entry = unsafe { (*cur.inner.get()).entry.take() };
    match entry {
        Some(f) => match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => cur.set_state(State::Term),
            Err(cause) => {
                cur.set_state(State::Except);
                let what = cause
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| cause.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".into());
                error!("fiber {} panicked: {}", cur.id, what);
            }
        },
        None => cur.set_state(State::Term),
    }
    let raw: *const Fiber = Arc::as_ptr(&cur);
    // The worker that swapped us in still holds its own Arc for the whole
    // turn, so the fiber outlives this frame; dropping ours here lets the
    // owner free a finished fiber as soon as it regains control.
    drop(cur);
    // SAFETY: see above, the pointee is kept alive by the resuming worker.
    let fiber = unsafe { &*raw };
    if fiber.is_caller_root() {
        let to = thread_main();
        set_current(to.clone());
        unsafe { swap(fiber, &to) };
    } else {
        let to = scheduler_fiber().expect("finished fiber with no scheduler fiber to return to");
        set_current(to.clone());
        unsafe { swap(fiber, &to) };
    }
    unreachable!("terminated fiber {} resumed", fiber.id());
}

#[inline(always)]
fn set_current(fiber: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(fiber));
}

/// The fiber currently executing on this thread. Materializes the
/// thread-main fiber on first use.
pub fn current() -> Arc<Fiber> {
    if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
        return f;
    }
    let main = Arc::new(Fiber::main_fiber());
    THREAD_MAIN.with(|m| *m.borrow_mut() = Some(main.clone()));
    CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
    main
}

/// Id of the current fiber, 0 if the thread never touched the fiber module.
pub fn current_id() -> u64 {
    CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id()).unwrap_or(0))
}

fn thread_main() -> Arc<Fiber> {
    current();
    THREAD_MAIN.with(|m| m.borrow().clone()).expect("thread-main fiber missing")
}

pub(crate) fn set_scheduler_fiber(fiber: Arc<Fiber>) {
    SCHED_FIBER.with(|s| *s.borrow_mut() = Some(fiber));
}

pub(crate) fn scheduler_fiber() -> Option<Arc<Fiber>> {
    SCHED_FIBER.with(|s| s.borrow().clone())
}

/// Parks the current fiber as [`State::Ready`]: it is requeued by the worker
/// loop and will run again without an external wake-up.
pub fn yield_ready() {
    let cur = current();
    debug_assert_eq!(cur.state(), State::Exec);
    cur.set_state(State::Ready);
    cur.swap_out();
}

/// Parks the current fiber until the i/o manager or a timer wakes it. The
/// Hold state is applied by the worker loop after the swap completes;
/// flipping it earlier would let another worker resume a context that is
/// still being saved on this thread.
pub fn yield_hold() {
    let cur = current();
    debug_assert_eq!(cur.state(), State::Exec);
    cur.swap_out();
}

/// Number of live fibers with their own stack.
pub fn count() -> usize {
    LIVE_FIBERS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn call_back_roundtrip() {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let fiber = Fiber::new(
            move || {
                log2.lock().unwrap().push("first");
                yield_hold();
                log2.lock().unwrap().push("second");
            },
            16 * 1024,
            true,
        )
        .unwrap();

        assert_eq!(fiber.state(), State::Init);
        fiber.call();
        log.lock().unwrap().push("between");
        fiber.call();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(*log.lock().unwrap(), vec!["first", "between", "second"]);
    }

    #[test]
    fn reset_reuses_the_stack() {
        let fiber = Fiber::new(|| {}, 16 * 1024, true).unwrap();
        fiber.call();
        assert_eq!(fiber.state(), State::Term);

        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();
        fiber.reset(move || *ran2.lock().unwrap() = true).unwrap();
        assert_eq!(fiber.state(), State::Init);
        fiber.call();
        assert!(*ran.lock().unwrap());
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn reset_while_runnable_is_refused() {
        let fiber = Fiber::new(|| yield_hold(), 16 * 1024, true).unwrap();
        fiber.call();
        // Parked in the middle of the entry: neither Init nor finished.
        assert!(fiber.reset(|| {}).is_err());
        fiber.call();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn panic_moves_to_except() {
        let fiber = Fiber::new(|| panic!("boom"), 16 * 1024, true).unwrap();
        fiber.call();
        assert_eq!(fiber.state(), State::Except);
        // A finished-by-panic fiber can be rearmed.
        fiber.reset(|| {}).unwrap();
        fiber.call();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn yield_ready_marks_ready() {
        let fiber = Fiber::new(|| yield_ready(), 16 * 1024, true).unwrap();
        fiber.call();
        assert_eq!(fiber.state(), State::Ready);
        fiber.call();
        assert_eq!(fiber.state(), State::Term);
    }
}
