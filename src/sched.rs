//! N:M task scheduler.
//!
//! A [`Scheduler`] owns N worker threads, each running a *scheduler fiber*
//! that pulls tasks (fibers or plain callbacks) from a shared queue and swaps
//! into them. With `use_caller` the constructing thread counts as one worker:
//! it hosts a dedicated root scheduler fiber whose loop runs when
//! [`Scheduler::stop`] is called on that thread.
//!
//! The scheduler alone only schedules; the blocking/waking machinery lives in
//! [`crate::io::IoManager`], which installs itself as the scheduler's reactor
//! and takes over the idle path and the tickle.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info};
use once_cell::sync::OnceCell;

use crate::fiber::{self, Fiber, State};
use crate::io::IoManager;

const IDLE_PARK_MS: u64 = 3_000;

enum TaskKind {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

/// One unit of scheduled work: a fiber to resume or a callback to run inside
/// a fresh (well, recycled) fiber. Consumed exactly once.
pub struct Task {
    kind: TaskKind,
    /// Pinned worker slot; `None` runs on any worker.
    worker: Option<usize>,
}

impl Task {
    pub fn callback<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            kind: TaskKind::Call(Box::new(f)),
            worker: None,
        }
    }

    pub fn fiber(fiber: Arc<Fiber>) -> Task {
        Task {
            kind: TaskKind::Fiber(fiber),
            worker: None,
        }
    }

    pub fn on_worker(mut self, worker: usize) -> Task {
        self.worker = Some(worker);
        self
    }
}

pub struct Scheduler {
    name: String,
    /// Number of spawned worker threads (excludes the caller slot).
    spawned: usize,
    use_caller: bool,
    tasks: Mutex<VecDeque<Task>>,
    park: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    active: AtomicUsize,
    idle: AtomicUsize,
    started: AtomicBool,
    stopping: AtomicBool,
    reactor: OnceCell<Weak<IoManager>>,
}

thread_local! {
    static CURRENT_SCHED: RefCell<Option<Arc<Scheduler>>> = RefCell::new(None);
    static WORKER_INDEX: Cell<isize> = Cell::new(-1);
}

/// The scheduler driving the current thread, if any.
pub fn current() -> Option<Arc<Scheduler>> {
    CURRENT_SCHED.with(|s| s.borrow().clone())
}

/// Index of the worker slot this thread occupies, -1 elsewhere.
pub fn current_worker() -> isize {
    WORKER_INDEX.with(|w| w.get())
}

impl Scheduler {
    /// `threads` is the total worker count (>= 1). With `use_caller` the
    /// constructing thread takes slot 0 and only `threads - 1` OS threads are
    /// spawned; `stop` must then be called on the constructing thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads >= 1, "scheduler needs at least one worker");
        let sched = Arc::new(Scheduler {
            name: name.into(),
            spawned: if use_caller { threads - 1 } else { threads },
            use_caller,
            tasks: Mutex::new(VecDeque::new()),
            park: Condvar::new(),
            threads: Mutex::new(Vec::new()),
            root_fiber: Mutex::new(None),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            reactor: OnceCell::new(),
        });
        if use_caller {
            // The caller thread is worker 0; make it resumable and visible
            // to code that asks for the ambient scheduler before start().
            fiber::current();
            CURRENT_SCHED.with(|s| *s.borrow_mut() = Some(sched.clone()));
            WORKER_INDEX.with(|w| w.set(0));
        }
        sched
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total worker slots, including the caller slot.
    #[inline(always)]
    pub fn worker_count(&self) -> usize {
        self.spawned + self.use_caller as usize
    }

    #[inline(always)]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    #[inline(always)]
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    #[inline(always)]
    pub fn has_idle_threads(&self) -> bool {
        self.idle_count() > 0
    }

    pub(crate) fn attach_reactor(&self, io: Weak<IoManager>) {
        let _ = self.reactor.set(io);
    }

    pub(crate) fn reactor(&self) -> Option<Arc<IoManager>> {
        self.reactor.get().and_then(Weak::upgrade)
    }

    /// Spawns the worker threads. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let offset = self.use_caller as usize;
        let mut threads = self.threads.lock().expect("scheduler lock poisoned");
        for i in 0..self.spawned {
            let sched = self.clone();
            let index = i + offset;
            let handle = std::thread::Builder::new()
                .name(format!("{}_{}", self.name, index))
                .spawn(move || sched.run(index))
                .expect("failed to spawn scheduler worker");
            threads.push(handle);
        }
    }

    /// Runs a callback on any worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::callback(f));
    }

    /// Resumes a fiber on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.submit(Task::fiber(fiber));
    }

    /// Enqueues one task, honoring its worker pin.
    pub fn submit(&self, task: Task) {
        let need_tickle = {
            let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
            let was_empty = tasks.is_empty();
            tasks.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Enqueues a batch with at most one tickle.
    pub fn submit_batch<I>(&self, batch: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let need_tickle = {
            let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
            let was_empty = tasks.is_empty();
            tasks.extend(batch);
            was_empty && !tasks.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Moves the current fiber to the given worker slot (or any) and yields.
    pub fn switch_to(&self, worker: Option<usize>) {
        if let Some(w) = worker {
            if current_worker() == w as isize {
                return;
            }
        }
        let mut task = Task::fiber(fiber::current());
        task.worker = worker;
        self.submit(task);
        fiber::yield_hold();
    }

    /// Wakes idle workers. Delegated to the reactor when one is attached.
    /// All parked workers are woken so a pinned task's worker re-checks the
    /// queue no matter who parked first.
    pub(crate) fn tickle(&self) {
        if let Some(io) = self.reactor() {
            io.tickle();
        } else {
            self.park.notify_all();
        }
    }

    /// `true` once `stop` was requested and no queued or running work
    /// remains. The reactor extends this with its own conditions.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            && self.active.load(Ordering::SeqCst) == 0
            && self
                .tasks
                .lock()
                .expect("scheduler lock poisoned")
                .is_empty()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn check_full_stop(&self) -> bool {
        match self.reactor() {
            Some(io) => io.stopping(),
            None => self.base_stopping(),
        }
    }

    /// Requests shutdown, drains the remaining work and joins the workers.
    /// With `use_caller` the calling thread runs its own worker loop here.
    pub fn stop(self: &Arc<Self>) {
        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.worker_count() {
            self.tickle();
        }

        if self.use_caller && !self.check_full_stop() {
            let sched = self.clone();
            let root = Fiber::new(move || sched.run(0), 0, true)
                .expect("failed to create the use-caller scheduler fiber");
            *self.root_fiber.lock().expect("scheduler lock poisoned") = Some(root.clone());
            root.call();
            *self.root_fiber.lock().expect("scheduler lock poisoned") = None;
        }

        let handles: Vec<_> = self
            .threads
            .lock()
            .expect("scheduler lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
        info!("{}: stopped", self.name);
    }

    /// The worker loop, running inside this thread's scheduler fiber.
    fn run(self: &Arc<Self>, index: usize) {
        debug!("{}: worker {} run", self.name, index);
        CURRENT_SCHED.with(|s| *s.borrow_mut() = Some(self.clone()));
        WORKER_INDEX.with(|w| w.set(index as isize));
        crate::hook::set_hook_enabled(true);
        // On a spawned worker the scheduler fiber is the thread-main fiber;
        // on the caller thread it is the root fiber we are running on.
        fiber::set_scheduler_fiber(fiber::current());

        let weak = Arc::downgrade(self);
        let idle_fiber = Fiber::new(
            move || loop {
                let sched = match weak.upgrade() {
                    Some(s) => s,
                    None => break,
                };
                if sched.check_full_stop() {
                    break;
                }
                match sched.reactor() {
                    Some(io) => io.idle_turn(),
                    None => sched.park_idle(),
                }
                drop(sched);
                fiber::yield_hold();
            },
            0,
            false,
        )
        .expect("failed to create the idle fiber");
        let mut carrier: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_me = false;
            let mut task = None;
            {
                let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
                let mut i = 0;
                while i < tasks.len() {
                    if let Some(w) = tasks[i].worker {
                        if w != index {
                            // Pinned elsewhere; make sure its worker looks.
                            tickle_me = true;
                            i += 1;
                            continue;
                        }
                    }
                    if let TaskKind::Fiber(f) = &tasks[i].kind {
                        // Still being swapped out on another thread; its
                        // context is not resumable yet.
                        if f.state() == State::Exec {
                            i += 1;
                            continue;
                        }
                    }
                    task = tasks.remove(i).map(|t| t.kind);
                    self.active.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me = tickle_me || !tasks.is_empty() && task.is_some();
            }
            if tickle_me {
                self.tickle();
            }

            match task {
                Some(TaskKind::Fiber(f)) => {
                    if !f.state().is_done() {
                        f.swap_in();
                        self.active.fetch_sub(1, Ordering::SeqCst);
                        match f.state() {
                            State::Ready => self.schedule_fiber(f),
                            s if !s.is_done() => f.set_state(State::Hold),
                            _ => {}
                        }
                    } else {
                        self.active.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                Some(TaskKind::Call(cb)) => {
                    let f = match carrier.take() {
                        Some(c) => {
                            c.reset_boxed(cb).expect("carrier fiber not reusable");
                            c
                        }
                        None => Fiber::new_boxed(cb, 0, false)
                            .expect("failed to create a carrier fiber"),
                    };
                    f.swap_in();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    match f.state() {
                        State::Ready => self.schedule_fiber(f),
                        s if s.is_done() => carrier = Some(f),
                        _ => f.set_state(State::Hold),
                    }
                }
                None => {
                    if idle_fiber.state() == State::Term {
                        debug!("{}: worker {} idle fiber term", self.name, index);
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.swap_in();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                    if !idle_fiber.state().is_done() {
                        idle_fiber.set_state(State::Hold);
                    }
                }
            }
        }
        WORKER_INDEX.with(|w| w.set(-1));
    }

    /// Default idle behavior without a reactor: park on the queue condvar,
    /// bounded so the stop flag is re-checked.
    fn park_idle(&self) {
        let tasks = self.tasks.lock().expect("scheduler lock poisoned");
        if tasks.is_empty() && !self.stopping.load(Ordering::SeqCst) {
            let _ = self
                .park
                .wait_timeout(tasks, Duration::from_millis(IDLE_PARK_MS))
                .expect("scheduler lock poisoned");
        }
    }
}
