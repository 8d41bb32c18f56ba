//! Cooperative N:M fiber runtime with epoll-driven I/O.
//!
//! The crate is organized in layers, leaves first:
//! - [`fiber`] - stackful user-mode execution contexts with explicit swaps,
//! - [`sched`] - worker threads pulling fibers and callbacks from a shared queue,
//! - [`timer`] - deadline-ordered timers with periodic re-arm and condition gating,
//! - [`io`] - the [`IoManager`](io::IoManager): scheduler + timers + an epoll set,
//! - [`hook`] - blocking-call equivalents that suspend the calling fiber,
//! - [`net`](socket) primitives ([`Address`](address::Address), [`Socket`](socket::Socket),
//!   [`SocketStream`](stream::SocketStream)),
//! - [`http`] - HTTP/1.1 session/connection/pool and servlet dispatch.
//!
//! Code running inside a worker fiber can use the hooked calls (`hook::read`,
//! `hook::sleep`, ...) or the [`socket::Socket`] wrappers in a blocking style;
//! whenever a call would block, the current fiber is parked on the epoll set or
//! the timer list and the worker thread picks up the next runnable task.

pub mod address;
pub mod bytes;
pub mod clock;
pub mod config;
pub mod error;
pub mod fd_manager;
pub mod fiber;
pub mod hook;
pub mod http;
pub mod io;
pub mod log;
pub mod sched;
pub mod socket;
pub mod stream;
pub mod tcp_server;
pub mod timer;
pub mod uri;

pub use error::{Error, Result};
