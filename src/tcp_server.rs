//! The TCP server scaffold: listening sockets, an accept loop per listener,
//! and a handler invoked on a process worker for every accepted client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info};
use once_cell::sync::Lazy;

use crate::address::Address;
use crate::config::{self, ConfigVar};
use crate::io::IoManager;
use crate::socket::Socket;

static READ_TIMEOUT: Lazy<Arc<ConfigVar<u64>>> = Lazy::new(|| {
    config::lookup(
        "tcp_server.read_timeout",
        (120 * 1000) as u64,
        "tcp server read timeout",
    )
});

/// Per-client entry point, run on the process worker.
pub trait ClientHandler: Send + Sync {
    fn handle_client(&self, client: Socket);
}

impl<F> ClientHandler for F
where
    F: Fn(Socket) + Send + Sync,
{
    fn handle_client(&self, client: Socket) {
        self(client)
    }
}

pub struct TcpServer {
    name: String,
    worker: Arc<IoManager>,
    accept_worker: Arc<IoManager>,
    handler: Arc<dyn ClientHandler>,
    socks: Mutex<Vec<Arc<Socket>>>,
    recv_timeout_ms: u64,
    stopped: AtomicBool,
}

impl TcpServer {
    /// `worker` runs client handlers, `accept_worker` the accept loops; they
    /// may be the same manager.
    pub fn new(
        name: &str,
        worker: Arc<IoManager>,
        accept_worker: Arc<IoManager>,
        handler: Arc<dyn ClientHandler>,
    ) -> Arc<TcpServer> {
        Arc::new(TcpServer {
            name: name.into(),
            worker,
            accept_worker,
            handler,
            socks: Mutex::new(Vec::new()),
            recv_timeout_ms: READ_TIMEOUT.value(),
            stopped: AtomicBool::new(true),
        })
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Addresses actually bound, useful with port 0.
    pub fn local_addresses(&self) -> Vec<Address> {
        self.socks
            .lock()
            .expect("server lock poisoned")
            .iter()
            .filter_map(|s| s.local_address())
            .collect()
    }

    /// Binds and listens on every address; on partial failure the failed
    /// addresses are returned and nothing is kept bound.
    pub fn bind(&self, addrs: &[Address]) -> Result<(), Vec<Address>> {
        let mut bound = Vec::new();
        let mut failed = Vec::new();
        for addr in addrs {
            let sock = match Socket::tcp(addr) {
                Ok(s) => s,
                Err(e) => {
                    error!("{}: socket for {} failed: {}", self.name, addr, e);
                    failed.push(*addr);
                    continue;
                }
            };
            if let Err(e) = sock.bind(addr).and_then(|_| sock.listen(libc::SOMAXCONN)) {
                error!("{}: bind/listen on {} failed: {}", self.name, addr, e);
                failed.push(*addr);
                continue;
            }
            info!("{}: bound {}", self.name, sock);
            bound.push(Arc::new(sock));
        }
        if !failed.is_empty() {
            return Err(failed);
        }
        self.socks
            .lock()
            .expect("server lock poisoned")
            .extend(bound);
        Ok(())
    }

    /// Schedules one accept loop per listening socket. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if !self.stopped.swap(false, Ordering::SeqCst) {
            return;
        }
        let socks = self.socks.lock().expect("server lock poisoned").clone();
        for sock in socks {
            let server = self.clone();
            self.accept_worker
                .schedule(move || server.accept_loop(sock));
        }
    }

    fn accept_loop(self: &Arc<Self>, sock: Arc<Socket>) {
        while !self.stopped.load(Ordering::SeqCst) {
            match sock.accept() {
                Ok(client) => {
                    client.set_recv_timeout(Some(Duration::from_millis(self.recv_timeout_ms)));
                    let handler = self.handler.clone();
                    self.worker.schedule(move || handler.handle_client(client));
                }
                Err(e) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    error!("{}: accept failed: {}", self.name, e);
                }
            }
        }
    }

    /// Stops accepting: wakes the accept fibers and closes the listeners.
    pub fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let server = self.clone();
        self.accept_worker.schedule(move || {
            let socks: Vec<_> = server
                .socks
                .lock()
                .expect("server lock poisoned")
                .drain(..)
                .collect();
            for sock in socks {
                sock.cancel_all();
                sock.close();
            }
        });
    }
}
