//! Fiber-friendly sockets.
//!
//! [`Socket`] owns a descriptor and delegates every operation to the hook
//! layer, so a call that would block parks the calling fiber instead of the
//! thread. Local and remote addresses are cached after bind/connect/accept.

use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, error};

use crate::address::Address;
use crate::error::cvt;
use crate::fd_manager::TimeoutKind;
use crate::hook;
use crate::io::IoManager;

pub struct Socket {
    fd: RawFd,
    family: libc::c_int,
    ty: libc::c_int,
    protocol: libc::c_int,
    connected: AtomicBool,
    closed: AtomicBool,
    local: Mutex<Option<Address>>,
    remote: Mutex<Option<Address>>,
}

impl Socket {
    /// A TCP socket of the same family as `addr`.
    pub fn tcp(addr: &Address) -> crate::Result<Socket> {
        Socket::new(addr.family(), libc::SOCK_STREAM, 0)
    }

    /// A UDP socket of the same family as `addr`.
    pub fn udp(addr: &Address) -> crate::Result<Socket> {
        let sock = Socket::new(addr.family(), libc::SOCK_DGRAM, 0)?;
        sock.connected.store(true, Ordering::Relaxed);
        Ok(sock)
    }

    pub fn new(family: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> crate::Result<Socket> {
        let fd = hook::socket(family, ty, protocol)?;
        let sock = Socket {
            fd,
            family,
            ty,
            protocol,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            local: Mutex::new(None),
            remote: Mutex::new(None),
        };
        sock.init_options();
        Ok(sock)
    }

    fn from_fd(fd: RawFd, family: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> Socket {
        let sock = Socket {
            fd,
            family,
            ty,
            protocol,
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            local: Mutex::new(None),
            remote: Mutex::new(None),
        };
        sock.init_options();
        sock.refresh_local();
        sock.refresh_remote();
        sock
    }

    fn init_options(&self) {
        let one: libc::c_int = 1;
        // SAFETY: plain int-valued socket options on our own descriptor.
        unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            if self.ty == libc::SOCK_STREAM && self.family != libc::AF_UNIX {
                libc::setsockopt(
                    self.fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_NODELAY,
                    &one as *const libc::c_int as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        }
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline(always)]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn bind(&self, addr: &Address) -> crate::Result<()> {
        let (sockaddr, len) = addr.as_sockaddr();
        // SAFETY: the sockaddr pair comes from `Address`.
        cvt(unsafe { libc::bind(self.fd, sockaddr, len) })?;
        self.refresh_local();
        Ok(())
    }

    pub fn listen(&self, backlog: libc::c_int) -> crate::Result<()> {
        // SAFETY: plain listen on our own descriptor.
        cvt(unsafe { libc::listen(self.fd, backlog) })?;
        Ok(())
    }

    /// Accepts one connection; the calling fiber parks until a peer arrives
    /// (or the receive timeout cancels the wait).
    pub fn accept(&self) -> io::Result<Socket> {
        let fd = hook::accept(self.fd)?;
        Ok(Socket::from_fd(fd, self.family, self.ty, self.protocol))
    }

    /// Connects with an explicit timeout, `None` meaning the
    /// `tcp.connect.timeout` default.
    pub fn connect(&self, addr: &Address, timeout: Option<Duration>) -> io::Result<()> {
        match timeout {
            Some(t) => hook::connect_with_timeout(self.fd, addr, Some(t.as_millis() as u64))?,
            None => hook::connect(self.fd, addr)?,
        }
        self.connected.store(true, Ordering::Relaxed);
        self.refresh_local();
        self.refresh_remote();
        debug!("connected: {}", self);
        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        hook::recv(self.fd, buf, 0)
    }

    pub fn recv_vectored(&self, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
        hook::readv(self.fd, bufs)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Address)> {
        hook::recvfrom(self.fd, buf, 0)
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        hook::send(self.fd, buf, 0)
    }

    pub fn send_vectored(&self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        hook::writev(self.fd, bufs)
    }

    pub fn send_to(&self, buf: &[u8], addr: &Address) -> io::Result<usize> {
        hook::sendto(self.fd, buf, 0, addr)
    }

    pub fn shutdown_write(&self) -> io::Result<()> {
        // SAFETY: plain shutdown on our own descriptor.
        cvt(unsafe { libc::shutdown(self.fd, libc::SHUT_WR) }).map(|_| ())
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        if let Err(e) = hook::set_socket_timeout(self.fd, TimeoutKind::Recv, timeout) {
            error!("set_recv_timeout({}) failed: {}", self.fd, e);
        }
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        hook::socket_timeout(self.fd, TimeoutKind::Recv)
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) {
        if let Err(e) = hook::set_socket_timeout(self.fd, TimeoutKind::Send, timeout) {
            error!("set_send_timeout({}) failed: {}", self.fd, e);
        }
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        hook::socket_timeout(self.fd, TimeoutKind::Send)
    }

    /// Wakes a fiber parked on readability of this socket.
    pub fn cancel_read(&self) {
        if let Some(iom) = IoManager::current() {
            iom.cancel_event(self.fd, crate::io::Event::READ);
        }
    }

    /// Wakes a fiber parked on writability of this socket.
    pub fn cancel_write(&self) {
        if let Some(iom) = IoManager::current() {
            iom.cancel_event(self.fd, crate::io::Event::WRITE);
        }
    }

    /// Wakes every fiber parked on this socket.
    pub fn cancel_all(&self) {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(self.fd);
        }
    }

    pub fn local_address(&self) -> Option<Address> {
        *self.local.lock().expect("socket lock poisoned")
    }

    pub fn remote_address(&self) -> Option<Address> {
        *self.remote.lock().expect("socket lock poisoned")
    }

    fn refresh_local(&self) {
        // SAFETY: zeroed storage filled by the kernel up to `len`.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc == 0 {
            *self.local.lock().expect("socket lock poisoned") =
                Some(Address::from_storage(&storage, len));
        }
    }

    fn refresh_remote(&self) {
        // SAFETY: as in refresh_local.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(
                self.fd,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc == 0 {
            *self.remote.lock().expect("socket lock poisoned") =
                Some(Address::from_storage(&storage, len));
        }
    }

    /// Cancels any waiters and closes the descriptor, once. Also run on drop.
    pub fn close(&self) {
        if self.fd < 0 || self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::Relaxed);
        if let Err(e) = hook::close(self.fd) {
            error!("close({}) failed: {}", self.fd, e);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Socket fd={} family={} type={} connected={}",
            self.fd,
            self.family,
            self.ty,
            self.is_connected()
        )?;
        if let Some(local) = self.local_address() {
            write!(f, " local={}", local)?;
        }
        if let Some(remote) = self.remote_address() {
            write!(f, " remote={}", remote)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn udp_echo_roundtrip() {
        let io = IoManager::new(2, false, "t-udp").unwrap();

        let any = Address::lookup_any("127.0.0.1:0").unwrap();
        let responder = Socket::udp(&any).unwrap();
        responder.bind(&any).unwrap();
        let responder_addr = responder.local_address().unwrap();

        io.schedule(move || {
            let mut buf = [0u8; 64];
            let (n, peer) = responder.recv_from(&mut buf).unwrap();
            responder.send_to(&buf[..n], &peer).unwrap();
        });

        let (tx, rx) = mpsc::channel();
        io.schedule(move || {
            let client = Socket::udp(&responder_addr).unwrap();
            client.set_recv_timeout(Some(Duration::from_secs(5)));
            client.send_to(b"marco", &responder_addr).unwrap();

            let mut buf = [0u8; 64];
            let (n, from) = client.recv_from(&mut buf).unwrap();
            tx.send((buf[..n].to_vec(), from.to_string())).unwrap();
        });

        let (echoed, from) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(echoed, b"marco");
        assert_eq!(from, responder_addr.to_string());
        io.stop();
    }
}
