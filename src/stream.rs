//! The byte-stream contract shared by sockets and the HTTP layer.

use std::io;
use std::sync::Arc;

use crate::socket::Socket;

/// A readable/writable byte stream. `read`/`write` keep kernel semantics
/// (short transfers allowed, `Ok(0)` on read means the peer closed); the
/// `_fix_size` variants loop until the full count moved.
pub trait Stream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    fn close(&self);

    /// Reads exactly `buf.len()` bytes; a short count is returned only when
    /// the peer closed mid-way.
    fn read_fix_size(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    /// Writes exactly `buf.len()` bytes or fails.
    fn write_fix_size(&self, buf: &[u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.write(&buf[done..])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer stopped accepting data",
                ));
            }
            done += n;
        }
        Ok(done)
    }
}

/// Adapts a [`Socket`] to the stream contract. With `owner` set the socket
/// is closed when the stream goes away.
pub struct SocketStream {
    socket: Arc<Socket>,
    owner: bool,
}

impl SocketStream {
    pub fn new(socket: Arc<Socket>, owner: bool) -> SocketStream {
        SocketStream { socket, owner }
    }

    #[inline(always)]
    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    #[inline(always)]
    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }
}

impl Stream for SocketStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn close(&self) {
        self.socket.close();
    }
}

impl Drop for SocketStream {
    fn drop(&mut self) {
        if self.owner {
            self.socket.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted in-memory stream: reads drain the given chunks one per call,
    /// writes accumulate.
    pub(crate) struct ScriptedStream {
        chunks: Mutex<Vec<Vec<u8>>>,
        pub written: Mutex<Vec<u8>>,
    }

    impl ScriptedStream {
        pub fn new(mut chunks: Vec<Vec<u8>>) -> ScriptedStream {
            chunks.reverse();
            ScriptedStream {
                chunks: Mutex::new(chunks),
                written: Mutex::new(Vec::new()),
            }
        }
    }

    impl Stream for ScriptedStream {
        fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut chunks = self.chunks.lock().unwrap();
            let chunk = match chunks.last_mut() {
                Some(c) => c,
                None => return Ok(0),
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n == chunk.len() {
                chunks.pop();
            } else {
                chunk.drain(..n);
            }
            Ok(n)
        }

        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn close(&self) {}
    }

    #[test]
    fn read_fix_size_stops_at_peer_close() {
        let stream = ScriptedStream::new(vec![b"abc".to_vec(), b"de".to_vec()]);
        let mut buf = [0u8; 10];
        let n = stream.read_fix_size(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"abcde");
    }

    #[test]
    fn read_fix_size_spans_chunks() {
        let stream = ScriptedStream::new(vec![b"abc".to_vec(), b"def".to_vec()]);
        let mut buf = [0u8; 6];
        let n = stream.read_fix_size(&mut buf).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf, b"abcdef");
    }
}
