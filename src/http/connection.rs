//! Client-side HTTP connection and the bounded connection pool.

use std::collections::VecDeque;
use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error};

use crate::address::Address;
use crate::clock;
use crate::error::Error;
use crate::http::parser::{self, ResponseParser};
use crate::http::proto::{Method, Request, Response};
use crate::socket::Socket;
use crate::stream::{SocketStream, Stream};
use crate::uri::Uri;

/// Outcome classes of a client request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    InvalidUrl,
    InvalidHost,
    ConnectFailure,
    SendClosedByPeer,
    SendSocketError,
    Timeout,
    CreateSocketError,
    PoolGetConnection,
    PoolInvalidConnection,
}

/// A client call's result: code, optional response, human-readable error.
pub struct HttpResult {
    pub code: ResultCode,
    pub response: Option<Response>,
    pub error: String,
}

impl HttpResult {
    fn new(code: ResultCode, response: Option<Response>, error: impl Into<String>) -> HttpResult {
        HttpResult {
            code,
            response,
            error: error.into(),
        }
    }

    fn ok(response: Response) -> HttpResult {
        HttpResult::new(ResultCode::Ok, Some(response), "OK")
    }

    #[inline(always)]
    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }
}

/// One established client connection.
pub struct Connection {
    stream: SocketStream,
    created_ms: u64,
    requests: AtomicU32,
}

impl Connection {
    pub fn new(socket: Socket) -> Connection {
        Connection {
            stream: SocketStream::new(Arc::new(socket), true),
            created_ms: clock::monotonic_ms(),
            requests: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub fn socket(&self) -> &Arc<Socket> {
        self.stream.socket()
    }

    #[inline(always)]
    pub fn is_connected(&self) -> bool {
        self.stream.is_connected()
    }

    /// Requests served over this connection so far (pool bookkeeping).
    #[inline(always)]
    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    /// Serializes and sends one request.
    pub fn send_request(&self, req: &Request) -> io::Result<usize> {
        self.stream.write_fix_size(req.to_string().as_bytes())
    }

    /// Receives one response, decoding chunked transfer. The connection is
    /// closed on any framing violation.
    pub fn recv_response(&self) -> crate::Result<Response> {
        match recv_response_from(&self.stream) {
            Ok(rsp) => Ok(rsp),
            Err(e) => {
                self.stream.close();
                Err(e)
            }
        }
    }

    /// One-shot GET against an absolute URL.
    pub fn do_get(
        url: &str,
        timeout: Duration,
        headers: &[(&str, &str)],
        body: &str,
    ) -> HttpResult {
        Self::do_request_url(Method::Get, url, timeout, headers, body)
    }

    /// One-shot POST against an absolute URL.
    pub fn do_post(
        url: &str,
        timeout: Duration,
        headers: &[(&str, &str)],
        body: &str,
    ) -> HttpResult {
        Self::do_request_url(Method::Post, url, timeout, headers, body)
    }

    pub fn do_request_url(
        method: Method,
        url: &str,
        timeout: Duration,
        headers: &[(&str, &str)],
        body: &str,
    ) -> HttpResult {
        let uri = match Uri::parse(url) {
            Ok(u) => u,
            Err(e) => {
                return HttpResult::new(
                    ResultCode::InvalidUrl,
                    None,
                    format!("invalid url {:?}: {}", url, e),
                )
            }
        };
        let req = build_request(method, &uri, headers, body, uri.host());
        Self::do_request(&req, &uri, timeout)
    }

    /// The final single-connection path: connect, send, receive.
    pub fn do_request(req: &Request, uri: &Uri, timeout: Duration) -> HttpResult {
        let addr = match uri.create_address() {
            Ok(a) => a,
            Err(e) => {
                return HttpResult::new(
                    ResultCode::InvalidHost,
                    None,
                    format!("invalid host {:?}: {}", uri.host(), e),
                )
            }
        };
        let sock = match Socket::tcp(&addr) {
            Ok(s) => s,
            Err(e) => {
                return HttpResult::new(
                    ResultCode::CreateSocketError,
                    None,
                    format!("create socket for {} failed: {}", addr, e),
                )
            }
        };
        if let Err(e) = sock.connect(&addr, Some(timeout)) {
            return HttpResult::new(
                ResultCode::ConnectFailure,
                None,
                format!("connect to {} failed: {}", addr, e),
            );
        }
        sock.set_recv_timeout(Some(timeout));

        let conn = Connection::new(sock);
        exchange(&conn, req, timeout)
    }
}

fn exchange(conn: &Connection, req: &Request, timeout: Duration) -> HttpResult {
    match conn.send_request(req) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WriteZero => {
            return HttpResult::new(
                ResultCode::SendClosedByPeer,
                None,
                format!("send closed by peer: {}", e),
            )
        }
        Err(e) => {
            return HttpResult::new(
                ResultCode::SendSocketError,
                None,
                format!("send failed: {}", e),
            )
        }
    }
    match conn.recv_response() {
        Ok(rsp) => HttpResult::ok(rsp),
        Err(e) => HttpResult::new(
            ResultCode::Timeout,
            None,
            format!("response not received within {:?}: {}", timeout, e),
        ),
    }
}

fn build_request(
    method: Method,
    uri: &Uri,
    headers: &[(&str, &str)],
    body: &str,
    default_host: &str,
) -> Request {
    let mut req = Request::new();
    req.method = method;
    req.path = uri.path().to_string();
    req.query = uri.query().to_string();
    req.fragment = uri.fragment().to_string();
    req.set_close(false);

    let mut has_host = false;
    for (key, value) in headers {
        if key.eq_ignore_ascii_case("connection") {
            if value.eq_ignore_ascii_case("close") {
                req.set_close(true);
            }
            continue;
        }
        if !has_host && key.eq_ignore_ascii_case("host") {
            has_host = !value.is_empty();
        }
        req.set_header(key, value);
    }
    if !has_host {
        req.set_header("host", default_host);
    }
    req.body = body.to_string();
    req
}

/// The receive loop with chunked decoding on top of the header parse.
pub(crate) fn recv_response_from<S: Stream>(stream: &S) -> crate::Result<Response> {
    let buffer_size = parser::response_buffer_size();
    let max_body = parser::response_max_body_size();
    let mut parser = ResponseParser::new();
    let mut buf = vec![0u8; buffer_size];
    let mut len = 0;

    while !parser.is_finished() {
        let n = stream.read(&mut buf[len..])?;
        if n == 0 {
            return Err(Error::IO(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed before the response completed",
            )));
        }
        len += n;
        let consumed = parser.execute(&buf[..len]);
        if let Some(e) = parser.error() {
            return Err(e.clone().into());
        }
        buf.copy_within(consumed..len, 0);
        len -= consumed;
        if !parser.is_finished() && len == buf.len() {
            return Err(Error::InvalidArgument(
                "response header section exceeds the buffer".into(),
            ));
        }
    }

    let chunked = parser.is_chunked();
    let declared = parser.content_length() as usize;
    let mut response = parser.into_response();
    let mut body: Vec<u8> = Vec::new();

    if chunked {
        loop {
            // The chunk-size line, refilling until it is complete.
            let (used, size) = loop {
                match parser::parse_chunk_size(&buf[..len]) {
                    Some(Ok(v)) => break v,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        if len == buf.len() {
                            return Err(Error::InvalidArgument(
                                "chunk size line exceeds the buffer".into(),
                            ));
                        }
                        let n = stream.read(&mut buf[len..])?;
                        if n == 0 {
                            return Err(unexpected_eof("inside a chunk size line"));
                        }
                        len += n;
                    }
                }
            };
            buf.copy_within(used..len, 0);
            len -= used;

            if body.len() + size as usize > max_body {
                return Err(Error::InvalidArgument(format!(
                    "chunked body exceeds the {} byte limit",
                    max_body
                )));
            }

            // `size` bytes of payload...
            let mut remaining = size as usize;
            while remaining > 0 {
                if len == 0 {
                    let n = stream.read(&mut buf[..])?;
                    if n == 0 {
                        return Err(unexpected_eof("inside chunk data"));
                    }
                    len = n;
                }
                let take = remaining.min(len);
                body.extend_from_slice(&buf[..take]);
                buf.copy_within(take..len, 0);
                len -= take;
                remaining -= take;
            }
            // ...and the CRLF that closes the chunk.
            while len < 2 {
                let n = stream.read(&mut buf[len..])?;
                if n == 0 {
                    return Err(unexpected_eof("at a chunk boundary"));
                }
                len += n;
            }
            if &buf[..2] != b"\r\n" {
                return Err(Error::InvalidArgument("missing CRLF after a chunk".into()));
            }
            buf.copy_within(2..len, 0);
            len -= 2;

            if size == 0 {
                break;
            }
        }
    } else if declared > 0 {
        if declared > max_body {
            return Err(Error::InvalidArgument(format!(
                "response body of {} bytes exceeds the limit",
                declared
            )));
        }
        body.resize(declared, 0);
        let from_buf = declared.min(len);
        body[..from_buf].copy_from_slice(&buf[..from_buf]);
        if from_buf < declared {
            let read = stream.read_fix_size(&mut body[from_buf..])?;
            if read < declared - from_buf {
                return Err(unexpected_eof("inside the response body"));
            }
        }
    }

    if !body.is_empty() {
        response.body = String::from_utf8_lossy(&body).into_owned();
    }
    Ok(response)
}

fn unexpected_eof(context: &str) -> Error {
    Error::IO(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("peer closed {}", context),
    ))
}

// -- connection pool --------------------------------------------------------

/// A bounded FIFO of reusable connections to one `host:port`.
pub struct Pool {
    host: String,
    vhost: String,
    port: u16,
    max_size: u32,
    max_alive_ms: u64,
    max_request: u32,
    conns: Mutex<VecDeque<Connection>>,
    total: AtomicU32,
}

impl Pool {
    pub fn new(
        host: &str,
        vhost: &str,
        port: u16,
        max_size: u32,
        max_alive: Duration,
        max_request: u32,
    ) -> Arc<Pool> {
        Arc::new(Pool {
            host: host.into(),
            vhost: vhost.into(),
            port,
            max_size,
            max_alive_ms: max_alive.as_millis() as u64,
            max_request,
            conns: Mutex::new(VecDeque::new()),
            total: AtomicU32::new(0),
        })
    }

    /// Builds a pool from `http://host:port`.
    pub fn from_url(
        url: &str,
        vhost: &str,
        max_size: u32,
        max_alive: Duration,
        max_request: u32,
    ) -> crate::Result<Arc<Pool>> {
        let uri = Uri::parse(url)?;
        if uri.host().is_empty() {
            return Err(Error::InvalidArgument(format!("url without host: {:?}", url)));
        }
        Ok(Pool::new(
            uri.host(),
            vhost,
            uri.port_or_default(),
            max_size,
            max_alive,
            max_request,
        ))
    }

    /// Live connections owned by the pool, borrowed ones included.
    #[inline(always)]
    pub fn total(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    /// Borrows a healthy connection, establishing a new one when the idle
    /// list is empty and the pool is under its cap. Expired or disconnected
    /// idle entries are discarded on the way (one pop per loop iteration).
    pub fn get(self: &Arc<Self>) -> crate::Result<PoolGuard> {
        let now = clock::monotonic_ms();
        let mut dropped = 0u32;
        let mut found = None;
        {
            let mut conns = self.conns.lock().expect("pool lock poisoned");
            while let Some(conn) = conns.pop_front() {
                if !conn.is_connected() || conn.created_ms + self.max_alive_ms <= now {
                    dropped += 1;
                    continue;
                }
                found = Some(conn);
                break;
            }
        }
        if dropped > 0 {
            self.total.fetch_sub(dropped, Ordering::SeqCst);
            debug!("pool {}:{}: dropped {} stale", self.host, self.port, dropped);
        }

        let conn = match found {
            Some(conn) => conn,
            None => {
                if self.total.load(Ordering::SeqCst) >= self.max_size {
                    return Err(Error::InvalidArgument(format!(
                        "pool {}:{} exhausted ({} connections)",
                        self.host, self.port, self.max_size
                    )));
                }
                let mut addr = Address::lookup_any(&self.host)?;
                addr.set_port(self.port);
                let sock = Socket::tcp(&addr)?;
                sock.connect(&addr, None)?;
                self.total.fetch_add(1, Ordering::SeqCst);
                Connection::new(sock)
            }
        };
        Ok(PoolGuard {
            pool: self.clone(),
            conn: Some(conn),
        })
    }

    pub fn do_get(
        self: &Arc<Self>,
        path_and_query: &str,
        timeout: Duration,
        headers: &[(&str, &str)],
        body: &str,
    ) -> HttpResult {
        self.do_method(Method::Get, path_and_query, timeout, headers, body)
    }

    pub fn do_post(
        self: &Arc<Self>,
        path_and_query: &str,
        timeout: Duration,
        headers: &[(&str, &str)],
        body: &str,
    ) -> HttpResult {
        self.do_method(Method::Post, path_and_query, timeout, headers, body)
    }

    pub fn do_method(
        self: &Arc<Self>,
        method: Method,
        path_and_query: &str,
        timeout: Duration,
        headers: &[(&str, &str)],
        body: &str,
    ) -> HttpResult {
        let uri = match Uri::parse(path_and_query) {
            Ok(u) => u,
            Err(e) => {
                return HttpResult::new(
                    ResultCode::InvalidUrl,
                    None,
                    format!("invalid path {:?}: {}", path_and_query, e),
                )
            }
        };
        let host = if self.vhost.is_empty() {
            &self.host
        } else {
            &self.vhost
        };
        let req = build_request(method, &uri, headers, body, host);
        self.do_request(&req, timeout)
    }

    /// Runs one request over a pooled connection.
    pub fn do_request(self: &Arc<Self>, req: &Request, timeout: Duration) -> HttpResult {
        let guard = match self.get() {
            Ok(g) => g,
            Err(e) => {
                return HttpResult::new(
                    ResultCode::PoolGetConnection,
                    None,
                    format!("pool {}:{}: {}", self.host, self.port, e),
                )
            }
        };
        if !guard.is_connected() {
            return HttpResult::new(
                ResultCode::PoolInvalidConnection,
                None,
                format!("pool {}:{}: stale connection", self.host, self.port),
            );
        }
        guard.socket().set_recv_timeout(Some(timeout));
        exchange(&guard, req, timeout)
    }
}

impl Pool {
    fn release(&self, conn: Connection) {
        let requests = conn.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let now = clock::monotonic_ms();
        if !conn.is_connected()
            || conn.created_ms + self.max_alive_ms <= now
            || requests >= self.max_request
        {
            self.total.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        self.conns
            .lock()
            .expect("pool lock poisoned")
            .push_back(conn);
    }
}

/// RAII borrow of a pooled connection; returning it (or discarding it when
/// unhealthy) happens on drop, atomically with the pool counters.
pub struct PoolGuard {
    pool: Arc<Pool>,
    conn: Option<Connection>,
}

impl Deref for PoolGuard {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("pool guard already released")
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        } else {
            error!("pool guard dropped without a connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::ScriptedStream;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_response_with_content_length() {
        let stream = ScriptedStream::new(vec![
            b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\npo".to_vec(),
            b"ng".to_vec(),
        ]);
        let rsp = recv_response_from(&stream).unwrap();
        assert_eq!(rsp.status, 200);
        assert_eq!(rsp.body, "pong");
    }

    #[test]
    fn chunked_response_in_pieces() {
        let stream = ScriptedStream::new(vec![
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec(),
            b"5\r\nhello\r\n".to_vec(),
            b"0\r\n\r\n".to_vec(),
        ]);
        let rsp = recv_response_from(&stream).unwrap();
        assert_eq!(rsp.body, "hello");
        assert_eq!(rsp.body.len(), 5);
        // Nothing left unconsumed: a follow-up read hits the scripted EOF.
        let mut probe = [0u8; 8];
        assert_eq!(stream.read(&mut probe).unwrap(), 0);
    }

    #[test]
    fn chunked_response_with_multiple_chunks() {
        let stream = ScriptedStream::new(vec![
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n"
                .to_vec(),
        ]);
        let rsp = recv_response_from(&stream).unwrap();
        assert_eq!(rsp.body, "wikipedia");
    }

    #[test]
    fn chunk_data_split_across_reads() {
        let stream = ScriptedStream::new(vec![
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\na\r\n01234".to_vec(),
            b"56789\r\n".to_vec(),
            b"0\r\n\r\n".to_vec(),
        ]);
        let rsp = recv_response_from(&stream).unwrap();
        assert_eq!(rsp.body, "0123456789");
    }

    #[test]
    fn truncated_chunked_response_is_an_error() {
        let stream = ScriptedStream::new(vec![
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhel".to_vec(),
        ]);
        assert!(recv_response_from(&stream).is_err());
    }

    #[test]
    fn missing_chunk_crlf_is_an_error() {
        let stream = ScriptedStream::new(vec![
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n2\r\nhiXX0\r\n\r\n".to_vec(),
        ]);
        assert!(recv_response_from(&stream).is_err());
    }
}
