//! Server-side HTTP session: one accepted connection.

use std::io;
use std::sync::Arc;

use crate::error::Error;
use crate::http::parser::{self, RequestParser};
use crate::http::proto::{Request, Response};
use crate::socket::Socket;
use crate::stream::{SocketStream, Stream};

/// Reads requests from and writes responses to one client socket.
pub struct Session {
    stream: SocketStream,
}

impl Session {
    pub fn new(socket: Arc<Socket>, owner: bool) -> Session {
        Session {
            stream: SocketStream::new(socket, owner),
        }
    }

    #[inline(always)]
    pub fn socket(&self) -> &Arc<Socket> {
        self.stream.socket()
    }

    /// Receives and parses one request, including its body. The connection
    /// is closed on any framing violation.
    pub fn recv_request(&self) -> crate::Result<Request> {
        match recv_request_from(&self.stream) {
            Ok(req) => Ok(req),
            Err(e) => {
                self.stream.close();
                Err(e)
            }
        }
    }

    /// Serializes and sends one response.
    pub fn send_response(&self, rsp: &Response) -> io::Result<usize> {
        self.stream.write_fix_size(rsp.to_string().as_bytes())
    }

    pub fn close(&self) {
        self.stream.close();
    }
}

/// The receive loop: refill the buffer preserving the unconsumed tail, feed
/// the parser, abort if the buffer fills before the header section is
/// complete, then read the declared body (bounded).
pub(crate) fn recv_request_from<S: Stream>(stream: &S) -> crate::Result<Request> {
    let buffer_size = parser::request_buffer_size();
    let mut parser = RequestParser::new();
    let mut buf = vec![0u8; buffer_size];
    let mut len = 0;

    while !parser.is_finished() {
        let n = stream.read(&mut buf[len..])?;
        if n == 0 {
            return Err(Error::IO(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed before the request completed",
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
                "request header section exceeds the buffer".into(),
            ));
        }
    }

    let body_len = parser.content_length() as usize;
    if body_len > parser::request_max_body_size() {
        return Err(Error::InvalidArgument(format!(
            "request body of {} bytes exceeds the limit",
            body_len
        )));
    }

    let mut request = parser.into_request();
    if body_len > 0 {
        let mut body = vec![0u8; body_len];
        let from_buf = body_len.min(len);
        body[..from_buf].copy_from_slice(&buf[..from_buf]);
        if from_buf < body_len {
            let read = stream.read_fix_size(&mut body[from_buf..])?;
            if read < body_len - from_buf {
                return Err(Error::IO(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed inside the request body",
                )));
            }
        }
        request.body = String::from_utf8_lossy(&body).into_owned();
    }
    request.init();
    request.init_params();
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::proto::Method;
    use crate::stream::testing::ScriptedStream;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_with_body_across_refills() {
        let stream = ScriptedStream::new(vec![
            b"POST /submit HTTP/1.1\r\nHost: a\r\ncontent-le".to_vec(),
            b"ngth: 10\r\n\r\n01234".to_vec(),
            b"56789".to_vec(),
        ]);
        let req = recv_request_from(&stream).unwrap();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.path, "/submit");
        assert_eq!(req.body, "0123456789");
        assert!(!req.is_close());
    }

    #[test]
    fn peer_close_mid_header_is_an_error() {
        let stream = ScriptedStream::new(vec![b"GET /x HTTP/1.1\r\nHos".to_vec()]);
        assert!(recv_request_from(&stream).is_err());
    }

    #[test]
    fn peer_close_mid_body_is_an_error() {
        let stream = ScriptedStream::new(vec![
            b"POST /x HTTP/1.1\r\ncontent-length: 10\r\n\r\nabc".to_vec(),
        ]);
        assert!(recv_request_from(&stream).is_err());
    }

    #[test]
    fn malformed_request_is_an_error() {
        let stream = ScriptedStream::new(vec![b"NONSENSE\r\n\r\n".to_vec()]);
        assert!(recv_request_from(&stream).is_err());
    }

    #[test]
    fn query_params_are_initialized() {
        let stream =
            ScriptedStream::new(vec![b"GET /p?user=dave&k=v HTTP/1.1\r\n\r\n".to_vec()]);
        let req = recv_request_from(&stream).unwrap();
        assert_eq!(req.param("user"), Some("dave"));
        assert_eq!(req.param("k"), Some("v"));
    }
}
