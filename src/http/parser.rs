//! Incremental HTTP/1.1 parsers.
//!
//! Both parsers consume from a caller-provided byte buffer one CRLF line at a
//! time and report how many bytes they used; the caller keeps any unconsumed
//! tail for the next round. Completion covers the header section only - the
//! body is framed by `content_length`/chunk sizes and read by the session or
//! connection on top.

use std::str;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config::{self, ConfigVar};
use crate::http::proto::{Method, Request, Response, HTTP_1_0, HTTP_1_1};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid request line: {0:?}")]
    InvalidRequestLine(String),
    #[error("invalid status line: {0:?}")]
    InvalidStatusLine(String),
    #[error("unknown method: {0:?}")]
    InvalidMethod(String),
    #[error("unsupported http version: {0:?}")]
    InvalidVersion(String),
    #[error("invalid header line: {0:?}")]
    InvalidHeader(String),
    #[error("invalid chunk size line: {0:?}")]
    InvalidChunkSize(String),
}

macro_rules! cached_config {
    ($cache:ident, $fn_name:ident, $var:ident, $key:literal, $default:expr, $desc:literal) => {
        static $cache: AtomicU64 = AtomicU64::new($default);
        static $var: Lazy<Arc<ConfigVar<u64>>> = Lazy::new(|| {
            let var = config::lookup($key, $default as u64, $desc);
            $cache.store(var.value(), Ordering::SeqCst);
            var.add_listener(|_, new| $cache.store(*new, Ordering::SeqCst));
            var
        });

        pub fn $fn_name() -> usize {
            Lazy::force(&$var);
            $cache.load(Ordering::SeqCst) as usize
        }
    };
}

cached_config!(
    REQ_BUF,
    request_buffer_size,
    REQ_BUF_VAR,
    "http.request.buffer_size",
    4 * 1024,
    "http request header buffer size"
);
cached_config!(
    REQ_BODY,
    request_max_body_size,
    REQ_BODY_VAR,
    "http.request.body.max_size",
    64 * 1024 * 1024,
    "http request max body size"
);
cached_config!(
    RSP_BUF,
    response_buffer_size,
    RSP_BUF_VAR,
    "http.response.buffer_size",
    4 * 1024,
    "http response header buffer size"
);
cached_config!(
    RSP_BODY,
    response_max_body_size,
    RSP_BODY_VAR,
    "http.response.body.max_size",
    64 * 1024 * 1024,
    "http response max body size"
);

/// Finds the first CRLF; returns the line without it and the bytes consumed.
fn take_line(data: &[u8]) -> Option<(&[u8], usize)> {
    let pos = data.windows(2).position(|w| w == b"\r\n")?;
    Some((&data[..pos], pos + 2))
}

fn parse_version(text: &str) -> Result<u8, ParseError> {
    match text {
        "HTTP/1.1" => Ok(HTTP_1_1),
        "HTTP/1.0" => Ok(HTTP_1_0),
        other => Err(ParseError::InvalidVersion(other.into())),
    }
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), ParseError> {
    let text = str::from_utf8(line)
        .map_err(|_| ParseError::InvalidHeader(String::from_utf8_lossy(line).into_owned()))?;
    let pos = text
        .find(':')
        .ok_or_else(|| ParseError::InvalidHeader(text.into()))?;
    let key = text[..pos].trim();
    if key.is_empty() {
        return Err(ParseError::InvalidHeader(text.into()));
    }
    Ok((key.to_string(), text[pos + 1..].trim().to_string()))
}

fn content_length_of(header: Option<&str>) -> u64 {
    header.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

enum HeadState {
    FirstLine,
    Headers,
    Finished,
}

/// Server-side request parser.
pub struct RequestParser {
    request: Request,
    state: HeadState,
    error: Option<ParseError>,
}

impl RequestParser {
    pub fn new() -> RequestParser {
        RequestParser {
            request: Request::new(),
            state: HeadState::FirstLine,
            error: None,
        }
    }

    /// Consumes as many complete lines as `data` holds; returns the number
    /// of bytes used. Stops consuming at completion or on error.
    pub fn execute(&mut self, data: &[u8]) -> usize {
        let mut consumed = 0;
        while self.error.is_none() && !self.is_finished() {
            let (line, used) = match take_line(&data[consumed..]) {
                Some(v) => v,
                None => break,
            };
            consumed += used;
            if let Err(e) = self.feed_line(line) {
                self.error = Some(e);
            }
        }
        consumed
    }

    fn feed_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        match self.state {
            HeadState::FirstLine => {
                let text = str::from_utf8(line).map_err(|_| {
                    ParseError::InvalidRequestLine(String::from_utf8_lossy(line).into_owned())
                })?;
                let mut parts = text.split_whitespace();
                let (method, target, version) =
                    match (parts.next(), parts.next(), parts.next(), parts.next()) {
                        (Some(m), Some(t), Some(v), None) => (m, t, v),
                        _ => return Err(ParseError::InvalidRequestLine(text.into())),
                    };
                self.request.method = method
                    .parse::<Method>()
                    .map_err(|_| ParseError::InvalidMethod(method.into()))?;
                self.request.version = parse_version(version)?;

                let (target, fragment) = match target.find('#') {
                    Some(pos) => (&target[..pos], &target[pos + 1..]),
                    None => (target, ""),
                };
                let (path, query) = match target.find('?') {
                    Some(pos) => (&target[..pos], &target[pos + 1..]),
                    None => (target, ""),
                };
                self.request.path = path.to_string();
                self.request.query = query.to_string();
                self.request.fragment = fragment.to_string();
                self.state = HeadState::Headers;
            }
            HeadState::Headers => {
                if line.is_empty() {
                    self.state = HeadState::Finished;
                    return Ok(());
                }
                let (key, value) = parse_header_line(line)?;
                self.request.set_header(&key, &value);
            }
            HeadState::Finished => {}
        }
        Ok(())
    }

    #[inline(always)]
    pub fn is_finished(&self) -> bool {
        matches!(self.state, HeadState::Finished)
    }

    #[inline(always)]
    pub fn error(&self) -> Option<&ParseError> {
        self.error.as_ref()
    }

    pub fn content_length(&self) -> u64 {
        content_length_of(self.request.header("content-length"))
    }

    /// The parsed request; meaningful once finished.
    pub fn into_request(self) -> Request {
        self.request
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-side response parser.
pub struct ResponseParser {
    response: Response,
    state: HeadState,
    error: Option<ParseError>,
}

impl ResponseParser {
    pub fn new() -> ResponseParser {
        ResponseParser {
            response: Response::new(HTTP_1_1, false),
            state: HeadState::FirstLine,
            error: None,
        }
    }

    pub fn execute(&mut self, data: &[u8]) -> usize {
        let mut consumed = 0;
        while self.error.is_none() && !self.is_finished() {
            let (line, used) = match take_line(&data[consumed..]) {
                Some(v) => v,
                None => break,
            };
            consumed += used;
            if let Err(e) = self.feed_line(line) {
                self.error = Some(e);
            }
        }
        consumed
    }

    fn feed_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        match self.state {
            HeadState::FirstLine => {
                let text = str::from_utf8(line).map_err(|_| {
                    ParseError::InvalidStatusLine(String::from_utf8_lossy(line).into_owned())
                })?;
                // "HTTP/1.1 200 OK" - the reason phrase may hold spaces.
                let mut parts = text.splitn(3, ' ');
                let version = parts
                    .next()
                    .ok_or_else(|| ParseError::InvalidStatusLine(text.into()))?;
                let status = parts
                    .next()
                    .ok_or_else(|| ParseError::InvalidStatusLine(text.into()))?;
                self.response.version = parse_version(version)?;
                self.response.status = status
                    .parse()
                    .map_err(|_| ParseError::InvalidStatusLine(text.into()))?;
                self.response.reason = parts.next().unwrap_or("").trim().to_string();
                self.state = HeadState::Headers;
            }
            HeadState::Headers => {
                if line.is_empty() {
                    self.state = HeadState::Finished;
                    return Ok(());
                }
                let (key, value) = parse_header_line(line)?;
                self.response.set_header(&key, &value);
            }
            HeadState::Finished => {}
        }
        Ok(())
    }

    #[inline(always)]
    pub fn is_finished(&self) -> bool {
        matches!(self.state, HeadState::Finished)
    }

    #[inline(always)]
    pub fn error(&self) -> Option<&ParseError> {
        self.error.as_ref()
    }

    pub fn content_length(&self) -> u64 {
        content_length_of(self.response.header("content-length"))
    }

    /// `Transfer-Encoding: chunked` was announced.
    pub fn is_chunked(&self) -> bool {
        self.response
            .header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    pub fn into_response(self) -> Response {
        self.response
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses one `SIZE[;ext]\r\n` chunk-size line. `None` until the line is
/// complete; `Some(Ok((bytes_consumed, chunk_size)))` otherwise.
pub(crate) fn parse_chunk_size(data: &[u8]) -> Option<Result<(usize, u64), ParseError>> {
    let (line, used) = take_line(data)?;
    let text = match str::from_utf8(line) {
        Ok(t) => t,
        Err(_) => {
            return Some(Err(ParseError::InvalidChunkSize(
                String::from_utf8_lossy(line).into_owned(),
            )))
        }
    };
    let digits = match text.find(';') {
        Some(pos) => &text[..pos],
        None => text,
    }
    .trim();
    match u64::from_str_radix(digits, 16) {
        Ok(size) => Some(Ok((used, size))),
        Err(_) => Some(Err(ParseError::InvalidChunkSize(text.into()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_in_one_piece() {
        let data = b"POST /login?next=%2F HTTP/1.1\r\nHost: example.com\r\nContent-Length: 11\r\n\r\nhello=world";
        let mut parser = RequestParser::new();
        let consumed = parser.execute(data);
        assert!(parser.is_finished());
        assert!(parser.error().is_none());
        // The body stays in the buffer.
        assert_eq!(consumed, data.len() - 11);
        assert_eq!(parser.content_length(), 11);

        let req = parser.into_request();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.path, "/login");
        assert_eq!(req.query, "next=%2F");
        assert_eq!(req.header("host"), Some("example.com"));
    }

    #[test]
    fn request_fed_byte_by_byte() {
        let data = b"GET /ping HTTP/1.1\r\nHost: a\r\n\r\n";
        let mut parser = RequestParser::new();
        let mut buf = Vec::new();
        let mut consumed_total = 0;
        for &b in data.iter() {
            buf.push(b);
            let consumed = parser.execute(&buf);
            buf.drain(..consumed);
            consumed_total += consumed;
        }
        assert!(parser.is_finished());
        assert_eq!(consumed_total, data.len());
        assert!(buf.is_empty());
        let req = parser.into_request();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/ping");
    }

    #[test]
    fn request_line_errors() {
        for bad in [
            &b"BREW /pot HTTP/1.1\r\n"[..],
            &b"GET /x HTTP/2.0\r\n"[..],
            &b"GET\r\n"[..],
        ] {
            let mut parser = RequestParser::new();
            parser.execute(bad);
            assert!(parser.error().is_some(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn header_without_colon_is_an_error() {
        let mut parser = RequestParser::new();
        parser.execute(b"GET / HTTP/1.1\r\nbogus header line\r\n\r\n");
        assert!(matches!(parser.error(), Some(ParseError::InvalidHeader(_))));
    }

    #[test]
    fn response_with_reason_phrase() {
        let mut parser = ResponseParser::new();
        let data = b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found";
        let consumed = parser.execute(data);
        assert!(parser.is_finished());
        assert_eq!(consumed, data.len() - 9);
        assert_eq!(parser.content_length(), 9);
        let rsp = parser.into_response();
        assert_eq!(rsp.status, 404);
        assert_eq!(rsp.reason(), "Not Found");
    }

    #[test]
    fn response_detects_chunked() {
        let mut parser = ResponseParser::new();
        parser.execute(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: Chunked\r\n\r\n");
        assert!(parser.is_finished());
        assert!(parser.is_chunked());
        assert_eq!(parser.content_length(), 0);
    }

    #[test]
    fn chunk_size_lines() {
        assert_eq!(parse_chunk_size(b"5\r\nhello"), Some(Ok((3, 5))));
        assert_eq!(parse_chunk_size(b"12b8;ext=1\r\n"), Some(Ok((12, 0x12b8))));
        assert_eq!(parse_chunk_size(b"0\r\n"), Some(Ok((3, 0))));
        assert_eq!(parse_chunk_size(b"5"), None);
        assert!(matches!(parse_chunk_size(b"xyz\r\n"), Some(Err(_))));
    }
}
