//! HTTP wire entities: methods, statuses, requests and responses.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Request methods.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Trace,
    Connect,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Method, ()> {
        Ok(match s {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "PATCH" => Method::Patch,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason phrase for a status code, for the codes this stack emits itself.
pub fn status_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// A header name: ordinary string, case-insensitive identity.
#[derive(Clone, Debug, Eq)]
pub struct HeaderName(String);

impl HeaderName {
    fn new(name: &str) -> HeaderName {
        HeaderName(name.to_string())
    }

    #[inline(always)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for HeaderName {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Ord for HeaderName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .bytes()
            .map(|b| b.to_ascii_lowercase())
            .cmp(other.0.bytes().map(|b| b.to_ascii_lowercase()))
    }
}

impl PartialOrd for HeaderName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub type HeaderMap = BTreeMap<HeaderName, String>;

fn header_get<'m>(map: &'m HeaderMap, key: &str) -> Option<&'m str> {
    map.get(&HeaderName::new(key)).map(String::as_str)
}

const fn pack_version(major: u8, minor: u8) -> u8 {
    (major << 4) | minor
}

fn version_str(v: u8) -> String {
    format!("HTTP/{}.{}", v >> 4, v & 0x0f)
}

/// 1.1, the version this stack speaks by default.
pub const HTTP_1_1: u8 = pack_version(1, 1);
pub const HTTP_1_0: u8 = pack_version(1, 0);

/// One HTTP request.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    /// Packed version, `0x11` for 1.1.
    pub version: u8,
    pub path: String,
    pub query: String,
    pub fragment: String,
    pub body: String,
    headers: HeaderMap,
    params: BTreeMap<String, String>,
    cookies: BTreeMap<String, String>,
    close: bool,
    websocket: bool,
}

impl Request {
    pub fn new() -> Request {
        Request {
            method: Method::Get,
            version: HTTP_1_1,
            path: "/".into(),
            query: String::new(),
            fragment: String::new(),
            body: String::new(),
            headers: HeaderMap::new(),
            params: BTreeMap::new(),
            cookies: BTreeMap::new(),
            close: true,
            websocket: false,
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        header_get(&self.headers, key)
    }

    pub fn set_header(&mut self, key: &str, value: &str) {
        self.headers.insert(HeaderName::new(key), value.to_string());
    }

    pub fn del_header(&mut self, key: &str) {
        self.headers.remove(&HeaderName::new(key));
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.header(key).is_some()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn set_param(&mut self, key: &str, value: &str) {
        self.params.insert(key.into(), value.into());
    }

    pub fn cookie(&self, key: &str) -> Option<&str> {
        self.cookies.get(key).map(String::as_str)
    }

    pub fn set_cookie(&mut self, key: &str, value: &str) {
        self.cookies.insert(key.into(), value.into());
    }

    #[inline(always)]
    pub fn is_close(&self) -> bool {
        self.close
    }

    #[inline(always)]
    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    #[inline(always)]
    pub fn is_websocket(&self) -> bool {
        self.websocket
    }

    #[inline(always)]
    pub fn set_websocket(&mut self, ws: bool) {
        self.websocket = ws;
    }

    /// Derives the close flag from the `Connection` header: 1.1 defaults to
    /// keep-alive, 1.0 to close.
    pub fn init(&mut self) {
        self.close = match self.header("connection") {
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => false,
            Some(v) if v.eq_ignore_ascii_case("close") => true,
            Some(_) | None => self.version < HTTP_1_1,
        };
    }

    /// Populates the parameter map from the query string and the cookie map
    /// from the `Cookie` header.
    pub fn init_params(&mut self) {
        let query = self.query.clone();
        for piece in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = match piece.find('=') {
                Some(pos) => (&piece[..pos], &piece[pos + 1..]),
                None => (piece, ""),
            };
            self.set_param(key, value);
        }
        if let Some(cookie) = self.header("cookie").map(str::to_string) {
            for piece in cookie.split(';') {
                let piece = piece.trim();
                if piece.is_empty() {
                    continue;
                }
                let (key, value) = match piece.find('=') {
                    Some(pos) => (&piece[..pos], &piece[pos + 1..]),
                    None => (piece, ""),
                };
                self.cookies.insert(key.into(), value.into());
            }
        }
    }

    /// A response shell matching this request's version and close flag.
    pub fn create_response(&self) -> Response {
        let mut rsp = Response::new(self.version, self.close);
        rsp.set_websocket(self.websocket);
        rsp
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Request {
    /// The serialized request: request line, headers, framing headers
    /// derived from the close flag and body, blank line, body.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        if !self.fragment.is_empty() {
            write!(f, "#{}", self.fragment)?;
        }
        write!(f, " {}\r\n", version_str(self.version))?;

        if !self.websocket {
            write!(
                f,
                "connection: {}\r\n",
                if self.close { "close" } else { "keep-alive" }
            )?;
        }
        for (key, value) in &self.headers {
            if !self.websocket && key.as_str().eq_ignore_ascii_case("connection") {
                continue;
            }
            write!(f, "{}: {}\r\n", key.as_str(), value)?;
        }
        if !self.body.is_empty() {
            write!(f, "content-length: {}\r\n\r\n{}", self.body.len(), self.body)
        } else {
            write!(f, "\r\n")
        }
    }
}

/// One HTTP response.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    /// Reason phrase from the wire; empty means "derive from the code".
    pub reason: String,
    pub version: u8,
    pub body: String,
    headers: HeaderMap,
    set_cookies: Vec<String>,
    close: bool,
    websocket: bool,
}

impl Response {
    pub fn new(version: u8, close: bool) -> Response {
        Response {
            status: 200,
            reason: String::new(),
            version,
            body: String::new(),
            headers: HeaderMap::new(),
            set_cookies: Vec::new(),
            close,
            websocket: false,
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        header_get(&self.headers, key)
    }

    pub fn set_header(&mut self, key: &str, value: &str) {
        self.headers.insert(HeaderName::new(key), value.to_string());
    }

    pub fn del_header(&mut self, key: &str) {
        self.headers.remove(&HeaderName::new(key));
    }

    pub fn set_cookie(&mut self, key: &str, value: &str) {
        self.set_cookies.push(format!("{}={}", key, value));
    }

    #[inline(always)]
    pub fn is_close(&self) -> bool {
        self.close
    }

    #[inline(always)]
    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    #[inline(always)]
    pub fn is_websocket(&self) -> bool {
        self.websocket
    }

    #[inline(always)]
    pub fn set_websocket(&mut self, ws: bool) {
        self.websocket = ws;
    }

    pub fn reason(&self) -> &str {
        if self.reason.is_empty() {
            status_reason(self.status)
        } else {
            &self.reason
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}\r\n",
            version_str(self.version),
            self.status,
            self.reason()
        )?;
        for (key, value) in &self.headers {
            if !self.websocket && key.as_str().eq_ignore_ascii_case("connection") {
                continue;
            }
            write!(f, "{}: {}\r\n", key.as_str(), value)?;
        }
        for cookie in &self.set_cookies {
            write!(f, "Set-Cookie: {}\r\n", cookie)?;
        }
        if !self.websocket {
            write!(
                f,
                "connection: {}\r\n",
                if self.close { "close" } else { "keep-alive" }
            )?;
        }
        write!(f, "content-length: {}\r\n\r\n{}", self.body.len(), self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn headers_are_case_insensitive() {
        let mut req = Request::new();
        req.set_header("Content-Type", "text/plain");
        assert_eq!(req.header("content-type"), Some("text/plain"));
        assert_eq!(req.header("CONTENT-TYPE"), Some("text/plain"));
        req.set_header("CONTENT-type", "text/html");
        assert_eq!(req.header("content-type"), Some("text/html"));
        req.del_header("Content-TYPE");
        assert!(!req.has_header("content-type"));
    }

    #[test]
    fn request_serialization() {
        let mut req = Request::new();
        req.path = "/ping".into();
        req.query = "a=1".into();
        req.set_close(false);
        req.set_header("Host", "example.com");
        assert_eq!(
            req.to_string(),
            "GET /ping?a=1 HTTP/1.1\r\nconnection: keep-alive\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn response_serialization_has_content_length() {
        let mut rsp = Response::new(HTTP_1_1, false);
        rsp.body = "pong".into();
        let text = rsp.to_string();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\npong"));
    }

    #[test]
    fn init_derives_close_flag() {
        let mut req = Request::new();
        req.init();
        assert!(!req.is_close());

        req.set_header("Connection", "close");
        req.init();
        assert!(req.is_close());

        let mut old = Request::new();
        old.version = HTTP_1_0;
        old.init();
        assert!(old.is_close());
    }

    #[test]
    fn init_params_splits_query_and_cookies() {
        let mut req = Request::new();
        req.query = "id=10&v=20&flag".into();
        req.set_header("Cookie", "session=abc; theme=dark");
        req.init_params();
        assert_eq!(req.param("id"), Some("10"));
        assert_eq!(req.param("v"), Some("20"));
        assert_eq!(req.param("flag"), Some(""));
        assert_eq!(req.cookie("session"), Some("abc"));
        assert_eq!(req.cookie("theme"), Some("dark"));
    }
}
