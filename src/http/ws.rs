//! WebSocket upgrade handshake (handshake only; frames are out of scope).
//!
//! The client sends a 16-byte base64 nonce under `Sec-WebSocket-Key`; the
//! server proves it saw the request by echoing
//! `base64(sha1(key + GUID))` in `Sec-WebSocket-Accept` on a
//! `101 Switching Protocols` response.

use std::fs::File;
use std::io::Read;

use sha1::{Digest, Sha1};

use crate::http::proto::{Method, Request, Response};

/// The fixed GUID of RFC 6455 §1.3.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn random_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    let filled = File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut nonce))
        .is_ok();
    if !filled {
        // Degraded source; the nonce only has to be unique per connection.
        let ms = crate::clock::realtime_ms();
        let addr = &nonce as *const _ as u64;
        nonce[..8].copy_from_slice(&ms.to_be_bytes());
        nonce[8..].copy_from_slice(&addr.to_be_bytes());
    }
    nonce
}

/// The accept token the server must echo for `key`.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    base64::encode(sha.finalize())
}

/// Builds the client-side upgrade request for `host` + `path`.
pub fn handshake_request(host: &str, path: &str) -> Request {
    let mut req = Request::new();
    req.method = Method::Get;
    req.path = path.into();
    req.set_websocket(true);
    req.set_header("Host", host);
    req.set_header("Upgrade", "websocket");
    req.set_header("Connection", "Upgrade");
    req.set_header("Sec-WebSocket-Version", "13");
    req.set_header("Sec-WebSocket-Key", &base64::encode(random_nonce()));
    req
}

/// Server side: validates an upgrade request and builds the
/// `101 Switching Protocols` response, `None` when the request is not a
/// well-formed upgrade.
pub fn handshake_verify(req: &Request) -> Option<Response> {
    if req.method != Method::Get {
        return None;
    }
    let upgrade = req.header("Upgrade")?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return None;
    }
    let connection = req.header("Connection")?;
    if !connection
        .split(',')
        .any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"))
    {
        return None;
    }
    if req.header("Sec-WebSocket-Version")? != "13" {
        return None;
    }
    let key = req.header("Sec-WebSocket-Key")?;
    if base64::decode(key).map(|k| k.len()) != Ok(16) {
        return None;
    }

    let mut rsp = req.create_response();
    rsp.set_websocket(true);
    rsp.status = 101;
    rsp.set_header("Upgrade", "websocket");
    rsp.set_header("Connection", "Upgrade");
    rsp.set_header("Sec-WebSocket-Accept", &accept_key(key));
    Some(rsp)
}

/// Client side: checks the server's response against the key we sent.
pub fn handshake_check(key: &str, rsp: &Response) -> bool {
    rsp.status == 101
        && rsp
            .header("Sec-WebSocket-Accept")
            .map(|got| got == accept_key(key))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // The worked example of RFC 6455 §1.3.
    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const RFC_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(accept_key(RFC_KEY), RFC_ACCEPT);
    }

    #[test]
    fn request_carries_a_fresh_nonce() {
        let a = handshake_request("example.com", "/chat");
        let b = handshake_request("example.com", "/chat");
        assert_eq!(a.header("Upgrade"), Some("websocket"));
        assert_eq!(a.header("Sec-WebSocket-Version"), Some("13"));
        let ka = a.header("Sec-WebSocket-Key").unwrap();
        let kb = b.header("Sec-WebSocket-Key").unwrap();
        assert_eq!(base64::decode(ka).unwrap().len(), 16);
        assert_ne!(ka, kb);
    }

    #[test]
    fn verify_then_check_roundtrip() {
        let req = handshake_request("example.com", "/chat");
        let key = req.header("Sec-WebSocket-Key").unwrap().to_string();
        let rsp = handshake_verify(&req).expect("valid upgrade request");
        assert_eq!(rsp.status, 101);
        assert!(handshake_check(&key, &rsp));
        assert!(!handshake_check("bogus+key+bogus+key+bog=", &rsp));
    }

    #[test]
    fn verify_rejects_missing_pieces() {
        let mut req = handshake_request("example.com", "/chat");
        req.del_header("Sec-WebSocket-Key");
        assert!(handshake_verify(&req).is_none());

        let mut req = handshake_request("example.com", "/chat");
        req.set_header("Upgrade", "h2c");
        assert!(handshake_verify(&req).is_none());

        let mut req = handshake_request("example.com", "/chat");
        req.method = Method::Post;
        assert!(handshake_verify(&req).is_none());
    }
}
