//! HTTP server + client end-to-end, through the connection pool.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use strand::address::Address;
use strand::http::ws;
use strand::http::{Connection, HttpServer, Pool, ResultCode};
use strand::io::IoManager;
use strand::socket::Socket;

fn start_server(io: &Arc<IoManager>) -> (HttpServer, u16) {
    let server = HttpServer::new(io.clone(), io.clone(), true);
    server.dispatch().add_function("/ping", |_req, rsp, _session| {
        rsp.body = "pong".into();
        0
    });
    server.dispatch().add_function("/whoami", |req, rsp, _session| {
        rsp.body = format!("user={}", req.param("user").unwrap_or("nobody"));
        0
    });
    server
        .dispatch()
        .add_glob_function("/static/*", |req, rsp, _session| {
            rsp.body = format!("static:{}", req.path);
            0
        });
    server.dispatch().add_function("/chat", |req, rsp, _session| {
        match ws::handshake_verify(req) {
            Some(upgraded) => *rsp = upgraded,
            None => rsp.status = 400,
        }
        0
    });
    server
        .bind(&[Address::lookup_any("127.0.0.1:0").unwrap()])
        .unwrap();
    server.start();
    let port = server.tcp().local_addresses()[0].port().unwrap();
    (server, port)
}

#[test]
fn get_through_the_pool_reuses_one_connection() {
    let io = IoManager::new(2, false, "t-http").unwrap();
    let (server, port) = start_server(&io);

    let pool = Pool::new("127.0.0.1", "", port, 2, Duration::from_secs(30), 100);
    let (tx, rx) = mpsc::channel();
    {
        let pool = pool.clone();
        io.schedule(move || {
            let mut summaries = Vec::new();
            for _ in 0..10 {
                let result = pool.do_get("/ping", Duration::from_secs(5), &[], "");
                let rsp = result.response.as_ref();
                summaries.push((
                    result.code,
                    rsp.map(|r| r.status),
                    rsp.and_then(|r| r.header("content-length").map(str::to_string)),
                    rsp.map(|r| r.body.clone()),
                ));
            }
            let reused_requests = pool.get().map(|conn| conn.request_count()).unwrap_or(0);
            tx.send((summaries, pool.total(), reused_requests)).unwrap();
        });
    }

    let (summaries, total, reused_requests) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    for (code, status, content_length, body) in summaries {
        assert_eq!(code, ResultCode::Ok);
        assert_eq!(status, Some(200));
        assert_eq!(content_length.as_deref(), Some("4"));
        assert_eq!(body.as_deref(), Some("pong"));
    }
    // Never more physical connections than the cap; serial traffic reuses
    // one, and its served-request counter kept climbing.
    assert!(total <= 2, "pool grew to {}", total);
    assert_eq!(reused_requests, 10);

    server.stop();
    io.stop();
}

#[test]
fn params_globs_and_the_default_servlet() {
    let io = IoManager::new(2, false, "t-http-routes").unwrap();
    let (server, port) = start_server(&io);

    let pool = Pool::new("127.0.0.1", "", port, 2, Duration::from_secs(30), 100);
    let (tx, rx) = mpsc::channel();
    io.schedule(move || {
        let whoami = pool.do_get("/whoami?user=dave", Duration::from_secs(5), &[], "");
        let glob = pool.do_get("/static/css/site.css", Duration::from_secs(5), &[], "");
        let missing = pool.do_get("/no/such/path", Duration::from_secs(5), &[], "");
        tx.send((
            whoami.response.map(|r| r.body),
            glob.response.map(|r| r.body),
            missing.response.map(|r| (r.status, r.body)),
        ))
        .unwrap();
    });

    let (whoami, glob, missing) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(whoami.as_deref(), Some("user=dave"));
    assert_eq!(glob.as_deref(), Some("static:/static/css/site.css"));
    let (status, body) = missing.unwrap();
    assert_eq!(status, 404);
    assert!(body.contains("404 Not Found"));

    server.stop();
    io.stop();
}

#[test]
fn websocket_upgrade_over_the_wire() {
    let io = IoManager::new(2, false, "t-ws").unwrap();
    let (server, port) = start_server(&io);

    let (tx, rx) = mpsc::channel();
    io.schedule(move || {
        let address = Address::lookup_any(&format!("127.0.0.1:{}", port)).unwrap();
        let sock = Socket::tcp(&address).unwrap();
        sock.connect(&address, Some(Duration::from_secs(5))).unwrap();
        sock.set_recv_timeout(Some(Duration::from_secs(5)));

        let req = ws::handshake_request("127.0.0.1", "/chat");
        let key = req.header("Sec-WebSocket-Key").unwrap().to_string();
        let conn = Connection::new(sock);
        conn.send_request(&req).unwrap();
        let rsp = conn.recv_response().unwrap();
        tx.send((rsp.status, ws::handshake_check(&key, &rsp))).unwrap();
    });

    let (status, accepted) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(status, 101);
    assert!(accepted);

    server.stop();
    io.stop();
}

#[test]
fn pool_cap_is_enforced() {
    let io = IoManager::new(2, false, "t-pool-cap").unwrap();
    let (server, port) = start_server(&io);

    let pool = Pool::new("127.0.0.1", "", port, 1, Duration::from_secs(30), 100);
    let (tx, rx) = mpsc::channel();
    io.schedule(move || {
        let first = pool.get();
        // The only slot is borrowed; a second borrow must be refused.
        let second_err = pool.get().is_err();
        drop(first);
        // Returned to the pool: borrowing works again.
        let third_ok = pool.get().is_ok();
        tx.send((second_err, third_ok, pool.total())).unwrap();
    });

    let (second_err, third_ok, total) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(second_err);
    assert!(third_ok);
    assert_eq!(total, 1);

    server.stop();
    io.stop();
}
