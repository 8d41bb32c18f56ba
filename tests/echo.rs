//! Echo server under concurrent client load.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use strand::address::Address;
use strand::io::IoManager;
use strand::socket::Socket;
use strand::tcp_server::TcpServer;

const CLIENTS: usize = 32;
const PAYLOAD_LEN: usize = 64 * 1024;

fn payload() -> Vec<u8> {
    b"0123456789ABCDEF"
        .iter()
        .copied()
        .cycle()
        .take(PAYLOAD_LEN)
        .collect()
}

#[test]
fn echo_many_concurrent_clients() {
    let io = IoManager::new(4, false, "t-echo").unwrap();
    let served_bytes = Arc::new(AtomicUsize::new(0));

    let counter = served_bytes.clone();
    let handler = move |client: Socket| {
        let mut buf = [0u8; 4096];
        loop {
            let n = match client.recv(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            counter.fetch_add(n, Ordering::SeqCst);
            let mut sent = 0;
            while sent < n {
                match client.send(&buf[sent..n]) {
                    Ok(m) => sent += m,
                    Err(_) => return,
                }
            }
        }
    };

    let server = TcpServer::new("echo", io.clone(), io.clone(), Arc::new(handler));
    server
        .bind(&[Address::lookup_any("127.0.0.1:0").unwrap()])
        .unwrap();
    server.start();
    let port = server.local_addresses()[0].port().unwrap();

    let data = Arc::new(payload());
    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        let data = data.clone();
        clients.push(thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();

            let writer_data = data.clone();
            let mut write_half = stream.try_clone().unwrap();
            let writer = thread::spawn(move || {
                write_half.write_all(&writer_data).unwrap();
                write_half
                    .shutdown(std::net::Shutdown::Write)
                    .unwrap();
            });

            let mut echoed = Vec::with_capacity(data.len());
            stream.read_to_end(&mut echoed).unwrap();
            writer.join().unwrap();
            assert_eq!(echoed.len(), data.len());
            assert!(echoed == *data, "echoed payload differs");
        }));
    }
    for client in clients {
        client.join().unwrap();
    }

    assert_eq!(served_bytes.load(Ordering::SeqCst), CLIENTS * PAYLOAD_LEN);

    // Once the clients are gone, only the accept waiter may remain; stopping
    // the server cancels it and the pending-event counter drains to zero.
    server.stop();
    let deadline = Instant::now() + Duration::from_secs(5);
    while io.pending_events() != 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(io.pending_events(), 0);
    io.stop();
}
