//! Runtime end-to-end checks: sleeping fibers, i/o timeouts, shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use strand::address::Address;
use strand::hook;
use strand::io::IoManager;
use strand::socket::Socket;

#[test]
fn sleeping_fibers_share_one_worker() {
    let io = IoManager::new(1, false, "t-sleep").unwrap();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();

    {
        let log = log.clone();
        let tx = tx.clone();
        io.schedule(move || {
            hook::sleep(Duration::from_millis(100));
            log.lock().unwrap().push("A");
            tx.send(()).unwrap();
        });
    }
    {
        let log = log.clone();
        let tx = tx.clone();
        io.schedule(move || {
            hook::sleep(Duration::from_millis(100));
            log.lock().unwrap().push("B");
            tx.send(()).unwrap();
        });
    }
    {
        let log = log.clone();
        let tx = tx.clone();
        io.schedule(move || {
            log.lock().unwrap().push("C");
            tx.send(()).unwrap();
        });
    }

    for _ in 0..3 {
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    let elapsed = started.elapsed();

    // The non-sleeping fiber ran while the others were parked, and the two
    // 100 ms sleeps overlapped on the single worker.
    assert_eq!(log.lock().unwrap().first(), Some(&"C"));
    assert!(elapsed >= Duration::from_millis(95), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(190), "{:?}", elapsed);

    io.stop();
}

#[test]
fn recv_timeout_unblocks_with_etimedout() {
    // A peer that accepts and then goes silent.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(600));
        drop(stream);
    });

    let io = IoManager::new(1, false, "t-timeout").unwrap();
    let (tx, rx) = mpsc::channel();
    io.schedule(move || {
        let address = Address::from_std(addr);
        let sock = Socket::tcp(&address).unwrap();
        sock.connect(&address, None).unwrap();
        sock.set_recv_timeout(Some(Duration::from_millis(100)));

        let started = Instant::now();
        let mut buf = [0u8; 16];
        let result = sock.recv(&mut buf);
        tx.send((
            result.map_err(|e| e.raw_os_error()),
            started.elapsed(),
        ))
        .unwrap();
    });

    let (result, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result, Err(Some(libc::ETIMEDOUT)));
    assert!(elapsed >= Duration::from_millis(80), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "{:?}", elapsed);

    // The cancelled wait left nothing registered behind.
    assert_eq!(io.pending_events(), 0);
    io.stop();
    peer.join().unwrap();
}

#[test]
fn connect_and_roundtrip_against_a_blocking_peer() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = thread::spawn(move || {
        use std::io::{Read, Write};
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        stream.write_all(b"world").unwrap();
    });

    let io = IoManager::new(2, false, "t-roundtrip").unwrap();
    let (tx, rx) = mpsc::channel();
    io.schedule(move || {
        let address = Address::from_std(addr);
        let sock = Socket::tcp(&address).unwrap();
        sock.connect(&address, Some(Duration::from_secs(5))).unwrap();
        assert!(sock.is_connected());
        assert!(sock.remote_address().is_some());

        sock.send(b"hello").unwrap();
        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < buf.len() {
            let n = sock.recv(&mut buf[got..]).unwrap();
            assert!(n > 0);
            got += n;
        }
        tx.send(buf.to_vec()).unwrap();
    });

    let echoed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(echoed, b"world");
    io.stop();
    peer.join().unwrap();
}

#[test]
fn use_caller_manager_drains_work_in_stop() {
    let io = IoManager::new(1, true, "t-caller").unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let done2 = done.clone();
    io.schedule(move || {
        hook::sleep(Duration::from_millis(20));
        done2.store(true, Ordering::SeqCst);
    });
    assert!(!done.load(Ordering::SeqCst));
    io.stop();
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn timer_fires_on_the_manager() {
    let io = IoManager::new(1, false, "t-timer").unwrap();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let started = Instant::now();
    io.add_timer(
        50,
        move || {
            let _ = tx.lock().unwrap().send(());
        },
        false,
    );
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(45), "{:?}", elapsed);
    io.stop();
}

#[test]
fn cancelled_timer_does_not_fire() {
    let io = IoManager::new(1, false, "t-timer-cancel").unwrap();
    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = fired.clone();
    let handle = io.add_timer(50, move || fired2.store(true, Ordering::SeqCst), false);
    assert!(handle.cancel());
    thread::sleep(Duration::from_millis(120));
    assert!(!fired.load(Ordering::SeqCst));
    io.stop();
}
