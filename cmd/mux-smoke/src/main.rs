//! netmux End-to-End Smoke Test
//!
//! Exercises the full stack against real loopback TCP:
//!   Part A - Addresses: parse, text cache, equality
//!   Part B - Multiplexer lifecycle: create, poll timeout, close
//!   Part C - Listen + accept + echo with concurrent clients
//!   Part D - Teardown
//!
//! Run: ./target/release/mux-smoke

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use netmux::{
    MuxSocket, PollOutcome, SocketAddress, SocketMultiplexer, SocketState, StreamHandler,
};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

// ════════════════════════════════════════════════════════════
// Part A: Addresses
// ════════════════════════════════════════════════════════════

fn test_addresses(t: &mut TestRunner) {
    t.section("Part A: Addresses");

    let v4: Result<SocketAddress, _> = "192.168.1.10:8080".parse();
    t.check("parse IPv4", v4.is_ok(), "parse failed");
    if let Ok(a) = &v4 {
        t.check("IPv4 port", a.port() == 8080, &format!("port={}", a.port()));
        t.check(
            "IPv4 text roundtrip",
            a.text() == "192.168.1.10:8080",
            a.text(),
        );
    }

    let v6: Result<SocketAddress, _> = "[::1]:443".parse();
    t.check("parse IPv6", v6.is_ok(), "parse failed");

    let bad: Result<SocketAddress, _> = "not-an-address".parse();
    t.check("malformed input rejected", bad.is_err(), "accepted");

    let a: SocketAddress = "10.0.0.1:80".parse().unwrap();
    let b: SocketAddress = "10.0.0.1:80".parse().unwrap();
    let _ = a.text(); // populate one cache, leave the other cold
    t.check("equality ignores text cache", a == b, "mismatch");
}

// ════════════════════════════════════════════════════════════
// Part B: Multiplexer lifecycle
// ════════════════════════════════════════════════════════════

fn test_lifecycle(t: &mut TestRunner) -> Option<Arc<SocketMultiplexer>> {
    t.section("Part B: Multiplexer Lifecycle");

    let mux = match SocketMultiplexer::new() {
        Ok(mux) => { t.pass("create multiplexer"); mux }
        Err(e) => {
            t.fail("create multiplexer", &format!("{}", e));
            return None;
        }
    };

    t.check("starts empty", mux.socket_count() == 0, "not empty");

    let started = Instant::now();
    match mux.poll(Some(Duration::from_millis(50))) {
        Ok(PollOutcome::TimedOut) => {
            t.check(
                "empty poll times out",
                started.elapsed() >= Duration::from_millis(40),
                "returned early",
            );
        }
        other => t.fail("empty poll times out", &format!("{:?}", other)),
    }

    Some(mux)
}

// ════════════════════════════════════════════════════════════
// Part C: Listen + accept + echo
// ════════════════════════════════════════════════════════════

struct Echo;

impl StreamHandler for Echo {
    fn on_readable(&self, _mux: &Arc<SocketMultiplexer>, socket: &Arc<MuxSocket>) {
        let mut buf = [0u8; 1024];
        loop {
            match socket.recv(&mut buf) {
                Ok(Some(0)) => {
                    socket.close();
                    return;
                }
                Ok(Some(n)) => {
                    let _ = socket.send(&buf[..n]);
                }
                Ok(None) => return,
                Err(_) => {
                    socket.close();
                    return;
                }
            }
        }
    }
}

fn test_echo(t: &mut TestRunner, mux: &Arc<SocketMultiplexer>) -> Option<Arc<MuxSocket>> {
    t.section("Part C: Listen + Accept + Echo (3 clients)");

    let addr: SocketAddress = "127.0.0.1:0".parse().unwrap();
    let listener = match mux.create_listen_socket(
        &addr,
        Box::new(|mux, fd, peer| MuxSocket::adopt_stream(mux, fd, peer, Box::new(Echo))),
    ) {
        Ok(l) => { t.pass("bind + listen"); l }
        Err(e) => {
            t.fail("bind + listen", &format!("{}", e));
            return None;
        }
    };

    let port = listener.local_address().map(|a| a.port()).unwrap_or(0);
    t.check("ephemeral port assigned", port != 0, "port is 0");

    let done = Arc::new(AtomicUsize::new(0));
    let ok = Arc::new(AtomicUsize::new(0));

    let mut clients = Vec::new();
    for i in 0..3u8 {
        let done = done.clone();
        let ok = ok.clone();
        clients.push(std::thread::spawn(move || {
            let msg = [b'a' + i; 64];
            let run = || -> std::io::Result<bool> {
                let mut stream = TcpStream::connect(("127.0.0.1", port))?;
                stream.set_read_timeout(Some(Duration::from_secs(5)))?;
                stream.write_all(&msg)?;
                let mut reply = [0u8; 64];
                stream.read_exact(&mut reply)?;
                Ok(reply == msg)
            };
            if let Ok(true) = run() {
                ok.fetch_add(1, Ordering::SeqCst);
            }
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // Drive the multiplexer until every client finished its roundtrip
    let deadline = Instant::now() + Duration::from_secs(10);
    while done.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        if let Err(e) = mux.poll(Some(Duration::from_millis(100))) {
            t.fail("poll loop", &format!("{}", e));
            break;
        }
    }
    for c in clients {
        let _ = c.join();
    }

    t.check(
        "3 concurrent echo roundtrips",
        ok.load(Ordering::SeqCst) == 3,
        &format!("{} of 3 succeeded", ok.load(Ordering::SeqCst)),
    );
    t.check(
        "connections_accepted == 3",
        listener.connections_accepted() == Some(3),
        &format!("{:?}", listener.connections_accepted()),
    );

    Some(listener)
}

// ════════════════════════════════════════════════════════════
// Part D: Teardown
// ════════════════════════════════════════════════════════════

fn test_teardown(t: &mut TestRunner, mux: &Arc<SocketMultiplexer>, listener: Arc<MuxSocket>) {
    t.section("Part D: Teardown");

    listener.close();
    t.check(
        "listener destroyed after close",
        listener.state() == SocketState::Destroyed,
        &format!("{}", listener.state()),
    );

    listener.close();
    t.check(
        "second close is a no-op",
        listener.state() == SocketState::Destroyed,
        "state changed",
    );

    // Drain whatever the clients left behind (EOFs close the streams)
    let deadline = Instant::now() + Duration::from_secs(5);
    while mux.socket_count() > 0 && Instant::now() < deadline {
        if mux.poll(Some(Duration::from_millis(100))).is_err() {
            break;
        }
    }
    t.check(
        "registry drained",
        mux.socket_count() == 0,
        &format!("{} left", mux.socket_count()),
    );
}

// ════════════════════════════════════════════════════════════

fn main() {
    println!("=== netmux End-to-End Smoke Test ===");

    let mut t = TestRunner::new();

    test_addresses(&mut t);

    let mux = match test_lifecycle(&mut t) {
        Some(mux) => mux,
        None => {
            t.summary();
            std::process::exit(1);
        }
    };

    if let Some(listener) = test_echo(&mut t, &mux) {
        test_teardown(&mut t, &mux, listener);
    }

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
