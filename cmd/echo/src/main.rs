//! TCP Echo Server
//!
//! Single-threaded echo on a netmux poll loop: one listen socket, one
//! stream socket per client, everything dispatched from main().
//!
//! Usage:
//!     ./target/release/echo [port]
//!
//! Stats go to stderr every 5 seconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use netmux::{MuxSocket, SocketAddress, SocketMultiplexer, StreamHandler};

struct Stats {
    accepts: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    closes: AtomicU64,
    errors: AtomicU64,
}

impl Stats {
    fn new() -> Self {
        Self {
            accepts: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

/// Echoes everything back. Short writes fall back to write events and
/// the pending tail is flushed from on_writable.
struct EchoClient {
    stats: Arc<Stats>,
    pending: std::sync::Mutex<Vec<u8>>,
}

impl EchoClient {
    fn flush(&self, socket: &Arc<MuxSocket>) {
        let mut pending = self.pending.lock().unwrap();
        while !pending.is_empty() {
            match socket.send(&pending) {
                Ok(Some(n)) => {
                    self.stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                    pending.drain(..n);
                }
                Ok(None) => {
                    // Kernel buffer full, resume from on_writable
                    let _ = socket.enable_write_events(true);
                    return;
                }
                Err(_) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    self.stats.closes.fetch_add(1, Ordering::Relaxed);
                    socket.close();
                    return;
                }
            }
        }
        let _ = socket.enable_write_events(false);
    }
}

impl StreamHandler for EchoClient {
    fn on_readable(&self, _mux: &Arc<SocketMultiplexer>, socket: &Arc<MuxSocket>) {
        let mut buf = [0u8; 4096];
        loop {
            match socket.recv(&mut buf) {
                Ok(Some(0)) => {
                    self.stats.closes.fetch_add(1, Ordering::Relaxed);
                    socket.close();
                    return;
                }
                Ok(Some(n)) => {
                    self.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                    self.pending.lock().unwrap().extend_from_slice(&buf[..n]);
                }
                Ok(None) => break,
                Err(_) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    self.stats.closes.fetch_add(1, Ordering::Relaxed);
                    socket.close();
                    return;
                }
            }
        }
        self.flush(socket);
    }

    fn on_writable(&self, _mux: &Arc<SocketMultiplexer>, socket: &Arc<MuxSocket>) {
        self.flush(socket);
    }
}

fn main() -> netmux::MuxResult<()> {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9997);

    let mux = SocketMultiplexer::new()?;
    let stats = Arc::new(Stats::new());

    let addr: SocketAddress = format!("0.0.0.0:{}", port).parse()?;
    let accept_stats = stats.clone();
    let listener = MuxSocket::listen(
        &mux,
        &addr,
        Box::new(move |mux, fd, peer| {
            accept_stats.accepts.fetch_add(1, Ordering::Relaxed);
            MuxSocket::adopt_stream(
                mux,
                fd,
                peer,
                Box::new(EchoClient {
                    stats: accept_stats.clone(),
                    pending: std::sync::Mutex::new(Vec::new()),
                }),
            )
        }),
    )?;

    eprintln!(
        "echo: listening on {}",
        listener.local_address().map(|a| a.text()).unwrap_or("?")
    );

    let start = Instant::now();
    let mut last_report = Instant::now();
    loop {
        mux.poll(Some(Duration::from_secs(1)))?;

        if last_report.elapsed() >= Duration::from_secs(5) {
            last_report = Instant::now();
            eprintln!(
                "[{:.1}s] sockets={} accepts={} bytes_in={} bytes_out={} closes={} err={}",
                start.elapsed().as_secs_f64(),
                mux.socket_count(),
                stats.accepts.load(Ordering::Relaxed),
                stats.bytes_in.load(Ordering::Relaxed),
                stats.bytes_out.load(Ordering::Relaxed),
                stats.closes.load(Ordering::Relaxed),
                stats.errors.load(Ordering::Relaxed),
            );
        }
    }
}
