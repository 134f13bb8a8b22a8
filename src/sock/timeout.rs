//! Out-of-band write-timeout wheel.
//!
//! Every guarded write registers an entry with `end_time = now + timeout`.
//! If the wheel fires before the writer cancels, the socket is force-closed
//! to abort the in-flight write, bounding write latency independent of the
//! blocking semantics of the socket API.

use std::collections::BTreeMap;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::stats::DiscoveryStats;

struct Entry {
    sock: TcpStream,
    done: Arc<AtomicBool>,
}

enum WheelCmd {
    Register {
        end_time: Instant,
        seq: u64,
        entry: Entry,
    },
}

/// Handle returned per guarded write.
pub struct TimeoutGuard {
    done: Arc<AtomicBool>,
}

impl TimeoutGuard {
    /// Returns `true` when the guard was cancelled before the wheel fired;
    /// `false` means the socket was already force-closed.
    pub fn cancel(&self) -> bool {
        self.done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Single wheel shared by every guarded socket write of one node.
#[derive(Clone)]
pub struct TimeoutWheel {
    tx: Sender<WheelCmd>,
    seq: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TimeoutWheel {
    pub fn start(stats: Arc<DiscoveryStats>) -> Self {
        let (tx, rx) = crossbeam::channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let join = {
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("disc-timeout-wheel".into())
                .spawn(move || run_wheel(rx, shutdown, stats))
                .expect("spawn timeout wheel")
        };
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
            shutdown,
            join: Arc::new(Mutex::new(Some(join))),
        }
    }

    /// Registers a force-close deadline for `sock`.
    ///
    /// The stream handle is an OS-level clone; closing it aborts the
    /// original writer's blocked call.
    pub fn register(&self, sock: &TcpStream, timeout: Duration) -> TimeoutGuard {
        let done = Arc::new(AtomicBool::new(false));
        let guard = TimeoutGuard {
            done: Arc::clone(&done),
        };
        let Ok(clone) = sock.try_clone() else {
            // Without a handle to close there is nothing to guard; the write
            // itself will surface the socket error.
            return guard;
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(WheelCmd::Register {
            end_time: Instant::now() + timeout,
            seq,
            entry: Entry { sock: clone, done },
        });
        guard
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.lock().expect("wheel join lock poisoned").take() {
            let _ = join.join();
        }
    }
}

fn run_wheel(rx: Receiver<WheelCmd>, shutdown: Arc<AtomicBool>, stats: Arc<DiscoveryStats>) {
    let mut entries: BTreeMap<(Instant, u64), Entry> = BTreeMap::new();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let now = Instant::now();
        while let Some((&(end_time, seq), _)) = entries.first_key_value() {
            if end_time > now {
                break;
            }
            let entry = entries
                .remove(&(end_time, seq))
                .expect("entry present under key");
            fire(entry, &stats);
        }

        let wait = entries
            .first_key_value()
            .map(|(&(end_time, _), _)| end_time.saturating_duration_since(now))
            .unwrap_or(Duration::from_millis(100))
            .min(Duration::from_millis(100));

        match rx.recv_timeout(wait) {
            Ok(WheelCmd::Register {
                end_time,
                seq,
                entry,
            }) => {
                if !entry.done.load(Ordering::Acquire) {
                    entries.insert((end_time, seq), entry);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn fire(entry: Entry, stats: &DiscoveryStats) {
    if entry
        .done
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        let _ = entry.sock.shutdown(Shutdown::Both);
        stats.on_socket_timeout();
        tracing::warn!(
            "socket write timed out, connection force-closed \
             (consider increasing socket_timeout_ms)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn cancelled_guard_leaves_socket_open() {
        let stats = Arc::new(DiscoveryStats::new());
        let wheel = TimeoutWheel::start(Arc::clone(&stats));
        let (mut client, mut server) = pair();

        let guard = wheel.register(&client, Duration::from_millis(200));
        client.write_all(b"x").unwrap();
        assert!(guard.cancel());

        let mut buf = [0u8; 1];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
        assert_eq!(stats.snapshot().socket_timeouts, 0);
        wheel.shutdown();
    }

    #[test]
    fn expired_guard_closes_socket() {
        let stats = Arc::new(DiscoveryStats::new());
        let wheel = TimeoutWheel::start(Arc::clone(&stats));
        let (client, mut server) = pair();

        let guard = wheel.register(&client, Duration::from_millis(20));
        thread::sleep(Duration::from_millis(120));
        assert!(!guard.cancel());
        assert_eq!(stats.snapshot().socket_timeouts, 1);

        // Peer observes the forced close as EOF.
        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).unwrap(), 0);
        wheel.shutdown();
    }
}
