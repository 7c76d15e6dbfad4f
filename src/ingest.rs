// Line-oriented TCP ingest shared by the joystick and pose clients
//
// Each client is one tokio task that owns its socket, splits the byte stream
// into newline-terminated lines and reconnects with a bounded backoff. A
// `watch<bool>` flips to true to shut the task down.

use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const READ_BUFFER: usize = 1024;

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Unterminated data beyond this is discarded
const MAX_PENDING: usize = 64 * 1024;

/// Splits a byte stream into complete lines
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes from one read; returns every line completed by them, in
    /// order, without terminators. Blank lines are dropped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }

        if self.pending.len() > MAX_PENDING {
            warn!("Discarding {} bytes without a line break", self.pending.len());
            self.pending.clear();
        }
        lines
    }

    /// Bytes of an unfinished line
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Reconnect delay: doubles per failure, capped, reset on success
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_INITIAL, BACKOFF_MAX)
    }
}

/// Receives what a line client reads. Runs on the client's task.
pub trait LineSink: Send + 'static {
    fn connected(&mut self) {}

    fn line(&mut self, line: &str);

    fn disconnected(&mut self) {}
}

/// Handle to a running line client
pub struct IngestHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl IngestHandle {
    /// Spawn a client for `addr` on the current tokio runtime
    pub fn spawn<S: LineSink>(name: &'static str, addr: String, sink: S) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(supervise(name, addr, sink, rx));
        Self { shutdown, task }
    }

    /// Signal shutdown and wait for the task to close its socket
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!("Ingest task failed: {}", e);
        }
    }
}

async fn supervise<S: LineSink>(
    name: &'static str,
    addr: String,
    mut sink: S,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::default();
    info!("{} client started: {}", name, addr);

    while !*shutdown.borrow() {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                info!("{} connected to {}", name, addr);
                backoff.reset();
                sink.connected();
                if read_lines(name, stream, &mut sink, &mut shutdown).await {
                    break;
                }
                sink.disconnected();
            }
            Ok(Err(e)) => warn!("{} connect to {} failed: {}", name, addr, e),
            Err(_) => warn!("{} connect to {} timed out", name, addr),
        }

        let delay = backoff.next_delay();
        info!("{} reconnecting in {:?}", name, delay);
        tokio::select! {
            _ = sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!("{} client stopped", name);
}

/// Read until the peer goes away or shutdown is requested. Returns true on
/// shutdown.
async fn read_lines<S: LineSink>(
    name: &str,
    mut stream: TcpStream,
    sink: &mut S,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut framer = LineFramer::new();
    let mut buf = [0u8; READ_BUFFER];

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                // sender gone counts as shutdown too
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    warn!("{} peer closed the connection", name);
                    return false;
                }
                Ok(n) => {
                    for line in framer.push(&buf[..n]) {
                        sink.line(&line);
                    }
                }
                Err(e) => {
                    warn!("{} read failed: {}", name, e);
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[test]
    fn framer_splits_multiple_frames() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.push(b"one\ntwo\n"), vec!["one", "two"]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn framer_reassembles_split_frames() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"{\"x\":0.").is_empty());
        assert_eq!(framer.pending(), 7);
        assert_eq!(framer.push(b"5}\r\n{\"y\""), vec!["{\"x\":0.5}"]);
        assert_eq!(framer.push(b":1}\n\n"), vec!["{\"y\":1}"]);
    }

    #[test]
    fn framer_drops_runaway_input() {
        let mut framer = LineFramer::new();
        framer.push(&vec![b'a'; MAX_PENDING + 1]);
        assert_eq!(framer.pending(), 0);
        assert_eq!(framer.push(b"ok\n"), vec!["ok"]);
    }

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 5000, 5000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    struct Collect(mpsc::UnboundedSender<String>);

    impl LineSink for Collect {
        fn connected(&mut self) {
            let _ = self.0.send("<connected>".into());
        }

        fn line(&mut self, line: &str) {
            let _ = self.0.send(line.to_string());
        }

        fn disconnected(&mut self) {
            let _ = self.0.send("<disconnected>".into());
        }
    }

    #[tokio::test]
    async fn client_reads_lines_and_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = IngestHandle::spawn("test", addr, Collect(tx));

        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"a\nb").await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.write_all(b"c\n").await.unwrap();
        drop(peer);

        let mut seen = Vec::new();
        while seen.len() < 4 {
            let item = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            seen.push(item);
        }
        assert_eq!(seen, vec!["<connected>", "a", "bc", "<disconnected>"]);

        handle.stop().await;
    }

    #[tokio::test]
    async fn client_stops_while_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = IngestHandle::spawn("test", addr, Collect(tx));

        let (_peer, _) = listener.accept().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "<connected>");
        timeout(Duration::from_secs(2), handle.stop()).await.unwrap();
    }
}
