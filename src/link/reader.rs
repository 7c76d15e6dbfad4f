// Serial reader: sole reader of the link
//
// The bridge answers with status lines such as `Radio Success: 1`. Nothing
// here feeds back into motion; it only updates the radio status.

use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::messages::RadioStatus;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const EOF_BACKOFF: Duration = Duration::from_millis(500);

/// Parse one status line from the bridge
pub fn parse_status_line(line: &str) -> Option<RadioStatus> {
    if !line.contains("Radio Success:") {
        return None;
    }
    let value = line.rsplit(':').next().unwrap_or_default().trim();
    Some(if value == "1" {
        RadioStatus::Ok
    } else {
        RadioStatus::Error
    })
}

/// Handle to the running reader thread
pub struct SerialReader {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SerialReader {
    /// Spawn the reader thread. `port` should have a finite read timeout so
    /// `stop` is observed promptly.
    pub fn start<R>(port: R, status: watch::Sender<RadioStatus>) -> std::io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let thread = thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || read_loop(BufReader::new(port), status, flag))?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Serial reader thread panicked");
            }
        }
    }
}

impl Drop for SerialReader {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn read_loop<R: Read>(
    mut port: BufReader<R>,
    status: watch::Sender<RadioStatus>,
    shutdown: Arc<AtomicBool>,
) {
    info!("Serial reader started");
    // Bytes of an unfinished line survive read timeouts
    let mut pending = Vec::new();

    while !shutdown.load(Ordering::SeqCst) {
        match port.read_until(b'\n', &mut pending) {
            Ok(0) => thread::sleep(EOF_BACKOFF),
            Ok(_) if pending.ends_with(b"\n") => {
                handle_line(&String::from_utf8_lossy(&pending), &status);
                pending.clear();
            }
            // partial line, keep reading
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("Serial read failed: {}", e);
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    info!("Serial reader stopped");
}

fn handle_line(line: &str, status: &watch::Sender<RadioStatus>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    debug!("Bridge: {}", line);
    if let Some(radio) = parse_status_line(line) {
        if *status.borrow() != radio {
            info!("Radio status: {:?}", radio);
        }
        status.send_replace(radio);
    }
}
