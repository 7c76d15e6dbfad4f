// Serial dispatcher: sole writer of the link
//
// Pops one snapshot at a time from the command queue, writes its frame, then
// sleeps the throttle interval. Write failures are reported through the
// status channel and never end the loop.

use std::io::Write;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::arbiter::{CommandQueue, Pop};
use crate::messages::{LinkStatus, MotionCommand};

/// Longest single wait on the queue
pub const POP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub throttle: Duration,
    /// Deadman: after this long without a new command following a moving
    /// one, send a single stop frame. `None` disables it.
    pub watchdog: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(crate::config::THROTTLE_MS),
            watchdog: None,
        }
    }
}

/// Handle to the running dispatcher thread
pub struct Dispatcher {
    queue: Arc<CommandQueue>,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the dispatcher thread; it owns `writer` from now on
    pub fn start<W>(
        queue: Arc<CommandQueue>,
        writer: W,
        config: DispatcherConfig,
        status: watch::Sender<LinkStatus>,
    ) -> std::io::Result<Self>
    where
        W: Write + Send + 'static,
    {
        let mut worker = Worker {
            queue: queue.clone(),
            writer,
            config,
            status,
            moving_since: None,
        };
        let thread = thread::Builder::new()
            .name("serial-dispatcher".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            queue,
            thread: Some(thread),
        })
    }

    /// Close the queue, let the thread flush what is left, and join it
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.queue.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Serial dispatcher thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

struct Worker<W> {
    queue: Arc<CommandQueue>,
    writer: W,
    config: DispatcherConfig,
    status: watch::Sender<LinkStatus>,
    /// Set while the last transmitted frame commanded motion
    moving_since: Option<Instant>,
}

impl<W: Write> Worker<W> {
    fn run(&mut self) {
        info!(
            "Serial dispatcher started: {}ms throttle, watchdog {:?}",
            self.config.throttle.as_millis(),
            self.config.watchdog
        );
        self.status.send_replace(LinkStatus::Idle);

        loop {
            let wait = match (self.config.watchdog, self.moving_since) {
                (Some(limit), Some(_)) => limit.min(POP_TIMEOUT),
                _ => POP_TIMEOUT,
            };

            match self.queue.pop_timeout(wait) {
                Pop::Command(cmd) => {
                    self.transmit(&cmd);
                    self.moving_since = cmd.is_moving().then(Instant::now);
                    thread::sleep(self.config.throttle);
                }
                Pop::TimedOut => self.check_watchdog(),
                Pop::Closed => break,
            }
        }

        info!("Serial dispatcher stopped");
    }

    fn check_watchdog(&mut self) {
        let (Some(limit), Some(since)) = (self.config.watchdog, self.moving_since) else {
            return;
        };
        if since.elapsed() >= limit {
            warn!("No command for {:?} while moving, stopping robot", since.elapsed());
            self.transmit(&MotionCommand::stop());
            self.moving_since = None;
        }
    }

    fn transmit(&mut self, cmd: &MotionCommand) {
        let frame = cmd.to_frame();
        let result = self
            .writer
            .write_all(frame.as_bytes())
            .and_then(|_| self.writer.flush());

        match result {
            Ok(()) => {
                debug!("Sent {}", frame.trim_end());
                self.status
                    .send_replace(LinkStatus::Sent(frame.trim_end().to_string()));
            }
            Err(e) => {
                warn!("Serial write failed: {}", e);
                self.status.send_replace(LinkStatus::WriteFailed(e.to_string()));
            }
        }
    }
}
