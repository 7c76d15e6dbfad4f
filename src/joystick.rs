// Joystick stream: newline-delimited JSON frames over TCP
//
// `{"x":f64,"y":f64,"r":f64,"speed":f64,"laser":0|1,"power":int}`
// Shaping happens on the ingest task; the director converts frames to
// commands with its current speed factor and laser power.
//
// The task hands over two `watch` cells: the latest frame and the connection
// state. Frames collapse to the newest one; a disconnect is never lost.

use serde::{Deserialize, Deserializer};
use tokio::sync::watch;
use tracing::warn;

use crate::config::JoystickConfig;
use crate::ingest::{IngestHandle, LineSink};
use crate::messages::MotionCommand;

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct JoystickFrame {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub r: f64,
    /// Operator speed factor; absent keeps the current one
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default, deserialize_with = "flag")]
    pub laser: bool,
    /// Laser power; absent keeps the current one
    #[serde(default)]
    pub power: Option<i64>,
}

/// Accepts `0|1` as well as `true|false`
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Float(f64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
        Flag::Float(f) => f != 0.0,
    })
}

impl JoystickFrame {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Speed factor this frame asks for, clamped, or `current`
    pub fn speed_factor(&self, current: f64) -> f64 {
        match self.speed {
            Some(s) if s.is_finite() => s.clamp(0.0, 1.0),
            _ => current,
        }
    }

    pub fn laser_power(&self, current: u8) -> u8 {
        self.power.map_or(current, |p| p.clamp(0, 255) as u8)
    }

    /// Axes scaled by the speed factor, laser as sent
    pub fn to_command(&self, current_speed: f64, current_power: u8) -> MotionCommand {
        let speed = self.speed_factor(current_speed);
        MotionCommand::new(self.x * speed, self.y * speed, self.r * speed, speed)
            .with_laser(self.laser, self.laser_power(current_power))
    }
}

/// Deadzone and per-axis inversion
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AxisShaping {
    pub deadzone: f64,
    pub invert_x: bool,
    pub invert_y: bool,
    pub invert_r: bool,
}

impl From<&JoystickConfig> for AxisShaping {
    fn from(cfg: &JoystickConfig) -> Self {
        Self {
            deadzone: cfg.deadzone.abs(),
            invert_x: cfg.invert_x,
            invert_y: cfg.invert_y,
            invert_r: cfg.invert_r,
        }
    }
}

impl AxisShaping {
    fn axis(&self, v: f64, invert: bool) -> f64 {
        if !v.is_finite() || v.abs() < self.deadzone {
            return 0.0;
        }
        if invert { -v } else { v }
    }

    pub fn apply(&self, frame: JoystickFrame) -> JoystickFrame {
        JoystickFrame {
            x: self.axis(frame.x, self.invert_x),
            y: self.axis(frame.y, self.invert_y),
            r: self.axis(frame.r, self.invert_r),
            ..frame
        }
    }
}

/// Suppresses re-submitting a command equal to the last one admitted
#[derive(Debug, Default)]
pub struct ChangeFilter {
    last: Option<MotionCommand>,
}

impl ChangeFilter {
    pub fn admit(&mut self, cmd: MotionCommand) -> bool {
        if self.last.is_some_and(|last| last.approx_eq(&cmd)) {
            return false;
        }
        self.last = Some(cmd);
        true
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JoystickEvent {
    Connected,
    Frame(JoystickFrame),
    Disconnected,
}

/// Connection state plus a count of disconnects, so a drop and reconnect
/// between two reads still shows up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Connection {
    connected: bool,
    drops: u64,
}

struct FrameSink {
    shaping: AxisShaping,
    frames: watch::Sender<Option<JoystickFrame>>,
    connection: watch::Sender<Connection>,
}

impl LineSink for FrameSink {
    fn connected(&mut self) {
        self.connection.send_modify(|c| c.connected = true);
    }

    fn line(&mut self, line: &str) {
        match JoystickFrame::parse(line) {
            Ok(frame) => {
                self.frames.send_replace(Some(self.shaping.apply(frame)));
            }
            Err(e) => warn!("Skipping malformed joystick frame {:?}: {}", line, e),
        }
    }

    fn disconnected(&mut self) {
        // clear first so no frame from the dead connection outlives it
        self.frames.send_replace(None);
        self.connection.send_modify(|c| {
            c.connected = false;
            c.drops += 1;
        });
    }
}

/// Director side of the joystick cells
pub struct JoystickFeed {
    frames: watch::Receiver<Option<JoystickFrame>>,
    connection: watch::Receiver<Connection>,
    seen: Connection,
}

impl JoystickFeed {
    fn channel(shaping: AxisShaping) -> (FrameSink, Self) {
        let (frames_tx, frames) = watch::channel(None);
        let (connection_tx, connection) = watch::channel(Connection::default());
        let sink = FrameSink {
            shaping,
            frames: frames_tx,
            connection: connection_tx,
        };
        let feed = Self {
            frames,
            connection,
            seen: Connection::default(),
        };
        (sink, feed)
    }

    /// A feed nothing ever writes to
    pub fn idle() -> Self {
        Self::channel(AxisShaping::default()).1
    }

    /// Events since the last call: connection changes first, then the
    /// newest frame if one arrived
    pub fn poll(&mut self) -> Vec<JoystickEvent> {
        let mut events = Vec::new();

        if self.connection.has_changed().unwrap_or(false) {
            let now = *self.connection.borrow_and_update();
            let dropped = now.drops != self.seen.drops;
            if dropped {
                events.push(JoystickEvent::Disconnected);
            }
            if now.connected && (dropped || !self.seen.connected) {
                events.push(JoystickEvent::Connected);
            }
            self.seen = now;
        }

        if self.frames.has_changed().unwrap_or(false) {
            if let Some(frame) = *self.frames.borrow_and_update() {
                events.push(JoystickEvent::Frame(frame));
            }
        }
        events
    }
}

/// Running joystick client
pub struct JoystickClient {
    handle: IngestHandle,
}

impl JoystickClient {
    pub fn start(cfg: &JoystickConfig) -> (Self, JoystickFeed) {
        let (sink, feed) = JoystickFeed::channel(AxisShaping::from(cfg));
        let handle = IngestHandle::spawn("Joystick", cfg.addr.clone(), sink);
        (Self { handle }, feed)
    }

    pub async fn stop(self) {
        self.handle.stop().await;
    }
}
