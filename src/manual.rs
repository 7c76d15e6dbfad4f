// Keyboard teleop: WASD translate, Q/E rotate, Space fires the laser
//
// Terminals rarely report releases, so a key counts as held while presses or
// repeats keep arriving within the hold window.

use std::time::{Duration, Instant};
use tracing::debug;

use crate::arbiter::Arbiter;
use crate::config::ManualConfig;
use crate::messages::{ControlSession, MotionCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualKey {
    Forward,
    Back,
    Left,
    Right,
    RotateCcw,
    RotateCw,
    Laser,
}

impl ManualKey {
    const ALL: [ManualKey; 7] = [
        ManualKey::Forward,
        ManualKey::Back,
        ManualKey::Left,
        ManualKey::Right,
        ManualKey::RotateCcw,
        ManualKey::RotateCw,
        ManualKey::Laser,
    ];

    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'w' => Some(Self::Forward),
            's' => Some(Self::Back),
            'a' => Some(Self::Left),
            'd' => Some(Self::Right),
            'q' => Some(Self::RotateCcw),
            'e' => Some(Self::RotateCw),
            ' ' => Some(Self::Laser),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Unit contribution to (x, y, rotation)
    fn axes(self) -> (f64, f64, f64) {
        match self {
            Self::Forward => (0.0, 1.0, 0.0),
            Self::Back => (0.0, -1.0, 0.0),
            Self::Right => (1.0, 0.0, 0.0),
            Self::Left => (-1.0, 0.0, 0.0),
            Self::RotateCcw => (0.0, 0.0, 1.0),
            Self::RotateCw => (0.0, 0.0, -1.0),
            Self::Laser => (0.0, 0.0, 0.0),
        }
    }
}

pub struct ManualInput {
    /// Last press or repeat per key
    held: [Option<Instant>; 7],
    last_sent: Option<(MotionCommand, Instant)>,
    hold: Duration,
    repeat: Duration,
}

impl ManualInput {
    pub fn new(config: &ManualConfig) -> Self {
        Self {
            held: [None; 7],
            last_sent: None,
            hold: Duration::from_millis(config.hold_ms),
            repeat: Duration::from_millis(config.repeat_ms),
        }
    }

    pub fn press(&mut self, key: ManualKey, now: Instant) {
        self.held[key.index()] = Some(now);
    }

    pub fn release(&mut self, key: ManualKey) {
        self.held[key.index()] = None;
    }

    pub fn is_held(&self, key: ManualKey) -> bool {
        self.held[key.index()].is_some()
    }

    /// Sum of held keys at the given speed factor and laser power
    pub fn command(&self, speed_factor: f64, laser_power: u8) -> MotionCommand {
        let (mut x, mut y, mut r) = (0.0, 0.0, 0.0);
        for key in ManualKey::ALL.into_iter().filter(|k| self.is_held(*k)) {
            let (kx, ky, kr) = key.axes();
            x += kx;
            y += ky;
            r += kr;
        }
        let laser = self.is_held(ManualKey::Laser);
        MotionCommand::new(x * speed_factor, y * speed_factor, r * speed_factor, speed_factor)
            .with_laser(laser, if laser { laser_power } else { 0 })
    }

    /// Expire lapsed keys and submit when the command changed, the repeat
    /// interval passed, or the last key just lapsed. Returns what was sent.
    pub fn poll(
        &mut self,
        now: Instant,
        speed_factor: f64,
        laser_power: u8,
        arbiter: &Arbiter,
    ) -> Option<MotionCommand> {
        for slot in self.held.iter_mut() {
            if slot.is_some_and(|t| now.saturating_duration_since(t) > self.hold) {
                *slot = None;
            }
        }

        let any_held = self.held.iter().any(Option::is_some);
        let cmd = self.command(speed_factor, laser_power);

        let due = match self.last_sent {
            // nothing held and nothing active: stay quiet
            None => any_held,
            Some((last, at)) => {
                !last.approx_eq(&cmd) || (any_held && now.saturating_duration_since(at) >= self.repeat)
            }
        };
        if !due {
            return None;
        }

        debug!("Manual: {:?}", cmd);
        let _ = arbiter.submit(ControlSession::Manual, cmd);
        self.last_sent = any_held.then_some((cmd, now));
        Some(cmd)
    }

    /// Forget held keys; zero the robot if manual input was driving it
    pub fn cancel(&mut self, arbiter: &Arbiter) {
        self.held = [None; 7];
        if self.last_sent.take().is_some() {
            let _ = arbiter.submit(ControlSession::Manual, MotionCommand::stop());
        }
    }
}
