// Vision-assisted positional corrector
//
// Fixed-period proportional loop: each cycle compares the latest pose sample
// with the current waypoint and submits a clamped correction. The cycle runs
// on its own deadline regardless of how often poses arrive.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::arbiter::Arbiter;
use crate::config::{CorrectorConfig, PlatformConfig};
use crate::messages::{ControlSession, MotionCommand};
use crate::pose::PoseSample;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Waypoint {
    pub x_mm: f64,
    pub y_mm: f64,
    pub yaw_deg: f64,
    /// Laser power while travelling to this waypoint, 0 = off
    pub laser_power: u8,
}

impl Waypoint {
    pub fn new(x_mm: f64, y_mm: f64, yaw_deg: f64) -> Self {
        Self {
            x_mm,
            y_mm,
            yaw_deg,
            laser_power: 0,
        }
    }

    pub fn with_laser(self, laser_power: u8) -> Self {
        Self { laser_power, ..self }
    }
}

impl fmt::Display for Waypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.1}, {:.1}, {:.1}°)", self.x_mm, self.y_mm, self.yaw_deg)?;
        if self.laser_power > 0 {
            write!(f, " laser {}", self.laser_power)?;
        }
        Ok(())
    }
}

/// `x,y,yaw[,power]` in mm, degrees and 0-255
impl FromStr for Waypoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let (coords, power) = match parts[..] {
            [x, y, yaw] => ([x, y, yaw], None),
            [x, y, yaw, power] => ([x, y, yaw], Some(power)),
            _ => return Err(format!("waypoint {s:?} must be x,y,yaw[,power]")),
        };

        let mut values = [0.0; 3];
        for (value, text) in values.iter_mut().zip(coords) {
            *value = text
                .parse::<f64>()
                .map_err(|e| format!("invalid waypoint {s:?}: {e}"))?;
            if !value.is_finite() {
                return Err(format!("waypoint {s:?} must be finite"));
            }
        }
        let laser_power = match power {
            Some(text) => text
                .parse::<u8>()
                .map_err(|e| format!("invalid laser power in {s:?}: {e}"))?,
            None => 0,
        };

        let [x, y, yaw] = values;
        Ok(Self::new(x, y, yaw).with_laser(laser_power))
    }
}

/// Wrap an angle into [-180, 180)
pub fn normalize_yaw(deg: f64) -> f64 {
    (deg + 180.0).rem_euclid(360.0) - 180.0
}

/// One cycle's decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    /// Within both tolerances
    Converged,
    /// Displacement (mm) and rotation (deg) to cover during the next cycle
    Step {
        dx_mm: f64,
        dy_mm: f64,
        rotation_deg: f64,
    },
}

/// Proportional step from `pose` towards `target`
pub fn compute_correction(target: &Waypoint, pose: &PoseSample, cfg: &CorrectorConfig) -> Correction {
    let ex = target.x_mm - pose.x_mm;
    let ey = target.y_mm - pose.y_mm;
    let eyaw = normalize_yaw(target.yaw_deg - pose.yaw_deg);

    if ex.hypot(ey) < cfg.position_tolerance_mm && eyaw.abs() < cfg.yaw_tolerance_deg {
        return Correction::Converged;
    }

    let (mut dx, mut dy) = (cfg.kp_pos * ex, cfg.kp_pos * ey);
    let magnitude = dx.hypot(dy);
    if magnitude > cfg.max_step_mm {
        // scale, keep direction
        let k = cfg.max_step_mm / magnitude;
        dx *= k;
        dy *= k;
    }
    let rotation = (cfg.kp_rot * eyaw).clamp(-cfg.max_rot_step_deg, cfg.max_rot_step_deg);

    Correction::Step {
        dx_mm: dx,
        dy_mm: dy,
        rotation_deg: rotation,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectorState {
    #[default]
    Idle,
    Tracking,
    Holding,
    Converged,
    Cancelled,
}

/// What a poll did, for the caller's status display
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CorrectorEvent {
    Step(MotionCommand),
    Reached(Waypoint),
    Converged,
    Holding,
}

pub struct Corrector {
    route: VecDeque<Waypoint>,
    state: CorrectorState,
    wake_at: Option<Instant>,
    cycles: u64,
    config: CorrectorConfig,
    platform: PlatformConfig,
}

impl Corrector {
    pub fn new(config: CorrectorConfig, platform: PlatformConfig) -> Self {
        let corrector = Self {
            route: VecDeque::new(),
            state: CorrectorState::Idle,
            wake_at: None,
            cycles: 0,
            config,
            platform,
        };
        let reachable = corrector.reachable_step_mm();
        if config.max_step_mm > reachable {
            info!(
                "Corrector steps above {:.1} mm per cycle saturate at full speed",
                reachable
            );
        }
        corrector
    }

    /// Start tracking a single waypoint
    pub fn begin(&mut self, target: Waypoint, now: Instant) {
        self.route(vec![target], now);
    }

    /// Visit waypoints in order; an empty route does nothing
    pub fn route(&mut self, waypoints: Vec<Waypoint>, now: Instant) {
        if waypoints.is_empty() {
            warn!("Corrector given an empty route");
            return;
        }
        info!("Corrector tracking {} waypoint(s), first {}", waypoints.len(), waypoints[0]);
        self.route = waypoints.into();
        self.state = CorrectorState::Tracking;
        self.cycles = 0;
        self.wake_at = Some(now);
    }

    /// Zero the robot, then let go of the route
    pub fn cancel(&mut self, arbiter: &Arbiter) {
        if !self.is_active() {
            return;
        }
        submit(arbiter, MotionCommand::stop());
        self.route.clear();
        self.state = CorrectorState::Cancelled;
        self.wake_at = None;
        info!("Corrector cancelled after {} cycles", self.cycles);
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, CorrectorState::Tracking | CorrectorState::Holding)
    }

    pub fn state(&self) -> CorrectorState {
        self.state
    }

    pub fn target(&self) -> Option<Waypoint> {
        self.route.front().copied()
    }

    pub fn remaining(&self) -> usize {
        self.route.len()
    }

    /// Run one cycle if it is due
    pub fn poll(
        &mut self,
        now: Instant,
        pose: Option<&PoseSample>,
        speed_factor: f64,
        arbiter: &Arbiter,
    ) -> Option<CorrectorEvent> {
        if !self.is_active() || self.wake_at.is_some_and(|t| now < t) {
            return None;
        }
        self.wake_at = Some(now + self.config.period());
        let target = *self.route.front()?;

        let Some(pose) = pose.filter(|p| self.is_fresh(p, now)) else {
            if self.state == CorrectorState::Holding {
                return None;
            }
            warn!("No usable pose sample, corrector holding");
            self.state = CorrectorState::Holding;
            submit(arbiter, MotionCommand::stop().with_speed_factor(speed_factor));
            return Some(CorrectorEvent::Holding);
        };
        if self.state == CorrectorState::Holding {
            info!("Pose available again, corrector resuming");
            self.state = CorrectorState::Tracking;
        }

        self.cycles += 1;
        match compute_correction(&target, pose, &self.config) {
            Correction::Converged => {
                self.route.pop_front();
                if let Some(next) = self.route.front() {
                    // pause on the waypoint with the next leg's laser
                    let pause = MotionCommand::stop()
                        .with_speed_factor(speed_factor)
                        .with_laser(next.laser_power > 0, next.laser_power);
                    submit(arbiter, pause);
                    info!("Reached {}, next {}", target, next);
                    return Some(CorrectorEvent::Reached(target));
                }
                submit(arbiter, MotionCommand::stop().with_speed_factor(speed_factor));
                info!("Corrector converged on {} after {} cycles", target, self.cycles);
                self.state = CorrectorState::Converged;
                self.wake_at = None;
                Some(CorrectorEvent::Converged)
            }
            Correction::Step {
                dx_mm,
                dy_mm,
                rotation_deg,
            } => {
                let cmd = self.step_command(dx_mm, dy_mm, rotation_deg, speed_factor);
                debug!(
                    "Correction: ({:.2}, {:.2}) mm, {:.2} deg -> {:?}",
                    dx_mm, dy_mm, rotation_deg, cmd
                );
                submit(arbiter, cmd);
                Some(CorrectorEvent::Step(cmd))
            }
        }
    }

    fn is_fresh(&self, pose: &PoseSample, now: Instant) -> bool {
        match self.config.max_pose_age_ms {
            Some(ms) => now.saturating_duration_since(pose.timestamp) <= Duration::from_millis(ms),
            None => true,
        }
    }

    /// Per-cycle step expressed as normalised velocity. A translation faster
    /// than the platform allows is scaled down as a whole, so the command
    /// still points along the step.
    pub fn step_command(&self, dx_mm: f64, dy_mm: f64, rotation_deg: f64, speed_factor: f64) -> MotionCommand {
        let period = self.config.period().as_secs_f64().max(1e-3);
        let linear = self.platform.max_linear_velocity_mm_s;
        let angular = self.platform.max_angular_velocity_deg_s;

        let (mut x, mut y) = (dx_mm / period / linear, dy_mm / period / linear);
        let peak = x.abs().max(y.abs());
        if peak > 1.0 {
            x /= peak;
            y /= peak;
        }
        let power = self.target().map_or(0, |w| w.laser_power);
        MotionCommand::new(x, y, rotation_deg / period / angular, speed_factor)
            .with_laser(power > 0, power)
    }

    /// Largest translation per cycle the platform can cover at full speed
    pub fn reachable_step_mm(&self) -> f64 {
        self.config.period().as_secs_f64() * self.platform.max_linear_velocity_mm_s
    }
}

fn submit(arbiter: &Arbiter, cmd: MotionCommand) {
    // Another source owns the robot when this is rejected
    let _ = arbiter.submit(ControlSession::Vision, cmd);
}
