// Toolpath executor
//
// Runs on the director loop: `poll` is called every tick and does at most one
// step when its wake-up time has passed. Moves become constant-velocity
// bursts followed by a stop; everything else takes effect between moves.

use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::parser::{Command, GCodeError, PositioningMode, Program};
use crate::arbiter::Arbiter;
use crate::config::{GCodeConfig, PlatformConfig};
use crate::messages::{ControlSession, MotionCommand};

/// Displacements shorter than this (mm) are treated as no movement
const MIN_DISTANCE_MM: f64 = 1e-3;

/// Power used by `M3` without `S`
const FULL_POWER: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Operator,
    Completed,
    TransportFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Loaded,
    Running,
    Stopped(StopReason),
}

/// Machine state as the program sees it
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GCodeState {
    pub position_mm: (f64, f64),
    pub feed_rate_mm_per_s: f64,
    pub laser_on: bool,
    pub laser_power: u8,
    pub positioning_mode: PositioningMode,
}

impl GCodeState {
    fn reset(platform: &PlatformConfig) -> Self {
        Self {
            position_mm: (0.0, 0.0),
            feed_rate_mm_per_s: platform.max_linear_velocity_mm_s,
            laser_on: false,
            laser_power: 0,
            positioning_mode: PositioningMode::Absolute,
        }
    }
}

/// One constant-velocity burst
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub line: usize,
    pub from: (f64, f64),
    pub to: (f64, f64),
    pub displacement: (f64, f64),
    pub velocity_mm_s: f64,
    pub duration: Duration,
    pub command: MotionCommand,
}

/// Snapshot for status reporting
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ProgramProgress {
    pub state: RunState,
    pub executed: usize,
    pub total: usize,
    pub skipped: usize,
    pub position_mm: (f64, f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Next poll executes the line under the cursor
    Ready,
    /// A segment is in flight; next poll zeroes velocity
    Moving,
    /// Override is zero; waiting to start the move under the cursor
    Held,
}

enum MoveOutcome {
    Segment(Segment),
    NoMotion,
    Held,
}

pub struct Interpreter {
    program: Program,
    cursor: usize,
    state: GCodeState,
    run_state: RunState,
    phase: Phase,
    wake_at: Option<Instant>,
    speed_factor: f64,
    config: GCodeConfig,
    platform: PlatformConfig,
}

impl Interpreter {
    pub fn new(config: GCodeConfig, platform: PlatformConfig) -> Self {
        Self {
            program: Program::default(),
            cursor: 0,
            state: GCodeState::reset(&platform),
            run_state: RunState::Idle,
            phase: Phase::Ready,
            wake_at: None,
            speed_factor: 0.0,
            config,
            platform,
        }
    }

    /// Replace the program. Refused while running.
    pub fn load(&mut self, program: Program) -> Result<(), GCodeError> {
        if self.run_state == RunState::Running {
            return Err(GCodeError::Busy);
        }
        if program.is_empty() {
            warn!("G-code program has no executable lines");
            return Err(GCodeError::EmptyProgram);
        }
        info!(
            "Loaded G-code program: {} lines, {} skipped",
            program.len(),
            program.skipped().len()
        );
        self.program = program;
        self.rewind();
        self.run_state = RunState::Loaded;
        Ok(())
    }

    /// Run the loaded program from its first line with fresh state
    pub fn start(&mut self, now: Instant) -> Result<(), GCodeError> {
        match self.run_state {
            RunState::Idle => return Err(GCodeError::NoProgram),
            RunState::Running => return Err(GCodeError::Busy),
            RunState::Loaded | RunState::Stopped(_) => {}
        }
        self.rewind();
        self.run_state = RunState::Running;
        self.wake_at = Some(now);
        info!("G-code program started ({} lines)", self.program.len());
        Ok(())
    }

    /// Operator stop
    pub fn stop(&mut self, arbiter: &Arbiter) {
        self.leave_running(StopReason::Operator, arbiter);
    }

    /// The link failed underneath a running program
    pub fn abort(&mut self, arbiter: &Arbiter) {
        self.leave_running(StopReason::TransportFailure, arbiter);
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn is_running(&self) -> bool {
        self.run_state == RunState::Running
    }

    pub fn state(&self) -> &GCodeState {
        &self.state
    }

    pub fn progress(&self) -> ProgramProgress {
        ProgramProgress {
            state: self.run_state,
            executed: self.cursor,
            total: self.program.len(),
            skipped: self.program.skipped().len(),
            position_mm: self.state.position_mm,
        }
    }

    /// Advance the program if its next step is due.
    ///
    /// `speed_factor` is the operator override (0..1) and caps every move.
    /// Returns the segment started by this call, if any.
    pub fn poll(&mut self, now: Instant, speed_factor: f64, arbiter: &Arbiter) -> Option<Segment> {
        if self.run_state != RunState::Running {
            return None;
        }
        if self.wake_at.is_some_and(|t| now < t) {
            return None;
        }
        self.speed_factor = speed_factor.clamp(0.0, 1.0);

        if self.phase == Phase::Moving {
            self.submit_to(arbiter, self.laser_command());
            self.phase = Phase::Ready;
            self.wake_at = Some(now + self.line_gap());
            return None;
        }

        let Some(line) = self.program.lines().get(self.cursor).cloned() else {
            info!("G-code program finished");
            self.leave_running(StopReason::Completed, arbiter);
            return None;
        };

        match line.command {
            Command::Move {
                rapid,
                x,
                y,
                feed,
                power,
            } => match self.begin_move(line.number, rapid, x, y, feed, power) {
                MoveOutcome::Segment(segment) => {
                    debug!(
                        "Line {}: ({:.3}, {:.3}) -> ({:.3}, {:.3}) at {:.3} mm/s for {:?}",
                        segment.line,
                        segment.from.0,
                        segment.from.1,
                        segment.to.0,
                        segment.to.1,
                        segment.velocity_mm_s,
                        segment.duration
                    );
                    self.cursor += 1;
                    self.phase = Phase::Moving;
                    self.wake_at = Some(now + segment.duration);
                    self.submit_to(arbiter, segment.command);
                    return Some(segment);
                }
                MoveOutcome::NoMotion => {
                    self.cursor += 1;
                    self.submit_to(arbiter, self.laser_command());
                }
                MoveOutcome::Held => {
                    if self.phase != Phase::Held {
                        info!("Speed override is zero, holding at line {}", line.number);
                        self.phase = Phase::Held;
                        self.submit_to(arbiter, self.laser_command());
                    }
                }
            },
            command => {
                self.cursor += 1;
                if self.apply(command) {
                    self.submit_to(arbiter, self.laser_command());
                }
            }
        }

        self.wake_at = Some(now + self.line_gap());
        None
    }

    fn rewind(&mut self) {
        self.cursor = 0;
        self.phase = Phase::Ready;
        self.wake_at = None;
        self.state = GCodeState::reset(&self.platform);
    }

    fn line_gap(&self) -> Duration {
        Duration::from_millis(self.config.line_gap_ms)
    }

    /// Non-motion command; true when the controller must hear about it
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::SetMode(mode) => {
                self.state.positioning_mode = mode;
                false
            }
            Command::FeedRate(mm_per_min) => {
                self.state.feed_rate_mm_per_s = mm_per_min / 60.0;
                false
            }
            Command::LaserOn { power } => {
                self.state.laser_on = true;
                self.state.laser_power = power.unwrap_or(FULL_POWER);
                true
            }
            Command::LaserOff => {
                self.state.laser_on = false;
                self.state.laser_power = 0;
                true
            }
            Command::LaserPower(power) => {
                self.state.laser_power = power;
                self.state.laser_on = power > 0;
                true
            }
            Command::Move { .. } => false,
        }
    }

    fn begin_move(
        &mut self,
        line: usize,
        rapid: bool,
        x: Option<f64>,
        y: Option<f64>,
        feed: Option<f64>,
        power: Option<u8>,
    ) -> MoveOutcome {
        if let Some(mm_per_min) = feed {
            self.state.feed_rate_mm_per_s = mm_per_min / 60.0;
        }
        if let Some(power) = power {
            self.state.laser_power = power;
            if power == 0 {
                self.state.laser_on = false;
            }
        }
        if x.is_none() && y.is_none() {
            return MoveOutcome::NoMotion;
        }

        let from = self.state.position_mm;
        let to = match self.state.positioning_mode {
            PositioningMode::Absolute => (x.unwrap_or(from.0), y.unwrap_or(from.1)),
            PositioningMode::Relative => (from.0 + x.unwrap_or(0.0), from.1 + y.unwrap_or(0.0)),
        };
        let (dx, dy) = (to.0 - from.0, to.1 - from.1);
        let distance = dx.hypot(dy);
        if distance < MIN_DISTANCE_MM {
            self.state.position_mm = to;
            return MoveOutcome::NoMotion;
        }

        let max = self.platform.max_linear_velocity_mm_s;
        let cap = self.speed_factor * max;
        if cap < 1e-6 {
            return MoveOutcome::Held;
        }

        let programmed = if rapid {
            max
        } else {
            self.state
                .feed_rate_mm_per_s
                .max(self.config.min_velocity_mm_s)
        };
        let mut velocity = programmed.min(cap);
        let mut seconds = distance / velocity;
        let floor = Duration::from_millis(self.config.min_segment_ms).as_secs_f64();
        if seconds < floor {
            seconds = floor;
            velocity = distance / seconds;
        }

        let command = MotionCommand::new(
            dx / seconds / max,
            dy / seconds / max,
            0.0,
            self.speed_factor,
        )
        .with_laser(self.state.laser_on, self.state.laser_power);

        self.state.position_mm = to;
        self.phase = Phase::Ready;

        MoveOutcome::Segment(Segment {
            line,
            from,
            to,
            displacement: (dx, dy),
            velocity_mm_s: velocity,
            duration: Duration::from_secs_f64(seconds),
            command,
        })
    }

    /// Zero motion carrying the current laser state
    fn laser_command(&self) -> MotionCommand {
        MotionCommand::stop()
            .with_speed_factor(self.speed_factor)
            .with_laser(self.state.laser_on, self.state.laser_power)
    }

    fn leave_running(&mut self, reason: StopReason, arbiter: &Arbiter) {
        if self.run_state != RunState::Running {
            return;
        }
        // laser goes off with the motion
        self.submit_to(arbiter, MotionCommand::stop().with_speed_factor(self.speed_factor));
        self.run_state = RunState::Stopped(reason);
        self.phase = Phase::Ready;
        self.wake_at = None;
        info!("G-code program stopped: {:?}", reason);
    }

    fn submit_to(&self, arbiter: &Arbiter, cmd: MotionCommand) {
        // Rejection means another source owns the robot; nothing to undo
        let _ = arbiter.submit(ControlSession::GCode, cmd);
    }
}
