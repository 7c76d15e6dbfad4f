// Operator-facing state owned by the director
use serde::Serialize;

use crate::config::ManualConfig;
use crate::corrector::{CorrectorState, Waypoint};
use crate::gcode::ProgramProgress;
use crate::messages::{ControlSession, LinkStatus, RadioStatus};
use crate::pose::PoseSample;

const SPEED_STEP: f64 = 0.1;
const POWER_STEP: i16 = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct RobotState {
    /// Operator override, 0..1
    pub speed_factor: f64,
    pub laser_power: u8,
    pub session: ControlSession,
    pub link: LinkStatus,
    pub radio: RadioStatus,
    pub pose: Option<PoseSample>,
    pub joystick_connected: bool,
}

impl RobotState {
    pub fn new(manual: &ManualConfig) -> Self {
        Self {
            speed_factor: manual.speed_factor.clamp(0.0, 1.0),
            laser_power: manual.laser_power,
            session: ControlSession::default(),
            link: LinkStatus::Disconnected,
            radio: RadioStatus::Unknown,
            pose: None,
            joystick_connected: false,
        }
    }

    pub fn faster(&mut self) -> f64 {
        self.set_speed_factor(self.speed_factor + SPEED_STEP)
    }

    pub fn slower(&mut self) -> f64 {
        self.set_speed_factor(self.speed_factor - SPEED_STEP)
    }

    pub fn set_speed_factor(&mut self, value: f64) -> f64 {
        if value.is_finite() {
            // keep tenths exact after repeated steps
            self.speed_factor = ((value * 100.0).round() / 100.0).clamp(0.0, 1.0);
        }
        self.speed_factor
    }

    pub fn more_power(&mut self) -> u8 {
        self.step_power(POWER_STEP)
    }

    pub fn less_power(&mut self) -> u8 {
        self.step_power(-POWER_STEP)
    }

    fn step_power(&mut self, delta: i16) -> u8 {
        self.laser_power = (i16::from(self.laser_power) + delta).clamp(0, 255) as u8;
        self.laser_power
    }
}

/// Snapshot published as telemetry
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DirectorStatus {
    pub session: ControlSession,
    pub speed_factor: f64,
    pub laser_power: u8,
    pub link: LinkStatus,
    pub radio: RadioStatus,
    pub joystick_connected: bool,
    pub pose: Option<PoseSample>,
    pub program: ProgramProgress,
    pub corrector: CorrectorState,
    pub target: Option<Waypoint>,
    pub dropped_commands: u64,
}
