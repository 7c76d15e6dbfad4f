// Message types shared by every command source and the serial link

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Normalised velocity-plus-laser instruction for the motion controller.
///
/// `x`, `y` and `rotation` are fractions of the platform maximum in
/// `[-1, 1]`; the controller scales them. Values are immutable once built:
/// the `with_*` helpers return a new command.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotionCommand {
    x: f64,
    y: f64,
    rotation: f64,
    laser_on: bool,
    laser_power: u8,
    speed_factor: f64,
}

fn unit(v: f64, lo: f64) -> f64 {
    if v.is_finite() { v.clamp(lo, 1.0) } else { 0.0 }
}

impl MotionCommand {
    pub fn new(x: f64, y: f64, rotation: f64, speed_factor: f64) -> Self {
        Self {
            x: unit(x, -1.0),
            y: unit(y, -1.0),
            rotation: unit(rotation, -1.0),
            laser_on: false,
            laser_power: 0,
            speed_factor: unit(speed_factor, 0.0),
        }
    }

    /// All motion zero, laser off
    pub fn stop() -> Self {
        Self::default()
    }

    pub fn with_laser(self, on: bool, power: u8) -> Self {
        Self {
            laser_on: on,
            laser_power: power,
            ..self
        }
    }

    pub fn with_speed_factor(self, speed_factor: f64) -> Self {
        Self {
            speed_factor: unit(speed_factor, 0.0),
            ..self
        }
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }

    pub fn rotation(&self) -> f64 {
        self.rotation
    }

    pub fn laser_on(&self) -> bool {
        self.laser_on
    }

    pub fn laser_power(&self) -> u8 {
        self.laser_power
    }

    pub fn speed_factor(&self) -> f64 {
        self.speed_factor
    }

    pub fn is_moving(&self) -> bool {
        self.x.abs() > 1e-6 || self.y.abs() > 1e-6 || self.rotation.abs() > 1e-6
    }

    /// True when every field matches within 1e-6
    pub fn approx_eq(&self, other: &Self) -> bool {
        (self.x - other.x).abs() <= 1e-6
            && (self.y - other.y).abs() <= 1e-6
            && (self.rotation - other.rotation).abs() <= 1e-6
            && (self.speed_factor - other.speed_factor).abs() <= 1e-6
            && self.laser_on == other.laser_on
            && self.laser_power == other.laser_power
    }

    /// ASCII frame for the controller bridge:
    /// `MX:<f>,MY:<f>,R:<f>,L:<0|1>,P:<0-255>,S:<f>\n`
    pub fn to_frame(&self) -> String {
        let mut frame = String::with_capacity(80);
        // Writing into a String cannot fail
        let _ = writeln!(
            frame,
            "MX:{},MY:{},R:{},L:{},P:{},S:{}",
            signed8(self.x),
            signed8(self.y),
            signed8(self.rotation),
            u8::from(self.laser_on),
            self.laser_power,
            signed8(self.speed_factor),
        );
        frame
    }
}

/// Eight decimals, leading space for non-negative values (firmware expects a
/// fixed sign column).
fn signed8(v: f64) -> String {
    if v < 0.0 {
        format!("{:.8}", v)
    } else {
        // also folds -0.0 into the positive column
        format!(" {:.8}", v.abs())
    }
}

/// The command source currently allowed to drive the robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSession {
    #[default]
    Manual,
    Joystick,
    #[serde(rename = "gcode")]
    GCode,
    Vision,
}

impl ControlSession {
    pub const ALL: [ControlSession; 4] = [
        ControlSession::Manual,
        ControlSession::Joystick,
        ControlSession::GCode,
        ControlSession::Vision,
    ];
}

impl std::fmt::Display for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControlSession::Manual => "manual",
            ControlSession::Joystick => "joystick",
            ControlSession::GCode => "gcode",
            ControlSession::Vision => "vision",
        };
        f.write_str(name)
    }
}

/// Outbound side of the serial link, as last seen by the dispatcher
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    #[default]
    Disconnected,
    Idle,
    Sent(String),
    WriteFailed(String),
}

/// Radio acknowledgement reported by the bridge on the inbound side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioStatus {
    #[default]
    Unknown,
    Ok,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_matches_firmware_format() {
        let cmd = MotionCommand::new(0.5, -0.25, 0.0, 0.75).with_laser(true, 200);
        assert_eq!(
            cmd.to_frame(),
            "MX: 0.50000000,MY:-0.25000000,R: 0.00000000,L:1,P:200,S: 0.75000000\n"
        );
    }

    #[test]
    fn stop_frame() {
        assert_eq!(
            MotionCommand::stop().to_frame(),
            "MX: 0.00000000,MY: 0.00000000,R: 0.00000000,L:0,P:0,S: 0.00000000\n"
        );
    }

    #[test]
    fn negative_zero_prints_as_zero() {
        let cmd = MotionCommand::new(-0.0, 0.0, -0.0, 0.0);
        assert!(cmd.to_frame().starts_with("MX: 0.00000000,"));
    }

    #[test]
    fn fields_are_clamped() {
        let cmd = MotionCommand::new(3.0, -7.0, f64::NAN, 1.5);
        assert_eq!(cmd.x(), 1.0);
        assert_eq!(cmd.y(), -1.0);
        assert_eq!(cmd.rotation(), 0.0);
        assert_eq!(cmd.speed_factor(), 1.0);
        assert_eq!(MotionCommand::stop().with_speed_factor(-0.3).speed_factor(), 0.0);
    }

    #[test]
    fn session_serializes_snake_case() {
        let json = serde_json::to_string(&ControlSession::GCode).unwrap();
        assert_eq!(json, "\"gcode\"");
        assert_eq!(ControlSession::GCode.to_string(), "gcode");
    }
}
