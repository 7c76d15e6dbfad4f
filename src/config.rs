// Defaults, topics, and the parameter file
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 100;

// Serial link to the motion controller bridge
pub const SERIAL_PORT: &str = "/dev/ttyUSB0";
pub const SERIAL_BAUDRATE: u32 = 115_200;
pub const SERIAL_READ_TIMEOUT_MS: u64 = 1000;

// Dispatcher cadence and queue
pub const THROTTLE_MS: u64 = 10;
pub const QUEUE_CAPACITY: usize = 8;

// Network collaborators
pub const JOYSTICK_ADDR: &str = "127.0.0.1:52345";
pub const POSE_ADDR: &str = "127.0.0.1:65432";

// Platform limits used to normalise velocities
pub const MAX_LINEAR_VELOCITY_MM_S: f64 = 200.0;
pub const MAX_ANGULAR_VELOCITY_DEG_S: f64 = 180.0;

// Operator defaults
pub const SPEED_FACTOR: f64 = 0.5;
pub const LASER_POWER: u8 = 128;

// Zenoh topics
pub const TOPIC_STATUS: &str = "director/state/status"; // full director status
pub const TOPIC_LINK: &str = "director/state/link"; // serial link status

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read the parameter file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse the parameter file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Everything the director needs, grouped by subsystem.
///
/// Missing keys in a parameter file keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DirectorConfig {
    pub link: LinkConfig,
    pub gcode: GCodeConfig,
    pub joystick: JoystickConfig,
    pub pose: PoseConfig,
    pub corrector: CorrectorConfig,
    pub manual: ManualConfig,
    pub platform: PlatformConfig,
    pub telemetry: bool,
}

impl DirectorConfig {
    /// Load a TOML parameter file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub max_linear_velocity_mm_s: f64,
    pub max_angular_velocity_deg_s: f64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            max_linear_velocity_mm_s: MAX_LINEAR_VELOCITY_MM_S,
            max_angular_velocity_deg_s: MAX_ANGULAR_VELOCITY_DEG_S,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub port: String,
    pub baudrate: u32,
    pub throttle_ms: u64,
    pub queue_capacity: usize,
    /// Deadman timeout; `None` keeps the last command running indefinitely
    pub watchdog_ms: Option<u64>,
    /// Log frames instead of opening the serial port
    pub dry_run: bool,
}

impl LinkConfig {
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn watchdog(&self) -> Option<Duration> {
        self.watchdog_ms.map(Duration::from_millis)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: SERIAL_PORT.to_string(),
            baudrate: SERIAL_BAUDRATE,
            throttle_ms: THROTTLE_MS,
            queue_capacity: QUEUE_CAPACITY,
            watchdog_ms: None,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct GCodeConfig {
    pub min_velocity_mm_s: f64,
    pub min_segment_ms: u64,
    pub line_gap_ms: u64,
}

impl Default for GCodeConfig {
    fn default() -> Self {
        Self {
            min_velocity_mm_s: 5.0,
            min_segment_ms: 50,
            line_gap_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JoystickConfig {
    pub enabled: bool,
    pub addr: String,
    pub deadzone: f64,
    pub invert_x: bool,
    pub invert_y: bool,
    pub invert_r: bool,
}

impl Default for JoystickConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: JOYSTICK_ADDR.to_string(),
            deadzone: 0.0,
            invert_x: false,
            invert_y: false,
            invert_r: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoseConfig {
    pub enabled: bool,
    pub addr: String,
    /// Camera origin to workspace origin, added to every sample
    pub offset_x_mm: f64,
    pub offset_y_mm: f64,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: POSE_ADDR.to_string(),
            offset_x_mm: 0.0,
            offset_y_mm: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CorrectorConfig {
    pub period_ms: u64,
    pub kp_pos: f64,
    pub kp_rot: f64,
    pub max_step_mm: f64,
    pub max_rot_step_deg: f64,
    pub position_tolerance_mm: f64,
    pub yaw_tolerance_deg: f64,
    /// Samples older than this hold the robot; `None` trusts any sample
    pub max_pose_age_ms: Option<u64>,
}

impl CorrectorConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        Self {
            period_ms: 50,
            kp_pos: 0.5,
            kp_rot: 0.5,
            max_step_mm: 20.0,
            max_rot_step_deg: 10.0,
            position_tolerance_mm: 2.0,
            yaw_tolerance_deg: 2.0,
            max_pose_age_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ManualConfig {
    pub hold_ms: u64,
    pub repeat_ms: u64,
    pub speed_factor: f64,
    pub laser_power: u8,
}

impl Default for ManualConfig {
    fn default() -> Self {
        Self {
            hold_ms: 150,
            repeat_ms: 150,
            speed_factor: SPEED_FACTOR,
            laser_power: LASER_POWER,
        }
    }
}
