use clap::Parser;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

use robot_director::config::DirectorConfig;
use robot_director::corrector::Waypoint;
use robot_director::runtime::{self, RunOptions};

/// Drive the laser robot from the keyboard, a joystick stream, G-code or
/// vision feedback
#[derive(Parser, Debug)]
#[command(name = "robot-director", version, about, long_about = None)]
struct Cli {
    /// TOML parameter file; flags below override it
    #[arg(long)]
    params: Option<PathBuf>,

    /// Serial port of the controller bridge
    #[arg(long)]
    port: Option<String>,

    #[arg(long)]
    baud: Option<u32>,

    /// Pause after each frame (ms)
    #[arg(long)]
    throttle_ms: Option<u64>,

    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Send a stop when no command follows a moving one within this (ms)
    #[arg(long)]
    watchdog_ms: Option<u64>,

    /// Joystick stream address (host:port)
    #[arg(long)]
    joystick: Option<String>,

    /// Pose stream address (host:port)
    #[arg(long)]
    pose: Option<String>,

    /// G-code program to load
    #[arg(long)]
    gcode: Option<PathBuf>,

    /// Vision waypoint `x,y,yaw[,power]` (mm, mm, deg, 0-255); repeat for a route
    #[arg(long = "target", allow_hyphen_values = true)]
    targets: Vec<Waypoint>,

    /// Publish status over Zenoh
    #[arg(long)]
    telemetry: bool,

    /// Log frames instead of opening the serial port
    #[arg(long)]
    no_serial: bool,
}

impl Cli {
    fn into_options(self) -> Result<RunOptions, Box<dyn std::error::Error + Send + Sync>> {
        let mut config = match &self.params {
            Some(path) => DirectorConfig::load(path)?,
            None => DirectorConfig::default(),
        };

        let link = &mut config.link;
        if let Some(port) = self.port {
            link.port = port;
        }
        if let Some(baud) = self.baud {
            link.baudrate = baud;
        }
        if let Some(ms) = self.throttle_ms {
            link.throttle_ms = ms;
        }
        if let Some(capacity) = self.queue_capacity {
            link.queue_capacity = capacity;
        }
        if self.watchdog_ms.is_some() {
            link.watchdog_ms = self.watchdog_ms;
        }
        link.dry_run |= self.no_serial;

        if let Some(addr) = self.joystick {
            config.joystick.addr = addr;
        }
        if let Some(addr) = self.pose {
            config.pose.addr = addr;
        }
        config.telemetry |= self.telemetry;

        Ok(RunOptions {
            config,
            program: self.gcode,
            targets: self.targets,
        })
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=debug to see every frame)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let options = match Cli::parse().into_options() {
        Ok(options) => options,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime::run(options).await {
        error!("Director error: {}", e);
        std::process::exit(1);
    }
}
