// Director for a laser-equipped holonomic robot
//
// Command sources (keyboard, joystick stream, G-code, vision corrector) feed
// one arbiter; a dispatcher thread serializes the winner onto the serial link.

pub mod arbiter;
pub mod config;
pub mod corrector;
pub mod gcode;
pub mod ingest;
pub mod joystick;
pub mod link;
pub mod manual;
pub mod messages;
pub mod pose;
pub mod runtime;
pub mod state;
pub mod telemetry;
