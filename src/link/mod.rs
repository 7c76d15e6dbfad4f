// Serial link to the motion controller bridge
//
// Provides:
// - Port opening and splitting into read/write halves
// - The dispatcher thread (sole writer)
// - The reader thread (sole reader)

mod dispatcher;
mod reader;
pub mod serial;

pub use dispatcher::{Dispatcher, DispatcherConfig, POP_TIMEOUT};
pub use reader::{SerialReader, parse_status_line};
pub use serial::{DryRunPort, LinkError, SerialHalves};
