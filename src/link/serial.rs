// Serial transport to the controller bridge
//
// The bridge speaks plain ASCII lines in both directions. The port is split
// into two owned handles so the dispatcher (writes) and the reader (reads)
// never share one.

use serialport::{self, SerialPort};
use std::io::{self, Write};
use std::time::Duration;
use tracing::{debug, info};

/// Error types for the serial link
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Cannot open {port}: {source}")]
    Open {
        port: String,
        source: serialport::Error,
    },
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// Independently owned read and write handles of one port
pub struct SerialHalves {
    pub writer: Box<dyn SerialPort>,
    pub reader: Box<dyn SerialPort>,
}

/// Open the bridge port and split it
pub fn open(port_name: &str, baudrate: u32, read_timeout: Duration) -> Result<SerialHalves> {
    info!("Opening serial link on {} at {} baud", port_name, baudrate);
    let writer = serialport::new(port_name, baudrate)
        .timeout(read_timeout)
        .open()
        .map_err(|source| LinkError::Open {
            port: port_name.to_string(),
            source,
        })?;
    let reader = writer.try_clone()?;

    Ok(SerialHalves { writer, reader })
}

/// Stand-in writer for runs without hardware: frames go to the log
#[derive(Debug, Default)]
pub struct DryRunPort;

impl Write for DryRunPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        debug!("[dry run] {}", String::from_utf8_lossy(buf).trim_end());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_port_names_it() {
        let err = open("/dev/does-not-exist-robot", 115_200, Duration::from_millis(10))
            .err()
            .expect("port should not exist");
        match err {
            LinkError::Open { port, .. } => assert_eq!(port, "/dev/does-not-exist-robot"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn clone_failure_is_a_serial_error() {
        let err: LinkError = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone").into();
        assert!(matches!(err, LinkError::Serial(_)));
        assert_eq!(err.to_string(), "Serial port error: gone");
    }

    #[test]
    fn dry_run_accepts_everything() {
        let mut port = DryRunPort;
        port.write_all(b"MX: 0.00000000\n").unwrap();
        port.flush().unwrap();
    }
}
