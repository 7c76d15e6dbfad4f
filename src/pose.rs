// Pose ingest: `tag_id,x_mm,y_mm,z_mm,yaw_deg` lines from the localizer
//
// Only the latest sample matters, so samples land in a watch cell.

use serde::Serialize;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::PoseConfig;
use crate::ingest::{IngestHandle, LineSink};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PoseError {
    #[error("Expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("Invalid {field}: {text:?}")]
    InvalidNumber { field: &'static str, text: String },
}

const FIELDS: [&str; 5] = ["tag_id", "x_mm", "y_mm", "z_mm", "yaw_deg"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoseSample {
    pub tag_id: i64,
    pub x_mm: f64,
    pub y_mm: f64,
    pub z_mm: f64,
    pub yaw_deg: f64,
    /// Local receipt time
    #[serde(skip)]
    pub timestamp: Instant,
}

impl PoseSample {
    pub fn parse(line: &str, received: Instant) -> Result<Self, PoseError> {
        let parts: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        if parts.len() != FIELDS.len() {
            return Err(PoseError::FieldCount(parts.len()));
        }

        let tag_id = parts[0].parse::<i64>().map_err(|_| PoseError::InvalidNumber {
            field: FIELDS[0],
            text: parts[0].to_string(),
        })?;

        let mut values = [0.0f64; 4];
        for (i, value) in values.iter_mut().enumerate() {
            let text = parts[i + 1];
            *value = text
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| PoseError::InvalidNumber {
                    field: FIELDS[i + 1],
                    text: text.to_string(),
                })?;
        }

        Ok(Self {
            tag_id,
            x_mm: values[0],
            y_mm: values[1],
            z_mm: values[2],
            yaw_deg: values[3],
            timestamp: received,
        })
    }

    /// Shift into workspace coordinates
    pub fn offset(self, dx_mm: f64, dy_mm: f64) -> Self {
        Self {
            x_mm: self.x_mm + dx_mm,
            y_mm: self.y_mm + dy_mm,
            ..self
        }
    }
}

struct PoseSink {
    offset: (f64, f64),
    latest: watch::Sender<Option<PoseSample>>,
}

impl LineSink for PoseSink {
    fn line(&mut self, line: &str) {
        match PoseSample::parse(line, Instant::now()) {
            Ok(sample) => {
                let sample = sample.offset(self.offset.0, self.offset.1);
                debug!(
                    "Pose tag {}: ({:.1}, {:.1}) yaw {:.1}",
                    sample.tag_id, sample.x_mm, sample.y_mm, sample.yaw_deg
                );
                self.latest.send_replace(Some(sample));
            }
            Err(e) => warn!("Skipping pose line {:?}: {}", line, e),
        }
    }
}

pub struct PoseClient {
    handle: IngestHandle,
}

impl PoseClient {
    /// Start reading poses; the receiver always holds the latest sample
    pub fn start(cfg: &PoseConfig) -> (Self, watch::Receiver<Option<PoseSample>>) {
        let (tx, rx) = watch::channel(None);
        let sink = PoseSink {
            offset: (cfg.offset_x_mm, cfg.offset_y_mm),
            latest: tx,
        };
        let handle = IngestHandle::spawn("Pose", cfg.addr.clone(), sink);
        (Self { handle }, rx)
    }

    pub async fn stop(self) {
        self.handle.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[test]
    fn parses_pose_line() {
        let now = Instant::now();
        let sample = PoseSample::parse("3, 120.5,-40,310.2, -12.5\n", now).unwrap();
        assert_eq!(sample.tag_id, 3);
        assert_eq!(sample.x_mm, 120.5);
        assert_eq!(sample.y_mm, -40.0);
        assert_eq!(sample.z_mm, 310.2);
        assert_eq!(sample.yaw_deg, -12.5);
        assert_eq!(sample.timestamp, now);
    }

    #[test]
    fn rejects_bad_lines() {
        let now = Instant::now();
        assert_eq!(PoseSample::parse("1,2,3", now), Err(PoseError::FieldCount(3)));
        assert_eq!(
            PoseSample::parse("1,2,abc,4,5", now),
            Err(PoseError::InvalidNumber {
                field: "y_mm",
                text: "abc".into()
            })
        );
        assert!(PoseSample::parse("x,2,3,4,5", now).is_err());
        assert!(PoseSample::parse("1,NaN,3,4,5", now).is_err());
    }

    #[test]
    fn offset_shifts_xy_only() {
        let sample = PoseSample::parse("0,10,20,30,45", Instant::now())
            .unwrap()
            .offset(-5.0, 2.5);
        assert_eq!((sample.x_mm, sample.y_mm, sample.z_mm), (5.0, 22.5, 30.0));
        assert_eq!(sample.yaw_deg, 45.0);
    }

    #[tokio::test]
    async fn client_keeps_latest_sample() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cfg = PoseConfig {
            addr: listener.local_addr().unwrap().to_string(),
            offset_x_mm: 100.0,
            ..Default::default()
        };
        let (client, mut rx) = PoseClient::start(&cfg);
        let (mut peer, _) = listener.accept().await.unwrap();

        peer.write_all(b"1,0,0,0,0\ngarbage\n1,5,6,0,90\n").await.unwrap();

        timeout(Duration::from_secs(2), async {
            loop {
                rx.changed().await.unwrap();
                if rx.borrow().is_some_and(|s| s.y_mm == 6.0) {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let sample = rx.borrow().unwrap();
        assert_eq!((sample.x_mm, sample.y_mm, sample.yaw_deg), (105.0, 6.0, 90.0));

        client.stop().await;
    }
}
