// Arbiter + dispatcher end to end with an in-memory transport
use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use robot_director::arbiter::Arbiter;
use robot_director::link::{Dispatcher, DispatcherConfig};
use robot_director::messages::{ControlSession, LinkStatus, MotionCommand};
use tokio::sync::watch;

#[derive(Clone, Default)]
struct Wire(Arc<Mutex<Vec<u8>>>);

impl Wire {
    fn frames(&self) -> Vec<String> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .split_inclusive('\n')
            .map(str::to_string)
            .collect()
    }
}

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn config() -> DispatcherConfig {
    DispatcherConfig {
        throttle: Duration::from_millis(1),
        watchdog: None,
    }
}

#[test]
fn every_frame_is_one_whole_submission() {
    let arbiter = Arc::new(Arbiter::with_capacity(4));
    arbiter.activate(ControlSession::Joystick);
    let wire = Wire::default();
    let (tx, _rx) = watch::channel(LinkStatus::Disconnected);
    let dispatcher = Dispatcher::start(arbiter.queue().clone(), wire.clone(), config(), tx).unwrap();

    // each producer writes its own id into every field
    let producers: Vec<_> = (1..=4u8)
        .map(|id| {
            let arbiter = arbiter.clone();
            thread::spawn(move || {
                let mut submitted = Vec::new();
                for n in 0..200 {
                    let v = f64::from(id) / 10.0;
                    let cmd = MotionCommand::new(v, -v, v, v).with_laser(n % 2 == 0, id * 50);
                    arbiter.submit(ControlSession::Joystick, cmd).unwrap();
                    submitted.push(cmd.to_frame());
                }
                submitted
            })
        })
        .collect();

    let mut allowed = HashSet::new();
    for producer in producers {
        allowed.extend(producer.join().unwrap());
    }
    let last = MotionCommand::stop();
    arbiter.submit(ControlSession::Joystick, last).unwrap();
    dispatcher.stop();

    let frames = wire.frames();
    assert!(!frames.is_empty());
    for frame in &frames[..frames.len() - 1] {
        assert!(allowed.contains(frame), "torn or foreign frame {frame:?}");
    }
    assert_eq!(frames.last(), Some(&last.to_frame()));
}

#[test]
fn burst_beyond_capacity_keeps_the_newest() {
    let arbiter = Arbiter::with_capacity(3);
    arbiter.activate(ControlSession::GCode);
    let cmds: Vec<_> = (0..10)
        .map(|i| MotionCommand::new(f64::from(i) / 10.0, 0.0, 0.0, 1.0))
        .collect();
    for cmd in &cmds {
        arbiter.submit(ControlSession::GCode, *cmd).unwrap();
    }

    let wire = Wire::default();
    let (tx, _rx) = watch::channel(LinkStatus::Disconnected);
    let dispatcher = Dispatcher::start(arbiter.queue().clone(), wire.clone(), config(), tx).unwrap();
    dispatcher.stop();

    let expected: Vec<String> = cmds[7..].iter().map(MotionCommand::to_frame).collect();
    assert_eq!(wire.frames(), expected);
    assert_eq!(arbiter.queue().dropped(), 7);
}

#[test]
fn inactive_source_never_reaches_the_wire() {
    let arbiter = Arbiter::with_capacity(8);
    let wire = Wire::default();
    let (tx, _rx) = watch::channel(LinkStatus::Disconnected);
    let dispatcher = Dispatcher::start(arbiter.queue().clone(), wire.clone(), config(), tx).unwrap();

    assert!(
        arbiter
            .submit(ControlSession::Vision, MotionCommand::new(1.0, 0.0, 0.0, 1.0))
            .is_err()
    );
    let manual = MotionCommand::new(0.0, 0.3, 0.0, 0.5);
    arbiter.submit(ControlSession::Manual, manual).unwrap();
    dispatcher.stop();

    assert_eq!(wire.frames(), vec![manual.to_frame()]);
}
