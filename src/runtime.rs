// Director: 100 Hz cooperative loop owning every command source
//
// Each tick drains keyboard and joystick input, polls the interpreter,
// corrector and manual input, then hands a status snapshot to the telemetry
// task. Only the active source's
// submissions reach the serial queue; switching sources zeroes the outgoing
// one first.

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::arbiter::{Arbiter, CommandQueue};
use crate::config::{DirectorConfig, LOOP_HZ, SERIAL_READ_TIMEOUT_MS};
use crate::corrector::{Corrector, Waypoint};
use crate::gcode::{Interpreter, Program};
use crate::joystick::{ChangeFilter, JoystickClient, JoystickEvent, JoystickFeed};
use crate::link::{Dispatcher, DispatcherConfig, DryRunPort, SerialReader, serial};
use crate::manual::{ManualInput, ManualKey};
use crate::messages::{ControlSession, LinkStatus, MotionCommand, RadioStatus};
use crate::pose::{PoseClient, PoseSample};
use crate::state::{DirectorStatus, RobotState};
use crate::telemetry::{self, TelemetryFeed};

// Status snapshot every N ticks (10 Hz)
const STATUS_EVERY: u64 = 10;

/// Status cells fed by the link threads and the pose client
pub struct Inputs {
    pub link: watch::Receiver<LinkStatus>,
    pub radio: watch::Receiver<RadioStatus>,
    pub pose: watch::Receiver<Option<PoseSample>>,
}

pub struct Director {
    state: RobotState,
    arbiter: Arbiter,
    interpreter: Interpreter,
    corrector: Corrector,
    route: Vec<Waypoint>,
    manual: ManualInput,
    joystick_filter: ChangeFilter,
    inputs: Inputs,
    /// No transport: queued commands are discarded each tick
    link_disabled: bool,
    quit: bool,
}

impl Director {
    pub fn new(config: &DirectorConfig, arbiter: Arbiter, inputs: Inputs) -> Self {
        let mut state = RobotState::new(&config.manual);
        state.session = arbiter.session();
        Self {
            state,
            arbiter,
            interpreter: Interpreter::new(config.gcode, config.platform),
            corrector: Corrector::new(config.corrector, config.platform),
            route: Vec::new(),
            manual: ManualInput::new(&config.manual),
            joystick_filter: ChangeFilter::default(),
            inputs,
            link_disabled: false,
            quit: false,
        }
    }

    pub fn state(&self) -> &RobotState {
        &self.state
    }

    pub fn arbiter(&self) -> &Arbiter {
        &self.arbiter
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    pub fn disable_link(&mut self) {
        self.link_disabled = true;
    }

    pub fn load_program(&mut self, program: Program) {
        if let Err(e) = self.interpreter.load(program) {
            warn!("Cannot load G-code program: {}", e);
        }
    }

    /// Read and load a program file. An unreadable file leaves the G-code
    /// source without a program; everything else keeps running.
    pub fn load_program_file(&mut self, path: &Path) {
        match Program::load(path) {
            Ok(program) => self.load_program(program),
            Err(e) => warn!("Cannot read G-code file {}: {}", path.display(), e),
        }
    }

    /// Waypoints visited when the vision source becomes active
    pub fn set_route(&mut self, route: Vec<Waypoint>) {
        self.route = route;
    }

    /// Zero the outgoing source, then hand control to `to`
    pub fn switch_source(&mut self, to: ControlSession, now: Instant) {
        let from = self.arbiter.session();
        if from == to {
            return;
        }
        self.cancel_source(from);
        self.arbiter.activate(to);
        self.state.session = to;

        if to == ControlSession::Vision {
            if self.route.is_empty() {
                info!("Vision active without targets; pass --target to track one");
            } else {
                self.corrector.route(self.route.clone(), now);
            }
        }
    }

    fn cancel_source(&mut self, source: ControlSession) {
        match source {
            ControlSession::Manual => self.manual.cancel(&self.arbiter),
            ControlSession::Joystick => {
                let _ = self
                    .arbiter
                    .submit(ControlSession::Joystick, MotionCommand::stop());
                self.joystick_filter.reset();
            }
            ControlSession::GCode => self.interpreter.stop(&self.arbiter),
            ControlSession::Vision => self.corrector.cancel(&self.arbiter),
        }
    }

    /// Stop every source and push a zero no matter who is active
    pub fn emergency_stop(&mut self) {
        for source in ControlSession::ALL {
            self.cancel_source(source);
        }
        self.arbiter.emergency_stop();
    }

    /// Start or restart the loaded program
    pub fn start_program(&mut self, now: Instant) {
        self.switch_source(ControlSession::GCode, now);
        if let Err(e) = self.interpreter.start(now) {
            warn!("Cannot start G-code program: {}", e);
        }
    }

    pub fn on_key(&mut self, key: KeyEvent, now: Instant) {
        let KeyEvent {
            code,
            modifiers,
            kind,
            ..
        } = key;

        if kind == KeyEventKind::Release {
            if let KeyCode::Char(c) = code {
                if let Some(manual) = ManualKey::from_char(c) {
                    self.manual.release(manual);
                }
            }
            return;
        }

        match code {
            KeyCode::Esc => self.quit = true,
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => self.quit = true,
            KeyCode::Char(c) => {
                if let Some(manual) = ManualKey::from_char(c) {
                    if self.state.session == ControlSession::Manual {
                        self.manual.press(manual, now);
                    }
                    return;
                }
                // repeats only matter for held movement keys
                if kind == KeyEventKind::Repeat {
                    return;
                }
                self.on_command_key(c.to_ascii_lowercase(), now);
            }
            _ => {}
        }
    }

    fn on_command_key(&mut self, c: char, now: Instant) {
        match c {
            '1' => self.switch_source(ControlSession::Manual, now),
            '2' => self.switch_source(ControlSession::Joystick, now),
            '3' => self.switch_source(ControlSession::GCode, now),
            '4' => self.switch_source(ControlSession::Vision, now),
            'g' => self.start_program(now),
            'x' => self.emergency_stop(),
            // mutate outside the log macros: filtered events skip their arguments
            'r' => {
                let speed = self.state.faster();
                info!("Speed: {:.1}", speed);
            }
            'f' => {
                let speed = self.state.slower();
                info!("Speed: {:.1}", speed);
            }
            '+' | '=' => {
                let power = self.state.more_power();
                info!("Laser power: {}", power);
            }
            '-' => {
                let power = self.state.less_power();
                info!("Laser power: {}", power);
            }
            _ => {}
        }
    }

    pub fn on_joystick(&mut self, event: JoystickEvent) {
        match event {
            JoystickEvent::Connected => self.state.joystick_connected = true,
            JoystickEvent::Disconnected => {
                self.state.joystick_connected = false;
                if self.state.session == ControlSession::Joystick {
                    warn!("Joystick lost while driving, stopping");
                    self.cancel_source(ControlSession::Joystick);
                }
            }
            // drained but ignored unless the joystick drives
            JoystickEvent::Frame(_) if self.state.session != ControlSession::Joystick => {}
            JoystickEvent::Frame(frame) => {
                self.state.speed_factor = frame.speed_factor(self.state.speed_factor);
                self.state.laser_power = frame.laser_power(self.state.laser_power);
                let cmd = frame.to_command(self.state.speed_factor, self.state.laser_power);
                if self.joystick_filter.admit(cmd) {
                    let _ = self.arbiter.submit(ControlSession::Joystick, cmd);
                }
            }
        }
    }

    /// One loop iteration after input has been routed
    pub fn tick(&mut self, now: Instant) {
        self.refresh_inputs();

        let speed = self.state.speed_factor;
        self.interpreter.poll(now, speed, &self.arbiter);
        self.corrector
            .poll(now, self.state.pose.as_ref(), speed, &self.arbiter);
        if self.state.session == ControlSession::Manual {
            self.manual
                .poll(now, speed, self.state.laser_power, &self.arbiter);
        }

        if self.link_disabled {
            let discarded = self.arbiter.queue().drain();
            if !discarded.is_empty() {
                debug!("Serial link disabled, discarded {} command(s)", discarded.len());
            }
        }
    }

    fn refresh_inputs(&mut self) {
        if self.inputs.link.has_changed().unwrap_or(false) {
            let link = self.inputs.link.borrow_and_update().clone();
            if matches!(link, LinkStatus::WriteFailed(_)) && self.interpreter.is_running() {
                warn!("Serial write failed, aborting G-code program");
                self.interpreter.abort(&self.arbiter);
            }
            self.state.link = link;
        }
        self.state.radio = *self.inputs.radio.borrow();
        self.state.pose = *self.inputs.pose.borrow();
    }

    /// Zero whichever source is driving and queue a final stop frame
    pub fn shutdown(&mut self) {
        info!("Stopping command sources");
        self.emergency_stop();
    }

    pub fn status(&self) -> DirectorStatus {
        DirectorStatus {
            session: self.state.session,
            speed_factor: self.state.speed_factor,
            laser_power: self.state.laser_power,
            link: self.state.link.clone(),
            radio: self.state.radio,
            joystick_connected: self.state.joystick_connected,
            pose: self.state.pose,
            program: self.interpreter.progress(),
            corrector: self.corrector.state(),
            target: self.corrector.target(),
            dropped_commands: self.arbiter.queue().dropped(),
        }
    }
}

/// What `run` needs beyond the parameter file
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config: DirectorConfig,
    pub program: Option<PathBuf>,
    pub targets: Vec<Waypoint>,
}

/// Serial threads, present when the link is up
struct Link {
    dispatcher: Option<Dispatcher>,
    reader: Option<SerialReader>,
}

fn start_link(
    config: &DirectorConfig,
    queue: Arc<CommandQueue>,
    link_tx: watch::Sender<LinkStatus>,
    radio_tx: watch::Sender<RadioStatus>,
) -> Result<Link, Box<dyn std::error::Error + Send + Sync>> {
    let dispatcher_config = DispatcherConfig {
        throttle: config.link.throttle(),
        watchdog: config.link.watchdog(),
    };

    if config.link.dry_run {
        info!("Dry run: frames are logged, not sent");
        let dispatcher = Dispatcher::start(queue, DryRunPort, dispatcher_config, link_tx)?;
        return Ok(Link {
            dispatcher: Some(dispatcher),
            reader: None,
        });
    }

    let halves = match serial::open(
        &config.link.port,
        config.link.baudrate,
        Duration::from_millis(SERIAL_READ_TIMEOUT_MS),
    ) {
        Ok(halves) => halves,
        Err(e) => {
            warn!("Serial link unavailable, commands will be dropped: {}", e);
            link_tx.send_replace(LinkStatus::Disconnected);
            return Ok(Link {
                dispatcher: None,
                reader: None,
            });
        }
    };

    let dispatcher = Dispatcher::start(queue, halves.writer, dispatcher_config, link_tx)?;
    let reader = SerialReader::start(halves.reader, radio_tx)?;
    Ok(Link {
        dispatcher: Some(dispatcher),
        reader: Some(reader),
    })
}

pub async fn run(options: RunOptions) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let RunOptions {
        config,
        program,
        targets,
    } = options;

    let queue = Arc::new(CommandQueue::new(config.link.queue_capacity));
    let (link_tx, link_rx) = watch::channel(LinkStatus::Disconnected);
    let (radio_tx, radio_rx) = watch::channel(RadioStatus::Unknown);
    let link = start_link(&config, queue.clone(), link_tx, radio_tx)?;

    let (joystick, mut joystick_feed) = if config.joystick.enabled {
        let (client, feed) = JoystickClient::start(&config.joystick);
        (Some(client), feed)
    } else {
        (None, JoystickFeed::idle())
    };
    let (pose, pose_rx) = if config.pose.enabled {
        let (client, rx) = PoseClient::start(&config.pose);
        (Some(client), rx)
    } else {
        (None, watch::channel(None).1)
    };

    // the telemetry task keeps its own view of the link cell
    let telemetry_link = link_rx.clone();
    let inputs = Inputs {
        link: link_rx,
        radio: radio_rx,
        pose: pose_rx,
    };
    let mut director = Director::new(&config, Arbiter::new(queue), inputs);
    if link.dispatcher.is_none() {
        director.disable_link();
    }
    // start halted
    let _ = director
        .arbiter()
        .submit(ControlSession::Manual, MotionCommand::stop());
    if let Some(path) = program {
        director.load_program_file(&path);
    }
    director.set_route(targets);

    let (status_tx, telemetry_task) = if config.telemetry {
        let (tx, rx) = watch::channel(director.status());
        let task = telemetry::spawn(TelemetryFeed::new(rx, telemetry_link));
        (Some(tx), Some(task))
    } else {
        (None, None)
    };

    info!(
        "Director started: {}Hz loop, queue {}, throttle {}ms",
        LOOP_HZ,
        config.link.queue_capacity,
        config.link.throttle_ms
    );
    info!("Keys: 1-4=source (manual/joystick/gcode/vision), G=run program, X=stop");
    info!("      WASD=move, Q/E=rotate, Space=laser, R/F=speed, +/-=power, Esc=quit");

    let result = match enable_raw_mode() {
        Ok(()) => {
            let result = run_loop(&mut director, &mut joystick_feed, status_tx.as_ref()).await;
            if let Err(e) = disable_raw_mode() {
                warn!("Failed to restore the terminal: {}", e);
            }
            result
        }
        Err(e) => Err(e.into()),
    };

    // Shutdown: sources, ingest, dispatcher (after the final zero), reader,
    // telemetry
    director.shutdown();
    if let Some(client) = joystick {
        client.stop().await;
    }
    if let Some(client) = pose {
        client.stop().await;
    }
    let Link { dispatcher, reader } = link;
    if let Some(dispatcher) = dispatcher {
        dispatcher.stop();
    }
    if let Some(reader) = reader {
        reader.stop();
    }
    if let Some(tx) = status_tx {
        tx.send_replace(director.status());
        // closing the cell ends the task
        drop(tx);
    }
    if let Some(task) = telemetry_task {
        if let Err(e) = task.await {
            warn!("Telemetry task failed: {}", e);
        }
    }
    info!("Director stopped");

    result
}

async fn run_loop(
    director: &mut Director,
    joystick: &mut JoystickFeed,
    status: Option<&watch::Sender<DirectorStatus>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ticks: u64 = 0;

    while !director.should_quit() {
        tick.tick().await;
        let now = Instant::now();

        // 1. Drain keyboard input (non-blocking)
        while event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()? {
                director.on_key(key, now);
            }
        }

        // 2. Drain joystick events
        for joystick_event in joystick.poll() {
            director.on_joystick(joystick_event);
        }

        // 3. Advance the sources
        director.tick(now);

        // 4. Hand over a status snapshot (never waits on the publisher)
        if let Some(status) = status {
            if ticks % STATUS_EVERY == 0 {
                status.send_replace(director.status());
            }
        }
        ticks += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::joystick::JoystickFrame;

    struct Harness {
        director: Director,
        link: watch::Sender<LinkStatus>,
        pose: watch::Sender<Option<PoseSample>>,
        _radio: watch::Sender<RadioStatus>,
    }

    fn harness() -> Harness {
        let (link, link_rx) = watch::channel(LinkStatus::Idle);
        let (radio, radio_rx) = watch::channel(RadioStatus::Unknown);
        let (pose, pose_rx) = watch::channel(None);
        let inputs = Inputs {
            link: link_rx,
            radio: radio_rx,
            pose: pose_rx,
        };
        let director = Director::new(&DirectorConfig::default(), Arbiter::with_capacity(256), inputs);
        Harness {
            director,
            link,
            pose,
            _radio: radio,
        }
    }

    fn press(c: char) -> KeyEvent {
        KeyEvent::new(KeyCode::Char(c), KeyModifiers::NONE)
    }

    fn sent(director: &Director) -> Vec<MotionCommand> {
        director.arbiter().queue().drain()
    }

    #[test]
    fn number_keys_switch_sources() {
        let mut h = harness();
        let now = Instant::now();
        for (key, session) in ['2', '3', '4', '1'].into_iter().zip([
            ControlSession::Joystick,
            ControlSession::GCode,
            ControlSession::Vision,
            ControlSession::Manual,
        ]) {
            h.director.on_key(press(key), now);
            assert_eq!(h.director.state().session, session);
            assert_eq!(h.director.arbiter().session(), session);
        }
    }

    #[test]
    fn switching_zeroes_the_outgoing_source() {
        let mut h = harness();
        let now = Instant::now();
        h.director.on_key(press('w'), now);
        h.director.tick(now);
        assert!(sent(&h.director)[0].is_moving());

        h.director.on_key(press('2'), now);
        assert_eq!(sent(&h.director), vec![MotionCommand::stop()]);

        // manual keys do nothing while the joystick drives
        h.director.on_key(press('w'), now);
        h.director.tick(now + Duration::from_millis(10));
        assert!(sent(&h.director).is_empty());
    }

    #[test]
    fn joystick_frames_only_count_when_active() {
        let mut h = harness();
        let frame = JoystickFrame {
            x: 1.0,
            speed: Some(0.5),
            ..Default::default()
        };
        h.director.on_joystick(JoystickEvent::Frame(frame));
        assert!(sent(&h.director).is_empty());
        assert_eq!(h.director.state().speed_factor, 0.5);

        h.director.switch_source(ControlSession::Joystick, Instant::now());
        h.director.on_joystick(JoystickEvent::Frame(frame));
        h.director.on_joystick(JoystickEvent::Frame(frame));
        let cmds = sent(&h.director);
        assert_eq!(cmds.len(), 1, "repeat frame filtered");
        assert_eq!(cmds[0].x(), 0.5);

        h.director.on_joystick(JoystickEvent::Disconnected);
        assert_eq!(sent(&h.director), vec![MotionCommand::stop()]);
    }

    #[test]
    fn program_runs_from_g_key() {
        let mut h = harness();
        h.director.load_program(Program::parse("G91\nG1 X1 F600\nG1 X1"));
        let mut now = Instant::now();
        h.director.on_key(press('g'), now);
        assert_eq!(h.director.state().session, ControlSession::GCode);

        for _ in 0..200 {
            now += Duration::from_millis(10);
            h.director.tick(now);
        }
        let status = h.director.status();
        assert_eq!(status.program.position_mm, (2.0, 0.0));
        assert_eq!(status.program.executed, 3);
        assert!(sent(&h.director).iter().any(MotionCommand::is_moving));
    }

    #[test]
    fn write_failure_aborts_the_program() {
        let mut h = harness();
        h.director.load_program(Program::parse("G1 X100 F60"));
        let now = Instant::now();
        h.director.start_program(now);
        h.director.tick(now);

        h.link.send_replace(LinkStatus::WriteFailed("unplugged".into()));
        h.director.tick(now + Duration::from_millis(10));
        assert_eq!(
            h.director.status().program.state,
            crate::gcode::RunState::Stopped(crate::gcode::StopReason::TransportFailure)
        );
    }

    #[test]
    fn vision_tracks_route_with_pose() {
        let mut h = harness();
        h.director.set_route(vec![Waypoint::new(100.0, 0.0, 0.0)]);
        let now = Instant::now();
        h.director.on_key(press('4'), now);
        h.pose.send_replace(Some(PoseSample {
            tag_id: 1,
            x_mm: 0.0,
            y_mm: 0.0,
            z_mm: 0.0,
            yaw_deg: 0.0,
            timestamp: now,
        }));
        h.director.tick(now);

        let cmds = sent(&h.director);
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].x() > 0.0);
        assert_eq!(h.director.status().target, Some(Waypoint::new(100.0, 0.0, 0.0)));
    }

    #[test]
    fn emergency_stop_reaches_the_queue() {
        let mut h = harness();
        h.director.switch_source(ControlSession::Vision, Instant::now());
        sent(&h.director);
        h.director.on_key(press('x'), Instant::now());
        assert_eq!(sent(&h.director).last(), Some(&MotionCommand::stop()));
    }

    #[test]
    fn disabled_link_discards_commands() {
        let mut h = harness();
        h.director.disable_link();
        let now = Instant::now();
        h.director.on_key(press('d'), now);
        h.director.tick(now);
        assert!(sent(&h.director).is_empty());
    }

    #[test]
    fn operator_keys() {
        let mut h = harness();
        let now = Instant::now();
        h.director.on_key(press('r'), now);
        h.director.on_key(press('+'), now);
        assert_eq!(h.director.state().speed_factor, 0.6);
        assert_eq!(h.director.state().laser_power, 144);

        h.director.on_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL), now);
        assert!(h.director.should_quit());
    }

    #[test]
    fn operator_keys_act_with_info_logs_filtered() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_test_writer()
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let mut h = harness();
            let now = Instant::now();
            for key in ['r', 'r', 'f', '+', '+', '-', '='] {
                h.director.on_key(press(key), now);
            }
            assert_eq!(h.director.state().speed_factor, 0.6);
            assert_eq!(h.director.state().laser_power, 160);
        });
    }

    #[test]
    fn missing_program_file_leaves_the_director_running() {
        let mut h = harness();
        h.director
            .load_program_file(Path::new("/nonexistent/robot-director/program.gcode"));
        assert_eq!(h.director.status().program.state, crate::gcode::RunState::Idle);

        // the rest still works
        let now = Instant::now();
        h.director.on_key(press('d'), now);
        h.director.tick(now);
        assert!(sent(&h.director)[0].is_moving());
    }

    #[test]
    fn program_file_is_loaded() {
        let path = std::env::temp_dir().join(format!("robot-director-{}.gcode", std::process::id()));
        std::fs::write(&path, "G91\nG1 X1 F600\n").unwrap();
        let mut h = harness();
        h.director.load_program_file(&path);
        std::fs::remove_file(&path).unwrap();

        let progress = h.director.status().program;
        assert_eq!(progress.state, crate::gcode::RunState::Loaded);
        assert_eq!(progress.total, 2);
    }
}
