//! Integration tests for the producer/coordinator handshake.
//!
//! The test thread plays the producer: it publishes ranges by hand and waits for the
//! coordinator to answer before checking the reported floor.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use apdcam_daq::coordinator::CoordinatorState;
use apdcam_daq::handshake::FloorWait;
use apdcam_daq::processor::{Processor, ShotCursor};
use apdcam_daq::{AcquisitionSession, ChannelBufferSet, Handshake, InProcessBackend, ShotRange};
use parking_lot::Mutex;

const TIMEOUT: Duration = Duration::from_secs(5);

type CallLog = Arc<Mutex<Vec<(String, ShotRange)>>>;

/// Processor returning scripted floors (or failures), recording every call.
struct Scripted {
    name: String,
    script: VecDeque<Result<u64, &'static str>>,
    log: CallLog,
    cursor: ShotCursor,
}

impl Scripted {
    fn boxed(
        name: &str,
        script: Vec<Result<u64, &'static str>>,
        log: &CallLog,
    ) -> Box<dyn Processor> {
        Box::new(Self {
            name: name.to_string(),
            script: script.into(),
            log: log.clone(),
            cursor: ShotCursor::new(),
        })
    }
}

impl Processor for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, _: &ChannelBufferSet) -> anyhow::Result<()> {
        self.cursor.reset();
        Ok(())
    }

    fn run(&mut self, _: &ChannelBufferSet, range: ShotRange) -> anyhow::Result<u64> {
        self.log.lock().push((self.name.clone(), range));
        match self.script.pop_front() {
            Some(Ok(floor)) => {
                self.cursor.advance(range.to);
                Ok(floor)
            }
            Some(Err(message)) => anyhow::bail!(message),
            None => Ok(self.cursor.advance(range.to)),
        }
    }

    fn cursor(&self) -> u64 {
        self.cursor.next()
    }
}

/// Processor that parks inside `run` until the test releases it.
struct Gate {
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
    floor: u64,
    log: CallLog,
    cursor: ShotCursor,
}

impl Processor for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    fn run(&mut self, _: &ChannelBufferSet, range: ShotRange) -> anyhow::Result<u64> {
        self.log.lock().push(("gate".to_string(), range));
        self.entered.send(())?;
        self.release.recv()?;
        self.cursor.advance(range.to);
        Ok(self.floor)
    }

    fn cursor(&self) -> u64 {
        self.cursor.next()
    }
}

fn session() -> (AcquisitionSession, Arc<Handshake>) {
    let handshake = Arc::new(Handshake::new());
    let buffers = ChannelBufferSet::allocate(16, &[0, 1, 9], 128).unwrap();
    let backend = InProcessBackend::new(buffers, handshake.clone());
    (AcquisitionSession::new(Arc::new(backend)), handshake)
}

fn publish_and_wait(handshake: &Handshake, range: ShotRange) -> u64 {
    handshake.publish(range);
    match handshake.wait_until_drained(TIMEOUT) {
        FloorWait::Reached(floor) => floor,
        other => panic!("range {range} not processed: {other:?}"),
    }
}

#[test]
fn test_two_processors_report_minimum_floor() {
    let log = CallLog::default();
    let (mut session, handshake) = session();
    session
        .register_processor(Scripted::boxed("a", vec![Ok(5)], &log))
        .unwrap();
    session
        .register_processor(Scripted::boxed("b", vec![Ok(3)], &log))
        .unwrap();
    session.start(false).unwrap();
    assert_eq!(session.state(), CoordinatorState::Running);

    assert_eq!(publish_and_wait(&handshake, ShotRange::new(0, 10)), 3);

    session.stop(true).unwrap();
    assert_eq!(session.state(), CoordinatorState::Stopped);
    assert_eq!(session.stats().last_floor, 3);

    // Registration order is execution order, both saw the same range.
    let calls = log.lock().clone();
    assert_eq!(
        calls,
        vec![
            ("a".to_string(), ShotRange::new(0, 10)),
            ("b".to_string(), ShotRange::new(0, 10)),
        ]
    );
}

#[test]
fn test_zero_processors_never_start_coordinator() {
    let (mut session, handshake) = session();
    session.start(false).unwrap();

    let status = session.status();
    assert_eq!(status.state, CoordinatorState::Idle);
    assert!(!status.coordinator_alive);

    handshake.publish(ShotRange::new(0, 10));
    assert_eq!(
        handshake.wait_for_floor(1, Duration::from_millis(50)),
        FloorWait::TimedOut
    );
    assert_eq!(handshake.iterations(), 0);
    session.stop(true).unwrap();
}

#[test]
fn test_stop_during_second_of_three_processors() {
    let log = CallLog::default();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();

    let (mut session, handshake) = session();
    session
        .register_processor(Scripted::boxed("first", vec![Ok(8)], &log))
        .unwrap();
    session
        .register_processor(Box::new(Gate {
            entered: entered_tx,
            release: release_rx,
            floor: 6,
            log: log.clone(),
            cursor: ShotCursor::new(),
        }))
        .unwrap();
    session
        .register_processor(Scripted::boxed("third", vec![Ok(1)], &log))
        .unwrap();
    session.start(false).unwrap();

    handshake.publish(ShotRange::new(0, 10));
    entered_rx.recv_timeout(TIMEOUT).unwrap();

    // Processor 2 is running: raise stop, then let it complete.
    handshake.request_stop();
    release_tx.send(()).unwrap();
    session.await_finish().unwrap();

    assert_eq!(session.state(), CoordinatorState::Stopped);
    let names: Vec<_> = log.lock().iter().map(|(name, _)| name.clone()).collect();
    assert_eq!(names, vec!["first", "gate"]);

    // The processors that ran still had their floor reported.
    assert_eq!(handshake.floor(), 6);
    assert_eq!(handshake.iterations(), 1);

    // Nothing runs after stop, whatever the producer publishes.
    handshake.publish(ShotRange::new(10, 20));
    assert_eq!(log.lock().len(), 2);
}

#[test]
fn test_failing_processor_keeps_previous_floor() {
    let log = CallLog::default();
    let (mut session, handshake) = session();
    session
        .register_processor(Scripted::boxed(
            "flaky",
            vec![Ok(4), Err("detector saturated"), Ok(26)],
            &log,
        ))
        .unwrap();
    session
        .register_processor(Scripted::boxed("steady", vec![], &log))
        .unwrap();
    let mut diagnostics = session.take_diagnostics().unwrap();
    session.start(false).unwrap();

    assert_eq!(publish_and_wait(&handshake, ShotRange::new(0, 10)), 4);
    // "flaky" fails: its floor from the first iteration still holds.
    assert_eq!(publish_and_wait(&handshake, ShotRange::new(4, 20)), 4);
    assert_eq!(publish_and_wait(&handshake, ShotRange::new(4, 30)), 26);

    session.stop(true).unwrap();

    // "steady" ran in every iteration regardless.
    let steady = log.lock().iter().filter(|(name, _)| name == "steady").count();
    assert_eq!(steady, 3);

    let stats = session.stats();
    assert_eq!(stats.iterations, 3);
    assert_eq!(stats.failures, 1);

    let failure = diagnostics.try_recv().unwrap();
    assert_eq!(failure.processor, "flaky");
    assert_eq!(failure.iteration, 2);
    assert_eq!(failure.range, ShotRange::new(4, 20));
    assert!(failure.message.contains("detector saturated"));
    assert!(diagnostics.try_recv().is_err());
}

#[test]
fn test_reported_floor_never_decreases() {
    let log = CallLog::default();
    let (mut session, handshake) = session();
    session
        .register_processor(Scripted::boxed("retro", vec![Ok(10), Ok(5), Ok(12)], &log))
        .unwrap();
    session.start(false).unwrap();

    assert_eq!(publish_and_wait(&handshake, ShotRange::new(0, 20)), 10);
    assert_eq!(publish_and_wait(&handshake, ShotRange::new(10, 30)), 10);
    assert_eq!(session.stats().last_floor, 10);
    assert_eq!(publish_and_wait(&handshake, ShotRange::new(10, 40)), 12);

    session.stop(true).unwrap();
}

#[test]
fn test_session_can_be_restarted() {
    let log = CallLog::default();
    let (mut session, handshake) = session();
    session
        .register_processor(Scripted::boxed("p", vec![], &log))
        .unwrap();

    session.start(false).unwrap();
    assert_eq!(publish_and_wait(&handshake, ShotRange::new(0, 50)), 50);
    session.stop(true).unwrap();

    // A new session resets the handshake and the processor cursors.
    session.start(false).unwrap();
    assert_eq!(handshake.floor(), 0);
    assert_eq!(publish_and_wait(&handshake, ShotRange::new(0, 8)), 8);
    session.stop(true).unwrap();

    assert_eq!(log.lock().len(), 2);
}
