mod common;

use chat_load_simulator::{Directory, Error, MessageType, Phase, Sender, SessionState};
use common::{read_frame, wait_until};

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::thread;

/// A channel that accepts `limit` bytes and then fails like a reset connection.
#[derive(Clone)]
struct Wire {
    bytes: Arc<Mutex<Vec<u8>>>,
    limit: usize,
    max_write: usize,
}

impl Wire {
    fn new(limit: usize, max_write: usize) -> Self {
        Self {
            bytes: Arc::default(),
            limit,
            max_write,
        }
    }

    fn len(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    fn frames(&self) -> Vec<chat_load_simulator::Frame> {
        let bytes = self.bytes.lock().unwrap().clone();
        let mut input: &[u8] = &bytes;
        let mut frames = Vec::new();
        while !input.is_empty() {
            frames.push(read_frame(&mut input));
        }
        frames
    }
}

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self.bytes.lock().unwrap();
        let room = self.limit - bytes.len();
        if room == 0 {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        let n = buf.len().min(room).min(self.max_write);
        bytes.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn active_state(id: i32, magic: i32) -> Arc<SessionState> {
    let state = Arc::new(SessionState::new());
    state.assign_id(id);
    state.complete_login(magic, |_| {});
    state
}

#[test]
fn messages_go_to_the_only_destination() {
    let state = active_state(7, 777);
    let directory = Arc::new(Directory::new());
    directory.register(5);

    let wire = Wire::new(usize::MAX, usize::MAX);
    let mut sender = Sender::new(wire.clone(), state, directory);
    for _ in 0..50 {
        sender.step().unwrap();
    }
    assert_eq!(sender.sent(), 50);

    let frames = wire.frames();
    assert_eq!(frames.len(), 50);
    for frame in frames {
        assert_eq!(frame.kind, MessageType::Data);
        assert_eq!(frame.dest_id, 5);
        assert_eq!(frame.source_id, 7);
        assert_eq!(frame.magic, 777);
        assert!(frame.payload.contains('5'));
    }
}

#[test]
fn short_writes_are_completed() {
    let state = active_state(7, 1);
    let directory = Arc::new(Directory::new());
    directory.register(9);

    let wire = Wire::new(usize::MAX, 3);
    let mut sender = Sender::new(wire.clone(), state, directory);
    sender.step().unwrap();
    sender.step().unwrap();

    let frames = wire.frames();
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.dest_id == 9));
}

#[test]
fn empty_directory_is_retried_not_fatal() {
    let state = active_state(7, 1);
    let directory = Arc::new(Directory::new());

    let wire = Wire::new(usize::MAX, usize::MAX);
    let mut sender = Sender::new(wire.clone(), state, directory.clone());
    sender.step().unwrap();
    assert_eq!(wire.len(), 0);

    directory.register(3);
    sender.step().unwrap();
    assert_eq!(wire.frames()[0].dest_id, 3);
}

#[test]
fn handshake_then_flood_until_the_wire_breaks() {
    let state = Arc::new(SessionState::new());
    let directory = Arc::new(Directory::new());
    let wire = Wire::new(64 * 1024, usize::MAX);

    let send_thread = {
        let mut sender = Sender::new(wire.clone(), state.clone(), directory.clone());
        thread::spawn(move || sender.run())
    };

    // Nothing is sent before the server assigns an id.
    thread::sleep(std::time::Duration::from_millis(20));
    assert_eq!(wire.len(), 0);
    assert_eq!(state.phase(), Phase::Unassigned);

    state.assign_id(42);
    wait_until("login request", || {
        state.phase() == Phase::LoginSentAwaitingAck
    });
    let frames = wire.frames();
    let login = &frames[0];
    assert_eq!(login.kind, MessageType::Login);
    assert_eq!(login.source_id, 42);
    assert_eq!(login.dest_id, 0);

    state.complete_login(777, |id| directory.register(id));

    let result = send_thread.join().unwrap();
    assert!(matches!(result, Err(Error::Io(e)) if e.kind() == io::ErrorKind::ConnectionReset));

    // The last frame may be cut short by the failing wire; every complete one is DATA to 42.
    let bytes = wire.bytes.lock().unwrap().clone();
    let mut input: &[u8] = &bytes[common::encode(login).len()..];
    let mut data = 0;
    while let Ok(frame) = chat_load_simulator::decode(input) {
        assert_eq!(frame.kind, MessageType::Data);
        assert_eq!(frame.dest_id, 42);
        assert_eq!(frame.magic, 777);
        input = &input[frame.encoded_len()..];
        data += 1;
    }
    assert!(data > 0);
}

#[test]
fn closing_stops_the_send_loop() {
    let state = Arc::new(SessionState::new());
    let directory = Arc::new(Directory::new());
    let wire = Wire::new(usize::MAX, usize::MAX);

    let send_thread = {
        let mut sender = Sender::new(wire.clone(), state.clone(), directory);
        thread::spawn(move || sender.run())
    };

    state.assign_id(1);
    wait_until("login request", || {
        state.phase() == Phase::LoginSentAwaitingAck
    });
    state.close();

    assert!(send_thread.join().unwrap().is_ok());
    assert_eq!(wire.frames().len(), 1);
}
