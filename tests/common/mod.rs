//! Helpers shared by the integration tests: a scripted stand-in for the chat server, raw frame
//! I/O, and an output sink that records lines.

#![allow(dead_code)]

use chat_load_simulator::frame::{HEADER_LEN, LENGTH};
use chat_load_simulator::{Frame, MessageType, Output, decode};

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn frame(kind: MessageType, magic: i32, source_id: i32, dest_id: i32, payload: &str) -> Frame {
    Frame {
        magic,
        kind,
        source_id,
        dest_id,
        payload: payload.to_owned(),
    }
}

pub fn encode(frame: &Frame) -> Vec<u8> {
    frame.encode().unwrap()
}

pub fn write_frame(stream: &mut TcpStream, frame: &Frame) {
    stream.write_all(&encode(frame)).unwrap();
}

/// Read exactly one frame off a blocking stream.
pub fn read_frame(stream: &mut impl Read) -> Frame {
    let mut bytes = vec![0; HEADER_LEN];
    stream.read_exact(&mut bytes).unwrap();

    let mut len = [0; 4];
    len.copy_from_slice(&bytes[LENGTH.range()]);
    let len = i32::from_be_bytes(len) as usize;

    let mut payload = vec![0; len];
    stream.read_exact(&mut payload).unwrap();
    bytes.extend_from_slice(&payload);

    decode(&bytes).unwrap()
}

pub fn listen() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Accept one connection, giving up after `TIMEOUT`.
pub fn accept(listener: &TcpListener) -> TcpStream {
    listener.set_nonblocking(true).unwrap();
    let deadline = Instant::now() + TIMEOUT;

    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).unwrap();
                stream.set_read_timeout(Some(TIMEOUT)).unwrap();
                return stream;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "no client connected");
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("accept: {e}"),
        }
    }
}

/// Play the server side of the handshake: hand out `id`, expect a LOGIN, acknowledge it.
pub fn handshake(stream: &mut TcpStream, id: i32, magic: i32) {
    write_frame(stream, &frame(MessageType::GeneratedId, 0, 0, id, ""));

    let login = read_frame(stream);
    assert_eq!(login.kind, MessageType::Login);
    assert_eq!(login.source_id, id);
    assert_eq!(login.dest_id, 0);
    assert_eq!(login.payload, "");

    write_frame(stream, &frame(MessageType::Login, magic, 0, id, ""));
}

pub fn io_uring_available() -> bool {
    match io_uring::IoUring::new(2) {
        Ok(_) => true,
        Err(e) => {
            eprintln!("skipping: io_uring unavailable: {e}");
            false
        }
    }
}

/// Poll `cond` until it holds, failing the test after `TIMEOUT`.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[derive(Default)]
pub struct Lines(Mutex<Vec<String>>);

impl Lines {
    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Output for Lines {
    fn line(&self, line: &str) {
        self.0.lock().unwrap().push(line.to_owned());
    }
}

/// Close `stream` with an RST instead of a FIN.
pub fn reset(stream: TcpStream) {
    use std::os::fd::AsRawFd;

    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    // SAFETY: `linger` is a valid option value for the duration of the call.
    let res = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(res, 0, "setsockopt: {}", io::Error::last_os_error());
    drop(stream);
}
