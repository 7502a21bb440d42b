// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use crate::directory::Directory;
use crate::error::Result;
use crate::frame::Frame;
use crate::state::{Phase, SessionState};

use log::*;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use std::io::{self, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long to back off when there is nobody to send a message to.
pub const EMPTY_DIRECTORY_RETRY: Duration = Duration::from_millis(10);

const WRITE_POLL_TIMEOUT_MS: libc::c_int = 100;

/// Write half of a non-blocking socket.
///
/// Writes that would block wait for the socket to become writable instead of failing.
#[derive(Debug)]
pub struct Channel {
    stream: TcpStream,
}

impl Channel {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    fn wait_writable(&self) -> io::Result<()> {
        let mut pollfd = libc::pollfd {
            fd: self.stream.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };

        // SAFETY: pollfd is a single valid entry that outlives the call.
        let res = unsafe { libc::poll(&mut pollfd, 1, WRITE_POLL_TIMEOUT_MS) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }

        Ok(())
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.stream.write(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait_writable()?,
                res => return res,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// The send half of a session.
///
/// Drives the handshake (wait for an id, log in, wait for the acknowledgement) and then sends
/// DATA frames to random logged-in sessions as fast as the channel takes them.
pub struct Sender<W> {
    channel: W,
    state: Arc<SessionState>,
    directory: Arc<Directory>,
    rng: SmallRng,
    sent: u64,
}

impl<W: Write> Sender<W> {
    pub fn new(channel: W, state: Arc<SessionState>, directory: Arc<Directory>) -> Self {
        Self {
            channel,
            state,
            directory,
            rng: SmallRng::from_entropy(),
            sent: 0,
        }
    }

    /// Run until the session closes or a write fails.
    pub fn run(&mut self) -> Result<()> {
        while !self.state.is_closed() {
            self.step()?;
        }

        debug!("Send loop finished after {} frames", self.sent);
        Ok(())
    }

    /// Advance the handshake by one step, or send one message once logged in.
    pub fn step(&mut self) -> Result<()> {
        match self.state.phase() {
            Phase::Unassigned => {
                if let Some(id) = self.state.wait_for_id() {
                    debug!("Id {id} assigned; logging in");
                }
            }
            Phase::AssignedPendingLogin => {
                self.transmit(&Frame::login(&self.state))?;
                self.state.note_login_sent();
                self.state.wait_for_login();
            }
            Phase::LoginSentAwaitingAck => {
                self.state.wait_for_login();
            }
            Phase::Active => self.send_message()?,
        }

        Ok(())
    }

    fn send_message(&mut self) -> Result<()> {
        let Some(dest) = self.directory.pick(&mut self.rng) else {
            debug!("No destinations yet; retrying");
            thread::sleep(EMPTY_DIRECTORY_RETRY);
            return Ok(());
        };

        let text = format!(
            "This is message from source with Id {} to {dest}",
            self.state.assigned_id()
        );
        self.transmit(&Frame::data(&self.state, dest, text))
    }

    /// Encode `frame` and write all of it, however many writes that takes.
    pub fn transmit(&mut self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode()?;

        let mut written = 0;
        while written < bytes.len() {
            match self.channel.write(&bytes[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    written += n;
                    if written < bytes.len() {
                        trace!("Short send: {written} of {} bytes", bytes.len());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.sent += 1;
        trace!("Sent {frame}");
        Ok(())
    }

    /// Number of frames fully written so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn into_inner(self) -> W {
        self.channel
    }
}
