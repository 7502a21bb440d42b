// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use crate::directory::Directory;
use crate::error::Result;
use crate::frame::{Frame, FrameBuffer, MessageType};
use crate::state::SessionState;

use log::*;

use std::io::{self, Read, Write};
use std::sync::Arc;

/// Line-oriented surface for what a human running the simulator wants to see.
pub trait Output: Send + Sync {
    fn line(&self, line: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stdout;

impl Output for Stdout {
    fn line(&self, line: &str) {
        let _ = writeln!(io::stdout().lock(), "{line}");
    }
}

/// Whether a channel is still usable after handling a readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Open,
    Closed,
}

/// The receive half of a session: turns readable bytes into state changes.
pub struct Receiver {
    state: Arc<SessionState>,
    directory: Arc<Directory>,
    output: Arc<dyn Output>,
    frames: FrameBuffer,
    scratch: Vec<u8>,
}

impl Receiver {
    pub fn new(
        state: Arc<SessionState>,
        directory: Arc<Directory>,
        output: Arc<dyn Output>,
        capacity: usize,
    ) -> Self {
        Self {
            state,
            directory,
            output,
            frames: FrameBuffer::new(capacity),
            scratch: vec![0; capacity],
        }
    }

    /// Drain everything `channel` has to offer and act on each complete frame.
    ///
    /// `channel` is expected to be non-blocking: the call returns once a read reports
    /// `WouldBlock`. A zero-length read means the peer hung up. Frames that fail to decode are
    /// reported and skipped; only I/O errors are returned.
    pub fn on_readable<R: Read>(&mut self, channel: &mut R) -> Result<Readiness> {
        loop {
            match channel.read(&mut self.scratch) {
                Ok(0) => {
                    debug!("Peer closed the connection");
                    return Ok(Readiness::Closed);
                }
                Ok(n) => {
                    trace!("Read {n} bytes");
                    self.frames.extend(&self.scratch[..n]);
                    self.drain_frames();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Readiness::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn drain_frames(&mut self) {
        while let Some(decoded) = self.frames.next_frame() {
            match decoded {
                Ok(frame) => self.dispatch(frame),
                Err(e) => warn!("Dropping frame: {e}"),
            }
        }

        if self.frames.pending() > 0 {
            trace!("{} bytes of a partial frame buffered", self.frames.pending());
        }
    }

    pub fn dispatch(&self, frame: Frame) {
        debug!("Received {frame}");

        match frame.kind {
            MessageType::Data => {
                self.output
                    .line(&format!("{} says: {}", frame.source_id, frame.payload));
            }
            MessageType::Login => {
                let directory = &self.directory;
                if self
                    .state
                    .complete_login(frame.magic, |id| directory.register(id))
                {
                    info!(
                        "Logged in as {} with magic {}",
                        self.state.assigned_id(),
                        frame.magic
                    );
                }
            }
            MessageType::GeneratedId => {
                if self.state.assign_id(frame.dest_id) {
                    info!("Assigned id {}", frame.dest_id);
                    self.output.line(&format!(
                        "=======> YOU HAVE BEEN ASSIGNED THIS ID: {}",
                        frame.dest_id
                    ));
                }
            }
            MessageType::Logout => {
                warn!("Ignoring LOGOUT from {}", frame.source_id);
            }
        }
    }
}
