// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::frame::{HEADER_LEN, MAX_FRAME_LEN};
use crate::receive::{Output, Readiness, Receiver, Stdout};
use crate::send::{Channel, Sender};
use crate::state::SessionState;

use io_uring::{IoUring, cqueue, opcode, types};
use log::*;

use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// user_data for poll cancellations, whose completions carry nothing of interest.
const CANCEL_TOKEN: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,

    /// Submission queue size of the io_uring each session waits on.
    pub ring_entries: u32,

    /// Largest frame a session can receive.
    pub read_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5000,
            ring_entries: 8,
            read_capacity: MAX_FRAME_LEN,
        }
    }
}

/// Waits for sockets to become readable, using a multishot poll on an io_uring.
///
/// Owns every registered socket. Dropping it cancels the outstanding polls, shuts down and
/// closes the sockets, and then closes the ring.
pub struct Multiplexer {
    ring: IoUring,
    channels: HashMap<u64, TcpStream>,
    next_token: u64,
}

impl Multiplexer {
    pub fn new(entries: u32) -> Result<Self> {
        let ring = IoUring::new(entries).map_err(Error::Multiplexer)?;
        Ok(Self {
            ring,
            channels: HashMap::new(),
            next_token: 0,
        })
    }

    /// Start watching `stream` for read-readiness. Returns the token `wait` reports it by.
    pub fn register(&mut self, stream: TcpStream) -> Result<u64> {
        let token = self.next_token;
        self.next_token += 1;

        self.submit_poll(stream.as_raw_fd(), token)?;
        debug!("Registered fd {} as channel {token}", stream.as_raw_fd());
        self.channels.insert(token, stream);

        Ok(token)
    }

    fn submit_poll(&mut self, fd: RawFd, token: u64) -> Result<()> {
        let poll = opcode::PollAdd::new(types::Fd(fd), libc::POLLIN as u32)
            .multi(true)
            .build()
            .user_data(token);

        // SAFETY: the fd belongs to a socket held in `channels` until the poll is cancelled.
        let pushed = unsafe { self.ring.submission().push(&poll) };
        pushed.map_err(|_| Error::Multiplexer(io::Error::other("submission queue is full")))
    }

    fn submit_cancel(&mut self, token: u64) {
        let cancel = opcode::PollRemove::new(token)
            .build()
            .user_data(CANCEL_TOKEN);

        // SAFETY: PollRemove references no memory.
        if unsafe { self.ring.submission().push(&cancel) }.is_err() {
            warn!("Could not queue cancellation for channel {token}");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channel(&mut self, token: u64) -> Option<&mut TcpStream> {
        self.channels.get_mut(&token)
    }

    /// Block until at least one registered channel is readable, and return the ready tokens.
    pub fn wait(&mut self) -> Result<Vec<u64>> {
        loop {
            match self.ring.submit_and_wait(1) {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Multiplexer(e)),
            }
        }

        let completions: Vec<(u64, i32, u32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result(), cqe.flags()))
            .collect();

        let mut ready = Vec::with_capacity(completions.len());
        for (token, res, flags) in completions {
            trace!("Completion for {token}: {res}");
            if token == CANCEL_TOKEN {
                continue;
            }
            let Some(stream) = self.channels.get(&token) else {
                // Poll of an already deregistered channel.
                continue;
            };
            if res < 0 {
                return Err(Error::Multiplexer(io::Error::from_raw_os_error(-res)));
            }
            if !cqueue::more(flags) {
                warn!("Multishot poll did not set MORE flag; resubmitting");
                let fd = stream.as_raw_fd();
                self.submit_poll(fd, token)?;
            }
            if !ready.contains(&token) {
                ready.push(token);
            }
        }

        Ok(ready)
    }

    /// Stop watching a channel and close it.
    pub fn deregister(&mut self, token: u64) {
        if let Some(stream) = self.channels.remove(&token) {
            self.submit_cancel(token);
            if let Err(e) = self.ring.submit() {
                warn!("Submitting cancellation for channel {token} failed: {e}");
            }
            close(token, stream);
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        let channels: Vec<_> = self.channels.drain().collect();
        for (token, stream) in channels {
            self.submit_cancel(token);
            close(token, stream);
        }

        if let Err(e) = self.ring.submit() {
            warn!("Submitting cancellations failed: {e}");
        }
        debug!("Multiplexer closed");
    }
}

fn close(token: u64, stream: TcpStream) {
    // Shutting down reaches every clone of the socket, including the sender's.
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        trace!("Shutdown of channel {token}: {e}");
    }
    debug!("Closed channel {token}");
}

/// Closes the session state when dropped, whatever path the session takes out.
struct CloseOnDrop<'a>(&'a SessionState);

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// One simulated client: a receive loop on the calling thread and a send thread.
pub struct Session {
    name: String,
    config: SessionConfig,
    state: Arc<SessionState>,
    directory: Arc<Directory>,
    output: Arc<dyn Output>,
}

impl Session {
    pub fn new(name: impl Into<String>, config: SessionConfig, directory: Arc<Directory>) -> Self {
        Self {
            name: name.into(),
            config,
            state: Arc::new(SessionState::new()),
            directory,
            output: Arc::new(Stdout),
        }
    }

    pub fn with_output(mut self, output: Arc<dyn Output>) -> Self {
        self.output = output;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Run the session to completion, reporting rather than returning any error.
    pub fn initiate(&self) {
        match self.run() {
            Ok(()) => info!("{}: session ended", self.name),
            Err(e) => error!("{}: session failed: {e}", self.name),
        }
    }

    /// Connect, start the send thread, and serve read events until the connection closes.
    pub fn run(&self) -> Result<()> {
        let _close = CloseOnDrop(&self.state);

        if self.config.read_capacity < HEADER_LEN {
            return Err(Error::Config(format!(
                "read capacity {} is smaller than a {HEADER_LEN} byte header",
                self.config.read_capacity
            )));
        }

        let stream = self.connect()?;
        stream.set_nonblocking(true)?;
        let send_stream = stream.try_clone()?;

        let mut mux = Multiplexer::new(self.config.ring_entries)?;
        mux.register(stream)?;

        let sender = self.spawn_sender(send_stream)?;
        let result = self.receive_loop(&mut mux);

        drop(mux);
        self.state.close();
        if sender.join().is_err() {
            error!("{}: send thread panicked", self.name);
        }

        result
    }

    fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        let started = Instant::now();
        let resolved: Vec<SocketAddr> = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|source| Error::Connect {
                addr: addr.clone(),
                source,
            })?
            .collect();
        self.directory.record_latency(&self.name, started.elapsed());

        let stream = TcpStream::connect(&resolved[..])
            .map_err(|source| Error::Connect {
                addr: addr.clone(),
                source,
            })?;
        info!("{}: connected to {addr}", self.name);

        Ok(stream)
    }

    fn spawn_sender(&self, stream: TcpStream) -> Result<JoinHandle<()>> {
        let shutdown = stream.try_clone()?;
        let mut sender = Sender::new(
            Channel::new(stream),
            self.state.clone(),
            self.directory.clone(),
        );
        let state = self.state.clone();
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(format!("{}-send", self.name))
            .spawn(move || {
                match sender.run() {
                    Ok(()) => {}
                    // The receive side already closed the socket under us.
                    Err(e) if state.is_closed() => {
                        debug!("{name}: send stopped after {} frames: {e}", sender.sent());
                    }
                    Err(e) => {
                        error!("{name}: send failed after {} frames: {e}", sender.sent());
                        state.close();
                        let _ = shutdown.shutdown(Shutdown::Both);
                    }
                }
            })?;

        Ok(handle)
    }

    fn receive_loop(&self, mux: &mut Multiplexer) -> Result<()> {
        let mut receiver = Receiver::new(
            self.state.clone(),
            self.directory.clone(),
            self.output.clone(),
            self.config.read_capacity,
        );

        while !mux.is_empty() {
            for token in mux.wait()? {
                let Some(channel) = mux.channel(token) else {
                    continue;
                };
                if receiver.on_readable(channel)? == Readiness::Closed {
                    info!("{}: connection closed", self.name);
                    mux.deregister(token);
                }
            }
        }

        Ok(())
    }
}
