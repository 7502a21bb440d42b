// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

//! Load generator for a binary-framed chat server.
//!
//! Each [`Session`] connects to the server, waits for it to hand out an id, logs in, and then
//! floods the server with DATA frames addressed to randomly chosen logged-in sessions. Sessions
//! share nothing but a [`Directory`] of logged-in ids.

pub mod directory;
pub mod error;
pub mod frame;
pub mod receive;
pub mod send;
pub mod session;
pub mod state;

pub use directory::Directory;
pub use error::{Error, FormatError, Result};
pub use frame::{Frame, FrameBuffer, MessageType, decode};
pub use receive::{Output, Readiness, Receiver, Stdout};
pub use send::{Channel, Sender};
pub use session::{Multiplexer, Session, SessionConfig};
pub use state::{Phase, SessionState};
