// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

//! The fixed-width binary frame spoken by the chat server.
//!
//! Every frame is an 18 byte header followed by `length` bytes of text. All integers are
//! big-endian `i32`s. The header layout lives in [`SCHEMA`], which both [`Frame::encode`] and
//! [`decode`] read from.

use crate::error::FormatError;
use crate::state::SessionState;

use std::fmt;
use std::ops::Range;

/// Destination id used for frames addressed to the server itself.
pub const SERVER_ID: i32 = 0;

/// Size of the receive buffer, and so the largest frame a session accepts.
pub const MAX_FRAME_LEN: usize = 256 * 256;

/// One fixed-width header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub width: usize,
}

impl Field {
    const fn new(name: &'static str, offset: usize, width: usize) -> Self {
        Self {
            name,
            offset,
            width,
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.width
    }
}

pub const MAGIC: Field = Field::new("magic", 0, 4);
pub const TYPE: Field = Field::new("type", 4, 2);
pub const SOURCE_ID: Field = Field::new("source_id", 6, 4);
pub const DEST_ID: Field = Field::new("dest_id", 10, 4);
pub const LENGTH: Field = Field::new("length", 14, 4);

/// Header fields in wire order.
pub const SCHEMA: [Field; 5] = [MAGIC, TYPE, SOURCE_ID, DEST_ID, LENGTH];

pub const HEADER_LEN: usize = 18;

// The fields must tile the header with no gaps.
const _: () = {
    let mut end = 0;
    let mut i = 0;
    while i < SCHEMA.len() {
        assert!(SCHEMA[i].offset == end);
        end += SCHEMA[i].width;
        i += 1;
    }
    assert!(end == HEADER_LEN);
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Login,
    Logout,
    GeneratedId,
    Data,
}

impl MessageType {
    pub const ALL: [MessageType; 4] = [
        MessageType::Login,
        MessageType::Logout,
        MessageType::GeneratedId,
        MessageType::Data,
    ];

    /// The two ASCII bytes that identify this type on the wire.
    pub fn code(self) -> &'static [u8; 2] {
        match self {
            Self::Login => b"LI",
            Self::Logout => b"LO",
            Self::GeneratedId => b"ID",
            Self::Data => b"DT",
        }
    }

    pub fn from_code(code: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Login => write!(f, "LOGIN"),
            Self::Logout => write!(f, "LOGOUT"),
            Self::GeneratedId => write!(f, "GENERATED_ID"),
            Self::Data => write!(f, "DATA"),
        }
    }
}

/// One protocol message.
///
/// The length field is not stored; it is always the byte length of `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub magic: i32,
    pub kind: MessageType,
    pub source_id: i32,
    pub dest_id: i32,
    pub payload: String,
}

impl Frame {
    /// A login request from the session to the server.
    pub fn login(state: &SessionState) -> Self {
        Self::to_server(MessageType::Login, state)
    }

    /// A logout request. Nothing sends this yet, the server accepts it though.
    pub fn logout(state: &SessionState) -> Self {
        Self::to_server(MessageType::Logout, state)
    }

    /// A chat message from this session to `dest_id`.
    pub fn data(state: &SessionState, dest_id: i32, text: impl Into<String>) -> Self {
        Self {
            magic: state.magic(),
            kind: MessageType::Data,
            source_id: state.assigned_id(),
            dest_id,
            payload: text.into(),
        }
    }

    fn to_server(kind: MessageType, state: &SessionState) -> Self {
        Self {
            magic: state.magic(),
            kind,
            source_id: state.assigned_id(),
            dest_id: SERVER_ID,
            payload: String::new(),
        }
    }

    pub fn length(&self) -> usize {
        self.payload.len()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.length()
    }

    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let length = i32::try_from(self.length()).map_err(|_| FormatError::Oversized {
            len: self.length(),
            max: i32::MAX as usize,
        })?;

        let mut bytes = vec![0; HEADER_LEN];
        write_i32(&mut bytes, MAGIC, self.magic);
        bytes[TYPE.range()].copy_from_slice(self.kind.code());
        write_i32(&mut bytes, SOURCE_ID, self.source_id);
        write_i32(&mut bytes, DEST_ID, self.dest_id);
        write_i32(&mut bytes, LENGTH, length);
        bytes.extend_from_slice(self.payload.as_bytes());

        Ok(bytes)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} ({} bytes)",
            self.kind,
            self.source_id,
            self.dest_id,
            self.length()
        )
    }
}

fn write_i32(bytes: &mut [u8], field: Field, value: i32) {
    debug_assert_eq!(field.width, 4, "{} is not an i32 field", field.name);
    bytes[field.range()].copy_from_slice(&value.to_be_bytes());
}

fn read_i32(bytes: &[u8], field: Field) -> i32 {
    debug_assert_eq!(field.width, 4, "{} is not an i32 field", field.name);
    let mut raw = [0; 4];
    raw.copy_from_slice(&bytes[field.range()]);
    i32::from_be_bytes(raw)
}

/// Decode the frame at the start of `bytes`.
///
/// Bytes past the declared payload length are ignored. No reassembly happens here, see
/// [`FrameBuffer`] for that.
pub fn decode(bytes: &[u8]) -> Result<Frame, FormatError> {
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::Truncated {
            needed: HEADER_LEN,
            available: bytes.len(),
        });
    }

    let code = &bytes[TYPE.range()];
    let kind = MessageType::from_code(code).ok_or(FormatError::UnknownType([code[0], code[1]]))?;

    let declared = read_i32(bytes, LENGTH);
    let length = usize::try_from(declared).map_err(|_| FormatError::NegativeLength(declared))?;

    let end = HEADER_LEN + length;
    if bytes.len() < end {
        return Err(FormatError::Truncated {
            needed: end,
            available: bytes.len(),
        });
    }

    Ok(Frame {
        magic: read_i32(bytes, MAGIC),
        kind,
        source_id: read_i32(bytes, SOURCE_ID),
        dest_id: read_i32(bytes, DEST_ID),
        payload: String::from_utf8_lossy(&bytes[HEADER_LEN..end]).into_owned(),
    })
}

/// Reassembles frames out of a TCP byte stream.
///
/// Bytes are appended as they arrive. Complete frames are split off the front; an incomplete
/// trailing frame stays buffered until the rest of it shows up.
#[derive(Debug)]
pub struct FrameBuffer {
    pending: Vec<u8>,

    /// Largest frame, header included, that will be accepted.
    capacity: usize,

    /// Bytes of an oversized frame still to arrive, dropped as they do.
    discard: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= HEADER_LEN);
        Self {
            pending: Vec::with_capacity(capacity),
            capacity,
            discard: 0,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        let skip = self.discard.min(bytes.len());
        self.discard -= skip;
        self.pending.extend_from_slice(&bytes[skip..]);
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Split the next complete frame off the buffer.
    ///
    /// Returns `None` when more bytes are needed. A frame with an unknown type code, or one too
    /// large for the buffer, is consumed and reported as an error; an oversized frame is skipped
    /// as its remaining bytes arrive. Either way the frames behind it are kept. Only a negative
    /// length loses the frame boundary, in which case everything buffered is dropped.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FormatError>> {
        if self.pending.len() < HEADER_LEN {
            return None;
        }

        let declared = read_i32(&self.pending, LENGTH);
        let Ok(length) = usize::try_from(declared) else {
            self.pending.clear();
            return Some(Err(FormatError::NegativeLength(declared)));
        };

        let total = HEADER_LEN + length;
        if total > self.capacity {
            let buffered = self.pending.len().min(total);
            self.pending.drain(..buffered);
            self.discard = total - buffered;
            return Some(Err(FormatError::Oversized {
                len: length,
                max: self.capacity - HEADER_LEN,
            }));
        }

        if self.pending.len() < total {
            return None;
        }

        let frame = decode(&self.pending[..total]);
        self.pending.drain(..total);
        Some(frame)
    }
}
