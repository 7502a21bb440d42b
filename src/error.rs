// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use std::io;

use thiserror::Error;

/// A frame could not be decoded or encoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("unknown message type code {0:?}")]
    UnknownType([u8; 2]),

    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("negative payload length {0}")]
    NegativeLength(i32),

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },
}

/// Everything that can end a session.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("multiplexer: {0}")]
    Multiplexer(io::Error),

    #[error("format: {0}")]
    Format(#[from] FormatError),
}

pub type Result<T> = std::result::Result<T, Error>;
