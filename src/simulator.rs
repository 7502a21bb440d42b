// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use chat_load_simulator::frame::{HEADER_LEN, MAX_FRAME_LEN};
use chat_load_simulator::{Directory, Session, SessionConfig};
use clap::Parser;
use log::*;

use std::io::{self, BufRead};
use std::sync::Arc;

#[derive(Parser)]
struct Args {
    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(short, long, default_value_t = 5000)]
    port: u16,

    /// Number of sessions to open. Read from stdin when not given.
    #[arg(short = 'n', long)]
    sessions: Option<usize>,

    #[arg(long, default_value_t = 8)]
    entries_in_ring: u32,

    #[arg(long, default_value_t = MAX_FRAME_LEN, value_parser = parse_buf_size)]
    buf_size: usize,
}

fn main() -> io::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let sessions = match args.sessions {
        Some(n) => n,
        None => read_session_count()?,
    };

    let config = SessionConfig {
        host: args.host,
        port: args.port,
        ring_entries: args.entries_in_ring,
        read_capacity: args.buf_size,
    };
    let directory = Arc::new(Directory::new());

    info!(
        "Starting {sessions} sessions against {}:{}",
        config.host, config.port
    );

    let mut join_handles = Vec::with_capacity(sessions);
    for i in 0..sessions {
        let name = format!("session-{i}");
        let config = config.clone();
        let directory = directory.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || Session::new(name, config, directory).initiate())?;
        join_handles.push(handle);
    }

    for handle in join_handles {
        if handle.join().is_err() {
            error!("A session thread panicked");
        }
    }

    for (session, ms) in directory.latencies() {
        debug!("{session}: resolved server address in {ms} ms");
    }

    Ok(())
}

fn parse_buf_size(s: &str) -> Result<usize, String> {
    let size: usize = s.parse().map_err(|e| format!("{e}"))?;
    if size < HEADER_LEN {
        return Err(format!("must be at least {HEADER_LEN} bytes to hold a frame header"));
    }
    Ok(size)
}

fn read_session_count() -> io::Result<usize> {
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    line.trim().parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("expected a number of sessions, got {:?}", line.trim()),
        )
    })
}
