// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

//! Identity and login flags of one session, shared by its receive and send threads.

use log::*;
use parking_lot::{Condvar, Mutex};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// `assigned_id` before the server has handed one out.
pub const UNASSIGNED: i32 = 0;

/// Where a session is in its handshake. Phases only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Unassigned,
    AssignedPendingLogin,
    LoginSentAwaitingAck,
    Active,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Unassigned => "unassigned",
            Self::AssignedPendingLogin => "assigned, pending login",
            Self::LoginSentAwaitingAck => "login sent, awaiting ack",
            Self::Active => "active",
        };
        f.write_str(s)
    }
}

/// Per-session state.
///
/// Every flag is set at most once and never reverts. The flags are atomics so they can be read
/// without locking; writers that a waiter may be blocked on take `lock` and notify `signal`
/// before releasing it, so a waiter that re-checks under the lock never misses a wakeup.
#[derive(Debug, Default)]
pub struct SessionState {
    assigned_id: AtomicI32,
    magic: AtomicI32,
    login_sent: AtomicBool,
    logged_in: AtomicBool,
    closed: AtomicBool,

    lock: Mutex<()>,
    signal: Condvar,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assigned_id(&self) -> i32 {
        self.assigned_id.load(Ordering::Acquire)
    }

    pub fn magic(&self) -> i32 {
        self.magic.load(Ordering::Acquire)
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> Phase {
        if self.is_logged_in() {
            Phase::Active
        } else if self.login_sent.load(Ordering::Acquire) {
            Phase::LoginSentAwaitingAck
        } else if self.assigned_id() != UNASSIGNED {
            Phase::AssignedPendingLogin
        } else {
            Phase::Unassigned
        }
    }

    /// Record the id the server generated for this session.
    ///
    /// Returns false, leaving the state untouched, if an id was already assigned or `id` is the
    /// unassigned sentinel.
    pub fn assign_id(&self, id: i32) -> bool {
        if id == UNASSIGNED {
            warn!("Ignoring assignment of the unassigned id");
            return false;
        }

        let _guard = self.lock.lock();
        match self
            .assigned_id
            .compare_exchange(UNASSIGNED, id, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.signal.notify_all();
                true
            }
            Err(current) => {
                warn!("Already assigned id {current}; ignoring {id}");
                false
            }
        }
    }

    pub fn note_login_sent(&self) {
        self.login_sent.store(true, Ordering::Release);
    }

    /// Mark the session logged in with the server-issued `magic`.
    ///
    /// `publish` runs with the assigned id before any waiter is woken, so whatever it makes
    /// visible is visible to the send thread once it leaves [`wait_for_login`]. Nothing is
    /// published if no id has been assigned. Returns false if the session was already logged in.
    ///
    /// [`wait_for_login`]: SessionState::wait_for_login
    pub fn complete_login(&self, magic: i32, publish: impl FnOnce(i32)) -> bool {
        let _guard = self.lock.lock();
        if self.is_logged_in() {
            warn!("Duplicate login acknowledgement (magic {magic}) ignored");
            return false;
        }

        self.magic.store(magic, Ordering::Release);
        self.logged_in.store(true, Ordering::Release);

        match self.assigned_id() {
            UNASSIGNED => warn!("Logged in before an id was assigned; not publishing"),
            id => publish(id),
        }

        self.signal.notify_all();
        true
    }

    /// Stop the session. Wakes every waiter.
    pub fn close(&self) {
        let _guard = self.lock.lock();
        self.closed.store(true, Ordering::Release);
        self.signal.notify_all();
    }

    /// Block until an id is assigned. Returns `None` if the session closes first.
    pub fn wait_for_id(&self) -> Option<i32> {
        let mut guard = self.lock.lock();
        loop {
            if self.is_closed() {
                return None;
            }
            match self.assigned_id() {
                UNASSIGNED => self.signal.wait(&mut guard),
                id => return Some(id),
            }
        }
    }

    /// Block until the login acknowledgement arrives. Returns false if the session closes first.
    pub fn wait_for_login(&self) -> bool {
        let mut guard = self.lock.lock();
        loop {
            if self.is_logged_in() {
                return true;
            }
            if self.is_closed() {
                return false;
            }
            self.signal.wait(&mut guard);
        }
    }
}
