// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

//! Registry shared by every session in the process.

use dashmap::DashMap;
use log::*;
use parking_lot::RwLock;
use rand::Rng;
use rand::seq::SliceRandom;

use std::time::Duration;

/// Ids of sessions that have logged in, plus how long each session took to resolve the server
/// address.
///
/// Receive threads append to the destination list on login; send threads pick message targets
/// from it. The list only grows.
#[derive(Debug, Default)]
pub struct Directory {
    destinations: RwLock<Vec<i32>>,
    latencies: DashMap<String, u64>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: i32) {
        let mut destinations = self.destinations.write();
        destinations.push(id);
        debug!("Registered destination {id} ({} total)", destinations.len());
    }

    pub fn len(&self) -> usize {
        self.destinations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn destinations(&self) -> Vec<i32> {
        self.destinations.read().clone()
    }

    /// A destination chosen uniformly at random, or `None` while nobody has logged in.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<i32> {
        self.destinations.read().choose(rng).copied()
    }

    pub fn record_latency(&self, session: &str, elapsed: Duration) {
        self.latencies
            .insert(session.to_owned(), elapsed.as_millis() as u64);
    }

    /// Milliseconds `session` spent resolving the server address.
    pub fn latency(&self, session: &str) -> Option<u64> {
        self.latencies.get(session).map(|ms| *ms)
    }

    /// All recorded latencies, sorted by session name.
    pub fn latencies(&self) -> Vec<(String, u64)> {
        let mut all: Vec<_> = self
            .latencies
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        all.sort();
        all
    }
}
