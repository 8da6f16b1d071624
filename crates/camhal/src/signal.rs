// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Wake-up bits for the worker loops and a one-shot completion.

use bitflags::bitflags;
use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

bitflags! {
    /// Events a worker loop can be woken with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SignalSet: u32 {
        const RELEASE = 1 << 0;
        const TERMINATE = 1 << 1;
        const REQUEST_QUEUE_NOT_EMPTY = 1 << 2;
        const OUTPUT_DONE = 1 << 3;
        const START_PROCESSING = 1 << 4;
        const DATA_READY = 1 << 5;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Accumulating signal bitset a single worker waits on.
#[derive(Debug, Default)]
pub struct Signal {
    pending: Mutex<SignalSet>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise bits and wake the waiter.
    pub fn set(&self, bits: SignalSet) {
        let mut pending = lock(&self.pending);
        pending.insert(bits);
        self.cond.notify_all();
    }

    /// Block until at least one bit is raised, then take all raised bits.
    pub fn wait(&self) -> SignalSet {
        let mut pending = lock(&self.pending);
        while pending.is_empty() {
            pending = self
                .cond
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
        std::mem::take(&mut *pending)
    }

    /// Like [`Signal::wait`] but gives up after `timeout`, returning an empty set.
    pub fn wait_timeout(&self, timeout: Duration) -> SignalSet {
        let pending = lock(&self.pending);
        let (mut pending, _) = self
            .cond
            .wait_timeout_while(pending, timeout, |p| p.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *pending)
    }

    /// Bits raised but not yet taken.
    pub fn peek(&self) -> SignalSet {
        *lock(&self.pending)
    }
}

/// One-shot event waited on during the release handshake.
#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        *lock(&self.done) = true;
        self.cond.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *lock(&self.done)
    }

    pub fn reset(&self) {
        *lock(&self.done) = false;
    }

    pub fn wait(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Returns `false` if the timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let done = lock(&self.done);
        let (done, _) = self
            .cond
            .wait_timeout_while(done, timeout, |d| !*d)
            .unwrap_or_else(PoisonError::into_inner);
        *done
    }
}
