//! Single-slot hand-off between one producer and one consumer.
//!
//! A [`Handoff`] holds at most one value. The producer blocks while the slot
//! is occupied and the consumer blocks while it is empty, so producer and
//! consumer strictly alternate. Values move through the slot; neither side
//! ever sees a partially written value.
//!
//! Blocking waits are sliced so they notice a cancelled [`ShutdownToken`]
//! and return [`BridgeError::Terminated`] instead of hanging.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::shutdown::ShutdownToken;

const WAIT_SLICE: Duration = Duration::from_millis(50);

pub struct Handoff<T> {
    slot: Mutex<Option<T>>,
    changed: Condvar,
}

impl<T> Handoff<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            changed: Condvar::new(),
        }
    }

    /// Wait until the slot is free, then store `value`.
    pub fn put(&self, value: T, shutdown: &ShutdownToken) -> Result<()> {
        let mut slot = self.lock();
        loop {
            if shutdown.is_cancelled() {
                return Err(BridgeError::Terminated);
            }
            if slot.is_none() {
                *slot = Some(value);
                self.changed.notify_all();
                return Ok(());
            }
            slot = self.wait(slot);
        }
    }

    /// Wait until the slot holds a value, then move it out.
    pub fn take(&self, shutdown: &ShutdownToken) -> Result<T> {
        let mut slot = self.lock();
        loop {
            if let Some(value) = slot.take() {
                self.changed.notify_all();
                return Ok(value);
            }
            if shutdown.is_cancelled() {
                return Err(BridgeError::Terminated);
            }
            slot = self.wait(slot);
        }
    }

    /// Copy of the held value without releasing the slot.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.lock().clone()
    }

    /// Empty the slot and wake a waiting producer.
    pub fn release(&self) -> Option<T> {
        let value = self.lock().take();
        self.changed.notify_all();
        value
    }

    pub fn is_occupied(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Option<T>>) -> MutexGuard<'a, Option<T>> {
        let (guard, _) = self
            .changed
            .wait_timeout(guard, WAIT_SLICE)
            .unwrap_or_else(PoisonError::into_inner);
        guard
    }
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}
