//! Per-entity update accumulator
//!
//! Collects dirty field names (or a full-update request) between sends and decides,
//! against a fixed throttle window, whether a send may happen now or must wait for the
//! trailing edge of the window. Nothing is ever dropped: whatever accumulated while
//! throttled goes out together on the next permitted send.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;

/// What a send carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingUpdate {
    /// Complete projection of the entity
    Full,
    /// Only these fields, plus the id
    Fields(BTreeSet<String>),
}

/// Outcome of [`UpdateAccumulator::poll`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Throttle {
    /// Nothing pending
    Idle,
    /// Send this now
    Ready(PendingUpdate),
    /// Inside the window; schedule a trailing flush after this delay
    Defer(Duration),
    /// A trailing flush is already scheduled and will pick the changes up
    Scheduled,
}

#[derive(Debug)]
pub struct UpdateAccumulator {
    window: Duration,
    dirty: BTreeSet<String>,
    full: bool,
    last_sent: Option<Instant>,
    flush_scheduled: bool,
}

impl UpdateAccumulator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            dirty: BTreeSet::new(),
            full: false,
            last_sent: None,
            flush_scheduled: false,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Request a full update; wins over any partial set
    pub fn mark_full(&mut self) {
        self.full = true;
        self.dirty.clear();
    }

    pub fn mark_fields<I, S>(&mut self, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.full {
            return;
        }
        self.dirty
            .extend(fields.into_iter().map(|f| f.as_ref().to_string()));
    }

    pub fn has_pending(&self) -> bool {
        self.full || !self.dirty.is_empty()
    }

    /// Decide what to do with the pending changes at `now`
    pub fn poll(&mut self, now: Instant) -> Throttle {
        if !self.has_pending() {
            return Throttle::Idle;
        }
        if self.flush_scheduled {
            return Throttle::Scheduled;
        }

        match self.last_sent {
            Some(last) if now.duration_since(last) < self.window => {
                self.flush_scheduled = true;
                Throttle::Defer(self.window - now.duration_since(last))
            }
            _ => self.take(now).map_or(Throttle::Idle, Throttle::Ready),
        }
    }

    /// Trailing-edge flush: always sends whatever is pending
    pub fn flush(&mut self, now: Instant) -> Option<PendingUpdate> {
        self.flush_scheduled = false;
        self.take(now)
    }

    /// Give up on a scheduled flush; the next `poll` after the window sends instead
    pub fn cancel_flush(&mut self) {
        self.flush_scheduled = false;
    }

    fn take(&mut self, now: Instant) -> Option<PendingUpdate> {
        let pending = if self.full {
            PendingUpdate::Full
        } else if !self.dirty.is_empty() {
            PendingUpdate::Fields(std::mem::take(&mut self.dirty))
        } else {
            return None;
        };

        self.full = false;
        self.dirty.clear();
        self.last_sent = Some(now);
        Some(pending)
    }
}
