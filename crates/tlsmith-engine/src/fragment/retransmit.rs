//! DTLS flight store and resend timer (RFC 6347 Section 4.2.4).
//!
//! A flight is the group of records sent between two receives; it is resent
//! as a whole. While a receive waits on an unanswered flight the timer says
//! when to resend it. The wait doubles after every resend, up to 60s.

use std::time::{Duration, Instant};

/// Longest wait between two resends of one flight.
const MAX_TIMEOUT: Duration = Duration::from_secs(60);

/// Resend schedule of the current flight.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    initial: Duration,
    current: Duration,
    deadline: Option<Instant>,
}

impl RetransmitTimer {
    pub fn new(initial: Duration) -> Self {
        let initial = initial.min(MAX_TIMEOUT);
        Self {
            initial,
            current: initial,
            deadline: None,
        }
    }

    /// Start the wait at `now` unless it is already running.
    pub fn arm(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.current);
        }
    }

    /// When the flight is due for a resend, if the timer runs.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Double the wait (capped) after a resend at `now`.
    pub fn backoff(&mut self, now: Instant) {
        self.current = std::cmp::min(self.current * 2, MAX_TIMEOUT);
        self.deadline = Some(now + self.current);
    }

    /// Stop the timer; the next flight starts from the initial wait.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.deadline = None;
    }

    pub fn timeout(&self) -> Duration {
        self.current
    }
}

/// Lower-layer payloads of the last flight, as (content type, bytes).
#[derive(Debug, Clone, Default)]
pub struct Flight {
    entries: Vec<(u8, Vec<u8>)>,
}

impl Flight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, content_type: u8, bytes: Vec<u8>) {
        self.entries.push((content_type, bytes));
    }

    pub fn entries(&self) -> &[(u8, Vec<u8>)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
