use crate::clock::Millis;

pub const POLL_INTERVAL_MS: u32 = 60_000;

/// Fixed-cadence poll scheduling on the wrapping clock.
#[derive(Debug, Clone)]
pub struct PollTimer {
    interval_ms: u32,
    last_poll: Option<Millis>,
}

impl Default for PollTimer {
    fn default() -> Self {
        Self::new(POLL_INTERVAL_MS)
    }
}

impl PollTimer {
    pub fn new(interval_ms: u32) -> Self {
        Self {
            interval_ms: interval_ms.max(1),
            last_poll: None,
        }
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    /// Returns true when a poll should run now and books it.
    pub fn poll_due(&mut self, now: Millis) -> bool {
        let Some(last) = self.last_poll else {
            self.last_poll = Some(now);
            return true;
        };

        if now.wrapping_since(last) < self.interval_ms {
            return false;
        }

        let mut booked = last.forward_by(i64::from(self.interval_ms));
        if now.wrapping_since(booked) >= self.interval_ms {
            // More than one interval behind; re-anchor instead of bursting.
            booked = now;
        }
        self.last_poll = Some(booked);
        true
    }

    /// Makes the next `poll_due` call fire.
    pub fn reset(&mut self) {
        self.last_poll = None;
    }

    pub fn remaining_ms(&self, now: Millis) -> u32 {
        match self.last_poll {
            Some(last) => self.interval_ms.saturating_sub(now.wrapping_since(last)),
            None => 0,
        }
    }
}
