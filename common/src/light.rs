use crate::{
    clock::Millis,
    config::Brightness,
    feed::{FeedError, Snapshot},
    output::{channel_duties, ChannelOutput, CHANNEL_COUNT},
    poller::PollTimer,
    schedule::{EventSlot, ScheduleEvent, ScheduleState},
    types::{EventCategory, LightStatus, SlotView},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied {
        current: EventCategory,
        next: EventCategory,
    },
    Retained,
}

/// Everything the device loop needs between polls: the schedule, the poll
/// cadence, brightness and the last rendered output.
#[derive(Debug, Clone)]
pub struct LightEngine {
    schedule: ScheduleState,
    poll: PollTimer,
    brightness: Brightness,
    output: ChannelOutput,

    fetch_count: u64,
    fetch_failures: u64,
    last_fetch: Option<Millis>,
    last_error: Option<String>,
}

impl LightEngine {
    pub fn new(mut brightness: Brightness, poll: PollTimer) -> Self {
        brightness.sanitize();
        Self {
            schedule: ScheduleState::new(),
            poll,
            brightness,
            output: ChannelOutput::new(),
            fetch_count: 0,
            fetch_failures: 0,
            last_fetch: None,
            last_error: None,
        }
    }

    pub fn schedule(&self) -> &ScheduleState {
        &self.schedule
    }

    pub fn brightness(&self) -> &Brightness {
        &self.brightness
    }

    pub fn set_brightness(&mut self, mut brightness: Brightness) -> bool {
        brightness.sanitize();
        if self.brightness == brightness {
            return false;
        }
        self.brightness = brightness;
        true
    }

    pub fn poll_due(&mut self, now: Millis, connected: bool) -> bool {
        connected && self.poll.poll_due(now)
    }

    pub fn request_refresh(&mut self) {
        self.poll.reset();
    }

    /// `now` must be read after the fetch completed.
    pub fn apply_fetch(&mut self, result: Result<Snapshot, FeedError>, now: Millis) -> FetchOutcome {
        match result {
            Ok(snapshot) => {
                self.schedule.apply_snapshot(&snapshot, now);
                self.fetch_count = self.fetch_count.saturating_add(1);
                self.last_fetch = Some(now);
                self.last_error = None;
                FetchOutcome::Applied {
                    current: self.schedule.current().category,
                    next: self.schedule.next().category,
                }
            }
            Err(err) => {
                self.fetch_failures = self.fetch_failures.saturating_add(1);
                self.last_error = Some(err.to_string());
                FetchOutcome::Retained
            }
        }
    }

    pub fn tick(&mut self, now: Millis) -> Vec<ScheduleEvent> {
        self.schedule.advance(now)
    }

    pub fn active_category(&self) -> EventCategory {
        self.schedule.active_category()
    }

    pub fn channel_duties(&self, max_duty: u32) -> [u32; CHANNEL_COUNT] {
        channel_duties(self.active_category(), &self.brightness, max_duty)
    }

    /// Duties to write, or `None` when the hardware already shows them.
    pub fn render(&mut self, max_duty: u32) -> Option<[u32; CHANNEL_COUNT]> {
        let duties = self.channel_duties(max_duty);
        self.output.update(duties)
    }

    pub fn invalidate_output(&mut self) {
        self.output.invalidate();
    }

    pub fn status(&self, now: Millis) -> LightStatus {
        LightStatus {
            active: self.active_category(),
            current: slot_view(self.schedule.current(), now),
            next: slot_view(self.schedule.next(), now),
            brightness: self.brightness.as_percentages(),
            duties: self.output.written().unwrap_or_default(),
            fetch_count: self.fetch_count,
            fetch_failures: self.fetch_failures,
            last_fetch_ago_ms: self.last_fetch.map(|last| now.wrapping_since(last)),
            last_error: self.last_error.clone(),
            next_poll_in_ms: self.poll.remaining_ms(now),
        }
    }
}

fn slot_view(slot: &EventSlot, now: Millis) -> SlotView {
    SlotView {
        category: slot.category,
        starts_in_ms: slot.start.map(|start| start.signed_since(now)),
        ends_in_ms: slot.end.map(|end| end.signed_since(now)),
    }
}
