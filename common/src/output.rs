use crate::{config::Brightness, types::EventCategory};

pub const CHANNEL_COUNT: usize = 4;

/// Duty for every channel: the active category's channel at its configured
/// brightness, every other channel dark.
pub fn channel_duties(
    active: EventCategory,
    brightness: &Brightness,
    max_duty: u32,
) -> [u32; CHANNEL_COUNT] {
    let mut duties = [0; CHANNEL_COUNT];
    duties[active.index()] = scale_percent(brightness.percent_for(active), max_duty);
    duties
}

pub fn scale_percent(percent: u8, max_duty: u32) -> u32 {
    let percent = u64::from(percent.min(100));
    (u64::from(max_duty) * percent / 100) as u32
}

/// Remembers what was last written so the hardware only sees transitions.
#[derive(Debug, Clone, Default)]
pub struct ChannelOutput {
    written: Option<[u32; CHANNEL_COUNT]>,
}

impl ChannelOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, duties: [u32; CHANNEL_COUNT]) -> Option<[u32; CHANNEL_COUNT]> {
        if self.written == Some(duties) {
            return None;
        }
        self.written = Some(duties);
        Some(duties)
    }

    pub fn written(&self) -> Option<[u32; CHANNEL_COUNT]> {
        self.written
    }

    /// Forces the next update through, e.g. after a failed hardware write.
    pub fn invalidate(&mut self) {
        self.written = None;
    }
}
