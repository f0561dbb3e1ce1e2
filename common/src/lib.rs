pub mod clock;
pub mod config;
pub mod feed;
pub mod light;
pub mod output;
pub mod poller;
pub mod schedule;
pub mod types;

pub use clock::Millis;
pub use config::{Brightness, ConfigError, ConfigUpdate, ConfigView, RuntimeConfig, UpdateOutcome};
pub use feed::{feed_url, parse_snapshot, url_encode, FeedError, Snapshot};
pub use light::{FetchOutcome, LightEngine};
pub use poller::{PollTimer, POLL_INTERVAL_MS};
pub use schedule::{EventSlot, ScheduleEvent, ScheduleState};
pub use types::{EventCategory, LightStatus};
