use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum EventCategory {
    #[default]
    Free,
    Coffee,
    Meeting,
    Recording,
}

impl EventCategory {
    /// Output channel order.
    pub const ALL: [EventCategory; 4] = [Self::Free, Self::Coffee, Self::Meeting, Self::Recording];

    /// Total parse: anything other than coffee, meeting or recording is free.
    pub fn parse(label: &str) -> Self {
        if label.eq_ignore_ascii_case("coffee") {
            Self::Coffee
        } else if label.eq_ignore_ascii_case("meeting") {
            Self::Meeting
        } else if label.eq_ignore_ascii_case("recording") {
            Self::Recording
        } else {
            Self::Free
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Free => 0,
            Self::Coffee => 1,
            Self::Meeting => 2,
            Self::Recording => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Coffee => "coffee",
            Self::Meeting => "meeting",
            Self::Recording => "recording",
        }
    }
}

impl From<String> for EventCategory {
    fn from(label: String) -> Self {
        Self::parse(&label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub category: EventCategory,
    #[serde(rename = "startsInMs")]
    pub starts_in_ms: Option<i32>,
    #[serde(rename = "endsInMs")]
    pub ends_in_ms: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LightStatus {
    pub active: EventCategory,
    pub current: SlotView,
    pub next: SlotView,
    pub brightness: [u8; 4],
    pub duties: [u32; 4],
    #[serde(rename = "fetchCount")]
    pub fetch_count: u64,
    #[serde(rename = "fetchFailures")]
    pub fetch_failures: u64,
    #[serde(rename = "lastFetchAgoMs")]
    pub last_fetch_ago_ms: Option<u32>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "nextPollInMs")]
    pub next_poll_in_ms: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(EventCategory::parse("Meeting"), EventCategory::Meeting);
        assert_eq!(EventCategory::parse("COFFEE"), EventCategory::Coffee);
        assert_eq!(EventCategory::parse("recording"), EventCategory::Recording);
    }

    #[test]
    fn unknown_labels_are_free() {
        for label in ["lunch", "", "free", "meetings", " meeting"] {
            assert_eq!(EventCategory::parse(label), EventCategory::Free, "{label}");
        }
    }

    #[test]
    fn deserializes_any_string() {
        let category: EventCategory = serde_json::from_str("\"Recording\"").unwrap();
        assert_eq!(category, EventCategory::Recording);

        let category: EventCategory = serde_json::from_str("\"lunch\"").unwrap();
        assert_eq!(category, EventCategory::Free);
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&EventCategory::Coffee).unwrap(),
            "\"coffee\""
        );
    }
}
