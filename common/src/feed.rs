use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::types::EventCategory;

pub const MAX_FEED_BODY_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed transport failed: {0}")]
    Transport(String),
    #[error("feed returned HTTP {0}")]
    Status(u16),
    #[error("feed body exceeds {MAX_FEED_BODY_BYTES} bytes")]
    BodyTooLarge,
    #[error("malformed feed body: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One fetch worth of event data. Offsets are milliseconds relative to the
/// moment the fetch completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub current: Option<CurrentEvent>,
    pub next: Option<NextEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentEvent {
    pub end_offset_ms: i64,
    pub category: EventCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextEvent {
    /// Subtracted from the fetch time, so an event starting in two seconds
    /// arrives as `-2000`.
    pub start_offset_ms: i64,
    pub end_offset_ms: i64,
    pub category: EventCategory,
}

#[derive(Debug, Deserialize)]
struct FeedPayload {
    #[serde(default)]
    current: Option<CurrentPayload>,
    #[serde(default)]
    next: Option<NextPayload>,
}

#[derive(Debug, Deserialize)]
struct CurrentPayload {
    end: i64,
    #[serde(rename = "type", default, deserialize_with = "category_or_free")]
    category: EventCategory,
}

#[derive(Debug, Deserialize)]
struct NextPayload {
    start: i64,
    end: i64,
    #[serde(rename = "type", default, deserialize_with = "category_or_free")]
    category: EventCategory,
}

// Any `type` that is not a string (null, numbers, objects) reads as free.
fn category_or_free<'de, D>(deserializer: D) -> Result<EventCategory, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value
        .as_str()
        .map(EventCategory::parse)
        .unwrap_or_default())
}

impl From<FeedPayload> for Snapshot {
    fn from(payload: FeedPayload) -> Self {
        Self {
            current: payload.current.map(|current| CurrentEvent {
                end_offset_ms: current.end,
                category: current.category,
            }),
            next: payload.next.map(|next| NextEvent {
                start_offset_ms: next.start,
                end_offset_ms: next.end,
                category: next.category,
            }),
        }
    }
}

pub fn parse_snapshot(body: &[u8]) -> Result<Snapshot, FeedError> {
    if body.len() > MAX_FEED_BODY_BYTES {
        return Err(FeedError::BodyTooLarge);
    }
    let payload: FeedPayload = serde_json::from_slice(body)?;
    Ok(payload.into())
}

pub fn feed_url(base_url: &str, feed_path: &str) -> String {
    format!("{base_url}{}", url_encode(feed_path))
}

/// Form-style percent encoding: alphanumerics pass through, space becomes
/// `+`, every other byte becomes `%XX`.
pub fn url_encode(input: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    let mut encoded = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b' ' => encoded.push('+'),
            b if b.is_ascii_alphanumeric() => encoded.push(b as char),
            b => {
                encoded.push('%');
                encoded.push(HEX[(b >> 4) as usize] as char);
                encoded.push(HEX[(b & 0x0f) as usize] as char);
            }
        }
    }
    encoded
}
