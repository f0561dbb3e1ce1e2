use crate::{clock::Millis, feed::Snapshot, types::EventCategory};

/// One tracked interval. `None` deadlines mean the slot is unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSlot {
    pub start: Option<Millis>,
    pub end: Option<Millis>,
    pub category: EventCategory,
}

impl EventSlot {
    pub const UNSET: Self = Self {
        start: None,
        end: None,
        category: EventCategory::Free,
    };

    pub fn clear(&mut self) {
        *self = Self::UNSET;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEvent {
    CurrentExpired(EventCategory),
    NextPromoted(EventCategory),
    NextDiscarded(EventCategory),
}

/// The `current`/`next` pair. Replaced wholesale by each snapshot and moved
/// forward in place by [`ScheduleState::advance`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleState {
    current: EventSlot,
    next: EventSlot,
}

impl ScheduleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &EventSlot {
        &self.current
    }

    pub fn next(&self) -> &EventSlot {
        &self.next
    }

    pub fn apply_snapshot(&mut self, snapshot: &Snapshot, now: Millis) {
        self.current = match snapshot.current {
            Some(current) => EventSlot {
                start: None,
                end: Some(now.forward_by(current.end_offset_ms)),
                category: current.category,
            },
            None => EventSlot::UNSET,
        };

        // The start offset is subtracted while the end offset is added; the
        // feed server relies on exactly this arithmetic.
        self.next = match snapshot.next {
            Some(next) => EventSlot {
                start: Some(now.back_by(next.start_offset_ms)),
                end: Some(now.forward_by(next.end_offset_ms)),
                category: next.category,
            },
            None => EventSlot::UNSET,
        };
    }

    /// Expires `current`, then promotes or discards `next`, against a single
    /// clock reading.
    pub fn advance(&mut self, now: Millis) -> Vec<ScheduleEvent> {
        let mut events = Vec::new();

        if let Some(end) = self.current.end {
            if end.is_before(now) {
                events.push(ScheduleEvent::CurrentExpired(self.current.category));
                self.current.clear();
            }
        }

        if let Some(start) = self.next.start {
            if start.is_before(now) {
                match self.next.end {
                    Some(end) if end.is_after(now) => {
                        events.push(ScheduleEvent::NextPromoted(self.next.category));
                        self.current = EventSlot {
                            start: None,
                            end: Some(end),
                            category: self.next.category,
                        };
                        self.next.clear();
                    }
                    Some(end) if end.is_before(now) => {
                        events.push(ScheduleEvent::NextDiscarded(self.next.category));
                        self.next.clear();
                    }
                    _ => {}
                }
            }
        }

        events
    }

    pub fn active_category(&self) -> EventCategory {
        match self.current.end {
            Some(_) => self.current.category,
            None => EventCategory::Free,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::CLOCK_PERIOD_MS,
        feed::{parse_snapshot, CurrentEvent, NextEvent},
    };
    use pretty_assertions::assert_eq;

    fn at(ms: u32) -> Millis {
        Millis::new(ms)
    }

    fn slot(start: Option<u32>, end: Option<u32>, category: EventCategory) -> EventSlot {
        EventSlot {
            start: start.map(Millis::new),
            end: end.map(Millis::new),
            category,
        }
    }

    fn fetched(body: &str, now: u32) -> ScheduleState {
        let mut state = ScheduleState::new();
        state.apply_snapshot(&parse_snapshot(body.as_bytes()).unwrap(), at(now));
        state
    }

    #[test]
    fn starts_unset_and_free() {
        let state = ScheduleState::new();
        assert_eq!(*state.current(), EventSlot::UNSET);
        assert_eq!(*state.next(), EventSlot::UNSET);
        assert_eq!(state.active_category(), EventCategory::Free);
    }

    #[test]
    fn advance_is_idempotent_for_same_instant() {
        let mut state = fetched(
            r#"{"current": {"end": 100, "type": "meeting"},
                "next": {"start": -50, "end": 400, "type": "recording"}}"#,
            1_000,
        );

        for now in [1_000, 1_051, 1_101, 1_401, 1_500] {
            let mut once = state.clone();
            once.advance(at(now));
            let mut twice = once.clone();
            let second = twice.advance(at(now));

            assert_eq!(twice, once, "now = {now}");
            assert!(second.is_empty(), "now = {now}");
            state = once;
        }
    }

    #[test]
    fn expiry_and_promotion_happen_in_one_call() {
        let mut state = ScheduleState {
            current: slot(None, Some(999), EventCategory::Meeting),
            next: slot(Some(900), Some(2_000), EventCategory::Coffee),
        };

        let events = state.advance(at(1_000));

        assert_eq!(
            events,
            vec![
                ScheduleEvent::CurrentExpired(EventCategory::Meeting),
                ScheduleEvent::NextPromoted(EventCategory::Coffee),
            ]
        );
        assert_eq!(*state.current(), slot(None, Some(2_000), EventCategory::Coffee));
        assert_eq!(*state.next(), EventSlot::UNSET);
        assert_eq!(state.active_category(), EventCategory::Coffee);
    }

    #[test]
    fn promotion_overrides_unexpired_current() {
        let mut state = ScheduleState {
            current: slot(None, Some(5_000), EventCategory::Meeting),
            next: slot(Some(900), Some(2_000), EventCategory::Recording),
        };

        let events = state.advance(at(1_000));

        assert_eq!(
            events,
            vec![ScheduleEvent::NextPromoted(EventCategory::Recording)]
        );
        assert_eq!(state.current().end, Some(at(2_000)));
        assert_eq!(state.active_category(), EventCategory::Recording);
    }

    #[test]
    fn elapsed_next_is_discarded_without_promotion() {
        let mut state = ScheduleState {
            current: EventSlot::UNSET,
            next: slot(Some(100), Some(500), EventCategory::Meeting),
        };

        let events = state.advance(at(1_000));

        assert_eq!(events, vec![ScheduleEvent::NextDiscarded(EventCategory::Meeting)]);
        assert_eq!(*state.current(), EventSlot::UNSET);
        assert_eq!(*state.next(), EventSlot::UNSET);
        assert_eq!(state.active_category(), EventCategory::Free);
    }

    #[test]
    fn next_ending_exactly_now_is_left_alone() {
        let mut state = ScheduleState {
            current: EventSlot::UNSET,
            next: slot(Some(100), Some(1_000), EventCategory::Meeting),
        };

        assert!(state.advance(at(1_000)).is_empty());
        assert_eq!(state.next().end, Some(at(1_000)));

        assert_eq!(
            state.advance(at(1_001)),
            vec![ScheduleEvent::NextDiscarded(EventCategory::Meeting)]
        );
    }

    #[test]
    fn current_is_active_through_its_end_instant() {
        let mut state = ScheduleState {
            current: slot(None, Some(1_000), EventCategory::Coffee),
            next: EventSlot::UNSET,
        };

        assert!(state.advance(at(1_000)).is_empty());
        assert_eq!(state.active_category(), EventCategory::Coffee);

        state.advance(at(1_001));
        assert_eq!(state.active_category(), EventCategory::Free);
    }

    #[test]
    fn snapshot_replaces_previous_state() {
        let mut state = fetched(
            r#"{"current": {"end": 5000, "type": "meeting"},
                "next": {"start": -10000, "end": 20000, "type": "recording"}}"#,
            1_000,
        );

        state.apply_snapshot(
            &Snapshot {
                current: None,
                next: Some(NextEvent {
                    start_offset_ms: -500,
                    end_offset_ms: 900,
                    category: EventCategory::Coffee,
                }),
            },
            at(2_000),
        );

        assert_eq!(*state.current(), EventSlot::UNSET);
        assert_eq!(
            *state.next(),
            slot(Some(2_500), Some(2_900), EventCategory::Coffee)
        );

        state.apply_snapshot(&Snapshot::default(), at(3_000));
        assert_eq!(state, ScheduleState::new());
    }

    #[test]
    fn stale_category_without_deadline_reads_free() {
        let state = ScheduleState {
            current: slot(None, None, EventCategory::Recording),
            next: EventSlot::UNSET,
        };

        assert_eq!(state.active_category(), EventCategory::Free);
    }

    #[test]
    fn expiry_is_detected_across_clock_wrap() {
        let period_end = (CLOCK_PERIOD_MS - 10) as u32;
        let mut state = ScheduleState {
            current: slot(None, Some(period_end), EventCategory::Meeting),
            next: EventSlot::UNSET,
        };

        let events = state.advance(at(5));

        assert_eq!(events, vec![ScheduleEvent::CurrentExpired(EventCategory::Meeting)]);
        assert_eq!(state.active_category(), EventCategory::Free);
    }

    #[test]
    fn deadlines_past_the_wrap_are_not_expired_early() {
        let mut state = ScheduleState::new();
        state.apply_snapshot(
            &Snapshot {
                current: Some(CurrentEvent {
                    end_offset_ms: 60_000,
                    category: EventCategory::Recording,
                }),
                next: None,
            },
            at(u32::MAX - 1_000),
        );

        assert_eq!(state.current().end, Some(at(58_999)));

        assert!(state.advance(at(u32::MAX)).is_empty());
        assert!(state.advance(at(30_000)).is_empty());
        assert_eq!(state.active_category(), EventCategory::Recording);

        state.advance(at(59_000));
        assert_eq!(state.active_category(), EventCategory::Free);
    }

    #[test]
    fn next_window_straddling_the_wrap_promotes_on_time() {
        let mut state = ScheduleState::new();
        state.apply_snapshot(
            &Snapshot {
                current: None,
                next: Some(NextEvent {
                    start_offset_ms: -2_000,
                    end_offset_ms: 10_000,
                    category: EventCategory::Meeting,
                }),
            },
            at(u32::MAX - 500),
        );

        assert_eq!(*state.next(), slot(Some(1_499), Some(9_499), EventCategory::Meeting));

        assert!(state.advance(at(u32::MAX - 100)).is_empty());
        assert!(state.advance(at(1_499)).is_empty());
        assert_eq!(state.active_category(), EventCategory::Free);

        assert_eq!(
            state.advance(at(1_600)),
            vec![ScheduleEvent::NextPromoted(EventCategory::Meeting)]
        );
        assert_eq!(state.active_category(), EventCategory::Meeting);

        state.advance(at(9_499));
        assert_eq!(state.active_category(), EventCategory::Meeting);
        state.advance(at(9_500));
        assert_eq!(state.active_category(), EventCategory::Free);
    }

    #[test]
    fn next_window_elapsed_across_the_wrap_is_discarded() {
        let mut state = ScheduleState::new();
        state.apply_snapshot(
            &Snapshot {
                current: None,
                next: Some(NextEvent {
                    start_offset_ms: 100,
                    end_offset_ms: 200,
                    category: EventCategory::Recording,
                }),
            },
            at(u32::MAX - 500),
        );

        assert_eq!(
            *state.next(),
            slot(Some(u32::MAX - 600), Some(u32::MAX - 300), EventCategory::Recording)
        );

        assert_eq!(
            state.advance(at(50)),
            vec![ScheduleEvent::NextDiscarded(EventCategory::Recording)]
        );
        assert_eq!(*state.next(), EventSlot::UNSET);
        assert_eq!(state.active_category(), EventCategory::Free);
    }

    #[test]
    fn empty_feed_is_free() {
        let mut state = fetched(r#"{"current": null, "next": null}"#, 1_000);
        state.advance(at(1_000));
        assert_eq!(state.active_category(), EventCategory::Free);
    }

    #[test]
    fn current_meeting_ends_on_schedule() {
        let mut state = fetched(r#"{"current": {"end": 5000, "type": "meeting"}}"#, 1_000);

        assert_eq!(state.current().end, Some(at(6_000)));
        assert_eq!(state.active_category(), EventCategory::Meeting);

        state.advance(at(6_000));
        assert_eq!(state.active_category(), EventCategory::Meeting);

        state.advance(at(6_001));
        assert_eq!(state.active_category(), EventCategory::Free);
    }

    // The start offset is subtracted from the fetch time: -2000 lands at 3000.
    #[test]
    fn next_start_uses_subtracted_offset() {
        let mut state = fetched(
            r#"{"next": {"start": -2000, "end": 3000, "type": "coffee"}}"#,
            1_000,
        );

        assert_eq!(*state.next(), slot(Some(3_000), Some(4_000), EventCategory::Coffee));

        assert!(state.advance(at(2_999)).is_empty());
        assert!(state.advance(at(3_000)).is_empty());
        assert_eq!(state.active_category(), EventCategory::Free);

        assert_eq!(
            state.advance(at(3_001)),
            vec![ScheduleEvent::NextPromoted(EventCategory::Coffee)]
        );
        assert_eq!(*state.current(), slot(None, Some(4_000), EventCategory::Coffee));
        assert_eq!(*state.next(), EventSlot::UNSET);
        assert_eq!(state.active_category(), EventCategory::Coffee);

        state.advance(at(4_001));
        assert_eq!(state.active_category(), EventCategory::Free);
    }

    #[test]
    fn positive_start_offset_places_next_in_the_past() {
        let mut state = fetched(
            r#"{"next": {"start": 500, "end": 3000, "type": "recording"}}"#,
            1_000,
        );

        assert_eq!(state.next().start, Some(at(500)));

        state.advance(at(1_000));
        assert_eq!(state.active_category(), EventCategory::Recording);
    }

    #[test]
    fn unknown_type_is_free() {
        let state = fetched(r#"{"current": {"end": 5000, "type": "lunch"}}"#, 1_000);
        assert_eq!(state.current().end, Some(at(6_000)));
        assert_eq!(state.active_category(), EventCategory::Free);
    }
}
