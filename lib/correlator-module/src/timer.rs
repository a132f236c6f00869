//! The minute-boundary clock every module's timer handlers are driven from.
//! Ticks are idempotent per wall-clock minute (§4.5): calling [`MinuteClock::tick`]
//! twice within the same minute is a no-op the second time.

use chrono::{NaiveDateTime, Timelike};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Minute,
    FiveMinutes,
    TenMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    Hour,
}

impl TimerKind {
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        let minute = now.minute();
        match self {
            TimerKind::Minute => true,
            TimerKind::FiveMinutes => minute % 5 == 0,
            TimerKind::TenMinutes => minute % 10 == 0,
            TimerKind::FifteenMinutes => minute % 15 == 0,
            TimerKind::ThirtyMinutes => minute % 30 == 0,
            TimerKind::Hour => minute == 0,
        }
    }
}

const ALL_KINDS: [TimerKind; 6] = [
    TimerKind::Minute,
    TimerKind::FiveMinutes,
    TimerKind::TenMinutes,
    TimerKind::FifteenMinutes,
    TimerKind::ThirtyMinutes,
    TimerKind::Hour,
];

/// The handlers applicable at `now`, in ascending granularity order.
pub fn due_kinds(now: NaiveDateTime) -> Vec<TimerKind> {
    ALL_KINDS.into_iter().filter(|k| k.is_due(now)).collect()
}

/// Tracks the last minute a tick fired for, so repeated calls within the
/// same minute are suppressed.
#[derive(Debug, Default)]
pub struct MinuteClock {
    last_ticked: Option<NaiveDateTime>,
}

impl MinuteClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the due timer kinds if `now` is in a new minute since the
    /// last successful tick, else `None`.
    pub fn tick(&mut self, now: NaiveDateTime) -> Option<Vec<TimerKind>> {
        let truncated = crate::truncate_to_minute(now);
        if self.last_ticked == Some(truncated) {
            return None;
        }
        self.last_ticked = Some(truncated);
        Some(due_kinds(truncated))
    }
}
