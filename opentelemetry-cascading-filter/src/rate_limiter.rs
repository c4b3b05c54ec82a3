use crate::sampling::Decision;
use std::time::{SystemTime, UNIX_EPOCH};

// per wall clock second span counter
// not Sync, callers serialize access
#[derive(Debug)]
pub(crate) struct RateLimiter {
    spans_per_second: i64,
    current_second: u64,
    spans_in_current_second: i64,
}

impl RateLimiter {
    pub(crate) fn new(spans_per_second: i64) -> Self {
        RateLimiter {
            spans_per_second,
            current_second: 0,
            spans_in_current_second: 0,
        }
    }

    pub(crate) fn spans_per_second(&self) -> i64 {
        self.spans_per_second
    }

    pub(crate) fn is_unlimited(&self) -> bool {
        self.spans_per_second <= 0
    }

    /// Spans already admitted in `current_second`, zero once the second has moved on.
    pub(crate) fn used_in(&self, current_second: u64) -> i64 {
        if current_second == self.current_second {
            self.spans_in_current_second
        } else {
            0
        }
    }

    /// Admits `span_count` spans if they fit in what is left of the
    /// budget for `current_second`. A burst is admitted whole or not at all.
    pub(crate) fn update_rate(&mut self, current_second: u64, span_count: i64) -> Decision {
        if self.is_unlimited() {
            return Decision::Sampled;
        }

        if self.current_second < current_second {
            self.current_second = current_second;
            self.spans_in_current_second = 0;
        }

        if self.spans_in_current_second + span_count > self.spans_per_second {
            return Decision::NotSampled;
        }

        self.spans_in_current_second += span_count;
        Decision::Sampled
    }
}

/// Seconds since the unix epoch, the unit every limiter counts in.
pub(crate) fn current_second() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since_epoch| since_epoch.as_secs())
        .unwrap_or_default()
}
