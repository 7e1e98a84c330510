//! Evaluation windows.
//!
//! Windows are normally half-open `[start, end)`. Trigger-driven windows can
//! collapse to a single instant when two trigger samples share a timestamp;
//! those are closed `[start, end]` so the instant itself is still covered.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A time interval over which a value is aggregated or evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// Start of the window (included)
    pub start: DateTime<Utc>,
    /// End of the window
    pub end: DateTime<Utc>,
    /// Whether `end` itself belongs to the window
    pub end_included: bool,
}

impl Window {
    /// Half-open window `[start, end)`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            end_included: false,
        }
    }

    /// Closed window `[start, end]`.
    pub fn closed(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            end_included: true,
        }
    }

    /// Check if a timestamp falls within this window.
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start
            && (timestamp < self.end || (self.end_included && timestamp == self.end))
    }

    pub fn is_zero_width(&self) -> bool {
        self.start == self.end
    }

    /// Same window with both bounds shifted independently, `None` on overflow.
    pub fn shifted(&self, start_offset: Duration, end_offset: Duration) -> Option<Self> {
        Some(Self {
            start: self.start.checked_add_signed(start_offset)?,
            end: self.end.checked_add_signed(end_offset)?,
            end_included: self.end_included,
        })
    }
}

/// Windows delimited by consecutive trigger timestamps.
///
/// Window `i` spans `[triggers[i], triggers[i + 1])`; the last one ends at
/// `time_max`. Two triggers at the same instant produce a closed zero-width
/// window. Out-of-order triggers are skipped.
pub fn trigger_windows(triggers: &[DateTime<Utc>], time_max: DateTime<Utc>) -> Vec<Window> {
    let mut windows = Vec::with_capacity(triggers.len());

    for (i, &from) in triggers.iter().enumerate() {
        let to = triggers.get(i + 1).copied().unwrap_or(time_max);
        if to < from {
            tracing::debug!("Skipping trigger window [{} to {}]: end before start", from, to);
            continue;
        }
        let window = Window::new(from, to);
        if window.is_zero_width() {
            windows.push(Window::closed(from, to));
        } else {
            windows.push(window);
        }
    }

    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_window_contains() {
        let window = Window::new(at(0), at(10));

        assert!(window.contains(at(0)));
        assert!(window.contains(at(5)));
        assert!(!window.contains(at(10)));
        assert!(!window.contains(at(-1)));
    }

    #[test]
    fn test_closed_window_contains_end() {
        let window = Window::closed(at(10), at(10));
        assert!(window.is_zero_width());
        assert!(window.contains(at(10)));
        assert!(!window.contains(at(11)));
    }

    #[test]
    fn test_shifted_window() {
        let window = Window::new(at(100), at(200))
            .shifted(Duration::seconds(-10), Duration::seconds(5))
            .unwrap();
        assert_eq!(window.start, at(90));
        assert_eq!(window.end, at(205));
        assert!(window.contains(at(204)));
    }

    #[test]
    fn test_shift_overflow_is_none() {
        let window = Window::new(at(0), at(10));
        assert!(window
            .shifted(Duration::zero(), Duration::days(365 * 300_000))
            .is_none());
    }

    #[test]
    fn test_trigger_windows_with_repeated_trigger() {
        let windows = trigger_windows(&[at(0), at(10), at(10), at(20)], at(30));

        assert_eq!(
            windows,
            vec![
                Window::new(at(0), at(10)),
                Window::closed(at(10), at(10)),
                Window::new(at(10), at(20)),
                Window::new(at(20), at(30)),
            ]
        );
    }

    #[test]
    fn test_trigger_windows_empty() {
        assert!(trigger_windows(&[], at(30)).is_empty());
    }
}
