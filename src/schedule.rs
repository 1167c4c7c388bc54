//! Room operating windows.

use chrono::{Datelike, NaiveDateTime, Timelike};
use tracing::warn;

const NANOS_PER_MINUTE: u64 = 60 * 1_000_000_000;
const MINUTES_PER_DAY: u32 = 24 * 60;

/// Parsed operating days and hours of a room.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Schedule {
    /// Indexed by days from Sunday; `None` means every day.
    days: Option<[bool; 7]>,
    hours: Option<Hours>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Hours {
    open: u32,
    close: u32,
}

impl Schedule {
    /// Parses the stored operating days and hours.
    ///
    /// Empty days means every day, empty hours means always open. An hours
    /// value that does not parse as `HH:MM-HH:MM` is ignored.
    pub fn parse(days: &str, hours: &str) -> Self {
        let days = days.trim();
        let days = (!days.is_empty()).then(|| {
            let mut mask = [false; 7];
            for index in days.chars().filter_map(|ch| ch.to_digit(10)) {
                if let Some(slot) = mask.get_mut(index as usize) {
                    *slot = true;
                }
            }
            mask
        });

        let hours = hours.trim();
        let hours = if hours.is_empty() {
            None
        } else {
            let parsed = parse_hours(hours);
            if parsed.is_none() {
                warn!(operating_hours = hours, "ignoring malformed operating hours");
            }
            parsed
        };

        Self { days, hours }
    }

    /// Returns whether `local` falls inside the window.
    ///
    /// Both ends of the hour range are inclusive at minute precision. A close
    /// time earlier than the open time wraps past midnight; the day check
    /// always uses the day of `local`.
    pub fn contains(&self, local: NaiveDateTime) -> bool {
        if let Some(days) = self.days {
            let weekday = local.weekday().num_days_from_sunday() as usize;
            if !days[weekday] {
                return false;
            }
        }

        let Some(hours) = self.hours else {
            return true;
        };
        let time = local.time();
        let position = u64::from(time.num_seconds_from_midnight()) * 1_000_000_000
            + u64::from(time.nanosecond().min(999_999_999));
        let open = u64::from(hours.open) * NANOS_PER_MINUTE;
        let close = u64::from(hours.close) * NANOS_PER_MINUTE;

        if hours.open <= hours.close {
            open <= position && position <= close
        } else {
            position >= open || position <= close
        }
    }
}

fn parse_hours(value: &str) -> Option<Hours> {
    let (open, close) = value.split_once('-')?;
    Some(Hours {
        open: parse_clock(open)?,
        close: parse_clock(close)?,
    })
}

fn parse_clock(value: &str) -> Option<u32> {
    let (hour, minute) = value.trim().split_once(':')?;
    let hour: u32 = hour.trim().parse().ok()?;
    let minute: u32 = minute.trim().parse().ok()?;
    if hour > 24 || minute >= 60 {
        return None;
    }
    let total = hour * 60 + minute;
    (total <= MINUTES_PER_DAY).then_some(total)
}
