//! World clock with proleptic Gregorian calendar arithmetic.
//!
//! Advancing the clock carries minutes into hours, hours into days, and days
//! across real month boundaries (including leap years), rather than doing a
//! naive field-by-field add.

use serde::{Deserialize, Serialize};

/// The in-world calendar and clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldClock {
    pub year: i32,
    /// 1-12.
    pub month: u8,
    /// 1 to the length of the month.
    pub day: u8,
    /// 0-23.
    pub hour: u8,
    /// 0-59.
    pub minute: u8,
}

impl Default for WorldClock {
    fn default() -> Self {
        Self {
            year: 1,
            month: 1,
            day: 1,
            hour: 8,
            minute: 0,
        }
    }
}

/// A non-negative span of world time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeDelta {
    pub minutes: u32,
    pub hours: u32,
    pub days: u32,
    pub months: u32,
    pub years: u32,
}

impl TimeDelta {
    pub fn is_zero(&self) -> bool {
        self.minutes == 0 && self.hours == 0 && self.days == 0 && self.months == 0 && self.years == 0
    }
}

/// Proleptic Gregorian leap-year rule.
pub fn is_leap_year(year: i32) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

/// Number of days in the given month.
pub fn days_in_month(year: i32, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if is_leap_year(year) {
                29
            } else {
                28
            }
        }
        _ => 30,
    }
}

impl WorldClock {
    pub fn new(year: i32, month: u8, day: u8, hour: u8, minute: u8) -> Self {
        let mut clock = Self {
            year,
            month: month.clamp(1, 12),
            day: 1,
            hour: hour.min(23),
            minute: minute.min(59),
        };
        clock.day = day.clamp(1, days_in_month(clock.year, clock.month));
        clock
    }

    /// Advance the clock by a delta, carrying minutes through years.
    ///
    /// Years and months are applied first (clamping the day into the target
    /// month), then days, hours, and minutes with upward carry.
    pub fn advance(&mut self, delta: &TimeDelta) {
        if delta.is_zero() {
            return;
        }

        self.year += delta.years as i32;
        self.add_months(delta.months);

        let total_minutes = self.minute as u64 + delta.minutes as u64;
        self.minute = (total_minutes % 60) as u8;
        let total_hours = self.hour as u64 + delta.hours as u64 + total_minutes / 60;
        self.hour = (total_hours % 24) as u8;
        self.add_days(delta.days as u64 + total_hours / 24);
    }

    fn add_months(&mut self, months: u32) {
        let total = (self.month as u32 - 1) + months;
        self.month = (total % 12 + 1) as u8;
        self.year += (total / 12) as i32;
        // Landing in a shorter month clamps the day (Jan 31 + 1 month).
        let dim = days_in_month(self.year, self.month);
        if self.day > dim {
            self.day = dim;
        }
    }

    fn add_days(&mut self, mut days: u64) {
        while days > 0 {
            let dim = days_in_month(self.year, self.month) as u64;
            let remaining_in_month = dim - self.day as u64;
            if days <= remaining_in_month {
                self.day += days as u8;
                break;
            }
            days -= remaining_in_month + 1;
            self.day = 1;
            self.add_months(1);
        }
    }

    /// Strict ordering for the monotonicity invariant.
    pub fn as_tuple(&self) -> (i32, u8, u8, u8, u8) {
        (self.year, self.month, self.day, self.hour, self.minute)
    }
}

impl std::fmt::Display for WorldClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Year {}, Month {}, Day {}, {:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute
        )
    }
}
