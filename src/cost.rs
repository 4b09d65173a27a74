//! Token cost calculation for a booking period

use crate::booking::DateRange;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Cost in tokens for holding a tool over `dates`.
///
/// Partial days always round up to a full day, so a 23 hour loan costs one
/// day and a 36 hour loan costs two.
pub fn rental_cost(dates: &DateRange, daily_cost: u64) -> u64 {
    days_spanned(dates) * daily_cost
}

fn days_spanned(dates: &DateRange) -> u64 {
    let seconds = (dates.end.to_datetime_utc() - dates.start.to_datetime_utc()).num_seconds();
    if seconds <= 0 {
        return 0;
    }

    (seconds as u64).div_ceil(SECONDS_PER_DAY as u64)
}
