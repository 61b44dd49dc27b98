//! RFC 7231 IMF-fixdate formatting for the `Date` response header.
//!
//! No date/time crate is in the dependency stack, so this is a minimal
//! from-scratch formatter rather than a dependency addition: a days-since-epoch
//! to civil-date conversion (Howard Hinnant's algorithm) plus a fixed table
//! of weekday/month names.

use std::time::{SystemTime, UNIX_EPOCH};

const WEEKDAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
const MONTHS: [&str; 12] =
    ["Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec"];

/// `days` since the Unix epoch (1970-01-01, a Thursday) to `(year, month, day)`.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Format `time` as e.g. `"Fri, 29 Apr 2022 12:49:47 GMT"`.
#[must_use]
pub fn format_http_date(time: SystemTime) -> String {
    let secs = time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0) as i64;
    let days = secs.div_euclid(86400);
    let sod = secs.rem_euclid(86400);
    let (year, month, day) = civil_from_days(days);
    let weekday = WEEKDAYS[(days.rem_euclid(7)) as usize];
    let hour = sod / 3600;
    let minute = (sod % 3600) / 60;
    let second = sod % 60;
    format!(
        "{weekday}, {day:02} {month} {year:04} {hour:02}:{minute:02}:{second:02} GMT",
        month = MONTHS[(month - 1) as usize],
    )
}

/// The `Date` header value for right now.
#[must_use]
pub fn http_date_now() -> String {
    format_http_date(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn formats_known_epoch_offset() {
        // 2022-04-29T12:49:47Z, used verbatim in the spec's worked HTTP example.
        let t = UNIX_EPOCH + Duration::from_secs(1_651_236_587);
        assert_eq!(format_http_date(t), "Fri, 29 Apr 2022 12:49:47 GMT");
    }

    #[test]
    fn epoch_is_a_thursday() {
        assert_eq!(format_http_date(UNIX_EPOCH), "Thu, 01 Jan 1970 00:00:00 GMT");
    }
}
