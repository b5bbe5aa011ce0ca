//! Standard 5-field cron parsing, evaluated in UTC.
//!
//! `cron` is a small, widely used crate for this and is documented in
//! `DESIGN.md` as an enrichment import rather than hand-rolled parsing.

use chrono::{DateTime, Utc};
use std::str::FromStr;

use crate::zerg::error::ZergError;

/// The next fire time strictly after `after`, or an error if `spec` doesn't parse.
///
/// `spec` is standard 5-field cron (`min hour dom month dow`); the `cron`
/// crate itself parses 6/7-field expressions with a leading seconds column,
/// so a `0` seconds field is prepended before handing it off.
pub fn next_fire_after(spec: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, ZergError> {
    let six_field = format!("0 {spec}");
    let schedule = ::cron::Schedule::from_str(&six_field)
        .map_err(|e| ZergError::validation(format!("invalid cron expression: {e}")))?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| ZergError::validation("cron expression has no future occurrences"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn every_minute_fires_on_the_next_minute_boundary() {
        let spec = "* * * * *";
        let after = Utc.with_ymd_and_hms(2026, 7, 26, 10, 30, 15).unwrap();
        let next = next_fire_after(spec, after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 26, 10, 31, 0).unwrap());
    }

    #[test]
    fn malformed_spec_is_rejected() {
        assert!(next_fire_after("not a cron spec", Utc::now()).is_err());
    }
}
