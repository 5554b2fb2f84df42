//! Daily schedule helper.

use gleaner_core::config::Schedule;
use time::{Duration, OffsetDateTime, Time};

/// Next occurrence of the daily `HH:MM` UTC trigger strictly after `now`.
pub fn next_run_at(now: OffsetDateTime, schedule: Schedule) -> OffsetDateTime {
    let at = Time::from_hms(schedule.hour, schedule.minute, 0)
        .unwrap_or(Time::MIDNIGHT);
    let today = now.replace_time(at);
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn later_today_when_time_has_not_passed() {
        let now = datetime!(2026-03-01 01:00 UTC);
        let next = next_run_at(now, "02:30".parse().unwrap());
        assert_eq!(next, datetime!(2026-03-01 02:30 UTC));
    }

    #[test]
    fn tomorrow_when_time_already_passed() {
        let now = datetime!(2026-03-01 03:00 UTC);
        let next = next_run_at(now, "02:30".parse().unwrap());
        assert_eq!(next, datetime!(2026-03-02 02:30 UTC));
    }

    #[test]
    fn exact_trigger_time_rolls_to_tomorrow() {
        let now = datetime!(2026-03-01 02:30 UTC);
        let next = next_run_at(now, "02:30".parse().unwrap());
        assert_eq!(next, datetime!(2026-03-02 02:30 UTC));
    }
}
