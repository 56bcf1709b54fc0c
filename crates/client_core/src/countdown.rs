use chrono::{DateTime, Utc};

pub const OVERDUE_LABEL: &str = "overdue";
pub const IDLE_LABEL: &str = "--:--:--";

/// `H:MM:SS` remaining until the deadline, or the fixed overdue label once it
/// has elapsed.
pub fn countdown_display(deadline: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let remaining = deadline - now;
    if remaining.num_milliseconds() <= 0 {
        return OVERDUE_LABEL.to_string();
    }
    let total = remaining.num_seconds();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn formats_hours_minutes_seconds() {
        let deadline = base() + Duration::hours(11) + Duration::minutes(59) + Duration::seconds(59);
        assert_eq!(countdown_display(deadline, base()), "11:59:59");
    }

    #[test]
    fn pads_minutes_and_seconds_but_not_hours() {
        let deadline = base() + Duration::hours(2) + Duration::minutes(3) + Duration::seconds(4);
        assert_eq!(countdown_display(deadline, base()), "2:03:04");
    }

    #[test]
    fn sub_hour_windows_show_zero_hours() {
        let deadline = base() + Duration::seconds(30);
        assert_eq!(countdown_display(deadline, base()), "0:00:30");
    }

    #[test]
    fn elapsed_deadline_shows_the_overdue_label() {
        assert_eq!(countdown_display(base(), base()), OVERDUE_LABEL);
        let deadline = base() - Duration::seconds(5);
        assert_eq!(countdown_display(deadline, base()), OVERDUE_LABEL);
    }

    #[test]
    fn a_sub_second_remainder_is_not_yet_overdue() {
        let deadline = base() + Duration::milliseconds(400);
        assert_eq!(countdown_display(deadline, base()), "0:00:00");
    }
}
