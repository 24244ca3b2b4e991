//! Daily refresh gate.
//!
//! Decides whether a news refresh may run now, given the persisted record of the
//! last attempt, and computes the record to persist after an attempt. Both
//! functions are pure; persistence lives in [`crate::record_store`].

use chrono::{NaiveDate, NaiveDateTime};

/// Layout of the timestamp on the first line of the record file.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Last recorded refresh attempt and how many attempts happened on its date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshRecord {
    pub last_update: NaiveDateTime,
    pub refresh_count: u32,
}

impl RefreshRecord {
    /// Parse the two-line text form. Anything unparseable yields `None`,
    /// which callers treat exactly like a missing record. Lines after the
    /// second are ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let last_update =
            NaiveDateTime::parse_from_str(lines.next()?.trim(), TIMESTAMP_FORMAT).ok()?;
        let refresh_count = lines.next()?.trim().parse::<u32>().ok()?;
        Some(Self {
            last_update,
            refresh_count,
        })
    }

    /// Text form written to disk: timestamp, newline, count (no trailing newline).
    pub fn to_file_contents(&self) -> String {
        format!(
            "{}\n{}",
            self.last_update.format(TIMESTAMP_FORMAT),
            self.refresh_count
        )
    }

    /// Count that applies on `today`; zero once the date has rolled over.
    pub fn effective_count(&self, today: NaiveDate) -> u32 {
        if self.last_update.date() == today {
            self.refresh_count
        } else {
            0
        }
    }

    pub fn formatted_last_update(&self) -> String {
        self.last_update.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Whether a refresh is permitted at `now` under a cap of `max_per_day`.
pub fn may_refresh(record: Option<&RefreshRecord>, now: NaiveDateTime, max_per_day: u32) -> bool {
    match record {
        None => true,
        Some(r) if r.last_update.date() != now.date() => true,
        Some(r) => r.refresh_count < max_per_day,
    }
}

/// Record to persist after an attempt at `now`, successful or not.
pub fn record_refresh(record: Option<&RefreshRecord>, now: NaiveDateTime) -> RefreshRecord {
    let refresh_count = match record {
        Some(r) if r.last_update.date() == now.date() => r.refresh_count.saturating_add(1),
        _ => 1,
    };
    RefreshRecord {
        last_update: now,
        refresh_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap()
    }

    #[test]
    fn first_refresh_is_always_allowed() {
        let now = at("2025-03-17 09:15:00");
        for cap in [1, 2, 5, u32::MAX] {
            assert!(may_refresh(None, now, cap));
        }
    }

    #[test]
    fn same_day_cap_is_enforced() {
        let now = at("2025-03-17 18:00:00");
        for count in 0..5u32 {
            let record = RefreshRecord {
                last_update: at("2025-03-17 08:00:00"),
                refresh_count: count,
            };
            for cap in 1..5u32 {
                assert_eq!(may_refresh(Some(&record), now, cap), count < cap);
            }
        }
    }

    #[test]
    fn new_day_resets_budget() {
        let record = RefreshRecord {
            last_update: at("2025-03-16 23:59:59"),
            refresh_count: 2,
        };
        assert!(may_refresh(Some(&record), at("2025-03-17 00:00:00"), 2));
        assert_eq!(record.effective_count(at("2025-03-17 00:00:00").date()), 0);
    }

    #[test]
    fn counts_up_within_one_day() {
        let morning = at("2025-03-17 08:00:00");
        let first = record_refresh(None, morning);
        let second = record_refresh(Some(&first), morning + Duration::hours(2));
        let third = record_refresh(Some(&second), morning + Duration::hours(4));

        assert_eq!(
            [first.refresh_count, second.refresh_count, third.refresh_count],
            [1, 2, 3]
        );
        assert_eq!(third.last_update, morning + Duration::hours(4));
    }

    #[test]
    fn rollover_restarts_count_at_one() {
        let yesterday = RefreshRecord {
            last_update: at("2025-03-16 12:00:00"),
            refresh_count: 7,
        };
        let now = at("2025-03-17 07:30:00");
        assert_eq!(
            record_refresh(Some(&yesterday), now),
            RefreshRecord {
                last_update: now,
                refresh_count: 1
            }
        );
    }

    #[test]
    fn count_saturates_instead_of_overflowing() {
        let now = at("2025-03-17 07:30:00");
        let record = RefreshRecord {
            last_update: now,
            refresh_count: u32::MAX,
        };
        assert_eq!(record_refresh(Some(&record), now).refresh_count, u32::MAX);
    }

    #[test]
    fn parses_two_line_form_and_ignores_extra_lines() {
        let record = RefreshRecord::parse("2025-03-17 10:11:12\n2\nleftover\n").unwrap();
        assert_eq!(record.last_update, at("2025-03-17 10:11:12"));
        assert_eq!(record.refresh_count, 2);

        let crlf = RefreshRecord::parse("2025-03-17 10:11:12\r\n1\r\n").unwrap();
        assert_eq!(crlf.refresh_count, 1);
    }

    #[test]
    fn malformed_text_is_no_record() {
        for text in [
            "",
            "2025-03-17 10:11:12",
            "2025-03-17 10:11:12\n",
            "not-a-date\n1",
            "not-a-date\nabc",
            "2025-03-17\n1",
            "2025-03-17 10:11:12\nabc",
            "2025-03-17 10:11:12\n-1",
        ] {
            assert_eq!(RefreshRecord::parse(text), None, "input {text:?}");
        }
    }

    #[test]
    fn file_contents_have_no_trailing_newline() {
        let record = RefreshRecord {
            last_update: at("2025-03-17 10:11:12"),
            refresh_count: 2,
        };
        assert_eq!(record.to_file_contents(), "2025-03-17 10:11:12\n2");
        assert_eq!(RefreshRecord::parse(&record.to_file_contents()), Some(record));
    }

    #[test]
    fn scenario_two_refreshes_then_denied() {
        let now = at("2025-03-17 09:00:00");
        let mut record: Option<RefreshRecord> = None;

        assert!(may_refresh(record.as_ref(), now, 2));
        record = Some(record_refresh(record.as_ref(), now));
        assert_eq!(record.map(|r| r.refresh_count), Some(1));

        assert!(may_refresh(record.as_ref(), now, 2));
        record = Some(record_refresh(record.as_ref(), now));
        assert_eq!(record.map(|r| r.refresh_count), Some(2));

        assert!(!may_refresh(record.as_ref(), now, 2));
    }

    #[test]
    fn scenario_corrupt_file_behaves_like_absent() {
        let now = at("2025-03-17 09:00:00");
        let parsed = RefreshRecord::parse("not-a-date\nabc");

        assert!(may_refresh(parsed.as_ref(), now, 2));
        assert_eq!(record_refresh(parsed.as_ref(), now), record_refresh(None, now));
        assert_eq!(record_refresh(parsed.as_ref(), now).refresh_count, 1);
    }
}
