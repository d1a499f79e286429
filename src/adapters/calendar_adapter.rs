//! Trade-date providers.

use crate::ports::calendar_port::CalendarPort;
use chrono::{Datelike, Duration, Local, NaiveDate, Weekday};

/// Today's local date, with weekends rolled back to the preceding Friday.
/// Exchange holidays are not modelled.
pub struct WeekdayCalendar;

impl CalendarPort for WeekdayCalendar {
    fn trade_date(&self) -> NaiveDate {
        previous_weekday(Local::now().date_naive())
    }
}

/// Always reports the same date.
pub struct FixedCalendar {
    date: NaiveDate,
}

impl FixedCalendar {
    pub fn new(date: NaiveDate) -> Self {
        Self { date }
    }
}

impl CalendarPort for FixedCalendar {
    fn trade_date(&self) -> NaiveDate {
        self.date
    }
}

pub fn previous_weekday(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date - Duration::days(2),
        _ => date,
    }
}
