//! Service calendars for determining when trips run.
//!
//! Operators publish timetables against named calendars (`Weekday`,
//! `SaturdayHoliday`, `Monday`, special date lists, ...). Several of them can
//! apply to the same day, so the [`CalendarPlanner`] picks the one calendar a
//! route actually runs on each date. The result is expressed as GTFS-style
//! [`ServiceCalendar`]s (calendar.txt + calendar_dates.txt logic).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{Datelike, Days, NaiveDate, Weekday};

use crate::identifiers::{RouteIdentifier, ServiceIdentifier};
use crate::identifiers::strip_namespace;

/// Determines which days a transit service operates
#[derive(Clone, Debug)]
pub struct ServiceCalendar {
    pub service_id: ServiceIdentifier,

    // Regular schedule
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub weekdays: WeekdayFlags,

    // Exception dates
    pub added_dates: Arc<HashSet<NaiveDate>>,   // Service runs on these dates
    pub removed_dates: Arc<HashSet<NaiveDate>>, // Service does not run on these dates
}

/// Compact representation of which weekdays a service runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WeekdayFlags {
    pub(crate) flags: u8,
}

impl WeekdayFlags {
    pub fn new() -> Self {
        Self { flags: 0 }
    }

    pub fn of(days: &[Weekday]) -> Self {
        let mut flags = Self::new();
        for day in days {
            flags.set(*day);
        }
        flags
    }

    pub fn set(&mut self, weekday: Weekday) {
        self.flags |= 1 << weekday.number_from_monday();
    }

    pub fn contains(&self, weekday: Weekday) -> bool {
        (self.flags & (1 << weekday.number_from_monday())) != 0
    }

    /// Days in Monday-first order
    pub fn days(&self) -> Vec<Weekday> {
        [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .filter(|d| self.contains(*d))
        .collect()
    }
}

impl ServiceCalendar {
    /// Check if the service runs on a given date
    pub fn runs_on(&self, date: NaiveDate) -> bool {
        // Check explicit additions first
        if self.added_dates.contains(&date) {
            return true;
        }

        // Check explicit removals
        if self.removed_dates.contains(&date) {
            return false;
        }

        // Check regular schedule
        if date < self.start_date || date > self.end_date {
            return false;
        }

        self.weekdays.contains(date.weekday())
    }

    /// Active dates in ascending order (calendar_dates.txt rows).
    pub fn active_dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = dates_between(self.start_date, self.end_date)
            .filter(|d| self.runs_on(*d))
            .collect();
        for added in self.added_dates.iter() {
            if *added < self.start_date || *added > self.end_date {
                dates.push(*added);
            }
        }
        dates.sort();
        dates.dedup();
        dates
    }
}

// ============================================================================
// Named calendars
// ============================================================================

/// A named calendar as used in published timetables.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CalendarKind {
    Everyday,
    Weekday,
    SaturdayHoliday,
    Holiday,
    Day(Weekday),
    /// Operator-specific list of dates
    Special(Arc<str>),
}

impl CalendarKind {
    pub fn parse(raw: &str) -> Self {
        match strip_namespace(raw) {
            "Everyday" => Self::Everyday,
            "Weekday" => Self::Weekday,
            "SaturdayHoliday" => Self::SaturdayHoliday,
            "Holiday" => Self::Holiday,
            "Monday" => Self::Day(Weekday::Mon),
            "Tuesday" => Self::Day(Weekday::Tue),
            "Wednesday" => Self::Day(Weekday::Wed),
            "Thursday" => Self::Day(Weekday::Thu),
            "Friday" => Self::Day(Weekday::Fri),
            "Saturday" => Self::Day(Weekday::Sat),
            "Sunday" => Self::Day(Weekday::Sun),
            other => Self::Special(other.into()),
        }
    }

    /// Regular weekly pattern (calendar.txt columns). Public holidays and
    /// special date lists have none; their dates are all exceptions.
    pub fn weekdays(&self) -> WeekdayFlags {
        use Weekday::*;
        match self {
            Self::Everyday => WeekdayFlags::of(&[Mon, Tue, Wed, Thu, Fri, Sat, Sun]),
            Self::Weekday => WeekdayFlags::of(&[Mon, Tue, Wed, Thu, Fri]),
            Self::SaturdayHoliday => WeekdayFlags::of(&[Sat, Sun]),
            Self::Day(day) => WeekdayFlags::of(&[*day]),
            Self::Holiday | Self::Special(_) => WeekdayFlags::new(),
        }
    }
}

/// Picks the calendar each route runs on for every date of a build window.
///
/// Priority per date: special date lists, then `Holiday` / `SaturdayHoliday`
/// on public holidays, then the calendar for that exact weekday, then
/// `Weekday` / `SaturdayHoliday` by weekday, then `Everyday`.
#[derive(Clone, Debug, Default)]
pub struct CalendarPlanner {
    holidays: HashSet<NaiveDate>,
    special: HashMap<NaiveDate, BTreeSet<Arc<str>>>,
}

impl CalendarPlanner {
    pub fn new(
        holidays: impl IntoIterator<Item = NaiveDate>,
        special_days: impl IntoIterator<Item = (Arc<str>, NaiveDate)>,
    ) -> Self {
        let mut special: HashMap<NaiveDate, BTreeSet<Arc<str>>> = HashMap::new();
        for (calendar, date) in special_days {
            special
                .entry(date)
                .or_default()
                .insert(strip_namespace(&calendar).into());
        }

        Self {
            holidays: holidays.into_iter().collect(),
            special,
        }
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    /// Calendars (out of `used`, the ones a route publishes) active on `date`.
    pub fn active_calendars(&self, used: &BTreeSet<Arc<str>>, date: NaiveDate) -> Vec<Arc<str>> {
        if let Some(special) = self.special.get(&date) {
            let hits: Vec<Arc<str>> = special.intersection(used).cloned().collect();
            if !hits.is_empty() {
                return hits;
            }
        }

        let weekday = date.weekday();
        let is_weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);

        let mut priority = Vec::with_capacity(5);
        if self.is_holiday(date) {
            priority.push(CalendarKind::Holiday);
            priority.push(CalendarKind::SaturdayHoliday);
        }
        priority.push(CalendarKind::Day(weekday));
        priority.push(if is_weekend {
            CalendarKind::SaturdayHoliday
        } else {
            CalendarKind::Weekday
        });
        priority.push(CalendarKind::Everyday);

        priority
            .iter()
            .find_map(|kind| used.iter().find(|name| CalendarKind::parse(name) == *kind))
            .cloned()
            .into_iter()
            .collect()
    }

    /// Materialize one `{route}.{calendar}` service over `[start, end]`.
    ///
    /// The weekly pattern comes from the calendar's kind; window dates that
    /// differ from it become added or removed exceptions.
    pub fn service_calendar(
        &self,
        route: &RouteIdentifier,
        calendar: &str,
        used: &BTreeSet<Arc<str>>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> ServiceCalendar {
        let weekdays = CalendarKind::parse(calendar).weekdays();

        let mut added = HashSet::new();
        let mut removed = HashSet::new();
        for date in dates_between(start, end) {
            let active = self
                .active_calendars(used, date)
                .iter()
                .any(|c| c.as_ref() == calendar);
            match (active, weekdays.contains(date.weekday())) {
                (true, false) => {
                    added.insert(date);
                }
                (false, true) => {
                    removed.insert(date);
                }
                _ => {}
            }
        }

        ServiceCalendar {
            service_id: ServiceIdentifier::new(format!("{}.{}", route, calendar)),
            start_date: start,
            end_date: end,
            weekdays,
            added_dates: Arc::new(added),
            removed_dates: Arc::new(removed),
        }
    }
}

/// Inclusive date range iterator.
pub fn dates_between(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    let mut next = Some(start);
    std::iter::from_fn(move || {
        let current = next.filter(|d| *d <= end)?;
        next = current.checked_add_days(Days::new(1));
        Some(current)
    })
}
