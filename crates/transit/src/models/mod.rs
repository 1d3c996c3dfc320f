//! Timetable data models, types, and traits.

pub mod calendar;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use calendar::{CalendarKind, CalendarPlanner, ServiceCalendar, WeekdayFlags};
pub use traits::TripLookup;
pub use types::{
    DirectionId, FragmentPool, RawFragment, RawStop, Result, StopTime, TransitError, Trip, SECONDS_PER_DAY,
};
