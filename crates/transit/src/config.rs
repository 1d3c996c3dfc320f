//! Build parameters.

use chrono::{Days, NaiveDate};

/// Knobs of one consolidation run.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BuildConfig {
    /// Longest accepted wait (seconds) between a fragment's end and its
    /// through-service continuation's start
    pub lookahead_secs: u32,
    /// Same-name stations closer than this (meters) merge into one station
    pub merge_radius_m: f64,
    /// First service date of the build window
    pub start_date: Option<NaiveDate>,
    /// Number of service dates in the build window
    pub window_days: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            lookahead_secs: 3600,
            merge_radius_m: 1000.0,
            start_date: None,
            window_days: 180,
        }
    }
}

impl BuildConfig {
    /// Inclusive (start, end) of the build window. Without an explicit start
    /// date the window begins at `fallback`.
    pub fn window(&self, fallback: NaiveDate) -> (NaiveDate, NaiveDate) {
        let start = self.start_date.unwrap_or(fallback);
        let span = u64::from(self.window_days.saturating_sub(1));
        let end = start.checked_add_days(Days::new(span)).unwrap_or(NaiveDate::MAX);
        (start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BuildConfig::default();
        assert_eq!(config.lookahead_secs, 3600);
        approx::assert_relative_eq!(config.merge_radius_m, 1000.0);
    }

    #[test]
    fn test_window() {
        let config = BuildConfig {
            start_date: NaiveDate::from_ymd_opt(2024, 4, 1),
            window_days: 7,
            ..Default::default()
        };
        let today = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
        let (start, end) = config.window(today);
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 4, 7).unwrap());
    }
}
