//! Type-safe, efficient identifiers for transit entities.
//!
//! All identifiers use Arc<str> for cheap cloning and minimal memory overhead.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::NaiveDate;

macro_rules! impl_identifier {
    ($name:ident) => {
        #[derive(Clone, Debug)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(s: impl AsRef<str>) -> Self {
                Self(s.as_ref().into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
            }
        }

        impl Eq for $name {}

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.0.cmp(&other.0)
            }
        }

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.0.hash(state);
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        #[cfg(feature = "serde")]
        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        #[cfg(feature = "serde")]
        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Ok(Self::new(s))
            }
        }
    };
}

impl_identifier!(OperatorIdentifier);
impl_identifier!(StationIdentifier);
impl_identifier!(RouteIdentifier);
impl_identifier!(TripIdentifier);
impl_identifier!(ServiceIdentifier);
impl_identifier!(TrainNumber);

/// Strip an ODPT-style namespace (`odpt.Station:JR-East.Yamanote.Tokyo`)
/// down to the local part. Ids without a namespace are returned as-is.
pub fn strip_namespace(raw: &str) -> &str {
    match raw.split_once(':') {
        Some((_, local)) => local,
        None => raw,
    }
}

/// Identity of one fragment in the pool: one operator's run of one train
/// number on one route for one service day.
///
/// Ordering is lexicographic over (operator, route, train, date) and is the
/// tie-break order used everywhere a deterministic choice is needed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FragmentKey {
    pub operator: OperatorIdentifier,
    pub route: RouteIdentifier,
    pub train_number: TrainNumber,
    pub service_date: NaiveDate,
}

impl FragmentKey {
    pub fn new(
        operator: impl Into<OperatorIdentifier>,
        route: impl Into<RouteIdentifier>,
        train_number: impl Into<TrainNumber>,
        service_date: NaiveDate,
    ) -> Self {
        Self {
            operator: operator.into(),
            route: route.into(),
            train_number: train_number.into(),
            service_date,
        }
    }

    /// Key used by realtime lookups, which do not know the route.
    pub fn train_identity(&self) -> TrainIdentity {
        TrainIdentity {
            operator: self.operator.clone(),
            train_number: self.train_number.clone(),
            service_date: self.service_date,
        }
    }
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.operator,
            self.route,
            self.train_number,
            self.service_date.format("%Y%m%d")
        )
    }
}

/// (operator, train number, service date) as reported by realtime feeds.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrainIdentity {
    pub operator: OperatorIdentifier,
    pub train_number: TrainNumber,
    pub service_date: NaiveDate,
}
