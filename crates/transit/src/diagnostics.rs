//! Data-quality findings collected during a build.
//!
//! Nothing here aborts a build. Each finding is logged as a `tracing`
//! warning when recorded and kept for the caller to review.

use std::fmt;

use crate::identifiers::FragmentKey;
use crate::models::TransitError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DiagnosticKind {
    MalformedRecord,
    UnknownStation,
    DuplicateFragment,
    InactiveRoute,
    InactiveCalendar,
    UnmatchedContinuation,
    AmbiguousContinuation,
    ContestedContinuation,
    CyclicChain,
    NonMonotonicChain,
}

impl DiagnosticKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedRecord => "malformed-record",
            Self::UnknownStation => "unknown-station",
            Self::DuplicateFragment => "duplicate-fragment",
            Self::InactiveRoute => "inactive-route",
            Self::InactiveCalendar => "inactive-calendar",
            Self::UnmatchedContinuation => "unmatched-continuation",
            Self::AmbiguousContinuation => "ambiguous-continuation",
            Self::ContestedContinuation => "contested-continuation",
            Self::CyclicChain => "cyclic-chain",
            Self::NonMonotonicChain => "non-monotonic-chain",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub fragment: Option<FragmentKey>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            fragment: None,
            message: message.into(),
        }
    }

    pub fn with_fragment(mut self, key: FragmentKey) -> Self {
        self.fragment = Some(key);
        self
    }

    /// Classify a per-record or per-chain error.
    pub fn from_error(error: &TransitError) -> Self {
        let kind = match error {
            TransitError::UnknownStation { .. } => DiagnosticKind::UnknownStation,
            TransitError::CyclicChain(_) => DiagnosticKind::CyclicChain,
            TransitError::NonMonotonicChain { .. } => DiagnosticKind::NonMonotonicChain,
            _ => DiagnosticKind::MalformedRecord,
        };
        let diagnostic = Self::new(kind, error.to_string());
        match error {
            TransitError::CyclicChain(key) => diagnostic.with_fragment(key.clone()),
            TransitError::NonMonotonicChain { head, .. } => diagnostic.with_fragment(head.clone()),
            _ => diagnostic,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fragment {
            Some(key) => write!(f, "[{}] {}: {}", self.kind.as_str(), key, self.message),
            None => write!(f, "[{}] {}", self.kind.as_str(), self.message),
        }
    }
}

/// Ordered list of findings.
#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, diagnostic: Diagnostic) {
        tracing::warn!(kind = diagnostic.kind.as_str(), "{}", diagnostic);
        self.entries.push(diagnostic);
    }

    /// Append findings that were already logged elsewhere.
    pub fn extend(&mut self, other: impl IntoIterator<Item = Diagnostic>) {
        self.entries.extend(other);
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.entries.iter().filter(|d| d.kind == kind).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.entries
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
