//! Suppression policy — which exit statuses are non-fatal for a node.
//!
//! A status of 0 is always success. Any other status fails the pipeline
//! unless the node's policy suppresses it:
//!
//! ```text
//! Strict              nothing suppressed (default)
//! Statuses [2, 5..=9] exact codes and inclusive ranges
//! All                 every status suppressed
//! Reckless            every status suppressed, stderr discarded too
//! ```
//!
//! Suppression never applies to launch errors; it is only consulted once a
//! node has produced an exit status.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

/// One entry of a status list: an exact code or an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusMatch {
    /// A single exit status.
    Exact(i32),
    /// An inclusive range of exit statuses.
    Range { start: i32, end: i32 },
}

impl StatusMatch {
    /// True if `status` falls under this entry.
    pub fn matches(&self, status: i32) -> bool {
        match *self {
            StatusMatch::Exact(code) => code == status,
            StatusMatch::Range { start, end } => (start..=end).contains(&status),
        }
    }
}

impl From<i32> for StatusMatch {
    fn from(code: i32) -> Self {
        StatusMatch::Exact(code)
    }
}

impl From<RangeInclusive<i32>> for StatusMatch {
    fn from(range: RangeInclusive<i32>) -> Self {
        StatusMatch::Range {
            start: *range.start(),
            end: *range.end(),
        }
    }
}

/// Error-suppression policy attached to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "statuses", rename_all = "snake_case")]
pub enum Suppression {
    /// Any non-zero status is fatal.
    #[default]
    Strict,
    /// The listed statuses are non-fatal.
    Statuses(Vec<StatusMatch>),
    /// Every status is non-fatal.
    All,
    /// Every status is non-fatal and the node's stderr is discarded.
    Reckless,
}

impl Suppression {
    /// Build a policy from a list of statuses and ranges.
    ///
    /// The list is normalized (sorted, deduplicated) so that building the
    /// same policy twice yields equal values. An empty list suppresses
    /// everything.
    pub fn statuses<I, M>(matches: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<StatusMatch>,
    {
        let mut list: Vec<StatusMatch> = matches.into_iter().map(Into::into).collect();
        if list.is_empty() {
            return Suppression::All;
        }
        list.sort();
        list.dedup();
        Suppression::Statuses(list)
    }

    /// Build a policy for a single inclusive range.
    pub fn range(range: RangeInclusive<i32>) -> Self {
        Suppression::Statuses(vec![range.into()])
    }

    /// True if a non-zero `status` is non-fatal under this policy.
    pub fn suppresses(&self, status: i32) -> bool {
        if status == 0 {
            return false;
        }
        match self {
            Suppression::Strict => false,
            Suppression::Statuses(list) => list.iter().any(|m| m.matches(status)),
            Suppression::All | Suppression::Reckless => true,
        }
    }

    /// True if `status` should fail the pipeline.
    pub fn is_fatal(&self, status: i32) -> bool {
        status != 0 && !self.suppresses(status)
    }

    /// True if the node's stderr should be thrown away.
    pub fn discards_stderr(&self) -> bool {
        matches!(self, Suppression::Reckless)
    }
}
