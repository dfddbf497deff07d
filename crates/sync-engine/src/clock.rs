//! VectorClock: per-device counters for causal ordering of file versions.
//!
//! Every sync-relevant version of a file carries a vector clock. Comparing two
//! clocks tells us whether one version descends from the other (`Before` /
//! `After`), whether they are the same history (`Equal`), or whether they were
//! edited independently on different devices (`Concurrent`).
//!
//! Clocks are values: `merge` and `increment` return new clocks and never
//! mutate the receiver.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use crate::device_id::DeviceId;

/// Causal relationship between two clocks, read as "`a` is ... `b`".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClockOrdering {
    /// `a` happened before `b` (`b` has seen everything `a` has, and more).
    Before,
    /// `a` happened after `b`.
    After,
    /// Same history.
    Equal,
    /// Neither dominates: independent edits.
    Concurrent,
}

/// Map of device id to counter. Devices missing from the map count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `device` (zero if never seen).
    pub fn get(&self, device: &str) -> u64 {
        self.0.get(device).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&c| c == 0)
    }

    /// Iterate `(device, counter)` pairs in device order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(d, c)| (d.as_str(), *c))
    }

    /// Compare two clocks componentwise over the union of their devices.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for device in self.0.keys().chain(other.0.keys()) {
            match self.get(device).cmp(&other.get(device)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Componentwise max of both clocks.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.0.clone();
        for (device, &counter) in &other.0 {
            let entry = merged.entry(device.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
        VectorClock(merged)
    }

    /// Copy of this clock with `device`'s counter bumped by one.
    pub fn increment(&self, device: &DeviceId) -> VectorClock {
        let mut next = self.0.clone();
        *next.entry(device.as_str().to_string()).or_insert(0) += 1;
        VectorClock(next)
    }

    /// True when this clock has seen everything `other` has (`After` or `Equal`).
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::After | ClockOrdering::Equal
        )
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        VectorClock(iter.into_iter().map(|(d, c)| (d.into(), c)).collect())
    }
}

impl<S: Into<String>, const N: usize> From<[(S, u64); N]> for VectorClock {
    fn from(pairs: [(S, u64); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl Display for VectorClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (device, counter)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", device, counter)?;
        }
        write!(f, "}}")
    }
}
