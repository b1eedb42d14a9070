// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// A fixed-point scalar quantity: an integer count of thousandths. Resource
/// arithmetic stays exact under repeated addition and subtraction, which
/// float scalars do not.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Scalar(i64);

impl Scalar {
    pub const ZERO: Scalar = Scalar(0);

    pub fn from_millis(millis: i64) -> Self {
        Scalar(millis)
    }

    /// Rounds to the nearest thousandth, matching the precision the rest of
    /// the system accounts in.
    pub fn from_f64(value: f64) -> Self {
        Scalar((value * 1000.0).round() as i64)
    }

    pub fn from_whole(value: i64) -> Self {
        Scalar(value * 1000)
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn min(self, other: Scalar) -> Scalar {
        Scalar(self.0.min(other.0))
    }

    pub fn saturating_sub(self, other: Scalar) -> Scalar {
        Scalar((self.0 - other.0).max(0))
    }
}

impl Add for Scalar {
    type Output = Scalar;

    fn add(self, rhs: Scalar) -> Scalar {
        Scalar(self.0 + rhs.0)
    }
}

impl AddAssign for Scalar {
    fn add_assign(&mut self, rhs: Scalar) {
        self.0 += rhs.0;
    }
}

impl Sub for Scalar {
    type Output = Scalar;

    fn sub(self, rhs: Scalar) -> Scalar {
        Scalar(self.0 - rhs.0)
    }
}

impl SubAssign for Scalar {
    fn sub_assign(&mut self, rhs: Scalar) {
        self.0 -= rhs.0;
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            let mut text = format!("{:.3}", self.as_f64());
            while text.ends_with('0') {
                text.pop();
            }
            f.write_str(&text)
        }
    }
}

/// A set of disjoint, normalised inclusive ranges over u64 (port pools).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ranges(Vec<(u64, u64)>);

impl Ranges {
    pub fn new(mut ranges: Vec<(u64, u64)>) -> Self {
        ranges.retain(|(begin, end)| begin <= end);
        ranges.sort_unstable();

        let mut normalised: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
        for (begin, end) in ranges {
            match normalised.last_mut() {
                Some(last) if begin <= last.1.saturating_add(1) => {
                    last.1 = last.1.max(end);
                }
                _ => normalised.push((begin, end)),
            }
        }

        Ranges(normalised)
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn size(&self) -> u64 {
        self.0.iter().map(|(begin, end)| end - begin + 1).sum()
    }

    pub fn union(&self, other: &Ranges) -> Ranges {
        let mut combined = self.0.clone();
        combined.extend_from_slice(&other.0);
        Ranges::new(combined)
    }

    pub fn subtract(&self, other: &Ranges) -> Ranges {
        let mut remaining = self.0.clone();

        for &(sub_begin, sub_end) in &other.0 {
            let mut next = Vec::with_capacity(remaining.len() + 1);
            for &(begin, end) in &remaining {
                if sub_end < begin || sub_begin > end {
                    next.push((begin, end));
                    continue;
                }
                if begin < sub_begin {
                    next.push((begin, sub_begin - 1));
                }
                if end > sub_end {
                    next.push((sub_end + 1, end));
                }
            }
            remaining = next;
        }

        Ranges(remaining)
    }

    pub fn contains(&self, other: &Ranges) -> bool {
        other.0.iter().all(|&(begin, end)| {
            self.0
                .iter()
                .any(|&(own_begin, own_end)| own_begin <= begin && end <= own_end)
        })
    }
}

impl fmt::Display for Ranges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(begin, end)| format!("{begin}-{end}"))
            .collect();
        write!(f, "[{}]", parts.join(","))
    }
}

/// The value facet of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResourceValue {
    Scalar(Scalar),
    Ranges(Ranges),
    Set(BTreeSet<String>),
}

impl ResourceValue {
    pub fn scalar(value: f64) -> Self {
        ResourceValue::Scalar(Scalar::from_f64(value))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ResourceValue::Scalar(scalar) => !scalar.is_positive(),
            ResourceValue::Ranges(ranges) => ranges.is_empty(),
            ResourceValue::Set(set) => set.is_empty(),
        }
    }

    pub fn same_kind(&self, other: &ResourceValue) -> bool {
        matches!(
            (self, other),
            (ResourceValue::Scalar(_), ResourceValue::Scalar(_))
                | (ResourceValue::Ranges(_), ResourceValue::Ranges(_))
                | (ResourceValue::Set(_), ResourceValue::Set(_))
        )
    }

    pub fn merge(&mut self, other: &ResourceValue) {
        match (self, other) {
            (ResourceValue::Scalar(own), ResourceValue::Scalar(theirs)) => *own += *theirs,
            (ResourceValue::Ranges(own), ResourceValue::Ranges(theirs)) => {
                *own = own.union(theirs);
            }
            (ResourceValue::Set(own), ResourceValue::Set(theirs)) => {
                own.extend(theirs.iter().cloned());
            }
            _ => panic!("merged resource values of different kinds"),
        }
    }

    /// Removes as much of `other` as is present; the caller checks
    /// `contains` first when exact subtraction is required.
    pub fn remove(&mut self, other: &ResourceValue) {
        match (self, other) {
            (ResourceValue::Scalar(own), ResourceValue::Scalar(theirs)) => {
                *own = own.saturating_sub(*theirs);
            }
            (ResourceValue::Ranges(own), ResourceValue::Ranges(theirs)) => {
                *own = own.subtract(theirs);
            }
            (ResourceValue::Set(own), ResourceValue::Set(theirs)) => {
                for item in theirs {
                    own.remove(item);
                }
            }
            _ => panic!("subtracted resource values of different kinds"),
        }
    }

    pub fn contains(&self, other: &ResourceValue) -> bool {
        match (self, other) {
            (ResourceValue::Scalar(own), ResourceValue::Scalar(theirs)) => own >= theirs,
            (ResourceValue::Ranges(own), ResourceValue::Ranges(theirs)) => own.contains(theirs),
            (ResourceValue::Set(own), ResourceValue::Set(theirs)) => own.is_superset(theirs),
            _ => false,
        }
    }
}

impl fmt::Display for ResourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceValue::Scalar(scalar) => scalar.fmt(f),
            ResourceValue::Ranges(ranges) => ranges.fmt(f),
            ResourceValue::Set(set) => {
                let parts: Vec<&str> = set.iter().map(String::as_str).collect();
                write!(f, "{{{}}}", parts.join(","))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_arithmetic_is_exact() {
        let a = Scalar::from_f64(0.1);
        let mut total = Scalar::ZERO;
        for _ in 0..10 {
            total += a;
        }
        assert_eq!(total, Scalar::from_whole(1));
    }

    #[test]
    fn ranges_normalise_and_coalesce() {
        let ranges = Ranges::new(vec![(5, 10), (1, 3), (11, 20)]);
        assert_eq!(ranges.ranges(), &[(1, 3), (5, 20)]);
        assert_eq!(ranges.size(), 19);
    }

    #[test]
    fn range_subtraction_splits() {
        let pool = Ranges::new(vec![(1, 100)]);
        let taken = Ranges::new(vec![(10, 20), (50, 50)]);
        let rest = pool.subtract(&taken);
        assert_eq!(rest.ranges(), &[(1, 9), (21, 49), (51, 100)]);
        assert!(pool.contains(&taken));
        assert!(!rest.contains(&taken));
    }

    #[test]
    fn set_values_behave_as_sets() {
        let mut own = ResourceValue::Set(["a", "b"].iter().map(|s| s.to_string()).collect());
        let theirs = ResourceValue::Set(["b"].iter().map(|s| s.to_string()).collect());
        assert!(own.contains(&theirs));
        own.remove(&theirs);
        assert!(!own.contains(&theirs));
    }
}
