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

use super::value::Scalar;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Stripped scalar quantities: resource-name to scalar amount, with every
/// reservation, volume, and allocation facet dropped. This is the unit of
/// quota and headroom accounting. Quantities never go negative; subtraction
/// saturates at zero per name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScalarQuantities(BTreeMap<String, Scalar>);

impl ScalarQuantities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of<N: Into<String>>(pairs: impl IntoIterator<Item = (N, f64)>) -> Self {
        let mut quantities = Self::new();
        for (name, value) in pairs {
            quantities.put(name.into(), Scalar::from_f64(value));
        }
        quantities
    }

    pub fn put(&mut self, name: impl Into<String>, amount: Scalar) {
        if amount.is_positive() {
            *self.0.entry(name.into()).or_default() += amount;
        }
    }

    pub fn get(&self, name: &str) -> Scalar {
        self.0.get(name).copied().unwrap_or_default()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Scalar)> {
        self.0.iter().map(|(name, amount)| (name.as_str(), *amount))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, other: &ScalarQuantities) -> bool {
        other
            .0
            .iter()
            .all(|(name, amount)| self.get(name) >= *amount)
    }
}

impl Add for ScalarQuantities {
    type Output = ScalarQuantities;

    fn add(mut self, rhs: ScalarQuantities) -> ScalarQuantities {
        self += rhs;
        self
    }
}

impl AddAssign for ScalarQuantities {
    fn add_assign(&mut self, rhs: ScalarQuantities) {
        for (name, amount) in rhs.0 {
            self.put(name, amount);
        }
    }
}

impl Sub for ScalarQuantities {
    type Output = ScalarQuantities;

    fn sub(mut self, rhs: ScalarQuantities) -> ScalarQuantities {
        self -= rhs;
        self
    }
}

impl SubAssign for ScalarQuantities {
    fn sub_assign(&mut self, rhs: ScalarQuantities) {
        for (name, amount) in rhs.0 {
            if let Some(own) = self.0.get_mut(&name) {
                *own = own.saturating_sub(amount);
                if own.is_zero() {
                    self.0.remove(&name);
                }
            }
        }
    }
}

impl fmt::Display for ScalarQuantities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(name, amount)| format!("{name}:{amount}"))
            .collect();
        f.write_str(&parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtraction_saturates_per_name() {
        let a = ScalarQuantities::of([("cpus", 4.0), ("mem", 1024.0)]);
        let b = ScalarQuantities::of([("cpus", 10.0), ("mem", 512.0)]);
        let diff = a - b;
        assert_eq!(diff.get("cpus"), Scalar::ZERO);
        assert_eq!(diff.get("mem"), Scalar::from_f64(512.0));
    }

    #[test]
    fn containment_requires_every_name() {
        let pool = ScalarQuantities::of([("cpus", 8.0), ("mem", 4096.0)]);
        assert!(pool.contains(&ScalarQuantities::of([("cpus", 8.0)])));
        assert!(!pool.contains(&ScalarQuantities::of([("cpus", 8.0), ("gpus", 1.0)])));
    }

    #[test]
    fn zero_amounts_are_not_tracked() {
        let mut quantities = ScalarQuantities::new();
        quantities.put("cpus", Scalar::ZERO);
        assert!(quantities.is_empty());
    }
}
