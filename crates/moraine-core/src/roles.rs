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
use std::fmt;
use thiserror::Error;

/// The default role: resources without a reservation belong here and any
/// framework may consume them.
pub const ROLE_UNRESERVED: &str = "*";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoleError {
    #[error("Role path must not be empty")]
    Empty,
    #[error("Role path '{0}' has an empty component")]
    EmptyComponent(String),
    #[error("Role component '{0}' is reserved")]
    ReservedComponent(String),
    #[error("Role component '{0}' must not begin with '-'")]
    LeadingDash(String),
    #[error("Role '*' does not admit path components")]
    StarInPath,
}

/// A hierarchical allocation role, e.g. `eng/research`. Reservations made to
/// an ancestor role are allocatable to all of its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleName(String);

impl RoleName {
    pub fn parse(value: impl Into<String>) -> Result<Self, RoleError> {
        let value = value.into();

        if value.is_empty() {
            return Err(RoleError::Empty);
        }

        if value == ROLE_UNRESERVED {
            return Ok(Self(value));
        }

        for component in value.split('/') {
            if component.is_empty() {
                return Err(RoleError::EmptyComponent(value.clone()));
            }
            if component == "." || component == ".." {
                return Err(RoleError::ReservedComponent(component.to_string()));
            }
            if component == ROLE_UNRESERVED {
                return Err(RoleError::StarInPath);
            }
            if component.starts_with('-') {
                return Err(RoleError::LeadingDash(component.to_string()));
            }
        }

        Ok(Self(value))
    }

    /// Constructs a role from input already known to be valid. Panics on
    /// invalid input since role strings inside the system are validated at
    /// the boundary.
    pub fn assume(value: impl Into<String>) -> Self {
        let value = value.into();
        Self::parse(value.clone())
            .unwrap_or_else(|e| panic!("invalid role '{value}' passed validation boundary: {e}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unreserved_role(&self) -> bool {
        self.0 == ROLE_UNRESERVED
    }

    pub fn is_hierarchical(&self) -> bool {
        self.0.contains('/')
    }

    /// Whether this role may carry a quota guarantee. Nested roles cannot.
    pub fn is_quotable(&self) -> bool {
        !self.is_unreserved_role() && !self.is_hierarchical()
    }

    /// Proper ancestors, nearest first: `a/b/c` yields `a/b` then `a`.
    pub fn ancestors(&self) -> impl Iterator<Item = RoleName> + '_ {
        let path = self.0.as_str();
        path.rmatch_indices('/')
            .map(move |(idx, _)| RoleName(path[..idx].to_string()))
    }

    pub fn is_ancestor_of(&self, other: &RoleName) -> bool {
        other
            .0
            .strip_prefix(self.0.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_and_nested_roles() {
        assert!(RoleName::parse("eng").is_ok());
        assert!(RoleName::parse("eng/research/ml").is_ok());
        assert!(RoleName::parse("*").is_ok());
    }

    #[test]
    fn rejects_malformed_paths() {
        assert_eq!(RoleName::parse(""), Err(RoleError::Empty));
        assert!(RoleName::parse("/eng").is_err());
        assert!(RoleName::parse("eng/").is_err());
        assert!(RoleName::parse("eng//ml").is_err());
        assert!(RoleName::parse("eng/..").is_err());
        assert!(RoleName::parse("eng/-x").is_err());
        assert_eq!(RoleName::parse("eng/*"), Err(RoleError::StarInPath));
    }

    #[test]
    fn ancestors_walk_nearest_first() {
        let role = RoleName::parse("a/b/c").unwrap();
        let ancestors: Vec<String> = role.ancestors().map(|r| r.as_str().to_string()).collect();
        assert_eq!(ancestors, vec!["a/b".to_string(), "a".to_string()]);
    }

    #[test]
    fn ancestry_is_component_wise() {
        let a = RoleName::parse("eng").unwrap();
        let b = RoleName::parse("eng/research").unwrap();
        let c = RoleName::parse("engineering").unwrap();
        assert!(a.is_ancestor_of(&b));
        assert!(!a.is_ancestor_of(&c));
        assert!(!b.is_ancestor_of(&a));
    }
}
