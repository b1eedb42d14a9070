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

pub mod quantities;
pub mod value;

pub use quantities::ScalarQuantities;
pub use value::{Ranges, ResourceValue, Scalar};

use crate::ids::ProviderId;
use crate::roles::RoleName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use thiserror::Error;

pub const CPUS: &str = "cpus";
pub const MEM: &str = "mem";
pub const DISK: &str = "disk";
pub const GPUS: &str = "gpus";
pub const PORTS: &str = "ports";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error("Conversion consumes {consumed} which is absent from the bundle")]
    ConversionConsumesAbsent { consumed: String },
    #[error("Conversion is not quantity-preserving: {0}")]
    ConversionNotBalanced(String),
    #[error("Invalid resource: {0}")]
    InvalidResource(String),
}

pub type ResourceResult<T> = Result<T, ResourceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationKind {
    Static,
    Dynamic,
}

/// One entry of a resource's reservation stack. The stack is ordered from
/// coarsest to finest role; the resource belongs to the role of the last
/// entry. An empty stack means unreserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub kind: ReservationKind,
    pub role: RoleName,
    pub principal: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Reservation {
    pub fn statically(role: RoleName) -> Self {
        Self {
            kind: ReservationKind::Static,
            role,
            principal: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn dynamically(role: RoleName, principal: impl Into<String>) -> Self {
        Self {
            kind: ReservationKind::Dynamic,
            role,
            principal: Some(principal.into()),
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub container_path: String,
    pub mode: VolumeMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persistence {
    pub id: String,
    pub principal: Option<String>,
}

/// Where a disk resource is carved from. MOUNT-backed disk is indivisible:
/// it is offered and allocated whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiskSource {
    Path { root: String },
    Mount { root: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub persistence: Option<Persistence>,
    pub volume: Option<Volume>,
    pub source: Option<DiskSource>,
}

/// A single resource with all orthogonal facets. Cross-referenced only by
/// value; identity of shared resources is the full facet tuple minus the
/// allocation role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub value: ResourceValue,
    #[serde(default)]
    pub reservations: Vec<Reservation>,
    #[serde(default)]
    pub disk: Option<DiskInfo>,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub revocable: bool,
    #[serde(default)]
    pub provider_id: Option<ProviderId>,
    #[serde(default)]
    pub allocation_role: Option<RoleName>,
}

impl Resource {
    pub fn scalar(name: impl Into<String>, amount: f64) -> Self {
        Self {
            name: name.into(),
            value: ResourceValue::scalar(amount),
            reservations: Vec::new(),
            disk: None,
            shared: false,
            revocable: false,
            provider_id: None,
            allocation_role: None,
        }
    }

    pub fn ports(ranges: Vec<(u64, u64)>) -> Self {
        Self {
            name: PORTS.to_string(),
            value: ResourceValue::Ranges(Ranges::new(ranges)),
            reservations: Vec::new(),
            disk: None,
            shared: false,
            revocable: false,
            provider_id: None,
            allocation_role: None,
        }
    }

    pub fn reserved_for(mut self, reservation: Reservation) -> Self {
        self.reservations.push(reservation);
        self
    }

    pub fn as_shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn as_revocable(mut self) -> Self {
        self.revocable = true;
        self
    }

    pub fn with_disk(mut self, disk: DiskInfo) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn from_provider(mut self, provider: ProviderId) -> Self {
        self.provider_id = Some(provider);
        self
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.value, ResourceValue::Scalar(_))
    }

    pub fn scalar_value(&self) -> Option<Scalar> {
        match self.value {
            ResourceValue::Scalar(scalar) => Some(scalar),
            _ => None,
        }
    }

    pub fn is_unreserved(&self) -> bool {
        self.reservations.is_empty()
    }

    pub fn reservation_role(&self) -> Option<&RoleName> {
        self.reservations.last().map(|reservation| &reservation.role)
    }

    pub fn has_refined_reservations(&self) -> bool {
        self.reservations.len() > 1
    }

    pub fn is_persistent_volume(&self) -> bool {
        self.disk
            .as_ref()
            .is_some_and(|disk| disk.persistence.is_some())
    }

    /// Whether this resource may be offered to the given role: unreserved
    /// resources go anywhere, reserved resources to their role and its
    /// descendants.
    pub fn is_allocatable_to(&self, role: &RoleName) -> bool {
        match self.reservation_role() {
            None => true,
            Some(reserved) => reserved == role || reserved.is_ancestor_of(role),
        }
    }

    /// Identity comparison for shared resources, ignoring which role the
    /// copy is currently allocated to.
    pub fn shares_identity_with(&self, other: &Resource) -> bool {
        self.name == other.name
            && self.value == other.value
            && self.reservations == other.reservations
            && self.disk == other.disk
            && self.shared == other.shared
            && self.revocable == other.revocable
            && self.provider_id == other.provider_id
    }

    /// Whether `other` can be merged into this resource by adding values.
    /// Shared resources are never merged: each copy is accounted separately.
    fn addable(&self, other: &Resource) -> bool {
        !self.shared
            && !other.shared
            && self.name == other.name
            && self.value.same_kind(&other.value)
            && self.reservations == other.reservations
            && self.disk == other.disk
            && self.revocable == other.revocable
            && self.provider_id == other.provider_id
            && self.allocation_role == other.allocation_role
            && !self.is_persistent_volume()
    }

    /// A copy with the finest reservation popped off the stack.
    pub fn popped_reservation(&self) -> Resource {
        let mut popped = self.clone();
        popped.reservations.pop();
        popped
    }

    /// A copy with persistence and volume cleared; the disk source, if any,
    /// is retained since it describes the physical medium.
    pub fn without_volume(&self) -> Resource {
        let mut plain = self.clone();
        if let Some(disk) = &mut plain.disk {
            disk.persistence = None;
            disk.volume = None;
            if disk.source.is_none() {
                plain.disk = None;
            }
        }
        plain
    }

    /// Chops a scalar resource down to `limit`. Returns false when nothing
    /// can be allocated under the limit, or when the resource is indivisible
    /// (MOUNT disk).
    pub fn shrink(&mut self, limit: Scalar) -> bool {
        let Some(current) = self.scalar_value() else {
            return false;
        };

        if current <= limit {
            return !current.is_zero();
        }

        if !limit.is_positive() {
            return false;
        }

        if matches!(
            self.disk.as_ref().and_then(|disk| disk.source.as_ref()),
            Some(DiskSource::Mount { .. })
        ) {
            return false;
        }

        self.value = ResourceValue::Scalar(limit);
        true
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(role) = self.reservation_role() {
            write!(f, "({role})")?;
        }
        if self.revocable {
            f.write_str("{rev}")?;
        }
        if self.shared {
            f.write_str("<shared>")?;
        }
        write!(f, ":{}", self.value)?;
        if let Some(role) = &self.allocation_role {
            write!(f, "@{role}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    resource: Resource,
    shared_count: u64,
}

/// A normalised bag of resources implementing set-like algebra. Mergeable
/// resources are kept coalesced; shared resources are kept as distinct
/// instances with a copy count.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources {
    entries: Vec<Entry>,
}

impl PartialEq for Resources {
    fn eq(&self, other: &Self) -> bool {
        self.contains(other) && other.contains(self)
    }
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sum(bundles: impl IntoIterator<Item = Resources>) -> Resources {
        let mut total = Resources::new();
        for bundle in bundles {
            total += bundle;
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.entries.iter().map(|entry| &entry.resource)
    }

    /// Iterates every resource, repeating shared resources per copy held.
    pub fn iter_counted(&self) -> impl Iterator<Item = (&Resource, u64)> {
        self.entries
            .iter()
            .map(|entry| (&entry.resource, entry.shared_count))
    }

    pub fn push(&mut self, resource: Resource) {
        if resource.value.is_empty() {
            return;
        }

        if resource.shared {
            if let Some(entry) = self
                .entries
                .iter_mut()
                .find(|entry| entry.resource.shares_identity_with(&resource))
            {
                entry.shared_count += 1;
                return;
            }
            self.entries.push(Entry {
                resource,
                shared_count: 1,
            });
            return;
        }

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.resource.addable(&resource))
        {
            entry.resource.value.merge(&resource.value);
            return;
        }

        self.entries.push(Entry {
            resource,
            shared_count: 1,
        });
    }

    fn remove(&mut self, resource: &Resource) {
        if resource.shared {
            if let Some(index) = self
                .entries
                .iter()
                .position(|entry| entry.resource.shares_identity_with(resource))
            {
                let entry = &mut self.entries[index];
                entry.shared_count = entry.shared_count.saturating_sub(1);
                if entry.shared_count == 0 {
                    self.entries.remove(index);
                }
            }
            return;
        }

        if let Some(index) = self.entries.iter().position(|entry| {
            !entry.resource.shared
                && entry.resource.name == resource.name
                && entry.resource.value.same_kind(&resource.value)
                && entry.resource.reservations == resource.reservations
                && entry.resource.disk == resource.disk
                && entry.resource.revocable == resource.revocable
                && entry.resource.provider_id == resource.provider_id
                && entry.resource.allocation_role == resource.allocation_role
        }) {
            let entry = &mut self.entries[index];
            entry.resource.value.remove(&resource.value);
            if entry.resource.value.is_empty() {
                self.entries.remove(index);
            }
        }
    }

    pub fn contains_resource(&self, resource: &Resource) -> bool {
        if resource.value.is_empty() {
            return true;
        }

        if resource.shared {
            return self
                .entries
                .iter()
                .any(|entry| entry.resource.shares_identity_with(resource));
        }

        self.entries.iter().any(|entry| {
            !entry.resource.shared
                && entry.resource.name == resource.name
                && entry.resource.reservations == resource.reservations
                && entry.resource.disk == resource.disk
                && entry.resource.revocable == resource.revocable
                && entry.resource.provider_id == resource.provider_id
                && entry.resource.allocation_role == resource.allocation_role
                && entry.resource.value.contains(&resource.value)
        })
    }

    pub fn contains(&self, other: &Resources) -> bool {
        // Entries are normalised, so per-entry containment suffices for
        // non-shared resources; shared entries additionally need the count.
        other.entries.iter().all(|theirs| {
            if theirs.resource.shared {
                self.entries.iter().any(|own| {
                    own.resource.shares_identity_with(&theirs.resource)
                        && own.shared_count >= theirs.shared_count
                })
            } else {
                self.contains_resource(&theirs.resource)
            }
        })
    }

    pub fn filter(&self, predicate: impl Fn(&Resource) -> bool) -> Resources {
        Resources {
            entries: self
                .entries
                .iter()
                .filter(|entry| predicate(&entry.resource))
                .cloned()
                .collect(),
        }
    }

    pub fn reserved(&self, role: &RoleName) -> Resources {
        self.filter(|resource| resource.reservation_role() == Some(role))
    }

    pub fn reserved_any(&self) -> Resources {
        self.filter(|resource| !resource.is_unreserved())
    }

    pub fn unreserved(&self) -> Resources {
        self.filter(Resource::is_unreserved)
    }

    pub fn revocable(&self) -> Resources {
        self.filter(|resource| resource.revocable)
    }

    pub fn non_revocable(&self) -> Resources {
        self.filter(|resource| !resource.revocable)
    }

    pub fn shared_part(&self) -> Resources {
        self.filter(|resource| resource.shared)
    }

    pub fn non_shared(&self) -> Resources {
        self.filter(|resource| !resource.shared)
    }

    pub fn scalars(&self) -> Resources {
        self.filter(Resource::is_scalar)
    }

    pub fn without_refinements(&self) -> Resources {
        self.filter(|resource| !resource.has_refined_reservations())
    }

    /// Unreserved resources plus reservations for `role` and every ancestor
    /// of `role`.
    pub fn allocatable_to(&self, role: &RoleName) -> Resources {
        self.filter(|resource| resource.is_allocatable_to(role))
    }

    pub fn allocate(&mut self, role: &RoleName) {
        for entry in &mut self.entries {
            entry.resource.allocation_role = Some(role.clone());
        }
    }

    pub fn unallocate(&mut self) {
        for entry in &mut self.entries {
            entry.resource.allocation_role = None;
        }
    }

    /// Groups by allocation role. Every resource must be allocated; an
    /// unallocated resource here is a bookkeeping violation.
    pub fn allocations(&self) -> BTreeMap<RoleName, Resources> {
        let mut grouped: BTreeMap<RoleName, Resources> = BTreeMap::new();
        for entry in &self.entries {
            let role = entry
                .resource
                .allocation_role
                .clone()
                .unwrap_or_else(|| panic!("unallocated resource {} in allocations()", entry.resource));
            let bundle = grouped.entry(role).or_default();
            for _ in 0..entry.shared_count {
                bundle.push(entry.resource.clone());
            }
        }
        grouped
    }

    /// Groups reserved resources by their reservation role.
    pub fn reservations(&self) -> BTreeMap<RoleName, Resources> {
        let mut grouped: BTreeMap<RoleName, Resources> = BTreeMap::new();
        for entry in &self.entries {
            if let Some(role) = entry.resource.reservation_role() {
                grouped
                    .entry(role.clone())
                    .or_default()
                    .push(entry.resource.clone());
            }
        }
        grouped
    }

    /// Stripped scalar quantities: name-to-amount with all metadata dropped.
    /// Shared resources count once per instance, not per copy.
    pub fn to_quantities(&self) -> ScalarQuantities {
        let mut quantities = ScalarQuantities::new();
        for entry in &self.entries {
            if let Some(amount) = entry.resource.scalar_value() {
                quantities.put(entry.resource.name.clone(), amount);
            }
        }
        quantities
    }

    pub fn names(&self) -> std::collections::BTreeSet<String> {
        self.entries
            .iter()
            .map(|entry| entry.resource.name.clone())
            .collect()
    }

    pub fn scalar_total(&self, name: &str) -> Scalar {
        self.entries
            .iter()
            .filter(|entry| entry.resource.name == name)
            .filter_map(|entry| entry.resource.scalar_value())
            .fold(Scalar::ZERO, |total, amount| total + amount)
    }

    pub fn cpus(&self) -> Scalar {
        self.scalar_total(CPUS)
    }

    pub fn mem(&self) -> Scalar {
        self.scalar_total(MEM)
    }

    pub fn gpus(&self) -> Scalar {
        self.scalar_total(GPUS)
    }

    /// Atomically applies a list of conversions, failing without effect if
    /// any consumed bundle is absent or a conversion is not balanced.
    pub fn apply(&self, conversions: &[ResourceConversion]) -> ResourceResult<Resources> {
        let mut result = self.clone();
        for conversion in conversions {
            conversion.validate()?;
            if !result.contains(&conversion.consumed) {
                return Err(ResourceError::ConversionConsumesAbsent {
                    consumed: conversion.consumed.to_string(),
                });
            }
            result -= conversion.consumed.clone();
            result += conversion.converted.clone();
        }
        Ok(result)
    }
}

impl From<Vec<Resource>> for Resources {
    fn from(resources: Vec<Resource>) -> Self {
        let mut bundle = Resources::new();
        for resource in resources {
            bundle.push(resource);
        }
        bundle
    }
}

impl From<Resource> for Resources {
    fn from(resource: Resource) -> Self {
        let mut bundle = Resources::new();
        bundle.push(resource);
        bundle
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        for entry in rhs.entries {
            for _ in 0..entry.shared_count {
                self.push(entry.resource.clone());
            }
        }
    }
}

impl AddAssign<&Resources> for Resources {
    fn add_assign(&mut self, rhs: &Resources) {
        *self += rhs.clone();
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(mut self, rhs: Resources) -> Resources {
        self += rhs;
        self
    }
}

impl SubAssign for Resources {
    fn sub_assign(&mut self, rhs: Resources) {
        for entry in rhs.entries {
            for _ in 0..entry.shared_count {
                self.remove(&entry.resource);
            }
        }
    }
}

impl SubAssign<&Resources> for Resources {
    fn sub_assign(&mut self, rhs: &Resources) {
        *self -= rhs.clone();
    }
}

impl Sub for Resources {
    type Output = Resources;

    fn sub(mut self, rhs: Resources) -> Resources {
        self -= rhs;
        self
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return f.write_str("{}");
        }
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|entry| {
                if entry.shared_count > 1 {
                    format!("{}x{}", entry.resource, entry.shared_count)
                } else {
                    entry.resource.to_string()
                }
            })
            .collect();
        f.write_str(&parts.join("; "))
    }
}

/// One step of an `apply` transformation: `consumed` is removed from the
/// bundle and `converted` inserted. Reserve, unreserve, volume creation and
/// destruction are all conversions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConversion {
    pub consumed: Resources,
    pub converted: Resources,
}

impl ResourceConversion {
    pub fn new(consumed: Resources, converted: Resources) -> Self {
        Self {
            consumed,
            converted,
        }
    }

    /// A conversion may move resources between reservation states or attach
    /// volumes, but never mint or destroy quantity.
    pub fn validate(&self) -> ResourceResult<()> {
        if self.consumed.to_quantities() != self.converted.to_quantities() {
            return Err(ResourceError::ConversionNotBalanced(format!(
                "{} -> {}",
                self.consumed, self.converted
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(name: &str) -> RoleName {
        RoleName::parse(name).unwrap()
    }

    #[test]
    fn addable_resources_coalesce() {
        let mut bundle = Resources::new();
        bundle.push(Resource::scalar(CPUS, 1.5));
        bundle.push(Resource::scalar(CPUS, 2.5));
        assert_eq!(bundle.iter().count(), 1);
        assert_eq!(bundle.cpus(), Scalar::from_f64(4.0));
    }

    #[test]
    fn reservations_keep_resources_apart() {
        let mut bundle = Resources::new();
        bundle.push(Resource::scalar(CPUS, 2.0));
        bundle.push(
            Resource::scalar(CPUS, 2.0).reserved_for(Reservation::statically(role("eng"))),
        );
        assert_eq!(bundle.iter().count(), 2);
        assert_eq!(bundle.reserved(&role("eng")).cpus(), Scalar::from_f64(2.0));
        assert_eq!(bundle.unreserved().cpus(), Scalar::from_f64(2.0));
    }

    #[test]
    fn subtraction_is_inverse_of_addition() {
        let total = Resources::from(vec![
            Resource::scalar(CPUS, 8.0),
            Resource::scalar(MEM, 4096.0),
            Resource::ports(vec![(31000, 32000)]),
        ]);
        let taken = Resources::from(vec![
            Resource::scalar(CPUS, 2.0),
            Resource::ports(vec![(31000, 31005)]),
        ]);

        let rest = total.clone() - taken.clone();
        assert!(total.contains(&taken));
        assert!(!rest.contains(&taken));
        assert_eq!(rest + taken, total);
    }

    #[test]
    fn shared_resources_count_copies() {
        let volume = Resource::scalar(DISK, 512.0)
            .reserved_for(Reservation::dynamically(role("eng"), "ops"))
            .with_disk(DiskInfo {
                persistence: Some(Persistence {
                    id: "vol-1".to_string(),
                    principal: None,
                }),
                volume: Some(Volume {
                    container_path: "data".to_string(),
                    mode: VolumeMode::ReadWrite,
                }),
                source: None,
            })
            .as_shared();

        let mut allocated = Resources::new();
        allocated.push(volume.clone());
        allocated.push(volume.clone());
        assert_eq!(allocated.iter().count(), 1);
        assert_eq!(allocated.iter_counted().next().unwrap().1, 2);

        // Quantities count the instance once regardless of copies.
        assert_eq!(
            allocated.to_quantities(),
            ScalarQuantities::of([(DISK, 512.0)])
        );

        allocated -= Resources::from(volume.clone());
        assert!(allocated.contains_resource(&volume));
        allocated -= Resources::from(volume.clone());
        assert!(allocated.is_empty());
    }

    #[test]
    fn allocatable_to_includes_ancestor_reservations() {
        let bundle = Resources::from(vec![
            Resource::scalar(CPUS, 1.0),
            Resource::scalar(CPUS, 2.0).reserved_for(Reservation::statically(role("eng"))),
            Resource::scalar(CPUS, 4.0)
                .reserved_for(Reservation::statically(role("sales"))),
        ]);

        let for_nested = bundle.allocatable_to(&role("eng/research"));
        assert_eq!(for_nested.cpus(), Scalar::from_f64(3.0));
    }

    #[test]
    fn reserve_then_unreserve_round_trips() {
        let total = Resources::from(vec![Resource::scalar(CPUS, 8.0)]);

        let consumed = Resources::from(Resource::scalar(CPUS, 3.0));
        let converted = Resources::from(
            Resource::scalar(CPUS, 3.0).reserved_for(Reservation::dynamically(role("eng"), "p")),
        );

        let reserve = ResourceConversion::new(consumed.clone(), converted.clone());
        let unreserve = ResourceConversion::new(converted, consumed);

        let reserved = total.apply(&[reserve]).unwrap();
        assert_eq!(reserved.reserved(&role("eng")).cpus(), Scalar::from_f64(3.0));

        let back = reserved.apply(&[unreserve]).unwrap();
        assert_eq!(back.to_quantities(), total.to_quantities());
        assert_eq!(back, total);
    }

    #[test]
    fn unbalanced_conversion_is_rejected() {
        let total = Resources::from(vec![Resource::scalar(CPUS, 8.0)]);
        let bad = ResourceConversion::new(
            Resources::from(Resource::scalar(CPUS, 3.0)),
            Resources::from(Resource::scalar(CPUS, 4.0)),
        );
        assert!(matches!(
            total.apply(&[bad]),
            Err(ResourceError::ConversionNotBalanced(_))
        ));
    }

    #[test]
    fn mount_disk_does_not_shrink() {
        let mut mount = Resource::scalar(DISK, 1024.0).with_disk(DiskInfo {
            persistence: None,
            volume: None,
            source: Some(DiskSource::Mount {
                root: "/mnt/data".to_string(),
            }),
        });
        assert!(!mount.shrink(Scalar::from_f64(512.0)));
        assert_eq!(mount.scalar_value(), Some(Scalar::from_f64(1024.0)));

        let mut plain = Resource::scalar(DISK, 1024.0);
        assert!(plain.shrink(Scalar::from_f64(512.0)));
        assert_eq!(plain.scalar_value(), Some(Scalar::from_f64(512.0)));
    }
}
