//! Desired-device reconciliation.
//!
//! The configuration collaborator hands over newline-separated peripheral
//! names per collection type; names are resolved to addresses against the
//! adapter's pairing list by name prefix, and the running collectors are
//! reconciled against the result.

use std::collections::HashMap;

use crate::domain::models::CollectionType;
use crate::infrastructure::bluetooth::driver::PairedDevice;

/// Splits a newline-separated device-name list, trimming entries and
/// dropping blanks, preserving first-seen order.
pub fn parse_device_names(input: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in input.lines() {
        let trimmed = line.trim();
        if !trimmed.is_empty() && !names.iter().any(|existing| existing == trimmed) {
            names.push(trimmed.to_string());
        }
    }
    names
}

/// Outcome of matching wanted names against the pairing list.
#[derive(Debug, Default)]
pub struct NameResolution {
    /// Wanted names with the address they resolved to.
    pub found: Vec<(String, String)>,
    /// Wanted names without any paired device.
    pub missing: Vec<String>,
}

impl NameResolution {
    pub fn addresses(&self) -> Vec<String> {
        self.found.iter().map(|(_, address)| address.clone()).collect()
    }
}

/// Resolves each wanted name to the first paired device whose advertised
/// name starts with it.
pub fn resolve_addresses(names: &[String], paired: &[PairedDevice]) -> NameResolution {
    let mut resolution = NameResolution::default();
    for name in names {
        match paired.iter().find(|device| device.name.starts_with(name)) {
            Some(device) => resolution
                .found
                .push((name.clone(), device.address.clone())),
            None => resolution.missing.push(name.clone()),
        }
    }
    resolution
}

/// Stop/start plan for one collection type.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub stop: Vec<String>,
    pub start: Vec<String>,
}

/// Plans the update: running collectors of the wanted type that are no
/// longer wanted get stopped; every wanted address gets a start command
/// (starting an already-running collection of the same type is a no-op
/// upstream). Collectors of other types are left alone.
pub fn reconcile(
    situation: &HashMap<String, CollectionType>,
    wanted_addresses: &[String],
    wanted_type: CollectionType,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan {
        stop: Vec::new(),
        start: wanted_addresses.to_vec(),
    };
    for (address, running_type) in situation {
        if *running_type == wanted_type && !wanted_addresses.iter().any(|a| a == address) {
            plan.stop.push(address.clone());
        }
    }
    plan.stop.sort();
    plan
}
