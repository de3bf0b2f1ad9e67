//! Parameter groups and partitions.

use crate::error::{BenchError, BenchResult};
use crate::nn::{ParamId, ParameterHandle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Multiplier applied to the submission's base learning rate.
pub const LR_MULTIPLIER: &str = "lr_multiplier";
/// Replaces the submission's weight decay.
pub const WEIGHT_DECAY: &str = "weight_decay";

/// Hyperparameter overrides of one group.
///
/// A key that is absent inherits the submission default. A key that is
/// present always wins, even when its value equals the default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Overrides(BTreeMap<String, f64>);

impl Overrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    /// These overrides with every key of `other` layered on top.
    #[must_use]
    pub fn extended(&self, other: &Overrides) -> Self {
        let mut merged = self.clone();
        merged.0.extend(other.iter().map(|(k, v)| (k.clone(), *v)));
        merged
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Overrides {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// A subset of a model's trainable parameters sharing one set of overrides.
#[derive(Debug, Clone, Default)]
pub struct ParameterGroup {
    pub members: BTreeMap<ParamId, ParameterHandle>,
    pub overrides: Overrides,
}

impl ParameterGroup {
    #[must_use]
    pub fn new(members: BTreeMap<ParamId, ParameterHandle>, overrides: Overrides) -> Self {
        Self { members, overrides }
    }

    /// A group without overrides.
    #[must_use]
    pub fn all(members: BTreeMap<ParamId, ParameterHandle>) -> Self {
        Self::new(members, Overrides::new())
    }

    #[must_use]
    pub fn with_override(mut self, key: impl Into<String>, value: f64) -> Self {
        self.overrides = self.overrides.with(key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ids(&self) -> BTreeSet<ParamId> {
        self.members.keys().cloned().collect()
    }
}

/// A disjoint cover of a model's trainable parameters.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    groups: Vec<ParameterGroup>,
}

impl Partition {
    /// Builds a partition, rejecting parameters that appear in more than one group.
    pub fn new(groups: Vec<ParameterGroup>) -> BenchResult<Self> {
        let partition = Self { groups };
        partition.validate_disjoint()?;
        Ok(partition)
    }

    /// Fails with `PartitionMismatch` if any parameter id is in two groups.
    pub fn validate_disjoint(&self) -> BenchResult<()> {
        let mut seen = BTreeSet::new();
        for group in &self.groups {
            for id in group.members.keys() {
                if !seen.insert(id.as_str()) {
                    return Err(BenchError::PartitionMismatch(format!(
                        "parameter '{id}' is assigned to more than one group"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Skips the disjointness check so merge can be tested against malformed input.
    #[cfg(test)]
    pub(crate) fn unchecked(groups: Vec<ParameterGroup>) -> Self {
        Self { groups }
    }

    /// One group holding every given parameter, no overrides.
    #[must_use]
    pub fn identity(members: BTreeMap<ParamId, ParameterHandle>) -> Self {
        Self { groups: vec![ParameterGroup::all(members)] }
    }

    pub fn groups(&self) -> &[ParameterGroup] {
        &self.groups
    }

    pub fn into_groups(self) -> Vec<ParameterGroup> {
        self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Every covered parameter, keyed by id.
    pub fn parameters(&self) -> BTreeMap<ParamId, ParameterHandle> {
        self.groups.iter().flat_map(|g| g.members.iter().map(|(id, p)| (id.clone(), p.clone()))).collect()
    }

    /// The set of parameter ids covered.
    pub fn universe(&self) -> BTreeSet<ParamId> {
        self.groups.iter().flat_map(|g| g.members.keys().cloned()).collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.groups.iter().map(ParameterGroup::len).sum()
    }

    pub fn overrides_for(&self, id: &str) -> Option<&Overrides> {
        self.groups.iter().find(|g| g.members.contains_key(id)).map(|g| &g.overrides)
    }

    /// Serializable view for reports.
    pub fn summary(&self) -> Vec<GroupSummary> {
        self.groups
            .iter()
            .map(|g| GroupSummary {
                parameters: g.members.keys().cloned().collect(),
                numel: g.members.values().map(|p| p.numel()).sum(),
                overrides: g.overrides.clone(),
            })
            .collect()
    }
}

/// Two partitions are equal when they group the same ids with the same
/// overrides, regardless of group order.
impl PartialEq for Partition {
    fn eq(&self, other: &Self) -> bool {
        if self.groups.len() != other.groups.len() {
            return false;
        }
        self.groups.iter().all(|g| {
            let ids = g.ids();
            other.groups.iter().any(|o| o.overrides == g.overrides && o.ids() == ids)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub parameters: Vec<ParamId>,
    pub numel: usize,
    pub overrides: Overrides,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Parameter;
    use ndarray::{ArrayD, IxDyn};

    fn members(ids: &[&str]) -> BTreeMap<ParamId, ParameterHandle> {
        ids.iter().map(|id| ((*id).to_string(), Parameter::new(ArrayD::zeros(IxDyn(&[2]))))).collect()
    }

    #[test]
    fn test_absent_and_default_valued_keys_differ() {
        let absent = Overrides::new();
        let explicit = Overrides::new().with(LR_MULTIPLIER, 1.0);
        assert_ne!(absent, explicit);
        assert!(!absent.contains(LR_MULTIPLIER));
        assert_eq!(explicit.get(LR_MULTIPLIER), Some(1.0));
    }

    #[test]
    fn test_duplicate_membership_rejected() {
        let a = ParameterGroup::all(members(&["w", "b"]));
        let b = ParameterGroup::all(members(&["b"]));
        assert!(matches!(Partition::new(vec![a, b]), Err(BenchError::PartitionMismatch(_))));
    }

    #[test]
    fn test_empty_group_is_legal() {
        let partition = Partition::new(vec![
            ParameterGroup::all(members(&["w"])),
            ParameterGroup::default().with_override(WEIGHT_DECAY, 0.0),
        ])
        .unwrap();
        assert_eq!(partition.num_parameters(), 1);
        assert_eq!(partition.universe().len(), 1);
    }

    #[test]
    fn test_equality_ignores_group_order() {
        let p1 = Partition::new(vec![
            ParameterGroup::all(members(&["a"])),
            ParameterGroup::all(members(&["b"])).with_override(LR_MULTIPLIER, 0.5),
        ])
        .unwrap();
        let p2 = Partition::new(vec![
            ParameterGroup::all(members(&["b"])).with_override(LR_MULTIPLIER, 0.5),
            ParameterGroup::all(members(&["a"])),
        ])
        .unwrap();
        assert_eq!(p1, p2);
        assert_eq!(p1.overrides_for("b").and_then(|o| o.get(LR_MULTIPLIER)), Some(0.5));
    }
}
