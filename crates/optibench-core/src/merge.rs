//! Merging of parameter partitions.
//!
//! Partitions are applied in order. For every parameter the overrides of the
//! last partition that has an opinion on it win; a group with an empty
//! override set has no opinion and keeps whatever was assigned before. The
//! result is re-bucketed by final override set.

use crate::error::{BenchError, BenchResult};
use crate::groups::{Overrides, ParameterGroup, Partition};
use crate::nn::{ParamId, ParameterHandle};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Merges two partitions; `overlay` takes precedence over `base`.
pub fn merge(base: &Partition, overlay: &Partition) -> BenchResult<Partition> {
    merge_partitions(&[base.clone(), overlay.clone()])
}

/// Merges an ordered sequence of partitions of the same parameter universe.
///
/// # Errors
/// `PartitionMismatch` if the list is empty, if any partition covers a
/// different set of parameters than the first, or if one partition assigns
/// a parameter to two groups with different overrides.
pub fn merge_partitions(partitions: &[Partition]) -> BenchResult<Partition> {
    let (first, _) = partitions
        .split_first()
        .ok_or_else(|| BenchError::PartitionMismatch("nothing to merge".to_string()))?;
    let universe = first.universe();

    let mut handles: BTreeMap<ParamId, ParameterHandle> = BTreeMap::new();
    let mut assigned: BTreeMap<ParamId, Overrides> = BTreeMap::new();
    let mut first_seen: Vec<Overrides> = Vec::new();

    for (position, partition) in partitions.iter().enumerate() {
        check_universe(&universe, partition, position)?;

        for (id, (handle, overrides)) in assignments(partition, position)? {
            handles.entry(id.clone()).or_insert(handle);
            if overrides.is_empty() {
                if position == 0 {
                    assigned.insert(id, overrides);
                }
                continue;
            }
            if !first_seen.contains(&overrides) {
                first_seen.push(overrides.clone());
            }
            assigned.insert(id, overrides);
        }
    }

    let mut buckets: Vec<ParameterGroup> = std::iter::once(Overrides::new())
        .chain(first_seen)
        .map(|overrides| ParameterGroup::new(BTreeMap::new(), overrides))
        .collect();

    for (id, overrides) in assigned {
        let Some(bucket) = buckets.iter_mut().find(|g| g.overrides == overrides) else {
            return Err(BenchError::PartitionMismatch(format!("no output group for parameter '{id}'")));
        };
        if let Some(handle) = handles.remove(&id) {
            bucket.members.insert(id, handle);
        }
    }
    buckets.retain(|g| !g.is_empty());

    debug!(inputs = partitions.len(), groups = buckets.len(), parameters = universe.len(), "merged parameter partitions");
    Partition::new(buckets)
}

fn check_universe(universe: &BTreeSet<ParamId>, partition: &Partition, position: usize) -> BenchResult<()> {
    let other = partition.universe();
    if &other == universe {
        return Ok(());
    }
    let missing: Vec<&str> = universe.difference(&other).map(String::as_str).collect();
    let added: Vec<&str> = other.difference(universe).map(String::as_str).collect();
    Err(BenchError::PartitionMismatch(format!(
        "partition {position} covers a different parameter set (missing: [{}], added: [{}])",
        missing.join(", "),
        added.join(", ")
    )))
}

/// Per-parameter view of one partition.
///
/// A parameter listed twice with identical overrides is accepted; listed
/// twice with different overrides is a conflict that is never resolved
/// silently.
fn assignments(
    partition: &Partition,
    position: usize,
) -> BenchResult<BTreeMap<ParamId, (ParameterHandle, Overrides)>> {
    let mut out: BTreeMap<ParamId, (ParameterHandle, Overrides)> = BTreeMap::new();
    for group in partition.groups() {
        for (id, handle) in &group.members {
            if let Some((_, existing)) = out.get(id) {
                if existing != &group.overrides {
                    return Err(BenchError::PartitionMismatch(format!(
                        "partition {position} assigns conflicting overrides to '{id}'"
                    )));
                }
                continue;
            }
            out.insert(id.clone(), (handle.clone(), group.overrides.clone()));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::{LR_MULTIPLIER, WEIGHT_DECAY};
    use crate::nn::Parameter;
    use ndarray::{ArrayD, IxDyn};

    fn params(ids: &[&str]) -> BTreeMap<ParamId, ParameterHandle> {
        ids.iter().map(|id| ((*id).to_string(), Parameter::new(ArrayD::zeros(IxDyn(&[1]))))).collect()
    }

    fn subset(all: &BTreeMap<ParamId, ParameterHandle>, ids: &[&str]) -> BTreeMap<ParamId, ParameterHandle> {
        all.iter().filter(|(k, _)| ids.contains(&k.as_str())).map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn rest(all: &BTreeMap<ParamId, ParameterHandle>, ids: &[&str]) -> BTreeMap<ParamId, ParameterHandle> {
        all.iter().filter(|(k, _)| !ids.contains(&k.as_str())).map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// `ids` get `overrides`, everything else is in a no-opinion group.
    fn layer(all: &BTreeMap<ParamId, ParameterHandle>, ids: &[&str], overrides: Overrides) -> Partition {
        Partition::new(vec![
            ParameterGroup::new(subset(all, ids), overrides),
            ParameterGroup::all(rest(all, ids)),
        ])
        .unwrap()
    }

    fn ids(v: &[&str]) -> BTreeSet<ParamId> {
        v.iter().map(|s| (*s).to_string()).collect()
    }

    fn lr(v: f64) -> Overrides {
        Overrides::new().with(LR_MULTIPLIER, v)
    }

    #[test]
    fn test_merge_single_is_identity() {
        let all = params(&["a", "b", "c"]);
        let p = layer(&all, &["a"], lr(0.5));
        assert_eq!(merge_partitions(std::slice::from_ref(&p)).unwrap(), p);
        assert_eq!(merge(&p, &p).unwrap(), p);
    }

    #[test]
    fn test_merge_precedence_two_groups() {
        let all = params(&["a", "b", "c", "d"]);
        let base = Partition::identity(all.clone());
        let overlay = layer(&all, &["b", "c"], lr(0.1));

        let merged = merge(&base, &overlay).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.groups()[0].ids(), ids(&["a", "d"]));
        assert!(merged.groups()[0].overrides.is_empty());
        assert_eq!(merged.groups()[1].ids(), ids(&["b", "c"]));
        assert_eq!(merged.groups()[1].overrides, lr(0.1));
    }

    #[test]
    fn test_overrides_do_not_leak_to_group_siblings() {
        let all = params(&["a", "b", "c"]);
        let p1 = layer(&all, &["a", "b"], Overrides::new().with(WEIGHT_DECAY, 0.0));
        let p2 = layer(&all, &["a"], lr(2.0));

        let merged = merge(&p1, &p2).unwrap();
        assert_eq!(merged.overrides_for("a"), Some(&lr(2.0)));
        assert_eq!(merged.overrides_for("b"), Some(&Overrides::new().with(WEIGHT_DECAY, 0.0)));
        assert!(merged.overrides_for("c").unwrap().is_empty());
    }

    #[test]
    fn test_later_override_replaces_fully() {
        let all = params(&["a"]);
        let p1 = layer(&all, &["a"], lr(0.5).with(WEIGHT_DECAY, 0.1));
        let p2 = layer(&all, &["a"], lr(3.0));
        let merged = merge(&p1, &p2).unwrap();
        assert_eq!(merged.overrides_for("a"), Some(&lr(3.0)));
    }

    #[test]
    fn test_empty_overlay_keeps_previous() {
        let all = params(&["a", "b"]);
        let p1 = layer(&all, &["a"], lr(0.5));
        let merged = merge(&p1, &Partition::identity(all)).unwrap();
        assert_eq!(merged, p1);
    }

    #[test]
    fn test_mismatched_universe_rejected() {
        let p1 = Partition::identity(params(&["a", "b", "c"]));
        let p2 = Partition::identity(params(&["a", "b", "d"]));
        let err = merge(&p1, &p2).unwrap_err();
        match err {
            BenchError::PartitionMismatch(msg) => {
                assert!(msg.contains("missing: [c]"), "{msg}");
                assert!(msg.contains("added: [d]"), "{msg}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_same_position_conflict_raises() {
        let all = params(&["a", "b"]);
        let conflicting = Partition::unchecked(vec![
            ParameterGroup::new(subset(&all, &["a"]), lr(0.1)),
            ParameterGroup::new(subset(&all, &["a", "b"]), lr(0.2)),
        ]);
        let err = merge(&Partition::identity(all.clone()), &conflicting).unwrap_err();
        assert!(err.to_string().contains("conflicting overrides to 'a'"), "{err}");

        let agreeing = Partition::unchecked(vec![
            ParameterGroup::new(subset(&all, &["a"]), lr(0.1)),
            ParameterGroup::new(subset(&all, &["a", "b"]), lr(0.1)),
        ]);
        let merged = merge(&Partition::identity(all), &agreeing).unwrap();
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(matches!(merge_partitions(&[]), Err(BenchError::PartitionMismatch(_))));
    }

    #[test]
    fn test_left_fold_equivalence() {
        let all = params(&["w1", "w2", "w3", "b1", "b2"]);
        let p1 = Partition::identity(all.clone());
        let p2 = layer(&all, &["w1", "w2", "b1"], lr(0.1));
        let p3 = layer(&all, &["b1", "b2"], Overrides::new().with(WEIGHT_DECAY, 0.0));
        let p4 = layer(&all, &["w2"], lr(5.0));

        let flat = merge_partitions(&[p1.clone(), p2.clone(), p3.clone(), p4.clone()]).unwrap();
        let folded = merge(&merge(&merge(&p1, &p2).unwrap(), &p3).unwrap(), &p4).unwrap();
        assert_eq!(flat, folded);
        assert_eq!(flat.overrides_for("w1"), Some(&lr(0.1)));
        assert_eq!(flat.overrides_for("w2"), Some(&lr(5.0)));
        assert_eq!(flat.overrides_for("b1"), Some(&Overrides::new().with(WEIGHT_DECAY, 0.0)));
        assert!(flat.overrides_for("w3").unwrap().is_empty());
    }

    #[test]
    fn test_identical_override_sets_share_a_group() {
        let all = params(&["a", "b", "c"]);
        let p = Partition::new(vec![
            ParameterGroup::new(subset(&all, &["a"]), lr(0.1)),
            ParameterGroup::new(subset(&all, &["b"]), lr(0.1)),
            ParameterGroup::all(subset(&all, &["c"])),
        ])
        .unwrap();
        let merged = merge_partitions(&[p]).unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merged_partition_is_disjoint_cover() {
        let all = params(&["a", "b", "c", "d"]);
        let merged = merge_partitions(&[
            Partition::identity(all.clone()),
            layer(&all, &["a", "c"], lr(0.2)),
            layer(&all, &["c", "d"], lr(0.3)),
        ])
        .unwrap();
        assert_eq!(merged.num_parameters(), 4);
        assert_eq!(merged.universe().len(), 4);
    }
}
