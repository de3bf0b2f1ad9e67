//! Grouped models.
//!
//! [`GroupedModel`] wraps a plain module with the identity grouping. Models
//! that need special treatment for some of their parameters either implement
//! [`GroupedModule`] themselves (merging their own partitions on top of the
//! base grouping) or stack [`Overlay`] rules on an existing grouped model.

use crate::error::{BenchError, BenchResult};
use crate::groups::{Overrides, ParameterGroup, Partition};
use crate::merge::merge_partitions;
use crate::nn::{Module, ParamId, ParameterHandle};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// A model that can describe its parameter partition.
pub trait GroupedModule: Send + Sync + fmt::Debug {
    /// The wrapped module.
    fn module(&self) -> &dyn Module;

    /// A disjoint cover of the module's trainable parameters.
    fn parameter_groups(&self) -> BenchResult<Partition>;

    fn name(&self) -> &str {
        self.module().name()
    }

    fn trainable_parameters(&self) -> BTreeMap<ParamId, ParameterHandle> {
        self.module().trainable_parameters()
    }
}

/// Identity grouping over an exclusively owned module.
#[derive(Debug)]
pub struct GroupedModel {
    module: Box<dyn Module>,
}

impl GroupedModel {
    /// Wraps a module with a single no-override group.
    ///
    /// # Errors
    /// `InvalidModel` if the module has no trainable parameters.
    pub fn from_raw(module: impl Module + 'static) -> BenchResult<Self> {
        Self::from_boxed(Box::new(module))
    }

    pub fn from_boxed(module: Box<dyn Module>) -> BenchResult<Self> {
        let trainable = module.trainable_parameters().len();
        if trainable == 0 {
            return Err(BenchError::InvalidModel { model: module.name().to_string() });
        }
        debug!(model = %module.name(), parameters = trainable, "wrapped model with default grouping");
        Ok(Self { module })
    }

    /// The default partition: every trainable parameter, no overrides.
    pub fn default_groups(&self) -> Partition {
        Partition::identity(self.module.trainable_parameters())
    }
}

impl GroupedModule for GroupedModel {
    fn module(&self) -> &dyn Module {
        self.module.as_ref()
    }

    fn parameter_groups(&self) -> BenchResult<Partition> {
        Ok(self.default_groups())
    }
}

/// Selects parameters by id or shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamMatcher {
    /// Every trainable parameter.
    All,
    Prefix(String),
    Suffix(String),
    Exact(BTreeSet<ParamId>),
    /// Tensors with exactly this many dimensions (1 selects biases and norm scales).
    Rank(usize),
    AnyOf(Vec<ParamMatcher>),
}

impl ParamMatcher {
    pub fn exact<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ParamId>,
    {
        Self::Exact(ids.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, id: &str, param: &ParameterHandle) -> bool {
        match self {
            Self::All => true,
            Self::Prefix(prefix) => id.starts_with(prefix.as_str()),
            Self::Suffix(suffix) => id.ends_with(suffix.as_str()),
            Self::Exact(ids) => ids.contains(id),
            Self::Rank(rank) => param.ndim() == *rank,
            Self::AnyOf(matchers) => matchers.iter().any(|m| m.matches(id, param)),
        }
    }
}

/// Builds a two-group partition: matching parameters carry `overrides`, the
/// rest carry none.
pub fn override_partition(
    params: &BTreeMap<ParamId, ParameterHandle>,
    matcher: &ParamMatcher,
    overrides: Overrides,
) -> BenchResult<Partition> {
    let (selected, rest): (BTreeMap<_, _>, BTreeMap<_, _>) = params
        .iter()
        .map(|(id, p)| (id.clone(), p.clone()))
        .partition(|(id, p)| matcher.matches(id, p));
    Partition::new(vec![ParameterGroup::new(selected, overrides), ParameterGroup::all(rest)])
}

/// Splits every group of `base` by `matcher`. Matching members keep their
/// group's overrides with `overrides` layered on top; the others keep their
/// group's overrides unchanged.
///
/// Merging the result over `base` adds `overrides` to the matching
/// parameters without dropping anything the model declared for them.
///
/// # Errors
/// `PartitionMismatch` if `base` is not disjoint.
pub fn refine_partition(base: &Partition, matcher: &ParamMatcher, overrides: &Overrides) -> BenchResult<Partition> {
    let mut groups = Vec::with_capacity(base.len() * 2);
    for group in base.groups() {
        let (selected, rest): (BTreeMap<_, _>, BTreeMap<_, _>) = group
            .members
            .iter()
            .map(|(id, p)| (id.clone(), p.clone()))
            .partition(|(id, p)| matcher.matches(id, p));
        if !selected.is_empty() {
            groups.push(ParameterGroup::new(selected, group.overrides.extended(overrides)));
        }
        if !rest.is_empty() {
            groups.push(ParameterGroup::new(rest, group.overrides.clone()));
        }
    }
    Partition::new(groups)
}

/// One named override rule of an [`Overlay`].
#[derive(Debug, Clone)]
pub struct OverrideRule {
    pub name: String,
    pub matcher: ParamMatcher,
    pub overrides: Overrides,
}

impl OverrideRule {
    pub fn new(name: impl Into<String>, matcher: ParamMatcher, overrides: Overrides) -> Self {
        Self { name: name.into(), matcher, overrides }
    }
}

/// A grouped model layered with override rules; later rules win.
#[derive(Debug)]
pub struct Overlay {
    inner: Box<dyn GroupedModule>,
    rules: Vec<OverrideRule>,
}

impl Overlay {
    pub fn new(inner: impl GroupedModule + 'static) -> Self {
        Self { inner: Box::new(inner), rules: Vec::new() }
    }

    #[must_use]
    pub fn rule(mut self, rule: OverrideRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[OverrideRule] {
        &self.rules
    }
}

impl GroupedModule for Overlay {
    fn module(&self) -> &dyn Module {
        self.inner.module()
    }

    fn parameter_groups(&self) -> BenchResult<Partition> {
        let params = self.trainable_parameters();
        let mut layers = vec![self.inner.parameter_groups()?];
        for rule in &self.rules {
            debug!(rule = %rule.name, "applying override rule");
            layers.push(override_partition(&params, &rule.matcher, rule.overrides.clone())?);
        }
        merge_partitions(&layers)
    }
}
