//! Translation rule tables and axis environments.

use crate::error::XlaError;
use crate::lowering::Lowerer;
use jx_core::{Jaxpr, Params, Primitive};
use jx_runtime::{Platform, XlaBuilder, XlaOp};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

// ── Axis environment ───────────────────────────────────────────────

/// Named replication axes in scope, innermost last, plus the total replica
/// count of the computation being lowered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AxisEnv {
    nreps: usize,
    names: Vec<String>,
    sizes: Vec<usize>,
}

impl AxisEnv {
    #[must_use]
    pub fn new(nreps: usize) -> Self {
        Self {
            nreps,
            names: Vec::new(),
            sizes: Vec::new(),
        }
    }

    /// A new environment with one more axis in scope.
    #[must_use]
    pub fn extend(&self, name: impl Into<String>, size: usize) -> Self {
        let mut next = self.clone();
        next.names.push(name.into());
        next.sizes.push(size);
        next
    }

    #[must_use]
    pub fn nreps(&self) -> usize {
        self.nreps
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Position of the innermost axis called `name`.
    pub fn axis_read(&self, name: &str) -> Result<usize, XlaError> {
        self.names
            .iter()
            .rposition(|candidate| candidate == name)
            .ok_or_else(|| XlaError::UnboundAxisName {
                name: name.to_owned(),
            })
    }

    /// Replica groups for a collective over the named axes: replicas in one
    /// group differ only in their coordinates along those axes.
    ///
    /// Group members vary along the named axes, so a reduction within a
    /// group runs across those axes and leaves every other axis fixed.
    pub fn axis_groups(&self, names: &[&str]) -> Result<Vec<Vec<usize>>, XlaError> {
        let mesh_axes = names
            .iter()
            .map(|name| self.axis_read(name))
            .collect::<Result<Vec<_>, _>>()?;
        replica_groups(self.nreps, &self.sizes, &mesh_axes)
    }
}

/// Partitions `0..nrep` into replica groups.
///
/// Replica ids are laid out row-major over `mesh_spec` followed by one
/// trailing axis absorbing the remaining replicas. Each group collects the
/// replicas that share every coordinate outside `mesh_axes`; members are
/// ordered row-major over `mesh_axes` in the order given.
pub fn replica_groups(
    nrep: usize,
    mesh_spec: &[usize],
    mesh_axes: &[usize],
) -> Result<Vec<Vec<usize>>, XlaError> {
    let mesh_size: usize = mesh_spec.iter().product();
    if mesh_size == 0 || nrep % mesh_size != 0 {
        return Err(XlaError::RaggedAxisEnv {
            nreps: nrep,
            mesh_size,
        });
    }
    let mut full_spec = mesh_spec.to_vec();
    full_spec.push(nrep / mesh_size);

    let unique: BTreeSet<usize> = mesh_axes.iter().copied().collect();
    if unique.len() != mesh_axes.len() || mesh_axes.iter().any(|axis| *axis >= mesh_spec.len()) {
        return Err(XlaError::InvalidAxisGroup {
            detail: format!("axes {mesh_axes:?} over a mesh of rank {}", mesh_spec.len()),
        });
    }
    let other_axes: Vec<usize> = (0..full_spec.len())
        .filter(|axis| !unique.contains(axis))
        .collect();

    let mut strides = vec![1_usize; full_spec.len()];
    for axis in (0..full_spec.len() - 1).rev() {
        strides[axis] = strides[axis + 1] * full_spec[axis + 1];
    }
    let offsets = |axes: &[usize]| -> Vec<usize> {
        let count: usize = axes.iter().map(|axis| full_spec[*axis]).product();
        (0..count)
            .map(|mut flat| {
                let mut offset = 0;
                for axis in axes.iter().rev() {
                    offset += (flat % full_spec[*axis]) * strides[*axis];
                    flat /= full_spec[*axis];
                }
                offset
            })
            .collect()
    };

    let members = offsets(mesh_axes);
    Ok(offsets(&other_axes)
        .into_iter()
        .map(|base| members.iter().map(|member| base + member).collect())
        .collect())
}

// ── Rule tables ────────────────────────────────────────────────────

/// Arguments handed to initial-style rules, which lower their nested
/// programs inline into the caller's builder.
pub struct InitialStyleArgs<'a> {
    pub axis_env: &'a AxisEnv,
    pub sub_jaxprs: &'a [Jaxpr],
    pub lowerer: &'a Lowerer<'a>,
}

/// Arguments handed to call-style rules, which lower their body as a
/// separate computation.
pub struct CallArgs<'a> {
    pub subjaxpr: &'a Jaxpr,
    pub axis_env: &'a AxisEnv,
    pub lowerer: &'a Lowerer<'a>,
}

pub type TranslationRule =
    Arc<dyn Fn(&mut XlaBuilder, &[XlaOp], &Params) -> Result<XlaOp, XlaError> + Send + Sync>;
/// Receives the replica groups resolved from the equation's `axis_name`,
/// and the remaining params.
pub type CollectiveRule = Arc<
    dyn Fn(&mut XlaBuilder, &[XlaOp], &[Vec<usize>], &Params) -> Result<XlaOp, XlaError>
        + Send
        + Sync,
>;
pub type InitialStyleRule = Arc<
    dyn Fn(&mut XlaBuilder, &InitialStyleArgs<'_>, &[XlaOp], &Params) -> Result<XlaOp, XlaError>
        + Send
        + Sync,
>;
/// Receives the nodes bound to the body's constants and free variables,
/// then the regular inputs.
pub type CallRule = Arc<
    dyn Fn(&mut XlaBuilder, &CallArgs<'_>, &[XlaOp], &[XlaOp], &Params) -> Result<XlaOp, XlaError>
        + Send
        + Sync,
>;

/// Which table a primitive's rule was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Platform,
    Generic,
    InitialStyle,
    Collective,
    Call,
}

#[derive(Clone, Default)]
pub struct TranslationRegistry {
    generic: FxHashMap<&'static str, TranslationRule>,
    platform: FxHashMap<Platform, FxHashMap<&'static str, TranslationRule>>,
    collective: FxHashMap<&'static str, CollectiveRule>,
    call: FxHashMap<&'static str, CallRule>,
    initial_style: FxHashMap<&'static str, InitialStyleRule>,
}

impl fmt::Debug for TranslationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut generic: Vec<_> = self.generic.keys().collect();
        generic.sort();
        f.debug_struct("TranslationRegistry")
            .field("generic", &generic)
            .field("platform", &self.platform.keys().collect::<Vec<_>>())
            .field("collective", &self.collective.len())
            .field("call", &self.call.len())
            .field("initial_style", &self.initial_style.len())
            .finish()
    }
}

impl TranslationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_generic(
        &mut self,
        primitive: &'static Primitive,
        rule: impl Fn(&mut XlaBuilder, &[XlaOp], &Params) -> Result<XlaOp, XlaError>
        + Send
        + Sync
        + 'static,
    ) {
        self.generic.insert(primitive.name(), Arc::new(rule));
    }

    pub fn register_platform(
        &mut self,
        platform: Platform,
        primitive: &'static Primitive,
        rule: impl Fn(&mut XlaBuilder, &[XlaOp], &Params) -> Result<XlaOp, XlaError>
        + Send
        + Sync
        + 'static,
    ) {
        self.platform
            .entry(platform)
            .or_default()
            .insert(primitive.name(), Arc::new(rule));
    }

    pub fn register_collective(
        &mut self,
        primitive: &'static Primitive,
        rule: impl Fn(&mut XlaBuilder, &[XlaOp], &[Vec<usize>], &Params) -> Result<XlaOp, XlaError>
        + Send
        + Sync
        + 'static,
    ) {
        self.collective.insert(primitive.name(), Arc::new(rule));
    }

    pub fn register_call(
        &mut self,
        primitive: &'static Primitive,
        rule: impl Fn(&mut XlaBuilder, &CallArgs<'_>, &[XlaOp], &[XlaOp], &Params) -> Result<XlaOp, XlaError>
        + Send
        + Sync
        + 'static,
    ) {
        self.call.insert(primitive.name(), Arc::new(rule));
    }

    pub fn register_initial_style(
        &mut self,
        primitive: &'static Primitive,
        rule: impl Fn(&mut XlaBuilder, &InitialStyleArgs<'_>, &[XlaOp], &Params) -> Result<XlaOp, XlaError>
        + Send
        + Sync
        + 'static,
    ) {
        self.initial_style.insert(primitive.name(), Arc::new(rule));
    }

    #[must_use]
    pub fn platform_rule(&self, platform: Platform, primitive: &Primitive) -> Option<&TranslationRule> {
        self.platform.get(&platform)?.get(primitive.name())
    }

    #[must_use]
    pub fn generic_rule(&self, primitive: &Primitive) -> Option<&TranslationRule> {
        self.generic.get(primitive.name())
    }

    #[must_use]
    pub fn collective_rule(&self, primitive: &Primitive) -> Option<&CollectiveRule> {
        self.collective.get(primitive.name())
    }

    #[must_use]
    pub fn call_rule(&self, primitive: &Primitive) -> Option<&CallRule> {
        self.call.get(primitive.name())
    }

    #[must_use]
    pub fn initial_style_rule(&self, primitive: &Primitive) -> Option<&InitialStyleRule> {
        self.initial_style.get(primitive.name())
    }

    /// The table that lowering would consult for `primitive` on `platform`.
    #[must_use]
    pub fn rule_kind(&self, platform: Platform, primitive: &Primitive) -> Option<RuleKind> {
        if self.platform_rule(platform, primitive).is_some() {
            Some(RuleKind::Platform)
        } else if self.generic_rule(primitive).is_some() {
            Some(RuleKind::Generic)
        } else if self.initial_style_rule(primitive).is_some() {
            Some(RuleKind::InitialStyle)
        } else if self.collective_rule(primitive).is_some() {
            Some(RuleKind::Collective)
        } else if self.call_rule(primitive).is_some() {
            Some(RuleKind::Call)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jx_core::{AbstractValue, ShapeError};
    use proptest::prelude::*;

    fn same(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
        Ok(args.to_vec())
    }

    static PLAIN_P: Primitive = Primitive::new("plain", same);

    #[test]
    fn axis_groups_over_each_axis_of_a_2x3_mesh() {
        let env = AxisEnv::new(6).extend("i", 2).extend("j", 3);
        assert_eq!(
            env.axis_groups(&["i"]).expect("groups"),
            vec![vec![0, 3], vec![1, 4], vec![2, 5]]
        );
        assert_eq!(
            env.axis_groups(&["j"]).expect("groups"),
            vec![vec![0, 1, 2], vec![3, 4, 5]]
        );
        assert_eq!(
            env.axis_groups(&["i", "j"]).expect("groups"),
            vec![vec![0, 1, 2, 3, 4, 5]]
        );
    }

    #[test]
    fn trailing_replicas_form_their_own_axis() {
        let env = AxisEnv::new(8).extend("i", 2);
        assert_eq!(
            env.axis_groups(&["i"]).expect("groups"),
            vec![vec![0, 4], vec![1, 5], vec![2, 6], vec![3, 7]]
        );
    }

    #[test]
    fn axis_read_finds_the_innermost_binding() {
        let env = AxisEnv::new(4).extend("i", 2).extend("i", 2);
        assert_eq!(env.axis_read("i").expect("bound"), 1);
        assert_eq!(
            env.axis_read("k"),
            Err(XlaError::UnboundAxisName {
                name: "k".to_owned()
            })
        );
    }

    #[test]
    fn ragged_meshes_are_rejected() {
        let env = AxisEnv::new(5).extend("i", 2);
        assert!(matches!(
            env.axis_groups(&["i"]),
            Err(XlaError::RaggedAxisEnv { nreps: 5, mesh_size: 2 })
        ));
    }

    #[test]
    fn extend_leaves_the_original_untouched() {
        let base = AxisEnv::new(2);
        let inner = base.extend("i", 2);
        assert!(base.names().is_empty());
        assert_eq!(inner.names(), &["i".to_owned()]);
        assert_eq!(inner.sizes(), &[2]);
        assert_eq!(inner.nreps(), 2);
    }

    #[test]
    fn platform_rules_take_precedence() {
        let mut registry = TranslationRegistry::new();
        assert_eq!(registry.rule_kind(Platform::Cpu, &PLAIN_P), None);
        registry.register_generic(&PLAIN_P, |_, args, _| Ok(args[0]));
        assert_eq!(registry.rule_kind(Platform::Cpu, &PLAIN_P), Some(RuleKind::Generic));
        registry.register_platform(Platform::Cpu, &PLAIN_P, |_, args, _| Ok(args[0]));
        assert_eq!(registry.rule_kind(Platform::Cpu, &PLAIN_P), Some(RuleKind::Platform));
        assert_eq!(registry.rule_kind(Platform::Gpu, &PLAIN_P), Some(RuleKind::Generic));
    }

    fn arb_mesh() -> impl Strategy<Value = (Vec<usize>, usize)> {
        (prop::collection::vec(1_usize..4, 1..4), 1_usize..3)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(
            jx_test_utils::property_test_case_count()
        ))]

        #[test]
        fn prop_groups_partition_every_replica((mesh, trailing) in arb_mesh(), pick in any::<prop::sample::Index>()) {
            let nrep = mesh.iter().product::<usize>() * trailing;
            let axis = pick.index(mesh.len());
            let groups = replica_groups(nrep, &mesh, &[axis]).expect("groups");
            prop_assert_eq!(groups.len(), nrep / mesh[axis]);
            let mut seen: Vec<usize> = groups.iter().flatten().copied().collect();
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..nrep).collect::<Vec<_>>());
            for group in &groups {
                prop_assert_eq!(group.len(), mesh[axis]);
            }
        }
    }
}
