//! # Reorder Engines
//!
//! A reorder engine turns one unit of writes (an epoch, or a whole region)
//! into the lazy sequence of [`ReorderPlan`]s to materialize and check.
//! Engines hold no state between calls, so units can be processed
//! independently.
//!
//! | Engine                | Scope  | Plans for `n` writes |
//! |-----------------------|--------|----------------------|
//! | `NoReorder`           | epoch  | 1                    |
//! | `Full`                | region | n!                   |
//! | `Partial`             | epoch  | n!                   |
//! | `FullAccumulative`    | region | n! * n               |
//! | `PartialAccumulative` | epoch  | n! * n               |
//! | `ReverseAccumulative` | epoch  | n                    |
//!
//! A unit with no writes always yields exactly one empty plan.

use std::fmt;
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::op::Operation;

/// Units larger than this make the permuting engines very slow.
pub const FACTORIAL_WARN_THRESHOLD: usize = 8;

/// A lazy, finite sequence of plans.
pub type Plans = Box<dyn Iterator<Item = ReorderPlan> + Send>;

/// Which span of the trace an engine reorders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReorderScope {
    /// Dispatched at every flush+fence barrier with the pending writes.
    Epoch,
    /// Dispatched once per region with every write of the region.
    Region,
}

/// One concrete ordering of a unit's writes.
///
/// `order` holds positions into the unit; the first `prefix` of them are
/// applied, the rest never reached the media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderPlan {
    /// Position of the base permutation in generation order.
    pub permutation: u64,
    pub order: Vec<usize>,
    pub prefix: usize,
}

impl ReorderPlan {
    /// Applies every write of `order`.
    pub fn complete(permutation: u64, order: Vec<usize>) -> Self {
        let prefix = order.len();
        Self {
            permutation,
            order,
            prefix,
        }
    }

    /// The plan for a unit without writes.
    pub fn empty() -> Self {
        Self::complete(0, Vec::new())
    }

    /// Positions of the writes this plan applies, in application order.
    #[inline]
    pub fn applied(&self) -> &[usize] {
        &self.order[..self.prefix]
    }

    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.prefix < self.order.len()
    }
}

/// Strategy producing candidate orderings for a unit of writes.
pub trait ReorderEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn scope(&self) -> ReorderScope {
        self.kind().scope()
    }

    /// Plans for `unit`, which must contain only writes. Calling again
    /// restarts the sequence from the beginning.
    fn generate(&self, unit: &[Operation]) -> Plans;
}

// =============================================================================
// Engine selection
// =============================================================================

/// The engine family, selectable by name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    #[default]
    NoReorder,
    Full,
    Partial,
    FullAccumulative,
    PartialAccumulative,
    ReverseAccumulative,
}

impl EngineKind {
    pub const ALL: [EngineKind; 6] = [
        Self::NoReorder,
        Self::Full,
        Self::Partial,
        Self::FullAccumulative,
        Self::PartialAccumulative,
        Self::ReverseAccumulative,
    ];

    pub fn scope(self) -> ReorderScope {
        match self {
            Self::Full | Self::FullAccumulative => ReorderScope::Region,
            Self::NoReorder
            | Self::Partial
            | Self::PartialAccumulative
            | Self::ReverseAccumulative => ReorderScope::Epoch,
        }
    }

    /// Instantiate the engine.
    pub fn engine(self) -> Box<dyn ReorderEngine> {
        match self {
            Self::NoReorder => Box::new(NoReorder),
            Self::Full => Box::new(Full),
            Self::Partial => Box::new(Partial),
            Self::FullAccumulative => Box::new(FullAccumulative),
            Self::PartialAccumulative => Box::new(PartialAccumulative),
            Self::ReverseAccumulative => Box::new(ReverseAccumulative),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::NoReorder => "no-reorder",
            Self::Full => "full",
            Self::Partial => "partial",
            Self::FullAccumulative => "full-accumulative",
            Self::PartialAccumulative => "partial-accumulative",
            Self::ReverseAccumulative => "reverse-accumulative",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EngineKind {
    type Err = String;

    /// Accepts the kebab-case name as well as `NoReorder`/`no_reorder` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().replace('-', "") == wanted)
            .ok_or_else(|| format!("unknown reorder engine '{}'", s))
    }
}

// =============================================================================
// Engines
// =============================================================================

/// Baseline: the trace order, nothing else.
pub struct NoReorder;

impl ReorderEngine for NoReorder {
    fn kind(&self) -> EngineKind {
        EngineKind::NoReorder
    }

    fn generate(&self, unit: &[Operation]) -> Plans {
        Box::new(std::iter::once(ReorderPlan::complete(
            0,
            (0..unit.len()).collect(),
        )))
    }
}

/// Every permutation of every write in the region.
pub struct Full;

impl ReorderEngine for Full {
    fn kind(&self) -> EngineKind {
        EngineKind::Full
    }

    fn generate(&self, unit: &[Operation]) -> Plans {
        whole(permutations(self.kind(), unit.len()))
    }
}

/// Every permutation of the writes pending at one barrier.
pub struct Partial;

impl ReorderEngine for Partial {
    fn kind(&self) -> EngineKind {
        EngineKind::Partial
    }

    fn generate(&self, unit: &[Operation]) -> Plans {
        whole(permutations(self.kind(), unit.len()))
    }
}

/// Every prefix of every permutation of the region's writes.
pub struct FullAccumulative;

impl ReorderEngine for FullAccumulative {
    fn kind(&self) -> EngineKind {
        EngineKind::FullAccumulative
    }

    fn generate(&self, unit: &[Operation]) -> Plans {
        accumulate(permutations(self.kind(), unit.len()))
    }
}

/// Every prefix of every permutation of the writes pending at one barrier.
pub struct PartialAccumulative;

impl ReorderEngine for PartialAccumulative {
    fn kind(&self) -> EngineKind {
        EngineKind::PartialAccumulative
    }

    fn generate(&self, unit: &[Operation]) -> Plans {
        accumulate(permutations(self.kind(), unit.len()))
    }
}

/// Every prefix of the reversed trace order.
pub struct ReverseAccumulative;

impl ReorderEngine for ReverseAccumulative {
    fn kind(&self) -> EngineKind {
        EngineKind::ReverseAccumulative
    }

    fn generate(&self, unit: &[Operation]) -> Plans {
        let reversed: Vec<usize> = (0..unit.len()).rev().collect();
        accumulate(Box::new(std::iter::once((0u64, reversed))))
    }
}

// =============================================================================
// Plan generation helpers
// =============================================================================

type Orders = Box<dyn Iterator<Item = (u64, Vec<usize>)> + Send>;

/// Lexicographic permutations of `0..n`, numbered in generation order.
fn permutations(kind: EngineKind, n: usize) -> Orders {
    if n > FACTORIAL_WARN_THRESHOLD {
        tracing::warn!(
            "{} engine permuting {} writes: {}! candidates will be checked",
            kind,
            n,
            n
        );
    }
    if n == 0 {
        return Box::new(std::iter::once((0u64, Vec::new())));
    }
    Box::new(
        (0..n)
            .permutations(n)
            .enumerate()
            .map(|(i, order)| (i as u64, order)),
    )
}

fn whole(orders: Orders) -> Plans {
    Box::new(orders.map(|(i, order)| ReorderPlan::complete(i, order)))
}

/// One plan per prefix length `1..=n` of every order; the empty order keeps
/// its single empty plan.
fn accumulate(orders: Orders) -> Plans {
    Box::new(orders.flat_map(|(permutation, order)| {
        let n = order.len();
        let first = if n == 0 { 0 } else { 1 };
        (first..=n).map(move |prefix| ReorderPlan {
            permutation,
            order: order.clone(),
            prefix,
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores(n: usize) -> Vec<Operation> {
        (0..n)
            .map(|i| Operation::store(i, (i * 8) as u64, vec![i as u8; 8]))
            .collect()
    }

    fn factorial(n: usize) -> usize {
        (1..=n).product()
    }

    #[test]
    fn test_no_reorder_is_trace_order() {
        let plans: Vec<_> = NoReorder.generate(&stores(3)).collect();
        assert_eq!(plans, vec![ReorderPlan::complete(0, vec![0, 1, 2])]);
    }

    #[test]
    fn test_full_generates_n_factorial() {
        for n in 1..=5 {
            assert_eq!(Full.generate(&stores(n)).count(), factorial(n));
            assert_eq!(Partial.generate(&stores(n)).count(), factorial(n));
        }
    }

    #[test]
    fn test_full_first_plan_is_trace_order_and_all_distinct() {
        let plans: Vec<_> = Full.generate(&stores(4)).collect();
        assert_eq!(plans[0].order, vec![0, 1, 2, 3]);
        let mut orders: Vec<_> = plans.iter().map(|p| p.order.clone()).collect();
        orders.sort();
        orders.dedup();
        assert_eq!(orders.len(), 24);
        assert!(plans.iter().all(|p| !p.is_truncated()));
    }

    #[test]
    fn test_accumulative_n_plans_per_permutation() {
        let plans: Vec<_> = FullAccumulative.generate(&stores(3)).collect();
        assert_eq!(plans.len(), factorial(3) * 3);
        for permutation in 0..6u64 {
            let prefixes: Vec<usize> = plans
                .iter()
                .filter(|p| p.permutation == permutation)
                .map(|p| p.prefix)
                .collect();
            assert_eq!(prefixes, vec![1, 2, 3]);
        }
        assert_eq!(PartialAccumulative.generate(&stores(3)).count(), 18);
    }

    #[test]
    fn test_accumulative_full_prefix_equals_plain_plan() {
        let plain: Vec<_> = Full.generate(&stores(3)).collect();
        let full_prefix: Vec<_> = FullAccumulative
            .generate(&stores(3))
            .filter(|p| p.prefix == 3)
            .collect();
        assert_eq!(plain, full_prefix);
    }

    #[test]
    fn test_reverse_accumulative() {
        let plans: Vec<_> = ReverseAccumulative.generate(&stores(3)).collect();
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].applied(), &[2]);
        assert_eq!(plans[2].applied(), &[2, 1, 0]);
    }

    #[test]
    fn test_empty_unit_yields_one_empty_plan_for_every_engine() {
        let baseline: Vec<_> = NoReorder.generate(&[]).collect();
        assert_eq!(baseline, vec![ReorderPlan::empty()]);
        for kind in EngineKind::ALL {
            let plans: Vec<_> = kind.engine().generate(&[]).collect();
            assert_eq!(plans, baseline, "engine {}", kind);
        }
    }

    #[test]
    fn test_generate_is_restartable() {
        let unit = stores(3);
        let first: Vec<_> = Partial.generate(&unit).collect();
        let second: Vec<_> = Partial.generate(&unit).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_engine_scopes() {
        assert_eq!(Full.scope(), ReorderScope::Region);
        assert_eq!(FullAccumulative.scope(), ReorderScope::Region);
        assert_eq!(Partial.scope(), ReorderScope::Epoch);
        assert_eq!(NoReorder.scope(), ReorderScope::Epoch);
    }

    #[test]
    fn test_engine_kind_from_str() {
        assert_eq!("full".parse::<EngineKind>(), Ok(EngineKind::Full));
        assert_eq!("NoReorder".parse::<EngineKind>(), Ok(EngineKind::NoReorder));
        assert_eq!(
            "partial_accumulative".parse::<EngineKind>(),
            Ok(EngineKind::PartialAccumulative)
        );
        assert!("random".parse::<EngineKind>().is_err());
        for kind in EngineKind::ALL {
            assert_eq!(kind.to_string().parse::<EngineKind>(), Ok(kind));
        }
    }
}
