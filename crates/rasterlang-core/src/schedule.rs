//! Scheduling directives attached to functions and their stages.
//!
//! A [`FuncSchedule`] carries the function-wide directives (store/compute
//! levels, explicit bounds, storage dims); a [`StageSchedule`] carries the
//! per-definition directives (splits, dim list, reduction variables, fusion
//! state). The loop-nest builder consumes these verbatim; nothing here is
//! interpreted at schedule-construction time.

use std::collections::HashMap;

use crate::expr::Expr;
use crate::stmt::{DeviceApi, ForType, MemoryType, PrefetchDirective};

/// What to do when a split factor does not divide the extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TailStrategy {
    /// Let the loop-nest builder pick (shift-inwards for pure stages,
    /// guard-with-if for updates).
    Auto,
    /// Round the outer extent up; the consumer must tolerate overcompute.
    RoundUp,
    /// Guard the body with a `likely` bounds test.
    GuardWithIf,
    /// Clamp the base so the last tile shifts inwards.
    ShiftInwards,
}

/// The four flavors of split directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitKind {
    /// `old -> outer * factor + inner`.
    Split,
    /// `(inner, outer) -> fused`.
    Fuse,
    /// `old -> outer`, a pure renaming.
    Rename,
    /// An RVar promoted to a pure Var; handled like a rename.
    Purify,
}

/// One split/fuse/rename directive, in application order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Split {
    pub old_var: String,
    pub outer: String,
    pub inner: String,
    pub factor: Expr,
    pub kind: SplitKind,
    pub tail: TailStrategy,
}

impl Split {
    pub fn is_split(&self) -> bool {
        self.kind == SplitKind::Split
    }

    pub fn is_fuse(&self) -> bool {
        self.kind == SplitKind::Fuse
    }

    pub fn is_rename(&self) -> bool {
        matches!(self.kind, SplitKind::Rename | SplitKind::Purify)
    }
}

/// Whether a loop dimension came from a pure var or a reduction var.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimType {
    PureVar,
    /// A reduction var whose iterations are provably independent.
    PureRVar,
    /// A reduction var with loop-carried dependences.
    ImpureRVar,
}

/// One loop in a stage's dim list (innermost first).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dim {
    pub var: String,
    pub for_type: ForType,
    pub device_api: DeviceApi,
    pub dim_type: DimType,
}

/// A position in some function's loop nest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LoopLevel {
    /// Computed on demand at every use site.
    Inlined,
    /// At the top of the pipeline.
    Root,
    /// Just inside the named loop of the named function's stage.
    At { func: String, stage: usize, var: String },
}

/// True when a dim-list name refers to the schedule variable `v2`: either
/// exactly, or as the tail of a fused name like `y.yi`.
pub fn var_name_match(dim_name: &str, v2: &str) -> bool {
    dim_name == v2 || dim_name.ends_with(&format!(".{v2}"))
}

impl LoopLevel {
    pub fn inlined() -> LoopLevel {
        LoopLevel::Inlined
    }

    pub fn root() -> LoopLevel {
        LoopLevel::Root
    }

    pub fn at(func: impl Into<String>, stage: usize, var: impl Into<String>) -> LoopLevel {
        LoopLevel::At { func: func.into(), stage, var: var.into() }
    }

    pub fn is_inlined(&self) -> bool {
        matches!(self, LoopLevel::Inlined)
    }

    pub fn is_root(&self) -> bool {
        matches!(self, LoopLevel::Root)
    }

    /// Does a `For` loop with this fully-qualified name sit at this level?
    pub fn matches_loop(&self, loop_name: &str) -> bool {
        match self {
            LoopLevel::Inlined => false,
            LoopLevel::Root => loop_name == crate::ops::ROOT_LOOP_NAME,
            LoopLevel::At { func, stage, var } => {
                let prefix = format!("{func}.s{stage}.");
                match loop_name.strip_prefix(&prefix) {
                    Some(rest) => var_name_match(rest, var),
                    None => false,
                }
            }
        }
    }

    /// Level equality up to the stage index, the comparison `compute_with`
    /// validation needs.
    pub fn matches_level(&self, other: &LoopLevel) -> bool {
        match (self, other) {
            (LoopLevel::Inlined, LoopLevel::Inlined) => true,
            (LoopLevel::Root, LoopLevel::Root) => true,
            (
                LoopLevel::At { func: f1, var: v1, .. },
                LoopLevel::At { func: f2, var: v2, .. },
            ) => f1 == f2 && (var_name_match(v1, v2) || var_name_match(v2, v1)),
            _ => false,
        }
    }
}

/// An explicit bound or alignment request on one pure dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BoundDirective {
    pub var: String,
    pub min: Option<Expr>,
    pub extent: Option<Expr>,
    pub modulus: Option<Expr>,
    pub remainder: Option<Expr>,
}

/// Storage layout directives for one dimension of the allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageDim {
    pub var: String,
    pub fold_factor: Option<Expr>,
    /// Fold assuming the min advances (true) or the max retreats (false).
    pub fold_forward: bool,
}

/// How a fused child loop aligns its iteration space with the parent's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopAlignStrategy {
    AlignStart,
    AlignEnd,
    NoAlign,
    Auto,
}

/// A `compute_with` edge between two stages, established on the parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FusedPair {
    pub func_1: String,
    pub stage_1: usize,
    pub func_2: String,
    pub stage_2: usize,
    pub var_name: String,
}

/// Where (and how) this stage fuses into a parent loop nest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuseLoopLevel {
    pub level: LoopLevel,
    pub align: HashMap<String, LoopAlignStrategy>,
}

impl Default for FuseLoopLevel {
    fn default() -> Self {
        FuseLoopLevel { level: LoopLevel::Inlined, align: HashMap::new() }
    }
}

/// A reduction-domain variable with its iteration range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReductionVariable {
    pub var: String,
    pub min: Expr,
    pub extent: Expr,
}

/// Per-definition scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageSchedule {
    pub splits: Vec<Split>,
    /// Loop dims, innermost first, ending with the `__outermost` dummy.
    pub dims: Vec<Dim>,
    pub rvars: Vec<ReductionVariable>,
    pub fuse_level: FuseLoopLevel,
    pub fused_pairs: Vec<FusedPair>,
    pub prefetches: Vec<PrefetchDirective>,
    pub allow_race_conditions: bool,
    /// True once the user touched this stage's schedule at all.
    pub touched: bool,
}

impl StageSchedule {
    /// The dim list for a fresh stage over the given pure args
    /// (innermost first), plus the dummy outermost dim.
    pub fn default_dims(args: &[String], rvars: &[ReductionVariable]) -> Vec<Dim> {
        let mut dims: Vec<Dim> = rvars
            .iter()
            .map(|rv| Dim {
                var: rv.var.clone(),
                for_type: ForType::Serial,
                device_api: DeviceApi::None,
                dim_type: DimType::ImpureRVar,
            })
            .collect();
        dims.extend(args.iter().map(|a| Dim {
            var: a.clone(),
            for_type: ForType::Serial,
            device_api: DeviceApi::None,
            dim_type: DimType::PureVar,
        }));
        dims.push(Dim {
            var: crate::ops::OUTERMOST_DIM.to_string(),
            for_type: ForType::Serial,
            device_api: DeviceApi::None,
            dim_type: DimType::PureVar,
        });
        dims
    }
}

/// Per-function scheduling state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncSchedule {
    pub store_level: LoopLevel,
    pub compute_level: LoopLevel,
    pub bounds: Vec<BoundDirective>,
    pub storage_dims: Vec<StorageDim>,
    pub memory_type: MemoryType,
    pub memoized: bool,
}

impl FuncSchedule {
    /// The default schedule: inlined, auto storage, one storage dim per arg.
    pub fn inlined_default(args: &[String]) -> FuncSchedule {
        FuncSchedule {
            store_level: LoopLevel::Inlined,
            compute_level: LoopLevel::Inlined,
            bounds: Vec::new(),
            storage_dims: args
                .iter()
                .map(|a| StorageDim { var: a.clone(), fold_factor: None, fold_forward: true })
                .collect(),
            memory_type: MemoryType::Auto,
            memoized: false,
        }
    }

    /// The schedule used for outputs: computed and stored at the root.
    pub fn root_default(args: &[String]) -> FuncSchedule {
        FuncSchedule {
            store_level: LoopLevel::Root,
            compute_level: LoopLevel::Root,
            ..FuncSchedule::inlined_default(args)
        }
    }

    pub fn storage_dim(&self, var: &str) -> Option<&StorageDim> {
        self.storage_dims.iter().find(|d| var_name_match(&d.var, var) || d.var == var)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_level_matches_qualified_names() {
        let level = LoopLevel::at("f", 0, "x");
        assert!(level.matches_loop("f.s0.x"));
        assert!(level.matches_loop("f.s0.y.x"));
        assert!(!level.matches_loop("f.s1.x"));
        assert!(!level.matches_loop("g.s0.x"));
        assert!(!level.matches_loop("f.s0.xi"));
    }

    #[test]
    fn root_matches_placeholder() {
        assert!(LoopLevel::root().matches_loop(crate::ops::ROOT_LOOP_NAME));
        assert!(!LoopLevel::inlined().matches_loop("f.s0.x"));
    }

    #[test]
    fn var_name_match_accepts_fused_tails() {
        assert!(var_name_match("y.yi", "yi"));
        assert!(var_name_match("yi", "yi"));
        assert!(!var_name_match("xyi", "yi"));
    }

    #[test]
    fn default_dims_order() {
        let args = vec!["x".to_string(), "y".to_string()];
        let rvars = vec![ReductionVariable {
            var: "r".to_string(),
            min: Expr::i32(0),
            extent: Expr::i32(10),
        }];
        let dims = StageSchedule::default_dims(&args, &rvars);
        let names: Vec<&str> = dims.iter().map(|d| d.var.as_str()).collect();
        assert_eq!(names, vec!["r", "x", "y", crate::ops::OUTERMOST_DIM]);
        assert_eq!(dims[0].dim_type, DimType::ImpureRVar);
    }
}
