//! Loop vectorization: replacing a `Vectorized` loop counter with a ramp
//! and widening everything it touches.
//!
//! A stack of vectorized loop variables supports nested vectorization
//! (inner widths multiply outer ones). Scoped lets are widened under
//! `<name>.widened.<loop_var>` names, interleaved ramps are inlined so
//! later patterns can match, divergent control flow is predicated or
//! scalarized, and simple atomic update patterns become horizontal
//! `VectorReduce` operations.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use rasterlang_analysis::simplify::{is_const_one, simplify};
use rasterlang_analysis::{can_prove, is_negative_const, is_positive_const};
use rasterlang_core::expr::{
    BinaryOp, CallKind, Expr, ExprKind, ModulusRemainder, ReduceOp,
};
use rasterlang_core::function::Environment;
use rasterlang_core::mutate::{walk_expr, walk_stmt, Mutator};
use rasterlang_core::ops::{self, as_likely_tag, unwrap_tags};
use rasterlang_core::scope::Scope;
use rasterlang_core::stmt::{DeviceApi, ForType, Stmt, StmtKind};
use rasterlang_core::substitute::{expr_uses_var, substitute, substitute_stmt};
use rasterlang_core::types::Type;
use rasterlang_core::visit::{walk_stmt as visit_walk_stmt, Visitor};
use rasterlang_core::{intrinsic, unique_name};

use crate::error::LowerError;

// Event codes in a trace call's argument list (argument 6).
const TRACE_EVENT_ARG: usize = 6;
const TRACE_LANES_ARG: usize = 5;
const TRACE_COORD_COUNT_ARG: usize = 9;
const TRACE_BEGIN_REALIZATION: i64 = 2;
const TRACE_END_REALIZATION: i64 = 3;

fn get_lane(e: &Expr, lane: u16) -> Expr {
    Expr::extract_lane(e.clone(), lane)
}

/// Widens `e` to the given lane count by broadcasting.
fn widen(e: Expr, lanes: u16) -> Expr {
    if e.lanes() == lanes {
        e
    } else {
        assert!(
            lanes % e.lanes() == 0,
            "mismatched vector lanes in vectorization: {} vs {}",
            e.lanes(),
            lanes
        );
        Expr::broadcast(e.clone(), lanes / e.lanes())
    }
}

// ---------------------------------------------------------------------------
// Exact lane bounds
// ---------------------------------------------------------------------------

struct LaneInterval {
    min: Expr,
    max: Expr,
}

/// The exact min and max lanes of a vector expression. Not conservative
/// like the bounds engine; exact for some common node shapes, and a
/// `VectorReduce` over the lanes otherwise. Nested vectors reduce one
/// nesting level.
fn bounds_of_nested_lanes(e: &Expr) -> LaneInterval {
    match e.kind() {
        ExprKind::Binary { op, a, b } => {
            let broadcast_side = |v: &Expr, other: &Expr| -> Option<(Expr, Expr)> {
                if let ExprKind::Broadcast { value, .. } = v.kind() {
                    Some((value.clone(), other.clone()))
                } else {
                    None
                }
            };
            match op {
                BinaryOp::Add => {
                    if let Some((bv, other)) =
                        broadcast_side(b, a).or_else(|| broadcast_side(a, b))
                    {
                        let i = bounds_of_nested_lanes(&other);
                        return LaneInterval {
                            min: i.min + bv.clone(),
                            max: i.max + bv,
                        };
                    }
                }
                BinaryOp::Sub => {
                    if let ExprKind::Broadcast { value, .. } = b.kind() {
                        let i = bounds_of_nested_lanes(a);
                        return LaneInterval {
                            min: i.min - value.clone(),
                            max: i.max - value.clone(),
                        };
                    }
                    if let ExprKind::Broadcast { value, .. } = a.kind() {
                        let i = bounds_of_nested_lanes(b);
                        return LaneInterval {
                            min: value.clone() - i.max,
                            max: value.clone() - i.min,
                        };
                    }
                }
                BinaryOp::Mul => {
                    if let Some((bv, other)) =
                        broadcast_side(b, a).or_else(|| broadcast_side(a, b))
                    {
                        if is_positive_const(&bv) {
                            let i = bounds_of_nested_lanes(&other);
                            return LaneInterval {
                                min: i.min * bv.clone(),
                                max: i.max * bv,
                            };
                        } else if is_negative_const(&bv) {
                            let i = bounds_of_nested_lanes(&other);
                            return LaneInterval {
                                min: i.max * bv.clone(),
                                max: i.min * bv,
                            };
                        }
                    }
                }
                BinaryOp::Div => {
                    if let ExprKind::Broadcast { value, .. } = b.kind() {
                        if is_positive_const(value) {
                            let i = bounds_of_nested_lanes(a);
                            return LaneInterval {
                                min: i.min / value.clone(),
                                max: i.max / value.clone(),
                            };
                        }
                    }
                }
                BinaryOp::Min | BinaryOp::Max => {
                    if let Some((bv, other)) =
                        broadcast_side(b, a).or_else(|| broadcast_side(a, b))
                    {
                        let i = bounds_of_nested_lanes(&other);
                        return LaneInterval {
                            min: Expr::binary(*op, i.min, bv.clone()),
                            max: Expr::binary(*op, i.max, bv),
                        };
                    }
                }
                BinaryOp::Mod => {}
            }
        }
        ExprKind::And { a, b } => {
            if let ExprKind::Broadcast { value, .. } = b.kind() {
                let i = bounds_of_nested_lanes(a);
                return LaneInterval {
                    min: Expr::and(i.min, value.clone()),
                    max: Expr::and(i.max, value.clone()),
                };
            }
            if let ExprKind::Broadcast { value, .. } = a.kind() {
                let i = bounds_of_nested_lanes(b);
                return LaneInterval {
                    min: Expr::and(i.min, value.clone()),
                    max: Expr::and(i.max, value.clone()),
                };
            }
        }
        ExprKind::Or { a, b } => {
            if let ExprKind::Broadcast { value, .. } = b.kind() {
                let i = bounds_of_nested_lanes(a);
                return LaneInterval {
                    min: Expr::or(i.min, value.clone()),
                    max: Expr::or(i.max, value.clone()),
                };
            }
            if let ExprKind::Broadcast { value, .. } = a.kind() {
                let i = bounds_of_nested_lanes(b);
                return LaneInterval {
                    min: Expr::or(i.min, value.clone()),
                    max: Expr::or(i.max, value.clone()),
                };
            }
        }
        ExprKind::Not { a } => {
            let i = bounds_of_nested_lanes(a);
            return LaneInterval { min: Expr::not(i.max), max: Expr::not(i.min) };
        }
        ExprKind::Ramp { base, stride, lanes } => {
            let last = Expr::int_of(base.ty().element_of(), *lanes as i64 - 1);
            if is_positive_const(stride) {
                return LaneInterval {
                    min: base.clone(),
                    max: base.clone() + last * stride.clone(),
                };
            } else if is_negative_const(stride) {
                return LaneInterval {
                    min: base.clone() + last * stride.clone(),
                    max: base.clone(),
                };
            }
        }
        ExprKind::Broadcast { value, .. } => {
            return LaneInterval { min: value.clone(), max: value.clone() };
        }
        ExprKind::Let { name, value, body } => {
            let iv = bounds_of_nested_lanes(value);
            let ib = bounds_of_nested_lanes(body);
            let wrap = |e: Expr| -> Expr {
                if expr_uses_var(&e, name) {
                    // Only valid if the binding was scalar; lane bounds of
                    // the value cover the vector case.
                    Expr::let_in(name.clone(), iv.min.clone(), e)
                } else {
                    e
                }
            };
            return LaneInterval { min: wrap(ib.min), max: wrap(ib.max) };
        }
        _ => {}
    }
    // Explicit reduction over the lanes.
    if e.ty().is_bool() {
        LaneInterval {
            min: Expr::vector_reduce(ReduceOp::And, e.clone(), 1),
            max: Expr::vector_reduce(ReduceOp::Or, e.clone(), 1),
        }
    } else {
        LaneInterval {
            min: Expr::vector_reduce(ReduceOp::Min, e.clone(), 1),
            max: Expr::vector_reduce(ReduceOp::Max, e.clone(), 1),
        }
    }
}

/// Like [`bounds_of_nested_lanes`], reduced all the way to scalars.
fn bounds_of_lanes(e: &Expr) -> LaneInterval {
    let mut b = bounds_of_nested_lanes(e);
    while b.min.ty().is_vector() {
        b.min = bounds_of_nested_lanes(&b.min).min;
    }
    while b.max.ty().is_vector() {
        b.max = bounds_of_nested_lanes(&b.max).max;
    }
    LaneInterval { min: simplify(&b.min), max: simplify(&b.max) }
}

// ---------------------------------------------------------------------------
// Interleaved ramps
// ---------------------------------------------------------------------------

/// A ramp with its lanes repeated `inner_repetitions` times and the whole
/// vector repeated `outer_repetitions` times, e.g. `<0 0 2 2 0 0 2 2>`.
#[derive(Debug, Clone)]
struct InterleavedRamp {
    base: Expr,
    stride: Expr,
    lanes: u16,
    inner_repetitions: u16,
    outer_repetitions: u16,
}

fn equal_or_zero(a: u16, b: u16) -> bool {
    a == 0 || b == 0 || a == b
}

fn is_interleaved_ramp(
    e: &Expr,
    scope: &Scope<Expr>,
    result: &mut InterleavedRamp,
) -> bool {
    match e.kind() {
        ExprKind::Ramp { base, stride, lanes } => {
            if base.ty().is_scalar() {
                result.base = base.clone();
                result.stride = stride.clone();
                result.lanes = *lanes;
                result.inner_repetitions = 1;
                result.outer_repetitions = 1;
                return true;
            }
            if let (
                ExprKind::Broadcast { value: bv, lanes: bl },
                ExprKind::Broadcast { value: sv, lanes: sl },
            ) = (base.kind(), stride.kind())
            {
                if bl == sl {
                    // Ramp of broadcasts.
                    result.base = bv.clone();
                    result.stride = sv.clone();
                    result.lanes = *lanes;
                    result.inner_repetitions = *bl;
                    result.outer_repetitions = 1;
                    return true;
                }
            }
            false
        }
        ExprKind::Broadcast { value, lanes } => {
            if value.ty().is_scalar() {
                result.base = value.clone();
                result.stride = Expr::zero(value.ty());
                result.lanes = *lanes;
                result.inner_repetitions = 0;
                result.outer_repetitions = 0;
                true
            } else if is_interleaved_ramp(value, scope, result) {
                result.outer_repetitions =
                    result.outer_repetitions.saturating_mul(*lanes);
                true
            } else {
                false
            }
        }
        ExprKind::Binary { op: BinaryOp::Add, a, b } => {
            let mut ra = dummy_ramp();
            if is_interleaved_ramp(a, scope, &mut ra)
                && is_interleaved_ramp(b, scope, result)
                && equal_or_zero(ra.inner_repetitions, result.inner_repetitions)
                && equal_or_zero(ra.outer_repetitions, result.outer_repetitions)
            {
                result.base = simplify(&(result.base.clone() + ra.base));
                result.stride = simplify(&(result.stride.clone() + ra.stride));
                result.inner_repetitions =
                    result.inner_repetitions.max(ra.inner_repetitions);
                result.outer_repetitions =
                    result.outer_repetitions.max(ra.outer_repetitions);
                true
            } else {
                false
            }
        }
        ExprKind::Binary { op: BinaryOp::Sub, a, b } => {
            let mut ra = dummy_ramp();
            if is_interleaved_ramp(a, scope, &mut ra)
                && is_interleaved_ramp(b, scope, result)
                && equal_or_zero(ra.inner_repetitions, result.inner_repetitions)
                && equal_or_zero(ra.outer_repetitions, result.outer_repetitions)
            {
                result.base = simplify(&(ra.base - result.base.clone()));
                result.stride = simplify(&(ra.stride - result.stride.clone()));
                result.inner_repetitions =
                    result.inner_repetitions.max(ra.inner_repetitions);
                result.outer_repetitions =
                    result.outer_repetitions.max(ra.outer_repetitions);
                true
            } else {
                false
            }
        }
        ExprKind::Binary { op: BinaryOp::Mul, a, b } => {
            if let Some(c) = b.as_const_int() {
                if is_interleaved_ramp(a, scope, result) {
                    result.base = simplify(&(result.base.clone() * Expr::i32(c as i32)));
                    result.stride =
                        simplify(&(result.stride.clone() * Expr::i32(c as i32)));
                    return true;
                }
            }
            false
        }
        ExprKind::Binary { op: BinaryOp::Div, a, b } => {
            if let Some(c) = b.as_const_int() {
                if is_interleaved_ramp(a, scope, result)
                    && is_const_one(&result.stride)
                    && result.inner_repetitions <= 1
                    && can_prove(&ops::eq(
                        result.base.clone() % Expr::i32(c as i32),
                        Expr::i32(0),
                    ))
                {
                    // ramp(base*c, 1, lanes) / c
                    result.base = simplify(&(result.base.clone() / Expr::i32(c as i32)));
                    result.inner_repetitions =
                        result.inner_repetitions.saturating_mul(c as u16);
                    return true;
                }
            }
            false
        }
        ExprKind::Binary { op: BinaryOp::Mod, a, b } => {
            if let Some(c) = b.as_const_int() {
                if is_interleaved_ramp(a, scope, result)
                    && result.outer_repetitions <= 1
                    && can_prove(&ops::eq(
                        Expr::i32(c as i32) % result.stride.clone(),
                        Expr::i32(0),
                    ))
                {
                    // ramp(base, s, lanes) % c with c a multiple of s.
                    result.base = simplify(&(result.base.clone() % Expr::i32(c as i32)));
                    result.stride =
                        simplify(&(result.stride.clone() % Expr::i32(c as i32)));
                    result.outer_repetitions =
                        result.outer_repetitions.saturating_mul(c as u16);
                    return true;
                }
            }
            false
        }
        ExprKind::Variable { name, .. } => match scope.get(name) {
            Some(value) => {
                let value = value.clone();
                is_interleaved_ramp(&value, scope, result)
            }
            None => false,
        },
        _ => false,
    }
}

fn dummy_ramp() -> InterleavedRamp {
    InterleavedRamp {
        base: Expr::i32(0),
        stride: Expr::i32(0),
        lanes: 0,
        inner_repetitions: 0,
        outer_repetitions: 0,
    }
}

// ---------------------------------------------------------------------------
// Helpers over allocations and loops
// ---------------------------------------------------------------------------

/// Allocations inside vectorized loops grow an inner per-lane dimension;
/// accesses are rewritten `index -> index * lanes + lane`.
struct RewriteAccessToVectorAlloc<'a> {
    var: Expr,
    alloc: &'a str,
    lanes: u16,
}

impl RewriteAccessToVectorAlloc<'_> {
    fn mutate_index(&mut self, name: &str, index: &Expr) -> Expr {
        let index = self.mutate_expr(index);
        if name == self.alloc {
            index * Expr::i32(self.lanes as i32) + self.var.clone()
        } else {
            index
        }
    }

    fn mutate_alignment(&self, name: &str, align: &ModulusRemainder) -> ModulusRemainder {
        if name == self.alloc {
            align.scaled(self.lanes as i64)
        } else {
            *align
        }
    }
}

impl Mutator for RewriteAccessToVectorAlloc<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        if let ExprKind::Load { name, index, predicate, alignment, binding } = e.kind() {
            let index = self.mutate_index(name, index);
            let predicate = self.mutate_expr(predicate);
            return Expr::load(
                e.ty().with_lanes(index.lanes()),
                name.clone(),
                index,
                predicate,
                self.mutate_alignment(name, alignment),
                binding.clone(),
            );
        }
        walk_expr(self, e)
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if let StmtKind::Store { name, value, index, predicate, alignment, binding } =
            s.kind()
        {
            let value = self.mutate_expr(value);
            let index = self.mutate_index(name, index);
            let predicate = self.mutate_expr(predicate);
            return Stmt::store(
                name.clone(),
                value,
                index,
                predicate,
                self.mutate_alignment(name, alignment),
                binding.clone(),
            );
        }
        walk_stmt(self, s)
    }
}

struct SerializeLoops;

impl Mutator for SerializeLoops {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if let StmtKind::For { name, min, extent, for_type: ForType::Vectorized, device_api, body } =
            s.kind()
        {
            return Stmt::for_loop(
                name.clone(),
                min.clone(),
                extent.clone(),
                ForType::Serial,
                *device_api,
                self.mutate_stmt(body),
            );
        }
        walk_stmt(self, s)
    }
}

// ---------------------------------------------------------------------------
// Predicated loads and stores
// ---------------------------------------------------------------------------

/// Pushes a vector predicate into every load and store of a statement.
/// Fails (leaves `valid` false) when the statement contains something that
/// cannot be predicated.
struct PredicateLoadStore {
    var: String,
    vector_predicate: Expr,
    lanes: u16,
    valid: bool,
    vectorized: bool,
}

impl PredicateLoadStore {
    fn new(var: String, vector_predicate: Expr) -> Self {
        let lanes = vector_predicate.lanes();
        assert!(lanes > 1);
        PredicateLoadStore { var, vector_predicate, lanes, valid: true, vectorized: false }
    }

    fn merge_predicate(&mut self, pred: Expr, new_pred: &Expr) -> Expr {
        if pred.lanes() == new_pred.lanes() {
            simplify(&Expr::and(pred, new_pred.clone()))
        } else {
            self.valid = false;
            pred
        }
    }

    fn is_vectorized(&self) -> bool {
        self.valid && self.vectorized
    }
}

impl Mutator for PredicateLoadStore {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        match e.kind() {
            ExprKind::Load { name, index, predicate, alignment, binding } => {
                self.valid = self.valid
                    && (predicate.lanes() == self.lanes
                        || (predicate.ty().is_scalar()
                            && !expr_uses_var(index, &self.var)));
                if !self.valid {
                    return e.clone();
                }

                let (predicate, index) = if !index.ty().is_scalar() {
                    (self.mutate_expr(predicate), self.mutate_expr(index))
                } else if expr_uses_var(index, &self.var) {
                    (
                        self.mutate_expr(&widen(predicate.clone(), self.lanes)),
                        self.mutate_expr(&widen(index.clone(), self.lanes)),
                    )
                } else {
                    return walk_expr(self, e);
                };

                let predicate =
                    self.merge_predicate(predicate, &self.vector_predicate.clone());
                if !self.valid {
                    return e.clone();
                }
                self.vectorized = true;
                Expr::load(
                    e.ty().with_lanes(index.lanes()),
                    name.clone(),
                    index,
                    predicate,
                    *alignment,
                    binding.clone(),
                )
            }
            ExprKind::Call { kind, .. } => {
                // Side effects cannot be predicated away.
                self.valid = self.valid && kind.is_pure();
                walk_expr(self, e)
            }
            ExprKind::VectorReduce { .. } => {
                self.valid = self.valid && is_const_one(&self.vector_predicate);
                e.clone()
            }
            _ => walk_expr(self, e),
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if let StmtKind::Store { name, value, index, predicate, alignment, binding } =
            s.kind()
        {
            self.valid = self.valid
                && (predicate.lanes() == self.lanes
                    || (predicate.ty().is_scalar() && !expr_uses_var(index, &self.var)));
            if !self.valid {
                return s.clone();
            }

            let (predicate, value, index) = if !index.ty().is_scalar() {
                (
                    self.mutate_expr(predicate),
                    self.mutate_expr(value),
                    self.mutate_expr(index),
                )
            } else if expr_uses_var(index, &self.var) {
                (
                    self.mutate_expr(&widen(predicate.clone(), self.lanes)),
                    self.mutate_expr(&widen(value.clone(), self.lanes)),
                    self.mutate_expr(&widen(index.clone(), self.lanes)),
                )
            } else {
                return walk_stmt(self, s);
            };

            let predicate = self.merge_predicate(predicate, &self.vector_predicate.clone());
            if !self.valid {
                return s.clone();
            }
            self.vectorized = true;
            return Stmt::store(name.clone(), value, index, predicate, *alignment, binding.clone());
        }
        walk_stmt(self, s)
    }
}

// ---------------------------------------------------------------------------
// The vector substitution itself
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct VectorizedVar {
    name: String,
    min: Expr,
    lanes: u16,
}

struct VectorSubs<'a> {
    // Innermost vectorized loop last.
    vectorized_vars: Vec<VectorizedVar>,
    // What each vectorized var is replaced with: combinations of ramps and
    // broadcasts depending on the current loop level.
    replacements: HashMap<String, Expr>,
    // Scalar lets whose values became vectors, original expressions.
    scope: Scope<Expr>,
    // The widened versions, keyed by the widened names.
    vector_scope: Scope<Expr>,
    // Containing lets, in order, for reinstatement when scalarizing.
    containing_lets: Vec<(String, Expr)>,
    env: &'a Environment,
    error: Option<LowerError>,
}

impl<'a> VectorSubs<'a> {
    fn new(vv: VectorizedVar, env: &'a Environment) -> Self {
        let mut subs = VectorSubs {
            vectorized_vars: vec![vv],
            replacements: HashMap::new(),
            scope: Scope::new(),
            vector_scope: Scope::new(),
            containing_lets: Vec::new(),
            env,
            error: None,
        };
        subs.update_replacements();
        subs
    }

    fn widened_var_name(&self, name: &str) -> String {
        format!(
            "{name}.widened.{}",
            self.vectorized_vars.last().expect("inside a vector loop").name
        )
    }

    /// Recomputes the replacement vectors for the current stack of
    /// vectorized loops. Each var needs a copy starting from its min and a
    /// copy starting from zero (for rewritten allocation accesses).
    fn update_replacements(&mut self) {
        self.replacements.clear();
        for var in &self.vectorized_vars {
            self.replacements.insert(var.name.clone(), var.min.clone());
            self.replacements
                .insert(format!("{}.from_zero", var.name), Expr::i32(0));
        }

        let mut strided_ones: Expr = Expr::i32(1);
        for ix in (0..self.vectorized_vars.len()).rev() {
            let lanes = self.vectorized_vars[ix].lanes;
            for ik in 0..self.vectorized_vars.len() {
                let name = self.vectorized_vars[ik].name.clone();
                let zero_name = format!("{name}.from_zero");
                let current = self.replacements[&name].clone();
                let current_zero = self.replacements[&zero_name].clone();
                if ix == ik {
                    self.replacements
                        .insert(name, Expr::ramp(current, strided_ones.clone(), lanes));
                    self.replacements.insert(
                        zero_name,
                        Expr::ramp(current_zero, strided_ones.clone(), lanes),
                    );
                } else {
                    self.replacements.insert(name, Expr::broadcast(current, lanes));
                    self.replacements
                        .insert(zero_name, Expr::broadcast(current_zero, lanes));
                }
            }
            strided_ones = Expr::broadcast(strided_ones, lanes);
        }
    }

    fn fail(&mut self, e: LowerError) {
        if self.error.is_none() {
            self.error = Some(e);
        }
    }

    /// Serializes any inner vector loops, reinstates the scalar lets, and
    /// wraps serial loops over the vectorized vars around the statement.
    fn scalarize(&self, s: &Stmt, serialize_inner_loops: bool) -> Stmt {
        let mut s = s.clone();
        if serialize_inner_loops {
            s = SerializeLoops.mutate_stmt(&s);
        }
        for (name, value) in self.containing_lets.iter().rev() {
            s = Stmt::let_stmt(name.clone(), value.clone(), s);
        }
        for vv in self.vectorized_vars.iter().rev() {
            s = Stmt::for_loop(
                vv.name.clone(),
                vv.min.clone(),
                Expr::i32(vv.lanes as i32),
                ForType::Serial,
                DeviceApi::None,
                s,
            );
        }
        s
    }

    fn mutate_binary(&mut self, e: &Expr, op: BinaryOp, a: &Expr, b: &Expr) -> Expr {
        let na = self.mutate_expr(a);
        let nb = self.mutate_expr(b);
        if na.same_as(a) && nb.same_as(b) {
            e.clone()
        } else {
            let w = na.lanes().max(nb.lanes());
            Expr::binary(op, widen(na, w), widen(nb, w))
        }
    }

    fn visit_let_value(&mut self, name: &str, value: &Expr) -> (Expr, bool, String) {
        let mutated_value = simplify(&self.mutate_expr(value));
        let was_vectorized = !value.ty().is_vector() && mutated_value.ty().is_vector();
        let vectorized_name = if was_vectorized {
            self.widened_var_name(name)
        } else {
            name.to_string()
        };
        (mutated_value, was_vectorized, vectorized_name)
    }

    fn mutate_atomic(&mut self, s: &Stmt) -> Stmt {
        let StmtKind::Atomic { producer_name, mutex_name, body } = s.kind() else {
            unreachable!()
        };

        'pattern: {
            if !mutex_name.is_empty() {
                // Cannot vectorize over a mutex.
                break 'pattern;
            }
            let StmtKind::Store { name: store_name, value, index, predicate, alignment, binding } =
                body.kind()
            else {
                break 'pattern;
            };

            // f[x] = y, no self-reference: plain vectorization is atomic
            // per-lane already.
            if !expr_uses_name_in_loads(value, store_name)
                && !expr_uses_name_in_loads(predicate, store_name)
            {
                let inner = self.mutate_stmt(body);
                return Stmt::atomic(producer_name.clone(), mutex_name.clone(), inner);
            }

            // f[x] = f[x] op y patterns.
            let (reduce_op, a, b) = match value.kind() {
                ExprKind::Binary { op: BinaryOp::Add, a, b } => (ReduceOp::Add, a, b),
                ExprKind::Binary { op: BinaryOp::Mul, a, b } => (ReduceOp::Mul, a, b),
                ExprKind::Binary { op: BinaryOp::Min, a, b } => (ReduceOp::Min, a, b),
                ExprKind::Binary { op: BinaryOp::Max, a, b } => (ReduceOp::Max, a, b),
                ExprKind::Cast { value: inner }
                    if inner.ty().is_bool() && e_is_and_or(inner).is_some() =>
                {
                    let (op, a, b) = e_is_and_or(inner).unwrap();
                    (op, a, b)
                }
                ExprKind::Call { name, args, .. }
                    if name == intrinsic::SATURATING_ADD && args.len() == 2 =>
                {
                    (ReduceOp::SaturatingAdd, &args[0], &args[1])
                }
                _ => break 'pattern,
            };

            let mut a = a.clone();
            let mut b = b.clone();
            // Bools get cast to uint8 for storage; strip that around loads.
            if b.ty().is_bool() {
                if let ExprKind::Cast { value } = b.kind() {
                    b = value.clone();
                }
            }
            if a.ty().is_bool() {
                if let ExprKind::Cast { value } = a.kind() {
                    a = value.clone();
                }
            }
            if a.as_variable().is_some() && b.as_variable().is_none() {
                std::mem::swap(&mut a, &mut b);
            }

            // b must be a lifted var, a must be a load of the stored buffer.
            let Some(var_b) = a_variable_name(&b) else { break 'pattern };
            if !self.scope.contains(&var_b) {
                break 'pattern;
            }
            let ExprKind::Load {
                name: load_name,
                index: load_index,
                predicate: load_predicate,
                ..
            } = a.kind()
            else {
                break 'pattern;
            };
            if load_name != store_name
                || !is_const_one(load_predicate)
                || !is_const_one(predicate)
            {
                break 'pattern;
            }

            let widened_b = self
                .vector_scope
                .get(&self.widened_var_name(&var_b))
                .cloned()
                .expect("scoped let has a widened binding");
            let store_index = self.mutate_expr(index);
            let load_index = self.mutate_expr(load_index);

            // The load and store must address the same interleaved ramp (or
            // the same scalar for a total reduction).
            let mut store_ir = dummy_ramp();
            let mut load_ir = dummy_ramp();
            let test = if store_index.ty().is_scalar() {
                Some(simplify(&ops::eq(load_index.clone(), store_index.clone())))
            } else if is_interleaved_ramp(&store_index, &self.vector_scope, &mut store_ir)
                && is_interleaved_ramp(&load_index, &self.vector_scope, &mut load_ir)
                && store_ir.inner_repetitions == load_ir.inner_repetitions
                && store_ir.outer_repetitions == load_ir.outer_repetitions
                && store_ir.lanes == load_ir.lanes
            {
                Some(simplify(&Expr::and(
                    ops::eq(store_ir.base.clone(), load_ir.base.clone()),
                    ops::eq(store_ir.stride.clone(), load_ir.stride.clone()),
                )))
            } else {
                None
            };
            let Some(test) = test else { break 'pattern };
            if !is_const_one(&test) {
                break 'pattern;
            }

            let binop = |x: Expr, y: Expr| -> Expr {
                match reduce_op {
                    ReduceOp::Add => x + y,
                    ReduceOp::Mul => x * y,
                    ReduceOp::Min => ops::min(x, y),
                    ReduceOp::Max => ops::max(x, y),
                    ReduceOp::And => Expr::and(x, y),
                    ReduceOp::Or => Expr::or(x, y),
                    ReduceOp::SaturatingAdd => ops::saturating_add(x, y),
                }
            };

            let mut b = widened_b;
            let (store_index, output_lanes) = if store_index.ty().is_scalar() {
                // Total reduction: the index is loop-invariant.
                b = Expr::vector_reduce(reduce_op, b, 1);
                (store_index, 1u16)
            } else {
                let reps = store_ir.inner_repetitions.max(1)
                    * store_ir.outer_repetitions.max(1);
                let output_lanes = store_index.lanes() / reps;
                let ramp_lanes = output_lanes / store_ir.base.lanes();
                let store_index = if ramp_lanes >= 2 {
                    Expr::ramp(store_ir.base.clone(), store_ir.stride.clone(), ramp_lanes)
                } else {
                    store_ir.base.clone()
                };
                if store_ir.inner_repetitions > 1 {
                    b = Expr::vector_reduce(
                        reduce_op,
                        b,
                        output_lanes * store_ir.outer_repetitions.max(1),
                    );
                }
                // Outer repetitions reduce across slices: powers of two by a
                // binary tree, the remainder linearly.
                if store_ir.outer_repetitions > 1 {
                    let mut reps = store_ir.outer_repetitions;
                    while reps % 2 == 0 {
                        let l = b.lanes() / 2;
                        let b0 = Expr::slice_vector(b.clone(), 0, 1, l);
                        let b1 = Expr::slice_vector(b.clone(), l, 1, l);
                        b = binop(b0, b1);
                        reps /= 2;
                    }
                    if reps > 1 {
                        let mut v = Expr::slice_vector(b.clone(), 0, 1, output_lanes);
                        for i in 1..reps {
                            let slice = Expr::slice_vector(
                                b.clone(),
                                i * output_lanes,
                                1,
                                output_lanes,
                            );
                            v = binop(v, slice);
                        }
                        b = v;
                    }
                }
                (store_index, output_lanes)
            };

            let new_load = Expr::load(
                a.ty().with_lanes(output_lanes),
                load_name.clone(),
                store_index.clone(),
                Expr::const_true_lanes(output_lanes),
                ModulusRemainder::unknown(),
                binding.clone(),
            );
            let lhs = Expr::cast(b.ty().with_lanes(output_lanes), new_load.clone());
            let b = binop(lhs, b);
            let b = Expr::cast(new_load.ty().with_lanes(b.lanes()), b);

            let lanes = b.lanes();
            let out = Stmt::store(
                store_name.clone(),
                b,
                store_index,
                Expr::const_true_lanes(lanes),
                *alignment,
                binding.clone(),
            );
            // The atomic may still be needed against coarser parallelism.
            return Stmt::atomic(producer_name.clone(), mutex_name.clone(), out);
        }

        // General case: serialize the whole atomic body.
        self.scalarize(s, true)
    }
}

fn e_is_and_or(e: &Expr) -> Option<(ReduceOp, &Expr, &Expr)> {
    match e.kind() {
        ExprKind::And { a, b } => Some((ReduceOp::And, a, b)),
        ExprKind::Or { a, b } => Some((ReduceOp::Or, a, b)),
        _ => None,
    }
}

fn a_variable_name(e: &Expr) -> Option<String> {
    e.as_variable().map(|s| s.to_string())
}

/// True when the expression loads from the named buffer.
fn expr_uses_name_in_loads(e: &Expr, buffer: &str) -> bool {
    struct Check<'a> {
        buffer: &'a str,
        found: bool,
    }
    impl Visitor for Check<'_> {
        fn visit_expr(&mut self, e: &Expr) {
            if let ExprKind::Load { name, .. } = e.kind() {
                if name == self.buffer {
                    self.found = true;
                }
            }
            if !self.found {
                rasterlang_core::visit::walk_expr(self, e);
            }
        }
    }
    let mut c = Check { buffer, found: false };
    c.visit_expr(e);
    c.found
}

impl Mutator for VectorSubs<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        if self.error.is_some() {
            return e.clone();
        }
        match e.kind() {
            ExprKind::Cast { value } => {
                let v = self.mutate_expr(value);
                if v.same_as(value) {
                    e.clone()
                } else {
                    Expr::cast(e.ty().with_lanes(v.lanes()), v)
                }
            }
            ExprKind::Reinterpret { value } => {
                let v = self.mutate_expr(value);
                if v.same_as(value) {
                    e.clone()
                } else {
                    Expr::reinterpret(e.ty().with_lanes(v.lanes()), v)
                }
            }
            ExprKind::Variable { name, .. } => {
                if let Some(replacement) = self.replacements.get(name) {
                    replacement.clone()
                } else if self.scope.contains(name) {
                    let widened_name = self.widened_var_name(name);
                    let ty = self
                        .vector_scope
                        .get(&widened_name)
                        .expect("scoped let has a widened binding")
                        .ty();
                    Expr::var(ty, widened_name)
                } else {
                    e.clone()
                }
            }
            ExprKind::Binary { op, a, b } => self.mutate_binary(e, *op, a, b),
            ExprKind::Cmp { op, a, b } => {
                let na = self.mutate_expr(a);
                let nb = self.mutate_expr(b);
                if na.same_as(a) && nb.same_as(b) {
                    e.clone()
                } else {
                    let w = na.lanes().max(nb.lanes());
                    Expr::cmp(*op, widen(na, w), widen(nb, w))
                }
            }
            ExprKind::And { a, b } => {
                let na = self.mutate_expr(a);
                let nb = self.mutate_expr(b);
                if na.same_as(a) && nb.same_as(b) {
                    e.clone()
                } else {
                    let w = na.lanes().max(nb.lanes());
                    Expr::and(widen(na, w), widen(nb, w))
                }
            }
            ExprKind::Or { a, b } => {
                let na = self.mutate_expr(a);
                let nb = self.mutate_expr(b);
                if na.same_as(a) && nb.same_as(b) {
                    e.clone()
                } else {
                    let w = na.lanes().max(nb.lanes());
                    Expr::or(widen(na, w), widen(nb, w))
                }
            }
            ExprKind::Not { a } => {
                let na = self.mutate_expr(a);
                if na.same_as(a) {
                    e.clone()
                } else {
                    Expr::not(na)
                }
            }
            ExprKind::Select { condition, true_value, false_value } => {
                let c = self.mutate_expr(condition);
                let t = self.mutate_expr(true_value);
                let f = self.mutate_expr(false_value);
                if c.same_as(condition) && t.same_as(true_value) && f.same_as(false_value)
                {
                    e.clone()
                } else {
                    // The branches widen; a scalar condition stays scalar.
                    let lanes = t.lanes().max(f.lanes()).max(c.lanes());
                    Expr::select(c, widen(t, lanes), widen(f, lanes))
                }
            }
            ExprKind::Load { name, index, predicate, alignment, binding } => {
                let np = self.mutate_expr(predicate);
                let ni = self.mutate_expr(index);
                if np.same_as(predicate) && ni.same_as(index) {
                    e.clone()
                } else {
                    let w = ni.lanes();
                    Expr::load(
                        e.ty().with_lanes(w),
                        name.clone(),
                        ni,
                        widen(np, w),
                        *alignment,
                        binding.clone(),
                    )
                }
            }
            ExprKind::Call { name, args, kind, value_index } => {
                let mut changed = false;
                let mut new_args: Vec<Expr> = Vec::with_capacity(args.len());
                for a in args {
                    let na = self.mutate_expr(a);
                    changed |= !na.same_as(a);
                    new_args.push(na);
                }
                let max_lanes =
                    new_args.iter().map(|a| a.lanes()).max().unwrap_or(1);

                if !changed {
                    return e.clone();
                }

                if name == intrinsic::TRACE {
                    return self.widen_trace_call(e, new_args, max_lanes);
                }

                if name == intrinsic::IF_THEN_ELSE && args.len() == 2 {
                    // A one-sided if_then_else over a load widens into a
                    // masked load.
                    let cond = widen(new_args[0].clone(), max_lanes);
                    let true_value = widen(new_args[1].clone(), max_lanes);
                    if let ExprKind::Load { name, index, alignment, binding, .. } =
                        true_value.kind()
                    {
                        return Expr::load(
                            e.ty().with_lanes(max_lanes),
                            name.clone(),
                            index.clone(),
                            cond,
                            *alignment,
                            binding.clone(),
                        );
                    }
                }

                for a in &mut new_args {
                    *a = widen(a.clone(), max_lanes);
                }
                let mut new_ty = e.ty().with_lanes(max_lanes);

                if name == intrinsic::PREFETCH {
                    // Prefetch is coarse-grained; pick lane zero of any
                    // vectorized argument rather than widening the call.
                    for a in &mut new_args {
                        if a.ty().is_vector() {
                            *a = get_lane(a, 0);
                        }
                    }
                    new_ty = e.ty();
                }

                Expr::call_indexed(new_ty, name.clone(), new_args, *kind, *value_index)
            }
            ExprKind::Let { name, value, body } => {
                let (mutated_value, was_vectorized, vectorized_name) =
                    self.visit_let_value(name, value);
                if was_vectorized {
                    self.scope.push(name.clone(), value.clone());
                    self.vector_scope
                        .push(vectorized_name.clone(), mutated_value.clone());
                }
                let mutated_body = self.mutate_expr(body);
                if was_vectorized {
                    self.scope.pop(name);
                    self.vector_scope.pop(&vectorized_name);
                }

                let mut ir = dummy_ramp();
                if is_interleaved_ramp(&mutated_value, &self.vector_scope, &mut ir) {
                    substitute(&vectorized_name, mutated_value, &mutated_body)
                } else if mutated_value.same_as(value) && mutated_body.same_as(body) {
                    e.clone()
                } else {
                    Expr::let_in(vectorized_name, mutated_value, mutated_body)
                }
            }
            ExprKind::Ramp { .. }
            | ExprKind::Broadcast { .. }
            | ExprKind::Shuffle { .. }
            | ExprKind::VectorReduce { .. }
            | ExprKind::IntImm { .. }
            | ExprKind::UIntImm { .. }
            | ExprKind::FloatImm { .. }
            | ExprKind::StringImm { .. } => walk_expr(self, e),
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if self.error.is_some() {
            return s.clone();
        }
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => {
                let (mutated_value, was_vectorized, vectorized_name) =
                    self.visit_let_value(name, value);
                if was_vectorized {
                    self.scope.push(name.clone(), value.clone());
                    self.vector_scope
                        .push(vectorized_name.clone(), mutated_value.clone());
                    self.containing_lets.push((name.clone(), value.clone()));
                }
                let mutated_body = self.mutate_stmt(body);
                if was_vectorized {
                    self.containing_lets.pop();
                    self.scope.pop(name);
                    self.vector_scope.pop(&vectorized_name);
                }

                let mut ir = dummy_ramp();
                if is_interleaved_ramp(&mutated_value, &self.vector_scope, &mut ir) {
                    substitute_stmt(&vectorized_name, mutated_value, &mutated_body)
                } else if mutated_value.same_as(value) && mutated_body.same_as(body) {
                    s.clone()
                } else {
                    Stmt::let_stmt(vectorized_name, mutated_value, mutated_body)
                }
            }
            StmtKind::Provide { .. } => {
                unreachable!("vectorization runs after storage flattening")
            }
            StmtKind::Store { name, value, index, predicate, alignment, binding } => {
                let np = self.mutate_expr(predicate);
                let nv = self.mutate_expr(value);
                let ni = self.mutate_expr(index);
                if np.same_as(predicate) && nv.same_as(value) && ni.same_as(index) {
                    s.clone()
                } else {
                    let lanes = np.lanes().max(nv.lanes()).max(ni.lanes());
                    Stmt::store(
                        name.clone(),
                        widen(nv, lanes),
                        widen(ni, lanes),
                        widen(np, lanes),
                        *alignment,
                        binding.clone(),
                    )
                }
            }
            StmtKind::AssertStmt { condition, .. } => {
                if condition.lanes() > 1 {
                    self.scalarize(s, true)
                } else {
                    s.clone()
                }
            }
            StmtKind::IfThenElse { condition, then_case, else_case } => {
                let cond = self.mutate_expr(condition);
                let lanes = cond.lanes();
                trace!(?cond, "vectorizing conditional");

                let then_case = self.mutate_stmt(then_case);
                let else_case = else_case.as_ref().map(|e| self.mutate_stmt(e));

                if lanes == 1 {
                    return Stmt::if_then_else(cond, then_case, else_case);
                }

                // Divergent lanes: try to predicate the loads and stores.
                let first_var = self.vectorized_vars[0].name.clone();
                let mut predicated_stmt = {
                    let mut p = PredicateLoadStore::new(first_var.clone(), cond.clone());
                    let out = p.mutate_stmt(&then_case);
                    (p.is_vectorized(), out)
                };
                if predicated_stmt.0 {
                    if let Some(else_case) = &else_case {
                        let mut p = PredicateLoadStore::new(
                            first_var.clone(),
                            Expr::not(cond.clone()),
                        );
                        let else_out = p.mutate_stmt(else_case);
                        predicated_stmt =
                            (p.is_vectorized(), Stmt::block(predicated_stmt.1, else_out));
                    }
                }
                let (vectorized_predicate, predicated) = predicated_stmt;

                if let Some((tag, inner)) = as_likely_tag(&cond) {
                    // Optimize for all lanes true: test the least-true lane.
                    let all_true = bounds_of_lanes(inner).min;
                    let all_true = Expr::call(
                        Type::bool_scalar(),
                        tag,
                        vec![all_true],
                        CallKind::PureIntrinsic,
                    );

                    if !vectorized_predicate {
                        // Strip the likelies from the case that scalarizes;
                        // it is no longer likely.
                        let without_likelies = Stmt::if_then_else(
                            unwrap_tags(condition),
                            original_then(s),
                            original_else(s),
                        );
                        let scalarized = self.scalarize(&without_likelies, false);
                        let scalarized = match vectorize_statement(&scalarized, self.env) {
                            Ok(out) => out,
                            Err(err) => {
                                self.fail(err);
                                return s.clone();
                            }
                        };
                        Stmt::if_then_else(all_true, then_case, Some(scalarized))
                    } else {
                        Stmt::if_then_else(all_true, then_case, Some(predicated))
                    }
                } else if vectorized_predicate {
                    predicated
                } else {
                    self.scalarize(s, true)
                }
            }
            StmtKind::For { name, min, extent, for_type, device_api, body } => {
                let mut min = self.mutate_expr(min);
                let mut extent = self.mutate_expr(extent);
                let mut body = body.clone();

                if min.ty().is_vector() {
                    // Rebase the loop to zero and try again.
                    let var = Expr::var_i32(name.clone());
                    let old_min = match s.kind() {
                        StmtKind::For { min, .. } => min.clone(),
                        _ => unreachable!(),
                    };
                    let body = substitute_stmt(name, var + old_min, &body);
                    let transformed = Stmt::for_loop(
                        name.clone(),
                        Expr::i32(0),
                        match s.kind() {
                            StmtKind::For { extent, .. } => extent.clone(),
                            _ => unreachable!(),
                        },
                        *for_type,
                        *device_api,
                        body,
                    );
                    return self.mutate_stmt(&transformed);
                }

                if extent.ty().is_vector() {
                    // Iterate to the max over the lanes and stop each lane
                    // individually inside the loop.
                    extent = bounds_of_lanes(&extent).max;
                    let var = Expr::var_i32(name.clone());
                    let (old_min, old_extent) = match s.kind() {
                        StmtKind::For { min, extent, .. } => (min.clone(), extent.clone()),
                        _ => unreachable!(),
                    };
                    body = Stmt::if_then_else(
                        ops::likely(ops::lt(var, old_min + old_extent)),
                        body,
                        None,
                    );
                }

                if *for_type == ForType::Vectorized {
                    let extent_int = extent.as_const_int();
                    let Some(lanes) = extent_int.filter(|v| *v > 1) else {
                        self.fail(LowerError::NonConstantVectorizedExtent {
                            loop_name: name.clone(),
                            extent: format!("{extent:?}"),
                        });
                        return s.clone();
                    };

                    self.vectorized_vars.push(VectorizedVar {
                        name: name.clone(),
                        min,
                        lanes: lanes as u16,
                    });
                    self.update_replacements();

                    // Re-widen the scoped lets for the new loop level.
                    for (let_name, let_value) in self.containing_lets.clone() {
                        let widened = self.widened_var_name(&let_name);
                        let value = self.mutate_expr(&let_value);
                        self.vector_scope.push(widened, value);
                    }

                    let mut body = self.mutate_stmt(&body);

                    let lets = self.containing_lets.clone();
                    for (let_name, _) in lets.iter().rev() {
                        let widened = self.widened_var_name(let_name);
                        let value = self.vector_scope.pop(&widened);
                        let mut ir = dummy_ramp();
                        if is_interleaved_ramp(&value, &self.vector_scope, &mut ir) {
                            body = substitute_stmt(&widened, value, &body);
                        } else {
                            body = Stmt::let_stmt(widened, value, body);
                        }
                    }
                    self.vectorized_vars.pop();
                    self.update_replacements();
                    body
                } else {
                    let body = self.mutate_stmt(&body);
                    let (old_min, old_extent, old_body) = match s.kind() {
                        StmtKind::For { min, extent, body, .. } => (min, extent, body),
                        _ => unreachable!(),
                    };
                    if min.same_as(old_min)
                        && extent.same_as(old_extent)
                        && body.same_as(old_body)
                    {
                        s.clone()
                    } else {
                        Stmt::for_loop(
                            name.clone(),
                            min,
                            extent,
                            *for_type,
                            *device_api,
                            body,
                        )
                    }
                }
            }
            StmtKind::Allocate {
                name,
                ty,
                memory_type,
                extents,
                condition,
                body,
                new_expr,
                free_function,
                padding,
            } => {
                assert_eq!(
                    *padding, 0,
                    "vectorization of padded allocations is not implemented"
                );
                // The expanded per-lane dimensions are innermost.
                let mut new_extents: Vec<Expr> = self
                    .vectorized_vars
                    .iter()
                    .map(|vv| Expr::i32(vv.lanes as i32))
                    .collect();
                for extent in extents {
                    let extent = self.mutate_expr(extent);
                    // Take the max over the lanes; strides vary per lane but
                    // the lanes cannot clobber each other's region.
                    let extent = if extent.ty().is_vector() {
                        bounds_of_lanes(&extent).max
                    } else {
                        extent
                    };
                    new_extents.push(extent);
                }
                let new_expr = new_expr.as_ref().map(|e| {
                    let out = self.mutate_expr(e);
                    assert!(
                        out.ty().is_scalar(),
                        "cannot vectorize an allocation with a per-lane custom allocator"
                    );
                    out
                });

                let mut body = body.clone();
                for vv in &self.vectorized_vars {
                    let mut rewrite = RewriteAccessToVectorAlloc {
                        var: Expr::var_i32(format!("{}.from_zero", vv.name)),
                        alloc: name,
                        lanes: vv.lanes,
                    };
                    body = rewrite.mutate_stmt(&body);
                }
                let mut body = self.mutate_stmt(&body);
                for vv in &self.vectorized_vars {
                    // The lane id may survive in inner scalarized blocks.
                    body = substitute_stmt(
                        &format!("{}.from_zero", vv.name),
                        Expr::var_i32(vv.name.clone()),
                        &body,
                    );
                }

                Stmt::allocate(
                    name.clone(),
                    *ty,
                    *memory_type,
                    new_extents,
                    self.mutate_expr(condition),
                    body,
                    new_expr,
                    free_function.clone(),
                    0,
                )
            }
            StmtKind::Atomic { .. } => self.mutate_atomic(s),
            _ => walk_stmt(self, s),
        }
    }
}

impl VectorSubs<'_> {
    /// Trace calls vectorize as a single call per vector. Begin/end
    /// realization events carry min/extent pairs, which collapse to the
    /// union over the lanes; other events widen their coordinate struct
    /// and record the lane count.
    fn widen_trace_call(&mut self, e: &Expr, mut new_args: Vec<Expr>, max_lanes: u16) -> Expr {
        let event = new_args
            .get(TRACE_EVENT_ARG)
            .and_then(|e| e.as_const_int());
        let realization_event = matches!(
            event,
            Some(TRACE_BEGIN_REALIZATION) | Some(TRACE_END_REALIZATION)
        );
        for i in 1..=2usize {
            let Some(arg) = new_args.get(i).cloned() else { continue };
            let ExprKind::Call { name, args: struct_args, .. } = arg.kind() else {
                continue;
            };
            if name != intrinsic::MAKE_STRUCT {
                continue;
            }
            if realization_event {
                if i == 1 {
                    // Values are empty for realization events.
                    continue;
                }
                // Coordinates are min/extent pairs; take the union.
                let mut call_args = vec![Expr::i32(0); struct_args.len()];
                let mut j = 0;
                while j + 1 < struct_args.len() {
                    let min_v = widen(struct_args[j].clone(), max_lanes);
                    let extent_v = widen(struct_args[j + 1].clone(), max_lanes);
                    let mut min_scalar = get_lane(&min_v, 0);
                    let mut max_scalar = min_scalar.clone() + get_lane(&extent_v, 0);
                    for k in 1..max_lanes {
                        let min_k = get_lane(&min_v, k);
                        let extent_k = get_lane(&extent_v, k);
                        min_scalar = ops::min(min_scalar, min_k.clone());
                        max_scalar = ops::max(max_scalar, min_k + extent_k);
                    }
                    call_args[j] = simplify(&min_scalar);
                    call_args[j + 1] = simplify(&(max_scalar - call_args[j].clone()));
                    j += 2;
                }
                new_args[i] = ops::make_struct(call_args);
            } else {
                let call_args: Vec<Expr> = struct_args
                    .iter()
                    .map(|a| widen(a.clone(), max_lanes))
                    .collect();
                new_args[i] = ops::make_struct(call_args);
            }
        }
        if !realization_event {
            if new_args.len() > TRACE_LANES_ARG {
                new_args[TRACE_LANES_ARG] = Expr::i32(max_lanes as i32);
            }
            if max_lanes > 1 && new_args.len() > TRACE_COORD_COUNT_ARG {
                new_args[TRACE_COORD_COUNT_ARG] = simplify(
                    &(new_args[TRACE_COORD_COUNT_ARG].clone()
                        * Expr::i32(max_lanes as i32)),
                );
            }
        }
        Expr::call(e.ty(), intrinsic::TRACE, new_args, CallKind::Intrinsic)
    }
}

fn original_then(s: &Stmt) -> Stmt {
    match s.kind() {
        StmtKind::IfThenElse { then_case, .. } => then_case.clone(),
        _ => unreachable!(),
    }
}

fn original_else(s: &Stmt) -> Option<Stmt> {
    match s.kind() {
        StmtKind::IfThenElse { else_case, .. } => else_case.clone(),
        _ => unreachable!(),
    }
}

// ---------------------------------------------------------------------------
// Atomic pre-pass: lift vectorizable expressions out
// ---------------------------------------------------------------------------

/// Finds the subexpressions of an atomic body that do not depend on the
/// protected buffer (directly, through loads after a store, or through
/// poisoned names) and so may be lifted outside the critical section.
struct FindVectorizableExprsInAtomicNode {
    poisoned_names: Scope<()>,
    poison: bool,
    liftable: HashSet<Expr>,
}

impl FindVectorizableExprsInAtomicNode {
    fn new(buf: &str, env: &Environment) -> Self {
        let mut poisoned_names = Scope::new();
        poisoned_names.push(buf.to_string(), ());
        if let Some(f) = env.get(buf) {
            if f.outputs() > 1 {
                for k in 0..f.outputs() {
                    poisoned_names.push(f.buffer_name(k), ());
                }
            }
        }
        FindVectorizableExprsInAtomicNode {
            poisoned_names,
            poison: false,
            liftable: HashSet::new(),
        }
    }

    fn analyze_expr(&mut self, e: &Expr) {
        let old_poison = std::mem::replace(&mut self.poison, false);
        self.walk(e);
        if !self.poison {
            self.liftable.insert(e.clone());
        }
        self.poison |= old_poison;
    }

    fn walk(&mut self, e: &Expr) {
        match e.kind() {
            ExprKind::Variable { name, .. } => {
                self.poison = self.poisoned_names.contains(name);
            }
            ExprKind::Load { name, index, predicate, .. } => {
                // Even if the load is bad, maybe the index can be lifted.
                self.analyze_expr(predicate);
                self.analyze_expr(index);
                self.poison |= self.poisoned_names.contains(name);
            }
            ExprKind::Let { name, value, body } => {
                self.analyze_expr(value);
                let bind = self.poison;
                if bind {
                    self.poisoned_names.push(name.clone(), ());
                }
                self.analyze_expr(body);
                if bind {
                    self.poisoned_names.pop(name);
                }
            }
            ExprKind::Call { name, kind, args, .. } => {
                for a in args {
                    self.analyze_expr(a);
                }
                // promise_clamped is impure only so it cannot be lifted out
                // of conditionals; atomic nodes are fine.
                let liftable_call = kind.is_pure()
                    || name == intrinsic::UNSAFE_PROMISE_CLAMPED
                    || name == intrinsic::PROMISE_CLAMPED;
                self.poison |= !liftable_call;
            }
            _ => {
                struct Walker<'a> {
                    inner: &'a mut FindVectorizableExprsInAtomicNode,
                }
                impl Visitor for Walker<'_> {
                    fn visit_expr(&mut self, e: &Expr) {
                        self.inner.analyze_expr(e);
                    }
                }
                let mut w = Walker { inner: self };
                rasterlang_core::visit::walk_expr(&mut w, e);
            }
        }
    }

    fn analyze_stmt(&mut self, s: &Stmt) {
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => {
                self.analyze_expr(value);
                let bind = self.poison;
                if bind {
                    self.poisoned_names.push(name.clone(), ());
                }
                self.analyze_stmt(body);
                if bind {
                    self.poisoned_names.pop(name);
                }
            }
            StmtKind::Store { name, value, index, predicate, .. } => {
                self.analyze_expr(index);
                self.analyze_expr(value);
                self.analyze_expr(predicate);
                // A store poisons all subsequent loads of the buffer.
                self.poisoned_names.push(name.clone(), ());
            }
            _ => {
                struct Walker<'a> {
                    inner: &'a mut FindVectorizableExprsInAtomicNode,
                }
                impl Visitor for Walker<'_> {
                    fn visit_expr(&mut self, e: &Expr) {
                        self.inner.analyze_expr(e);
                    }
                    fn visit_stmt(&mut self, s: &Stmt) {
                        self.inner.analyze_stmt(s);
                    }
                }
                let mut w = Walker { inner: self };
                visit_walk_stmt(&mut w, s);
            }
        }
    }
}

struct LiftVectorizableExprs<'a> {
    liftable: &'a HashSet<Expr>,
    already_lifted: HashMap<Expr, String>,
    lifted: Vec<(String, Expr)>,
}

impl Mutator for LiftVectorizableExprs<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        if self.liftable.contains(e) && !e.is_const() && e.as_variable().is_none() {
            let name = match self.already_lifted.get(e) {
                Some(name) => name.clone(),
                None => {
                    let name = unique_name("t");
                    self.lifted.push((name.clone(), e.clone()));
                    self.already_lifted.insert(e.clone(), name.clone());
                    name
                }
            };
            return Expr::var(e.ty(), name);
        }
        walk_expr(self, e)
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if let StmtKind::LetStmt { name, value, body } = s.kind() {
            if self.liftable.contains(value) {
                // Lift under the current name so other lifted expressions
                // do not need rewriting.
                self.lifted.push((name.clone(), value.clone()));
                return self.mutate_stmt(body);
            }
        }
        walk_stmt(self, s)
    }
}

struct LiftVectorizableExprsOutOfAllAtomicNodes<'a> {
    env: &'a Environment,
}

impl Mutator for LiftVectorizableExprsOutOfAllAtomicNodes<'_> {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if let StmtKind::Atomic { producer_name, mutex_name, body } = s.kind() {
            let mut finder =
                FindVectorizableExprsInAtomicNode::new(producer_name, self.env);
            finder.analyze_stmt(body);
            let mut lifter = LiftVectorizableExprs {
                liftable: &finder.liftable,
                already_lifted: HashMap::new(),
                lifted: Vec::new(),
            };
            let new_body = lifter.mutate_stmt(body);
            let mut out =
                Stmt::atomic(producer_name.clone(), mutex_name.clone(), new_body);
            for (name, value) in lifter.lifted.into_iter().rev() {
                out = Stmt::let_stmt(name, value, out);
            }
            out
        } else {
            walk_stmt(self, s)
        }
    }
}

// ---------------------------------------------------------------------------
// Atomic post-pass and the top-level driver
// ---------------------------------------------------------------------------

fn all_stores_in_scope(s: &Stmt, scope: &Scope<()>) -> bool {
    struct Check<'a> {
        scope: &'a Scope<()>,
        result: bool,
    }
    impl Visitor for Check<'_> {
        fn visit_stmt(&mut self, s: &Stmt) {
            if let StmtKind::Store { name, .. } = s.kind() {
                self.result = self.result && self.scope.contains(name);
            }
            visit_walk_stmt(self, s);
        }
    }
    let mut c = Check { scope, result: true };
    c.visit_stmt(s);
    c.result
}

/// Drops atomic nodes protecting buffers only accessed by a single thread.
struct RemoveUnnecessaryAtomics {
    in_thread: bool,
    local_allocs: Scope<()>,
}

impl Mutator for RemoveUnnecessaryAtomics {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.kind() {
            StmtKind::Allocate { name, .. } => {
                self.local_allocs.push(name.clone(), ());
                let out = walk_stmt(self, s);
                self.local_allocs.pop(name);
                out
            }
            StmtKind::Atomic { body, .. } => {
                if !self.in_thread || all_stores_in_scope(body, &self.local_allocs) {
                    self.mutate_stmt(body)
                } else {
                    s.clone()
                }
            }
            StmtKind::For { for_type, .. } if for_type.is_unordered_parallel() => {
                let old_in_thread = std::mem::replace(&mut self.in_thread, true);
                let old_allocs = std::mem::take(&mut self.local_allocs);
                let out = walk_stmt(self, s);
                self.local_allocs = old_allocs;
                self.in_thread = old_in_thread;
                out
            }
            _ => walk_stmt(self, s),
        }
    }
}

struct VectorizeLoops<'a> {
    env: &'a Environment,
    error: Option<LowerError>,
}

impl Mutator for VectorizeLoops<'_> {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if self.error.is_some() {
            return s.clone();
        }
        if let StmtKind::For { name, min, extent, for_type: ForType::Vectorized, body, .. } =
            s.kind()
        {
            let Some(lanes) = extent.as_const_int().filter(|v| *v > 1) else {
                self.error = Some(LowerError::NonConstantVectorizedExtent {
                    loop_name: name.clone(),
                    extent: format!("{extent:?}"),
                });
                return s.clone();
            };
            debug!(loop_name = %name, lanes, "vectorizing");
            let vv = VectorizedVar { name: name.clone(), min: min.clone(), lanes: lanes as u16 };
            let mut subs = VectorSubs::new(vv, self.env);
            let out = subs.mutate_stmt(body);
            if let Some(e) = subs.error {
                self.error = Some(e);
                return s.clone();
            }
            out
        } else {
            walk_stmt(self, s)
        }
    }
}

fn vectorize_statement(s: &Stmt, env: &Environment) -> Result<Stmt, LowerError> {
    let mut v = VectorizeLoops { env, error: None };
    let out = v.mutate_stmt(s);
    match v.error {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

/// Vectorizes every loop marked `Vectorized`.
pub fn vectorize_loops(s: &Stmt, env: &Environment) -> Result<Stmt, LowerError> {
    // Limit atomic nodes to just the necessary expressions first.
    let s = LiftVectorizableExprsOutOfAllAtomicNodes { env }.mutate_stmt(s);
    let s = vectorize_statement(&s, env)?;
    let mut cleanup =
        RemoveUnnecessaryAtomics { in_thread: false, local_allocs: Scope::new() };
    Ok(cleanup.mutate_stmt(&s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::expr::VarBinding;

    fn load(buf: &str, index: Expr) -> Expr {
        let lanes = index.lanes();
        Expr::load(
            Type::int(32).with_lanes(lanes),
            buf,
            index,
            Expr::const_true_lanes(lanes),
            ModulusRemainder::unknown(),
            VarBinding::Free,
        )
    }

    fn store(buf: &str, value: Expr, index: Expr) -> Stmt {
        let lanes = value.lanes().max(index.lanes());
        Stmt::store(
            buf,
            widen(value, lanes),
            widen(index, lanes),
            Expr::const_true_lanes(lanes),
            ModulusRemainder::unknown(),
            VarBinding::Free,
        )
    }

    fn vector_loop(name: &str, lanes: i32, body: Stmt) -> Stmt {
        Stmt::for_loop(
            name,
            Expr::i32(0),
            Expr::i32(lanes),
            ForType::Vectorized,
            DeviceApi::None,
            body,
        )
    }

    #[test]
    fn loop_var_becomes_a_ramp() {
        let x = Expr::var_i32("x");
        let body = store("out", load("in", x.clone()), x.clone());
        let s = vector_loop("x", 4, body);
        let out = vectorize_loops(&s, &Environment::new()).unwrap();

        match out.kind() {
            StmtKind::Store { value, index, .. } => {
                assert_eq!(index.lanes(), 4);
                assert!(matches!(index.kind(), ExprKind::Ramp { .. }));
                match value.kind() {
                    ExprKind::Load { index, .. } => {
                        assert!(matches!(index.kind(), ExprKind::Ramp { .. }));
                    }
                    other => panic!("expected widened Load, got {other:?}"),
                }
            }
            other => panic!("expected Store, got {other:?}"),
        }
    }

    #[test]
    fn already_vector_code_is_identity() {
        let idx = Expr::ramp(Expr::var_i32("base"), Expr::i32(1), 4);
        let s = store("out", load("in", idx.clone()), idx);
        let out = vectorize_loops(&s, &Environment::new()).unwrap();
        assert!(out.same_as(&s));
    }

    #[test]
    fn nonconstant_extent_is_a_user_error() {
        let x = Expr::var_i32("x");
        let body = store("out", x.clone(), x.clone());
        let s = Stmt::for_loop(
            "x",
            Expr::i32(0),
            Expr::var_i32("n"),
            ForType::Vectorized,
            DeviceApi::None,
            body,
        );
        let err = vectorize_loops(&s, &Environment::new()).unwrap_err();
        assert!(matches!(err, LowerError::NonConstantVectorizedExtent { .. }));
    }

    #[test]
    fn scalar_lets_widen_with_suffixed_names() {
        let x = Expr::var_i32("x");
        // let t = in[x] * 2 (vectorizes to a non-ramp, so the let is kept)
        let body = Stmt::let_stmt(
            "t",
            load("in", x.clone()) * 2,
            store("out", Expr::var_i32("t"), x.clone()),
        );
        let s = vector_loop("x", 4, body);
        let out = vectorize_loops(&s, &Environment::new()).unwrap();
        match out.kind() {
            StmtKind::LetStmt { name, value, .. } => {
                assert_eq!(name, "t.widened.x");
                assert_eq!(value.lanes(), 4);
            }
            other => panic!("expected widened LetStmt, got {other:?}"),
        }
    }

    #[test]
    fn interleaved_ramp_lets_are_inlined() {
        let x = Expr::var_i32("x");
        // let t = x + 7: an interleaved ramp, so uses substitute directly.
        let body = Stmt::let_stmt(
            "t",
            x.clone() + 7,
            store("out", Expr::var_i32("t"), x.clone()),
        );
        let s = vector_loop("x", 4, body);
        let out = vectorize_loops(&s, &Environment::new()).unwrap();
        match out.kind() {
            StmtKind::Store { value, .. } => {
                assert_eq!(value.lanes(), 4);
            }
            other => panic!("expected Store with inlined ramp, got {other:?}"),
        }
    }

    #[test]
    fn allocations_grow_an_inner_lane_dimension() {
        let x = Expr::var_i32("x");
        let body = Stmt::allocate(
            "tmp",
            Type::int(32),
            rasterlang_core::MemoryType::Auto,
            vec![Expr::i32(10)],
            Expr::const_true(),
            Stmt::block(
                store("tmp", x.clone(), Expr::i32(3)),
                store("out", load("tmp", Expr::i32(3)), x.clone()),
            ),
            None,
            None,
            0,
        );
        let s = vector_loop("x", 4, body);
        let out = vectorize_loops(&s, &Environment::new()).unwrap();
        match out.kind() {
            StmtKind::Allocate { extents, body, .. } => {
                assert_eq!(extents.len(), 2);
                assert_eq!(extents[0].as_const_int(), Some(4));
                assert_eq!(extents[1].as_const_int(), Some(10));
                // Accesses to tmp are rewritten index*lanes + lane.
                let mut saw_scaled_store = false;
                let mut stack = vec![body.clone()];
                while let Some(cur) = stack.pop() {
                    match cur.kind() {
                        StmtKind::Store { name, index, .. } if name == "tmp" => {
                            assert_eq!(index.lanes(), 4);
                            saw_scaled_store = true;
                        }
                        StmtKind::Block { first, rest } => {
                            stack.push(first.clone());
                            stack.push(rest.clone());
                        }
                        _ => {}
                    }
                }
                assert!(saw_scaled_store);
            }
            other => panic!("expected Allocate, got {other:?}"),
        }
    }

    #[test]
    fn likely_conditional_tests_all_lanes() {
        let x = Expr::var_i32("x");
        let cond = ops::likely(ops::lt(x.clone(), Expr::var_i32("limit")));
        let body = Stmt::if_then_else(cond, store("out", x.clone(), x.clone()), None);
        let s = vector_loop("x", 4, body);
        let out = vectorize_loops(&s, &Environment::new()).unwrap();
        match out.kind() {
            StmtKind::IfThenElse { condition, .. } => {
                // The scalar condition is the least-true lane, still likely.
                assert!(condition.ty().is_scalar());
                assert!(
                    condition.is_intrinsic(intrinsic::LIKELY),
                    "expected a likely() wrapper, got {condition:?}"
                );
            }
            other => panic!("expected IfThenElse, got {other:?}"),
        }
    }

    #[test]
    fn atomic_sum_becomes_vector_reduce() {
        let x = Expr::var_i32("x");
        // let y = in[x]; atomic { sum[0] = sum[0] + y }
        let body = Stmt::let_stmt(
            "y",
            load("in", x.clone()),
            Stmt::atomic(
                "sum",
                "",
                Stmt::store(
                    "sum",
                    load("sum", Expr::i32(0)) + Expr::var_i32("y"),
                    Expr::i32(0),
                    Expr::const_true(),
                    ModulusRemainder::unknown(),
                    VarBinding::Free,
                ),
            ),
        );
        let s = vector_loop("x", 4, body);
        let out = vectorize_loops(&s, &Environment::new()).unwrap();

        // Hunt for a VectorReduce(Add) somewhere in the stored value.
        let mut saw_reduce = false;
        let mut stack = vec![out];
        while let Some(cur) = stack.pop() {
            match cur.kind() {
                StmtKind::LetStmt { body, .. } => stack.push(body.clone()),
                StmtKind::Atomic { body, .. } => stack.push(body.clone()),
                StmtKind::Store { value, .. } => {
                    let mut exprs = vec![value.clone()];
                    while let Some(e) = exprs.pop() {
                        if matches!(
                            e.kind(),
                            ExprKind::VectorReduce { op: ReduceOp::Add, .. }
                        ) {
                            saw_reduce = true;
                        }
                        match e.kind() {
                            ExprKind::Binary { a, b, .. } => {
                                exprs.push(a.clone());
                                exprs.push(b.clone());
                            }
                            ExprKind::Cast { value } => exprs.push(value.clone()),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        assert!(saw_reduce, "expected the atomic sum to become a VectorReduce");
    }
}
