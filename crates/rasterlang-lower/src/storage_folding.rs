//! Storage folding: shrinking an allocation dimension to a circular buffer
//! when an enclosing serial loop marches monotonically through it.

use tracing::debug;

use rasterlang_analysis::bounds::{
    box_provided, box_required, bounds_of_expr_in_scope, region_contains, region_union,
    Interval,
};
use rasterlang_analysis::monotonic::{is_monotonic, Monotonic};
use rasterlang_analysis::simplify::{
    can_prove, find_constant_upper_bound, simplify, simplify_stmt,
};
use rasterlang_core::expr::{CallKind, Expr, ExprKind};
use rasterlang_core::function::{Environment, Function};
use rasterlang_core::mutate::{walk_expr, walk_stmt, Mutator};
use rasterlang_core::ops::{self, ge, le, lt};
use rasterlang_core::scope::Scope;
use rasterlang_core::stmt::{ForType, Range, Stmt, StmtKind};
use rasterlang_core::substitute::{expr_uses_var, substitute};
use rasterlang_core::visit::{walk_expr as visit_walk_expr, walk_stmt as visit_walk_stmt, Visitor};

use crate::error::LowerError;

fn next_power_of_two(x: i64) -> i64 {
    let mut p = 1i64;
    while p < x {
        p <<= 1;
    }
    p
}

// Beyond this, a fold stops paying for itself in saved memory.
const MAX_FOLD: i64 = 1024;

struct CountProducers<'a> {
    name: &'a str,
    count: usize,
}

impl Visitor for CountProducers<'_> {
    fn visit_stmt(&mut self, s: &Stmt) {
        if let StmtKind::ProducerConsumer { name, is_producer: true, .. } = s.kind() {
            if name == self.name {
                self.count += 1;
                return;
            }
        }
        visit_walk_stmt(self, s);
    }
}

fn count_producers(s: &Stmt, name: &str) -> usize {
    let mut v = CountProducers { name, count: 0 };
    v.visit_stmt(s);
    v.count
}

/// Rewrites every access to one dimension of a function modulo the fold
/// factor.
struct FoldStorageOfFunction<'a> {
    func: &'a str,
    dim: usize,
    factor: Expr,
}

impl FoldStorageOfFunction<'_> {
    fn fold_index(&self, index: &Expr) -> Expr {
        if self.factor.as_const_int() == Some(1) {
            Expr::i32(0)
        } else {
            simplify(&(index.clone() % self.factor.clone()))
        }
    }
}

impl Mutator for FoldStorageOfFunction<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        let e = walk_expr(self, e);
        if let ExprKind::Call { name, args, kind: CallKind::PipelineFunc, value_index } =
            e.kind()
        {
            if name == self.func {
                let mut args = args.clone();
                assert!(self.dim < args.len());
                args[self.dim] = self.fold_index(&args[self.dim]);
                return Expr::call_indexed(
                    e.ty(),
                    name.clone(),
                    args,
                    CallKind::PipelineFunc,
                    *value_index,
                );
            }
        }
        e
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        let s = walk_stmt(self, s);
        if let StmtKind::Provide { name, values, args, predicate } = s.kind() {
            if name == self.func {
                let mut args = args.clone();
                args[self.dim] = self.fold_index(&args[self.dim]);
                return Stmt::provide(name.clone(), values.clone(), args, predicate.clone());
            }
        }
        s
    }
}

struct Fold {
    dim: usize,
    factor: Expr,
}

/// Tries to fold the storage of one function within its realization body.
struct AttemptStorageFolding<'a> {
    func: &'a Function,
    explicit_only: bool,
    dims_folded: Vec<Fold>,
}

impl Mutator for AttemptStorageFolding<'_> {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.kind() {
            StmtKind::ProducerConsumer { name, .. } if name == &self.func.name => {
                // The fold has to be decided outside the pipeline that
                // writes the buffer.
                s.clone()
            }
            StmtKind::For { name, min, extent, for_type, device_api, body } => {
                if !matches!(for_type, ForType::Serial | ForType::Unrolled) {
                    // Another thread may see a different loop iteration;
                    // folding would alias across threads.
                    return s.clone();
                }

                let mut body = body.clone();
                let scope = Scope::new();
                let provided = box_provided(&body, &scope, &self.func.name);
                let required = box_required(&body, &scope, &self.func.name);
                let union = region_union(&provided, &required);

                // Try each dimension, outermost first.
                for i in (0..union.len()).rev() {
                    let Interval { min: Some(box_min), max: Some(box_max) } =
                        union.bounds[i].clone()
                    else {
                        continue;
                    };
                    let box_min = simplify(&box_min);
                    let box_max = simplify(&box_max);

                    let storage_dim = &self.func.schedule.storage_dims[i];
                    // The explicit factor only applies when the fold is
                    // relevant to this loop; otherwise the asserts would be
                    // too conservative.
                    let relevant = expr_uses_var(&box_min, name)
                        || expr_uses_var(&box_max, name);
                    let explicit_factor = if relevant {
                        storage_dim.fold_factor.clone()
                    } else {
                        None
                    };

                    debug!(
                        func = %self.func.name,
                        loop_name = %name,
                        dim = i,
                        min = ?box_min,
                        max = ?box_max,
                        "considering fold"
                    );

                    let mut min_monotonic_increasing = !self.explicit_only
                        && is_monotonic(&box_min, name) == Monotonic::Increasing;
                    let mut max_monotonic_decreasing = !self.explicit_only
                        && is_monotonic(&box_max, name) == Monotonic::Decreasing;

                    if !min_monotonic_increasing
                        && !max_monotonic_decreasing
                        && explicit_factor.is_some()
                    {
                        // The directive is trusted, but discharged with a
                        // runtime check that the window really advances.
                        let loop_var = Expr::var_i32(name.clone());
                        let condition = if storage_dim.fold_forward {
                            let min_next =
                                substitute(name, loop_var + 1, &box_min);
                            min_monotonic_increasing = true;
                            ge(min_next, box_min.clone())
                        } else {
                            let max_next =
                                substitute(name, loop_var + 1, &box_max);
                            max_monotonic_decreasing = true;
                            le(max_next, box_max.clone())
                        };
                        let error = ops::error_call(
                            "halide_error_bad_fold",
                            vec![
                                Expr::string(self.func.name.clone()),
                                Expr::string(storage_dim.var.clone()),
                                Expr::string(name.clone()),
                            ],
                        );
                        body = Stmt::block(Stmt::assert_stmt(condition, error), body);
                    }

                    if !(min_monotonic_increasing || max_monotonic_decreasing) {
                        debug!(
                            func = %self.func.name,
                            dim = i,
                            "not folding: min/max not monotonic in the loop variable"
                        );
                        continue;
                    }

                    let extent =
                        simplify(&((box_max.clone() - box_min.clone()) + 1));
                    let factor = match &explicit_factor {
                        Some(f) => {
                            let error = ops::error_call(
                                "halide_error_fold_factor_too_small",
                                vec![
                                    Expr::string(self.func.name.clone()),
                                    Expr::string(storage_dim.var.clone()),
                                    f.clone(),
                                    Expr::string(name.clone()),
                                    extent.clone(),
                                ],
                            );
                            body = Stmt::block(
                                Stmt::assert_stmt(le(extent.clone(), f.clone()), error),
                                body,
                            );
                            Some(f.clone())
                        }
                        None => {
                            // The fold factor is the next power of two above
                            // the worst-case extent over the loop.
                            let mut scope = Scope::new();
                            scope.push(
                                name.clone(),
                                Interval::bounded(
                                    Expr::var_i32(format!("{name}.loop_min")),
                                    Expr::var_i32(format!("{name}.loop_max")),
                                ),
                            );
                            let max_extent = bounds_of_expr_in_scope(&extent, &scope)
                                .max
                                .and_then(|m| find_constant_upper_bound(&m));
                            match max_extent {
                                Some(c) if c <= MAX_FOLD => {
                                    Some(Expr::i32(next_power_of_two(c) as i32))
                                }
                                _ => {
                                    debug!(
                                        func = %self.func.name,
                                        dim = i,
                                        "not folding: extent not bounded by a small constant"
                                    );
                                    None
                                }
                            }
                        }
                    };

                    if let Some(factor) = factor {
                        debug!(func = %self.func.name, dim = i, factor = ?factor, "folding");
                        self.dims_folded.push(Fold { dim: i, factor: factor.clone() });
                        body = FoldStorageOfFunction {
                            func: &self.func.name,
                            dim: i,
                            factor,
                        }
                        .mutate_stmt(&body);

                        let next_min = substitute(
                            name,
                            Expr::var_i32(name.clone()) + 1,
                            &box_min,
                        );
                        if can_prove(&lt(box_max.clone(), next_min)) {
                            // Iterations do not overlap; keep looking for
                            // further folds.
                        } else {
                            return Stmt::for_loop(
                                name.clone(),
                                min.clone(),
                                extent_of(s),
                                *for_type,
                                *device_api,
                                body,
                            );
                        }
                    }
                }

                // Sliding windows communicate values between iterations; an
                // inner fold is only safe when nothing is communicated.
                if region_contains(&provided, &required) {
                    body = self.mutate_stmt(&body);
                }

                if body.same_as(match s.kind() {
                    StmtKind::For { body, .. } => body,
                    _ => unreachable!(),
                }) {
                    s.clone()
                } else {
                    Stmt::for_loop(
                        name.clone(),
                        min.clone(),
                        extent.clone(),
                        *for_type,
                        *device_api,
                        body,
                    )
                }
            }
            _ => walk_stmt(self, s),
        }
    }
}

fn extent_of(s: &Stmt) -> Expr {
    match s.kind() {
        StmtKind::For { extent, .. } => extent.clone(),
        _ => unreachable!(),
    }
}

/// Detects realizations whose raw buffer handle escapes (extern or device
/// use); those may only be folded by explicit directive, and even that is
/// rejected.
struct IsBufferSpecial<'a> {
    func: &'a str,
    special: bool,
}

impl Visitor for IsBufferSpecial<'_> {
    fn visit_expr(&mut self, e: &Expr) {
        if let ExprKind::Variable { name, .. } = e.kind() {
            if e.ty().is_handle() && name == &format!("{}.buffer", self.func) {
                self.special = true;
            }
        }
        visit_walk_expr(self, e);
    }
}

struct StorageFolding<'a> {
    env: &'a Environment,
    error: Option<LowerError>,
}

impl Mutator for StorageFolding<'_> {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if self.error.is_some() {
            return s.clone();
        }
        if let StmtKind::Realize { name, types, memory_type, bounds, condition, body } =
            s.kind()
        {
            let body = self.mutate_stmt(body);
            let Some(func) = self.env.get(name) else {
                return rebuild_realize(s, body);
            };

            let mut special = IsBufferSpecial { func: name, special: false };
            special.visit_stmt(s);

            if special.special {
                for sd in &func.schedule.storage_dims {
                    if sd.fold_factor.is_some() {
                        self.error = Some(LowerError::BadFoldDirective {
                            func: name.clone(),
                            dim: sd.var.clone(),
                            reason: "the buffer is accessed by extern or device stages"
                                .into(),
                        });
                        return s.clone();
                    }
                }
                debug!(func = %name, "not folding: buffer handle escapes");
                return rebuild_realize(s, body);
            }

            // Multiple producers make the windows overlap unpredictably, so
            // only explicit directives are attempted.
            let explicit_only = count_producers(&body, name) != 1;
            let mut folder = AttemptStorageFolding {
                func,
                explicit_only,
                dims_folded: Vec::new(),
            };
            let body = folder.mutate_stmt(&body);

            if folder.dims_folded.is_empty() {
                rebuild_realize(s, body)
            } else {
                let mut new_bounds: Vec<Range> = bounds.clone();
                for fold in &folder.dims_folded {
                    assert!(fold.dim < new_bounds.len());
                    new_bounds[fold.dim] = Range::new(Expr::i32(0), fold.factor.clone());
                }
                Stmt::realize(
                    name.clone(),
                    types.clone(),
                    *memory_type,
                    new_bounds,
                    condition.clone(),
                    body,
                )
            }
        } else {
            walk_stmt(self, s)
        }
    }
}

fn rebuild_realize(original: &Stmt, body: Stmt) -> Stmt {
    match original.kind() {
        StmtKind::Realize { name, types, memory_type, bounds, condition, body: old } => {
            if body.same_as(old) {
                original.clone()
            } else {
                Stmt::realize(
                    name.clone(),
                    types.clone(),
                    *memory_type,
                    bounds.clone(),
                    condition.clone(),
                    body,
                )
            }
        }
        _ => unreachable!(),
    }
}

/// Substitutes constant-valued lets into their bodies; folding runs before
/// general simplification and needs the constants visible.
struct SubstituteInConstants {
    scope: Scope<Expr>,
}

impl Mutator for SubstituteInConstants {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        if let ExprKind::Variable { name, .. } = e.kind() {
            if let Some(v) = self.scope.get(name) {
                return v.clone();
            }
        }
        walk_expr(self, e)
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if let StmtKind::LetStmt { name, value, body } = s.kind() {
            let value = simplify(&self.mutate_expr(value));
            let body = if value.is_const() {
                self.scope.push(name.clone(), value.clone());
                let body = self.mutate_stmt(body);
                self.scope.pop(name);
                body
            } else {
                self.mutate_stmt(body)
            };
            if value.same_as(match s.kind() {
                StmtKind::LetStmt { value, .. } => value,
                _ => unreachable!(),
            }) && body.same_as(match s.kind() {
                StmtKind::LetStmt { body, .. } => body,
                _ => unreachable!(),
            }) {
                s.clone()
            } else {
                Stmt::let_stmt(name.clone(), value, body)
            }
        } else {
            walk_stmt(self, s)
        }
    }
}

/// Folds the storage of realizations with monotone usage, per the module
/// docs.
pub fn storage_folding(s: &Stmt, env: &Environment) -> Result<Stmt, LowerError> {
    let mut constants = SubstituteInConstants { scope: Scope::new() };
    let s = constants.mutate_stmt(s);
    let s = simplify_stmt(&s);
    let mut folding = StorageFolding { env, error: None };
    let out = folding.mutate_stmt(&s);
    match folding.error {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::function::call_func;
    use rasterlang_core::stmt::MemoryType;

    fn h() -> Function {
        Function::with_definition("h", vec!["x".to_string()], vec![Expr::var_i32("x")])
    }

    /// realize h [0, 9); for x in [0, 8): produce h(x..x+1); consume f(x) =
    /// h(x-1) + h(x). The window [x-1, x] advances with x.
    fn sliding_window_stmt() -> Stmt {
        let x = Expr::var_i32("x");
        let produce = Stmt::producer(
            "h",
            Stmt::provide("h", vec![x.clone()], vec![x.clone()], Expr::const_true()),
        );
        let consume = Stmt::consumer(
            "h",
            Stmt::provide(
                "f",
                vec![
                    call_func(&h(), vec![x.clone() - 1], 0)
                        + call_func(&h(), vec![x.clone()], 0),
                ],
                vec![x.clone()],
                Expr::const_true(),
            ),
        );
        // Parameterize the accesses by the loop variable.
        let x_loop = Expr::var_i32("f.s0.x");
        let produce = rasterlang_core::substitute::substitute_stmt("x", x_loop.clone(), &produce);
        let consume = rasterlang_core::substitute::substitute_stmt("x", x_loop, &consume);
        let loop_ = Stmt::serial_for(
            "f.s0.x",
            Expr::i32(0),
            Expr::i32(8),
            Stmt::block(produce, consume),
        );
        Stmt::realize(
            "h",
            vec![Type::int(32)],
            MemoryType::Auto,
            vec![Range::new(Expr::i32(-1), Expr::i32(9))],
            Expr::const_true(),
            loop_,
        )
    }

    use rasterlang_core::types::Type;

    #[test]
    fn monotone_sliding_window_folds_to_power_of_two() {
        let mut env = Environment::new();
        env.insert("h".to_string(), h());
        let out = storage_folding(&sliding_window_stmt(), &env).unwrap();

        match out.kind() {
            StmtKind::Realize { bounds, body, .. } => {
                assert_eq!(bounds[0].min.as_const_int(), Some(0));
                assert_eq!(bounds[0].extent.as_const_int(), Some(2));
                // Every access index is now taken mod 2.
                let mut saw_mod = false;
                let mut stack = vec![body.clone()];
                while let Some(cur) = stack.pop() {
                    match cur.kind() {
                        StmtKind::Provide { name, args, .. } if name == "h" => {
                            if let ExprKind::Binary {
                                op: rasterlang_core::BinaryOp::Mod,
                                b,
                                ..
                            } = args[0].kind()
                            {
                                assert_eq!(b.as_const_int(), Some(2));
                                saw_mod = true;
                            }
                        }
                        StmtKind::For { body, .. } => stack.push(body.clone()),
                        StmtKind::Block { first, rest } => {
                            stack.push(first.clone());
                            stack.push(rest.clone());
                        }
                        StmtKind::ProducerConsumer { body, .. } => stack.push(body.clone()),
                        _ => {}
                    }
                }
                assert!(saw_mod);
            }
            other => panic!("expected Realize, got {other:?}"),
        }
    }

    #[test]
    fn parallel_loops_block_folding() {
        let s = sliding_window_stmt();
        // Flip the loop to parallel.
        let s = match s.kind() {
            StmtKind::Realize { name, types, memory_type, bounds, condition, body } => {
                let body = match body.kind() {
                    StmtKind::For { name, min, extent, body, .. } => Stmt::for_loop(
                        name.clone(),
                        min.clone(),
                        extent.clone(),
                        ForType::Parallel,
                        rasterlang_core::DeviceApi::None,
                        body.clone(),
                    ),
                    _ => unreachable!(),
                };
                Stmt::realize(
                    name.clone(),
                    types.clone(),
                    *memory_type,
                    bounds.clone(),
                    condition.clone(),
                    body,
                )
            }
            _ => unreachable!(),
        };
        let mut env = Environment::new();
        env.insert("h".to_string(), h());
        let out = storage_folding(&s, &env).unwrap();
        match out.kind() {
            StmtKind::Realize { bounds, .. } => {
                assert_eq!(bounds[0].extent.as_const_int(), Some(9));
            }
            other => panic!("expected Realize, got {other:?}"),
        }
    }

    #[test]
    fn explicit_fold_on_escaped_buffer_is_an_error() {
        let mut func = h();
        func.schedule.storage_dims[0].fold_factor = Some(Expr::i32(2));
        let mut env = Environment::new();
        env.insert("h".to_string(), func);
        // Add a .buffer reference inside the realization.
        let s = match sliding_window_stmt().kind() {
            StmtKind::Realize { name, types, memory_type, bounds, condition, body } => {
                let handle = Stmt::evaluate(ops::error_call(
                    "some_extern_stage",
                    vec![Expr::var_bound(
                        Type::handle(),
                        "h.buffer",
                        rasterlang_core::VarBinding::Free,
                    )],
                ));
                Stmt::realize(
                    name.clone(),
                    types.clone(),
                    *memory_type,
                    bounds.clone(),
                    condition.clone(),
                    Stmt::block(handle, body.clone()),
                )
            }
            _ => unreachable!(),
        };
        let err = storage_folding(&s, &env).unwrap_err();
        assert!(matches!(err, LowerError::BadFoldDirective { .. }));
    }

    #[test]
    fn fold_factor_equal_to_extent_rewrites_indices_mod_identity() {
        // With an explicit fold factor of 4 and window extent 2, the fold
        // keeps the factor and the runtime assert extent <= 4 holds.
        let mut func = h();
        func.schedule.storage_dims[0].fold_factor = Some(Expr::i32(4));
        let mut env = Environment::new();
        env.insert("h".to_string(), func);
        let out = storage_folding(&sliding_window_stmt(), &env).unwrap();
        match out.kind() {
            StmtKind::Realize { bounds, .. } => {
                assert_eq!(bounds[0].extent.as_const_int(), Some(4));
            }
            other => panic!("expected Realize, got {other:?}"),
        }
    }
}
