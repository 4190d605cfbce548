//! Binding of the symbolic bounds the loop-nest builder references.
//!
//! The nests built by `loop_nest` refer to `<func>.s<k>.<var>.min` /
//! `.max`, and the realizations injected by `inject` refer to
//! `<func>.<var>.min_realized` / `.extent_realized`.
//!
//! Stage bounds bind at the produce site: just outside the block holding a
//! function's produce and consume markers, where the enclosing consumer
//! loop variables are in scope, so a `compute_at` producer computes only
//! the window its consumer's current iteration needs. The realization
//! bounds bind at the Realize and cover the union over all enclosing
//! loops. Output functions bind against their buffer's `.min.<d>` /
//! `.extent.<d>` symbols at the top of the pipeline.

use tracing::debug;

use rasterlang_analysis::bounds::{
    box_required, boxes_touched_filtered, AccessKind, Interval,
};
use rasterlang_analysis::simplify::simplify;
use rasterlang_core::expr::Expr;
use rasterlang_core::function::{Environment, Function};
use rasterlang_core::mutate::{walk_stmt, Mutator};
use rasterlang_core::ops;
use rasterlang_core::scope::Scope;
use rasterlang_core::stmt::{Stmt, StmtKind};
use rasterlang_core::visit::{walk_stmt as visit_walk_stmt, Visitor};
use rasterlang_core::{Feature, Target};

use crate::error::LowerError;

/// The bounds of one dimension of one function, before and after explicit
/// bound directives.
struct DimBounds {
    var: String,
    min_unbounded: Expr,
    max_unbounded: Expr,
    min: Expr,
    max: Expr,
    has_directive: bool,
}

fn dim_bounds_of(
    f: &Function,
    dim: usize,
    interval: &Interval,
) -> Result<DimBounds, LowerError> {
    let (Some(min_u), Some(max_u)) = (&interval.min, &interval.max) else {
        return Err(LowerError::UnboundedAccess { name: f.name.clone(), dim });
    };
    let var = f.args[dim].clone();
    let directive = f.schedule.bounds.iter().find(|b| b.var == var);
    let (min, max, has_directive) = match directive {
        Some(b) => {
            let min = b.min.clone().unwrap_or_else(|| min_u.clone());
            let max = match &b.extent {
                Some(extent) => simplify(&((extent.clone() + min.clone()) - 1)),
                None => max_u.clone(),
            };
            (min, max, b.min.is_some() || b.extent.is_some())
        }
        None => (min_u.clone(), max_u.clone(), false),
    };
    Ok(DimBounds {
        var,
        min_unbounded: simplify(min_u),
        max_unbounded: simplify(max_u),
        min: simplify(&min),
        max: simplify(&max),
        has_directive,
    })
}

fn region_dims(
    f: &Function,
    region: Option<&rasterlang_analysis::Region>,
) -> Result<Vec<DimBounds>, LowerError> {
    let mut dims = Vec::with_capacity(f.dimensions());
    for i in 0..f.dimensions() {
        let interval = region
            .and_then(|r| r.bounds.get(i))
            .cloned()
            .unwrap_or_else(Interval::everything);
        dims.push(dim_bounds_of(f, i, &interval)?);
    }
    Ok(dims)
}

/// Wraps `s` in the per-stage bound lets for one function.
fn wrap_stage_lets(mut s: Stmt, f: &Function, dims: &[DimBounds]) -> Stmt {
    for stage in (0..f.stages()).rev() {
        let prefix = f.stage_prefix(stage);
        for d in dims {
            s = Stmt::let_stmt(format!("{prefix}{}.max", d.var), d.max.clone(), s);
            s = Stmt::let_stmt(format!("{prefix}{}.min", d.var), d.min.clone(), s);
            if d.has_directive {
                s = Stmt::let_stmt(
                    format!("{prefix}{}.max_unbounded", d.var),
                    d.max_unbounded.clone(),
                    s,
                );
                s = Stmt::let_stmt(
                    format!("{prefix}{}.min_unbounded", d.var),
                    d.min_unbounded.clone(),
                    s,
                );
            }
        }
    }
    s
}

/// Wraps `s` in the explicit-bound assertion blocks for one function.
fn wrap_explicit_bound_asserts(mut s: Stmt, f: &Function) -> Stmt {
    for stage in 0..f.stages() {
        for b in &f.schedule.bounds {
            let prefix = format!("{}{}", f.stage_prefix(stage), b.var);
            let min_var = Expr::var_i32(format!("{prefix}.min_unbounded"));
            let max_var = Expr::var_i32(format!("{prefix}.max_unbounded"));
            let Some(extent) = &b.extent else {
                // A bare alignment always expands the computed region.
                continue;
            };
            let min_val = match &b.min {
                Some(m) => m.clone(),
                None => min_var.clone(),
            };
            let max_val = simplify(&((extent.clone() + min_val.clone()) - 1));
            let check = Expr::and(
                ops::le(min_val.clone(), min_var.clone()),
                ops::ge(max_val.clone(), max_var.clone()),
            );
            let error = ops::error_call(
                "halide_error_explicit_bounds_too_small",
                vec![
                    Expr::string(b.var.clone()),
                    Expr::string(f.name.clone()),
                    min_val,
                    max_val,
                    min_var,
                    max_var,
                ],
            );
            s = Stmt::block(Stmt::assert_stmt(check, error), s);
        }
    }
    s
}

struct ContainsProduceMarker<'a> {
    name: &'a str,
    found: bool,
}

impl Visitor for ContainsProduceMarker<'_> {
    fn visit_stmt(&mut self, s: &Stmt) {
        if self.found {
            return;
        }
        if let StmtKind::ProducerConsumer { name, is_producer: true, .. } = s.kind() {
            if name == self.name {
                self.found = true;
                return;
            }
        }
        visit_walk_stmt(self, s);
    }
}

fn contains_produce_marker(s: &Stmt, name: &str) -> bool {
    let mut v = ContainsProduceMarker { name, found: false };
    v.visit_stmt(s);
    v.found
}

/// Binds one function's stage bounds at the block pairing its produce
/// markers with its consumers.
struct BindProduceSite<'a> {
    f: &'a Function,
    bound: bool,
    error: Option<LowerError>,
}

impl Mutator for BindProduceSite<'_> {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if self.error.is_some() || self.bound {
            return s.clone();
        }
        if let StmtKind::Block { first, rest } = s.kind() {
            if contains_produce_marker(first, &self.f.name)
                && !contains_produce_marker(rest, &self.f.name)
            {
                let region = box_required(rest, &Scope::new(), &self.f.name);
                let bounded = !region.is_empty()
                    && region.bounds.iter().all(|i| i.is_bounded());
                if bounded {
                    match region_dims(self.f, Some(&region)) {
                        Ok(dims) => {
                            self.bound = true;
                            debug!(func = %self.f.name, "stage bounds bound at produce site");
                            return wrap_stage_lets(s.clone(), self.f, &dims);
                        }
                        Err(e) => {
                            self.error = Some(e);
                            return s.clone();
                        }
                    }
                }
            }
        }
        walk_stmt(self, s)
    }
}

struct BindRealizeBounds<'a> {
    env: &'a Environment,
    with_asserts: bool,
    error: Option<LowerError>,
}

impl Mutator for BindRealizeBounds<'_> {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if self.error.is_some() {
            return s.clone();
        }
        let s = walk_stmt(self, s);
        if let StmtKind::Realize { name, body, .. } = s.kind() {
            let Some(f) = self.env.get(name) else { return s };

            // Try the per-iteration binding at the produce site first.
            let mut produce_binder = BindProduceSite { f, bound: false, error: None };
            let new_body = produce_binder.mutate_stmt(body);
            if let Some(e) = produce_binder.error {
                self.error = Some(e);
                return s;
            }
            let s = rebuild_realize(&s, new_body);

            // The realization itself covers everything touched inside it,
            // symbolic only in variables bound outside the Realize.
            let body = match s.kind() {
                StmtKind::Realize { body, .. } => body,
                _ => unreachable!(),
            };
            let region = boxes_touched_filtered(
                body,
                &Scope::new(),
                AccessKind::Both,
                Some(name),
            )
            .swap_remove(name);
            let dims = match region_dims(f, region.as_ref()) {
                Ok(dims) => dims,
                Err(e) => {
                    self.error = Some(e);
                    return s;
                }
            };
            debug!(func = %name, "bound realized region");

            let mut out = s.clone();
            if self.with_asserts {
                out = wrap_explicit_bound_asserts(out, f);
            }
            for d in &dims {
                out = Stmt::let_stmt(
                    format!("{}.{}.extent_realized", f.name, d.var),
                    simplify(&((d.max.clone() + 1) - d.min.clone())),
                    out,
                );
                out = Stmt::let_stmt(
                    format!("{}.{}.min_realized", f.name, d.var),
                    d.min.clone(),
                    out,
                );
            }
            if !produce_binder.bound {
                out = wrap_stage_lets(out, f, &dims);
            }
            return out;
        }
        s
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

/// Binds the `.min`/`.max`, `.min_realized`/`.extent_realized`, and
/// explicit-bound assertion blocks for every realization and output.
pub fn bind_bounds(
    s: &Stmt,
    outputs: &[Function],
    env: &Environment,
    target: &Target,
) -> Result<Stmt, LowerError> {
    let with_asserts = !target.has_feature(Feature::NoAsserts);
    let mut binder = BindRealizeBounds { env, with_asserts, error: None };
    let mut s = binder.mutate_stmt(s);
    if let Some(e) = binder.error {
        return Err(e);
    }

    // Outputs read their region from the buffer the caller passed in.
    for f in outputs {
        let buffer = f.buffer_name(0);
        let mut dims = Vec::with_capacity(f.dimensions());
        for (i, _) in f.args.iter().enumerate() {
            let min_b = Expr::var_i32(format!("{buffer}.min.{i}"));
            let extent_b = Expr::var_i32(format!("{buffer}.extent.{i}"));
            let interval = Interval::bounded(
                min_b.clone(),
                simplify(&((min_b + extent_b) - 1)),
            );
            dims.push(dim_bounds_of(f, i, &interval)?);
        }
        if with_asserts {
            s = wrap_explicit_bound_asserts(s, f);
        }
        s = wrap_stage_lets(s, f, &dims);
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::function::call_func;
    use rasterlang_core::stmt::{MemoryType, Range};

    fn pointwise(name: &str) -> Function {
        Function::with_definition(name, vec!["x".to_string()], vec![Expr::var_i32("x")])
    }

    fn collect_let_names(s: &Stmt) -> Vec<String> {
        let mut names = Vec::new();
        let mut stack = vec![s.clone()];
        while let Some(cur) = stack.pop() {
            match cur.kind() {
                StmtKind::LetStmt { name, body, .. } => {
                    names.push(name.clone());
                    stack.push(body.clone());
                }
                StmtKind::Block { first, rest } => {
                    stack.push(first.clone());
                    stack.push(rest.clone());
                }
                StmtKind::Realize { body, .. } => stack.push(body.clone()),
                StmtKind::For { body, .. } => stack.push(body.clone()),
                StmtKind::ProducerConsumer { body, .. } => stack.push(body.clone()),
                _ => {}
            }
        }
        names
    }

    #[test]
    fn output_bounds_come_from_the_buffer() {
        let f = pointwise("f");
        let s = Stmt::provide(
            "f",
            vec![Expr::var_i32("f.s0.x")],
            vec![Expr::var_i32("f.s0.x")],
            Expr::const_true(),
        );
        let mut env = Environment::new();
        env.insert("f".to_string(), f.clone());
        let out = bind_bounds(&s, &[f], &env, &Target::host()).unwrap();
        let names = collect_let_names(&out);
        assert!(names.contains(&"f.s0.x.min".to_string()));
        assert!(names.contains(&"f.s0.x.max".to_string()));

        // The min binding refers to the output buffer symbol.
        match out.kind() {
            StmtKind::LetStmt { value, .. } => {
                assert!(rasterlang_core::expr_uses_var(value, "f.min.0")
                    || rasterlang_core::expr_uses_var(value, "f.extent.0"));
            }
            other => panic!("expected a bound let on top, got {other:?}"),
        }
    }

    #[test]
    fn realize_gets_required_region() {
        let g = pointwise("g");
        // for x in [0, 8): provide f = g(x-1) + g(x+1), inside realize g.
        let x = Expr::var_i32("x");
        let body = Stmt::provide(
            "f",
            vec![call_func(&g, vec![x.clone() - 1], 0) + call_func(&g, vec![x.clone() + 1], 0)],
            vec![x.clone()],
            Expr::const_true(),
        );
        let loop_ = Stmt::serial_for("x", Expr::i32(0), Expr::i32(8), body);
        let realize = Stmt::realize(
            "g",
            vec![rasterlang_core::Type::int(32)],
            MemoryType::Auto,
            vec![Range::new(
                Expr::var_i32("g.x.min_realized"),
                Expr::var_i32("g.x.extent_realized"),
            )],
            Expr::const_true(),
            loop_,
        );
        let mut env = Environment::new();
        env.insert("g".to_string(), g);
        let out = bind_bounds(&realize, &[], &env, &Target::host()).unwrap();
        let names = collect_let_names(&out);
        assert!(names.contains(&"g.x.min_realized".to_string()));
        assert!(names.contains(&"g.s0.x.min".to_string()));

        // min_realized should be -1: the union of x-1 and x+1 over [0, 8).
        let mut cur = out;
        loop {
            match cur.kind() {
                StmtKind::LetStmt { name, value, body } => {
                    if name == "g.x.min_realized" {
                        assert_eq!(value.as_const_int(), Some(-1));
                        break;
                    }
                    cur = body.clone();
                }
                other => panic!("ran out of lets: {other:?}"),
            }
        }
    }

    #[test]
    fn produce_site_binding_tracks_the_consumer_iteration() {
        // realize g { for x: Block(produce g, consume uses g(x-1), g(x)) }
        let g = pointwise("g");
        let x = Expr::var_i32("f.s0.x");
        let produce = Stmt::producer(
            "g",
            Stmt::provide(
                "g",
                vec![Expr::var_i32("g.s0.x")],
                vec![Expr::var_i32("g.s0.x")],
                Expr::const_true(),
            ),
        );
        let consume = Stmt::consumer(
            "g",
            Stmt::provide(
                "f",
                vec![
                    call_func(&g, vec![x.clone() - 1], 0)
                        + call_func(&g, vec![x.clone()], 0),
                ],
                vec![x.clone()],
                Expr::const_true(),
            ),
        );
        let loop_ = Stmt::serial_for(
            "f.s0.x",
            Expr::i32(0),
            Expr::i32(8),
            Stmt::block(produce, consume),
        );
        let realize = Stmt::realize(
            "g",
            vec![rasterlang_core::Type::int(32)],
            MemoryType::Auto,
            vec![Range::new(
                Expr::var_i32("g.x.min_realized"),
                Expr::var_i32("g.x.extent_realized"),
            )],
            Expr::const_true(),
            loop_,
        );
        let mut env = Environment::new();
        env.insert("g".to_string(), g);
        let out = bind_bounds(&realize, &[], &env, &Target::host()).unwrap();

        // Find the g.s0.x.min let; it must reference the loop variable.
        let mut found = false;
        let mut stack = vec![out];
        while let Some(cur) = stack.pop() {
            match cur.kind() {
                StmtKind::LetStmt { name, value, body } => {
                    if name == "g.s0.x.min" {
                        assert!(rasterlang_core::expr_uses_var(value, "f.s0.x"));
                        found = true;
                    }
                    stack.push(body.clone());
                }
                StmtKind::Realize { body, .. } | StmtKind::For { body, .. } => {
                    stack.push(body.clone())
                }
                StmtKind::Block { first, rest } => {
                    stack.push(first.clone());
                    stack.push(rest.clone());
                }
                _ => {}
            }
        }
        assert!(found, "stage bounds should bind inside the consumer loop");
    }

    #[test]
    fn unbounded_required_region_is_an_error() {
        let g = pointwise("g");
        // g is indexed by a load: unbounded.
        let idx = Expr::load_unpredicated(
            rasterlang_core::Type::int(32),
            "idx",
            Expr::var_i32("x"),
            rasterlang_core::VarBinding::Free,
        );
        let body = Stmt::evaluate(call_func(&g, vec![idx], 0));
        let realize = Stmt::realize(
            "g",
            vec![rasterlang_core::Type::int(32)],
            MemoryType::Auto,
            vec![Range::new(Expr::i32(0), Expr::i32(1))],
            Expr::const_true(),
            body,
        );
        let mut env = Environment::new();
        env.insert("g".to_string(), g);
        let err = bind_bounds(&realize, &[], &env, &Target::host()).unwrap_err();
        assert!(matches!(err, LowerError::UnboundedAccess { .. }));
    }
}
