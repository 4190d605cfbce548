//! Symbolic interval and box inference over IR expressions.
//!
//! Bounds queries never fail: anything the rules cannot handle degrades to
//! an unbounded side. Callers that need a finite region must check
//! [`Interval::is_bounded`] and raise their own diagnostic.

use indexmap::IndexMap;

use rasterlang_core::expr::{BinaryOp, CallKind, Expr, ExprKind, ReduceOp};
use rasterlang_core::ops;
use rasterlang_core::scope::Scope;
use rasterlang_core::stmt::{Stmt, StmtKind};
use rasterlang_core::visit::{walk_expr, walk_stmt, Visitor};

use crate::simplify::{is_negative_const, is_positive_const, simplify};

/// A closed interval with optionally-unbounded sides.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub min: Option<Expr>,
    pub max: Option<Expr>,
}

impl Interval {
    pub fn everything() -> Interval {
        Interval { min: None, max: None }
    }

    pub fn single_point(e: Expr) -> Interval {
        Interval { min: Some(e.clone()), max: Some(e) }
    }

    pub fn bounded(min: Expr, max: Expr) -> Interval {
        Interval { min: Some(min), max: Some(max) }
    }

    pub fn is_bounded(&self) -> bool {
        self.min.is_some() && self.max.is_some()
    }

    pub fn is_single_point(&self) -> bool {
        match (&self.min, &self.max) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// The smallest interval containing both.
    pub fn union(&self, other: &Interval) -> Interval {
        Interval {
            min: lift2(&self.min, &other.min, BinaryOp::Min),
            max: lift2(&self.max, &other.max, BinaryOp::Max),
        }
    }

    /// The largest interval contained in both.
    pub fn intersection(&self, other: &Interval) -> Interval {
        let min = match (&self.min, &other.min) {
            (Some(a), Some(b)) => Some(simplify(&ops::max(a.clone(), b.clone()))),
            (Some(a), None) | (None, Some(a)) => Some(a.clone()),
            (None, None) => None,
        };
        let max = match (&self.max, &other.max) {
            (Some(a), Some(b)) => Some(simplify(&ops::min(a.clone(), b.clone()))),
            (Some(a), None) | (None, Some(a)) => Some(a.clone()),
            (None, None) => None,
        };
        Interval { min, max }
    }
}

fn lift2(a: &Option<Expr>, b: &Option<Expr>, op: BinaryOp) -> Option<Expr> {
    match (a, b) {
        (Some(a), Some(b)) => Some(simplify(&Expr::binary(op, a.clone(), b.clone()))),
        _ => None,
    }
}

fn map2(a: &Option<Expr>, b: &Option<Expr>, f: impl Fn(Expr, Expr) -> Expr) -> Option<Expr> {
    match (a, b) {
        (Some(a), Some(b)) => Some(simplify(&f(a.clone(), b.clone()))),
        _ => None,
    }
}

fn map1(a: &Option<Expr>, f: impl Fn(Expr) -> Expr) -> Option<Expr> {
    a.as_ref().map(|a| simplify(&f(a.clone())))
}

/// A per-dimension bounding box over a buffer, with an optional predicate
/// describing when the buffer is touched at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub bounds: Vec<Interval>,
    pub used: Option<Expr>,
}

impl Region {
    pub fn new(bounds: Vec<Interval>) -> Region {
        Region { bounds, used: None }
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn maybe_unused(&self) -> bool {
        self.used.is_some()
    }
}

/// The dimensionwise union of two regions. The result is used whenever
/// either input is.
pub fn region_union(a: &Region, b: &Region) -> Region {
    if a.is_empty() {
        return b.clone();
    }
    if b.is_empty() {
        return a.clone();
    }
    assert_eq!(a.len(), b.len(), "regions of mismatched dimensionality");
    let bounds = a
        .bounds
        .iter()
        .zip(&b.bounds)
        .map(|(x, y)| x.union(y))
        .collect();
    let used = match (&a.used, &b.used) {
        (Some(x), Some(y)) => Some(simplify(&Expr::or(x.clone(), y.clone()))),
        _ => None,
    };
    Region { bounds, used }
}

/// True when `inner` provably fits inside `outer` in every dimension.
pub fn region_contains(outer: &Region, inner: &Region) -> bool {
    if outer.len() != inner.len() {
        return false;
    }
    outer.bounds.iter().zip(&inner.bounds).all(|(o, i)| {
        match (&o.min, &o.max, &i.min, &i.max) {
            (Some(om), Some(ox), Some(im), Some(ix)) => {
                crate::simplify::can_prove(&ops::le(om.clone(), im.clone()))
                    && crate::simplify::can_prove(&ops::ge(ox.clone(), ix.clone()))
            }
            _ => false,
        }
    })
}

/// A bounding interval of `e` given intervals for its free variables.
///
/// Sound but not minimal; exact on affine expressions of the scoped
/// variables and on min/max/select combinations of them.
pub fn bounds_of_expr_in_scope(e: &Expr, scope: &Scope<Interval>) -> Interval {
    match e.kind() {
        ExprKind::IntImm { .. }
        | ExprKind::UIntImm { .. }
        | ExprKind::FloatImm { .. }
        | ExprKind::StringImm { .. } => Interval::single_point(e.clone()),
        ExprKind::Variable { name, .. } => match scope.get(name) {
            Some(i) => i.clone(),
            None => Interval::single_point(e.clone()),
        },
        ExprKind::Binary { op, a, b } => {
            let ia = bounds_of_expr_in_scope(a, scope);
            let ib = bounds_of_expr_in_scope(b, scope);
            bounds_of_binary(*op, &ia, &ib, b)
        }
        ExprKind::Not { .. } | ExprKind::Cmp { .. } | ExprKind::And { .. } | ExprKind::Or { .. } => {
            // Boolean-valued; a single point when closed, otherwise [false, true].
            if expr_is_closed(e, scope) {
                Interval::single_point(e.clone())
            } else {
                Interval::bounded(Expr::const_false(), Expr::const_true())
            }
        }
        ExprKind::Select { true_value, false_value, .. } => {
            let it = bounds_of_expr_in_scope(true_value, scope);
            let if_ = bounds_of_expr_in_scope(false_value, scope);
            it.union(&if_)
        }
        ExprKind::Cast { value } => {
            let inner = bounds_of_expr_in_scope(value, scope);
            if inner.is_single_point() && value.ty().code == e.ty().code {
                Interval::single_point(e.clone())
            } else {
                // Casts can wrap; stay conservative.
                Interval::everything()
            }
        }
        ExprKind::Ramp { base, stride, lanes } => {
            let ib = bounds_of_expr_in_scope(base, scope);
            let last = Expr::i32(*lanes as i32 - 1);
            if is_positive_const(stride) {
                Interval {
                    min: ib.min,
                    max: map1(&ib.max, |m| m + stride.clone() * last.clone()),
                }
            } else if is_negative_const(stride) {
                Interval {
                    min: map1(&ib.min, |m| m + stride.clone() * last.clone()),
                    max: ib.max,
                }
            } else {
                let is = bounds_of_expr_in_scope(stride, scope);
                let lo = map2(&ib.min, &is.min, |b, s| b.clone() + ops::min(s.clone() * last.clone(), Expr::i32(0)));
                let hi = map2(&ib.max, &is.max, |b, s| b.clone() + ops::max(s.clone() * last.clone(), Expr::i32(0)));
                Interval { min: lo, max: hi }
            }
        }
        ExprKind::Broadcast { value, .. } => bounds_of_expr_in_scope(value, scope),
        ExprKind::Shuffle { vectors, .. } => {
            let mut result: Option<Interval> = None;
            for v in vectors {
                let iv = bounds_of_expr_in_scope(v, scope);
                result = Some(match result {
                    Some(r) => r.union(&iv),
                    None => iv,
                });
            }
            result.unwrap_or_else(Interval::everything)
        }
        ExprKind::VectorReduce { op, value } => match op {
            ReduceOp::Min | ReduceOp::Max => bounds_of_expr_in_scope(value, scope),
            _ => Interval::everything(),
        },
        ExprKind::Let { name, value, body } => {
            let iv = bounds_of_expr_in_scope(value, scope);
            let mut inner = scope.clone();
            inner.push(name.clone(), iv);
            bounds_of_expr_in_scope(body, &inner)
        }
        ExprKind::Call { name, args, kind, .. } => {
            if (e.is_intrinsic(rasterlang_core::intrinsic::LIKELY)
                || e.is_intrinsic(rasterlang_core::intrinsic::LIKELY_IF_INNERMOST))
                && args.len() == 1
            {
                bounds_of_expr_in_scope(&args[0], scope)
            } else if name == rasterlang_core::intrinsic::UNSAFE_PROMISE_CLAMPED
                || name == rasterlang_core::intrinsic::PROMISE_CLAMPED
            {
                // promise_clamped(e, lo, hi) promises lo <= e <= hi.
                let lo = bounds_of_expr_in_scope(&args[1], scope);
                let hi = bounds_of_expr_in_scope(&args[2], scope);
                Interval { min: lo.min, max: hi.max }
            } else if kind.is_pure() && args.is_empty() {
                Interval::single_point(e.clone())
            } else {
                Interval::everything()
            }
        }
        ExprKind::Load { .. } | ExprKind::Reinterpret { .. } => Interval::everything(),
    }
}

fn bounds_of_binary(op: BinaryOp, ia: &Interval, ib: &Interval, b_expr: &Expr) -> Interval {
    match op {
        BinaryOp::Add => Interval {
            min: map2(&ia.min, &ib.min, |a, b| a + b),
            max: map2(&ia.max, &ib.max, |a, b| a + b),
        },
        BinaryOp::Sub => Interval {
            min: map2(&ia.min, &ib.max, |a, b| a - b),
            max: map2(&ia.max, &ib.min, |a, b| a - b),
        },
        BinaryOp::Mul => {
            if ib.is_single_point() {
                let factor = ib.min.clone().unwrap();
                if is_positive_const(&factor) {
                    Interval {
                        min: map1(&ia.min, |a| a * factor.clone()),
                        max: map1(&ia.max, |a| a * factor.clone()),
                    }
                } else if is_negative_const(&factor) {
                    Interval {
                        min: map1(&ia.max, |a| a * factor.clone()),
                        max: map1(&ia.min, |a| a * factor.clone()),
                    }
                } else if ia.is_single_point() {
                    Interval::single_point(simplify(
                        &(ia.min.clone().unwrap() * factor),
                    ))
                } else {
                    Interval::everything()
                }
            } else {
                Interval::everything()
            }
        }
        BinaryOp::Div => {
            if ib.is_single_point() {
                let d = ib.min.clone().unwrap();
                if is_positive_const(&d) {
                    Interval {
                        min: map1(&ia.min, |a| a / d.clone()),
                        max: map1(&ia.max, |a| a / d.clone()),
                    }
                } else if is_negative_const(&d) {
                    Interval {
                        min: map1(&ia.max, |a| a / d.clone()),
                        max: map1(&ia.min, |a| a / d.clone()),
                    }
                } else {
                    Interval::everything()
                }
            } else {
                Interval::everything()
            }
        }
        BinaryOp::Mod => {
            // Euclidean mod by a positive constant lands in [0, b-1].
            if let Some(m) = b_expr.as_const_int() {
                if m > 0 {
                    return Interval::bounded(
                        Expr::zero(b_expr.ty().element_of()),
                        simplify(&(b_expr.clone() - 1)),
                    );
                }
            }
            Interval::everything()
        }
        BinaryOp::Min => Interval {
            min: lift2(&ia.min, &ib.min, BinaryOp::Min),
            max: match (&ia.max, &ib.max) {
                (Some(a), Some(b)) => Some(simplify(&ops::min(a.clone(), b.clone()))),
                (Some(a), None) | (None, Some(a)) => Some(a.clone()),
                (None, None) => None,
            },
        },
        BinaryOp::Max => Interval {
            min: match (&ia.min, &ib.min) {
                (Some(a), Some(b)) => Some(simplify(&ops::max(a.clone(), b.clone()))),
                (Some(a), None) | (None, Some(a)) => Some(a.clone()),
                (None, None) => None,
            },
            max: lift2(&ia.max, &ib.max, BinaryOp::Max),
        },
    }
}

/// True when no free variable of `e` is bound in `scope`.
fn expr_is_closed(e: &Expr, scope: &Scope<Interval>) -> bool {
    struct Check<'a> {
        scope: &'a Scope<Interval>,
        closed: bool,
    }
    impl Visitor for Check<'_> {
        fn visit_expr(&mut self, e: &Expr) {
            if let ExprKind::Variable { name, .. } = e.kind() {
                if self.scope.contains(name) {
                    self.closed = false;
                }
            }
            if self.closed {
                walk_expr(self, e);
            }
        }
    }
    let mut c = Check { scope, closed: true };
    c.visit_expr(e);
    c.closed
}

/// Which access directions [`boxes_touched`] should record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Required,
    Provided,
    Both,
}

struct BoxesTouched<'a> {
    kind: AccessKind,
    filter: Option<&'a str>,
    scope: Scope<Interval>,
    conditions: Vec<Expr>,
    boxes: IndexMap<String, Region>,
}

impl BoxesTouched<'_> {
    fn current_used(&self) -> Option<Expr> {
        let mut used: Option<Expr> = None;
        for c in &self.conditions {
            used = Some(match used {
                Some(u) => Expr::and(u, c.clone()),
                None => c.clone(),
            });
        }
        used
    }

    fn record(&mut self, name: &str, args_bounds: Vec<Interval>) {
        if let Some(f) = self.filter {
            if f != name {
                return;
            }
        }
        let region = Region { bounds: args_bounds, used: self.current_used() };
        let merged = match self.boxes.get(name) {
            Some(existing) => region_union(existing, &region),
            None => region,
        };
        self.boxes.insert(name.to_string(), merged);
    }

    fn bounds_of(&self, e: &Expr) -> Interval {
        bounds_of_expr_in_scope(e, &self.scope)
    }
}

impl Visitor for BoxesTouched<'_> {
    fn visit_expr(&mut self, e: &Expr) {
        walk_expr(self, e);
        if let ExprKind::Call { name, args, kind, .. } = e.kind() {
            let reads_buffer = matches!(kind, CallKind::PipelineFunc | CallKind::Image);
            if reads_buffer && self.kind != AccessKind::Provided {
                let bounds: Vec<Interval> = args.iter().map(|a| self.bounds_of(a)).collect();
                self.record(name, bounds);
            }
        }
        if let ExprKind::Load { name, index, .. } = e.kind() {
            if self.kind != AccessKind::Provided {
                let bounds = vec![self.bounds_of(index)];
                self.record(name, bounds);
            }
        }
    }

    fn visit_stmt(&mut self, s: &Stmt) {
        match s.kind() {
            StmtKind::For { name, min, extent, body, .. } => {
                self.visit_expr(min);
                self.visit_expr(extent);
                let imin = self.bounds_of(min);
                let iext = self.bounds_of(extent);
                let interval = Interval {
                    min: imin.min.clone(),
                    max: map2(&imin.max, &iext.max, |m, e| m + e - 1),
                };
                self.scope.push(name.clone(), interval);
                self.visit_stmt(body);
                self.scope.pop(name);
            }
            StmtKind::LetStmt { name, value, body } => {
                self.visit_expr(value);
                let interval = self.bounds_of(value);
                self.scope.push(name.clone(), interval);
                self.visit_stmt(body);
                self.scope.pop(name);
            }
            StmtKind::IfThenElse { condition, then_case, else_case } => {
                self.visit_expr(condition);
                let cond = ops::unwrap_tags(condition);
                let track = ops::is_pure(&cond) && expr_is_closed(&cond, &self.scope);
                if track {
                    self.conditions.push(cond.clone());
                }
                self.visit_stmt(then_case);
                if track {
                    self.conditions.pop();
                    self.conditions.push(simplify(&Expr::not(cond)));
                }
                if let Some(else_case) = else_case {
                    self.visit_stmt(else_case);
                }
                if track {
                    self.conditions.pop();
                }
            }
            StmtKind::Provide { name, values, args, predicate } => {
                self.visit_expr(predicate);
                for v in values {
                    self.visit_expr(v);
                }
                for a in args {
                    self.visit_expr(a);
                }
                if self.kind != AccessKind::Required {
                    let bounds: Vec<Interval> =
                        args.iter().map(|a| self.bounds_of(a)).collect();
                    self.record(name, bounds);
                }
            }
            StmtKind::Store { name, value, index, predicate, .. } => {
                self.visit_expr(predicate);
                self.visit_expr(value);
                self.visit_expr(index);
                if self.kind != AccessKind::Required {
                    let bounds = vec![self.bounds_of(index)];
                    self.record(name, bounds);
                }
            }
            _ => walk_stmt(self, s),
        }
    }
}

/// Per-buffer bounding boxes of all accesses of the requested kind
/// transitively performed by `s`, symbolic in free variables and `scope`.
pub fn boxes_touched(s: &Stmt, scope: &Scope<Interval>, kind: AccessKind) -> IndexMap<String, Region> {
    boxes_touched_filtered(s, scope, kind, None)
}

/// Like [`boxes_touched`], restricted to a single buffer name.
pub fn boxes_touched_filtered(
    s: &Stmt,
    scope: &Scope<Interval>,
    kind: AccessKind,
    filter: Option<&str>,
) -> IndexMap<String, Region> {
    let mut v = BoxesTouched {
        kind,
        filter,
        scope: scope.clone(),
        conditions: Vec::new(),
        boxes: IndexMap::new(),
    };
    v.visit_stmt(s);
    v.boxes
}

/// The box read from `name` within `s`.
pub fn box_required(s: &Stmt, scope: &Scope<Interval>, name: &str) -> Region {
    boxes_touched_filtered(s, scope, AccessKind::Required, Some(name))
        .swap_remove(name)
        .unwrap_or_else(|| Region::new(Vec::new()))
}

/// The box written to `name` within `s`.
pub fn box_provided(s: &Stmt, scope: &Scope<Interval>, name: &str) -> Region {
    boxes_touched_filtered(s, scope, AccessKind::Provided, Some(name))
        .swap_remove(name)
        .unwrap_or_else(|| Region::new(Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::function::call_func;
    use rasterlang_core::function::Function;
    use rasterlang_core::ops::{max, min};
    use rasterlang_core::types::Type;

    fn scope_of(entries: &[(&str, i32, i32)]) -> Scope<Interval> {
        let mut s = Scope::new();
        for (name, lo, hi) in entries {
            s.push(
                name.to_string(),
                Interval::bounded(Expr::i32(*lo), Expr::i32(*hi)),
            );
        }
        s
    }

    #[test]
    fn affine_bounds_are_exact() {
        let x = Expr::var_i32("x");
        let scope = scope_of(&[("x", 0, 9)]);
        let i = bounds_of_expr_in_scope(&(x.clone() * 2 + 3), &scope);
        assert_eq!(i.min, Some(Expr::i32(3)));
        assert_eq!(i.max, Some(Expr::i32(21)));
    }

    #[test]
    fn subtraction_flips_sides() {
        let x = Expr::var_i32("x");
        let scope = scope_of(&[("x", 0, 9)]);
        let i = bounds_of_expr_in_scope(&(Expr::i32(10) - x), &scope);
        assert_eq!(i.min, Some(Expr::i32(1)));
        assert_eq!(i.max, Some(Expr::i32(10)));
    }

    #[test]
    fn min_max_clamp_pattern() {
        let x = Expr::var_i32("x");
        let scope = scope_of(&[("x", -5, 100)]);
        let clamped = max(Expr::i32(0), min(x, Expr::i32(7)));
        let i = bounds_of_expr_in_scope(&clamped, &scope);
        assert_eq!(i.min, Some(Expr::i32(0)));
        assert_eq!(i.max, Some(Expr::i32(7)));
    }

    #[test]
    fn unknown_degrades_to_unbounded() {
        let l = Expr::load_unpredicated(
            Type::int(32),
            "buf",
            Expr::var_i32("i"),
            rasterlang_core::expr::VarBinding::Free,
        );
        let i = bounds_of_expr_in_scope(&l, &Scope::new());
        assert!(!i.is_bounded());
    }

    #[test]
    fn free_variable_is_a_symbolic_point() {
        let y = Expr::var_i32("y");
        let i = bounds_of_expr_in_scope(&(y.clone() + 1), &Scope::new());
        assert!(i.is_single_point());
        assert_eq!(i.min, Some(y + 1));
    }

    #[test]
    fn mod_by_positive_constant() {
        let x = Expr::var_i32("x");
        let i = bounds_of_expr_in_scope(&(x % 8), &scope_of(&[("x", -100, 100)]));
        assert_eq!(i.min, Some(Expr::i32(0)));
        assert_eq!(i.max, Some(Expr::i32(7)));
    }

    #[test]
    fn ramp_bounds_follow_stride_sign() {
        let r = Expr::ramp(Expr::var_i32("b"), Expr::i32(1), 4);
        let scope = scope_of(&[("b", 0, 10)]);
        let i = bounds_of_expr_in_scope(&r, &scope);
        assert_eq!(i.min, Some(Expr::i32(0)));
        assert_eq!(i.max, Some(Expr::i32(13)));
    }

    #[test]
    fn boxes_touched_collects_calls_and_provides() {
        let g = Function::with_definition("g", vec!["x".to_string()], vec![Expr::var_i32("x")]);
        let x = Expr::var_i32("x");
        let body = Stmt::provide(
            "f",
            vec![call_func(&g, vec![x.clone() - 1], 0) + call_func(&g, vec![x.clone() + 1], 0)],
            vec![x.clone()],
            Expr::const_true(),
        );
        let s = Stmt::serial_for("x", Expr::i32(0), Expr::i32(8), body);

        let required = box_required(&s, &Scope::new(), "g");
        assert_eq!(required.len(), 1);
        assert_eq!(required.bounds[0].min, Some(Expr::i32(-1)));
        assert_eq!(required.bounds[0].max, Some(Expr::i32(8)));

        let provided = box_provided(&s, &Scope::new(), "f");
        assert_eq!(provided.bounds[0].min, Some(Expr::i32(0)));
        assert_eq!(provided.bounds[0].max, Some(Expr::i32(7)));
    }

    #[test]
    fn conditional_reads_get_a_used_predicate() {
        let g = Function::with_definition("g", vec!["x".to_string()], vec![Expr::var_i32("x")]);
        let p = Expr::var(Type::bool_scalar(), "p");
        let body = Stmt::if_then_else(
            p.clone(),
            Stmt::evaluate(call_func(&g, vec![Expr::i32(0)], 0)),
            None,
        );
        let boxes = boxes_touched(&body, &Scope::new(), AccessKind::Required);
        let region = &boxes["g"];
        assert_eq!(region.used, Some(p));
    }

    #[test]
    fn region_union_and_containment() {
        let a = Region::new(vec![Interval::bounded(Expr::i32(0), Expr::i32(4))]);
        let b = Region::new(vec![Interval::bounded(Expr::i32(2), Expr::i32(9))]);
        let u = region_union(&a, &b);
        assert_eq!(u.bounds[0].min, Some(Expr::i32(0)));
        assert_eq!(u.bounds[0].max, Some(Expr::i32(9)));
        assert!(region_contains(&u, &a));
        assert!(!region_contains(&a, &b));
    }
}
