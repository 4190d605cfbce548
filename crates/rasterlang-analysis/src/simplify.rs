//! A meaning-preserving expression and statement simplifier.
//!
//! The lowering passes lean on this constantly: predicates must collapse to
//! constants for skip-stages to gate anything, fold extents must become
//! integer literals for storage folding to pick a factor, and union bounds
//! should not accumulate towers of `min(min(..))`. The rule set is the
//! subset those passes exercise; it folds constants, normalizes constant
//! association, and cancels the obvious identities. It makes no claim of
//! confluence.

use rasterlang_core::expr::{BinaryOp, CmpOp, Expr, ExprKind, FloatBits};
use rasterlang_core::mutate::{walk_expr, walk_stmt, Mutator};
use rasterlang_core::ops;
use rasterlang_core::stmt::{Stmt, StmtKind};
use rasterlang_core::substitute::expr_uses_var;

struct Simplify;

impl Mutator for Simplify {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        let e = walk_expr(self, e);
        simplify_node(&e)
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        let s = walk_stmt(self, s);
        simplify_stmt_node(&s)
    }
}

/// Simplifies an expression bottom-up.
pub fn simplify(e: &Expr) -> Expr {
    Simplify.mutate_expr(e)
}

/// Simplifies every expression in a statement and folds constant control flow.
pub fn simplify_stmt(s: &Stmt) -> Stmt {
    Simplify.mutate_stmt(s)
}

/// True if `e` simplifies to the constant true.
pub fn can_prove(e: &Expr) -> bool {
    is_const_true(&simplify(e))
}

pub fn is_const_true(e: &Expr) -> bool {
    matches!(e.kind(), ExprKind::UIntImm { value: 1 }) && e.ty().is_bool()
}

pub fn is_const_false(e: &Expr) -> bool {
    matches!(e.kind(), ExprKind::UIntImm { value: 0 }) && e.ty().is_bool()
}

pub fn is_const_zero(e: &Expr) -> bool {
    match e.kind() {
        ExprKind::IntImm { value } => *value == 0,
        ExprKind::UIntImm { value } => *value == 0,
        ExprKind::FloatImm { value } => value.0 == 0.0,
        ExprKind::Broadcast { value, .. } => is_const_zero(value),
        _ => false,
    }
}

pub fn is_const_one(e: &Expr) -> bool {
    match e.kind() {
        ExprKind::IntImm { value } => *value == 1,
        ExprKind::UIntImm { value } => *value == 1,
        ExprKind::FloatImm { value } => value.0 == 1.0,
        ExprKind::Broadcast { value, .. } => is_const_one(value),
        _ => false,
    }
}

fn simplify_node(e: &Expr) -> Expr {
    match e.kind() {
        ExprKind::Binary { op, a, b } => simplify_binary(e, *op, a, b),
        ExprKind::Cmp { op, a, b } => simplify_cmp(e, *op, a, b),
        ExprKind::And { a, b } => {
            if is_const_false(a) || is_const_false(b) {
                Expr::const_false()
            } else if is_const_true(a) {
                b.clone()
            } else if is_const_true(b) {
                a.clone()
            } else if a == b {
                a.clone()
            } else {
                e.clone()
            }
        }
        ExprKind::Or { a, b } => {
            if is_const_true(a) || is_const_true(b) {
                Expr::const_true()
            } else if is_const_false(a) {
                b.clone()
            } else if is_const_false(b) {
                a.clone()
            } else if a == b {
                a.clone()
            } else {
                e.clone()
            }
        }
        ExprKind::Not { a } => match a.kind() {
            ExprKind::Not { a: inner } => inner.clone(),
            ExprKind::UIntImm { value } if a.ty().is_bool() => Expr::bool_imm(*value == 0),
            _ => e.clone(),
        },
        ExprKind::Select { condition, true_value, false_value } => {
            if is_const_true(condition) {
                true_value.clone()
            } else if is_const_false(condition) {
                false_value.clone()
            } else if true_value == false_value {
                true_value.clone()
            } else {
                e.clone()
            }
        }
        ExprKind::Cast { value } => {
            let ty = e.ty();
            match value.kind() {
                ExprKind::IntImm { value: v } if ty.is_int() && ty.is_scalar() => {
                    Expr::int_of(ty, wrap_int(*v, ty.bits))
                }
                ExprKind::IntImm { value: v } if ty.is_float() && ty.is_scalar() => {
                    Expr::float_of(ty, *v as f64)
                }
                ExprKind::UIntImm { value: v } if ty.is_int() && ty.is_scalar() => {
                    Expr::int_of(ty, wrap_int(*v as i64, ty.bits))
                }
                _ => e.clone(),
            }
        }
        ExprKind::Let { name, value, body } => {
            if !expr_uses_var(body, name) {
                body.clone()
            } else if value.is_const() || value.as_variable().is_some() {
                simplify(&rasterlang_core::substitute::substitute(name, value.clone(), body))
            } else {
                e.clone()
            }
        }
        _ => e.clone(),
    }
}

fn wrap_int(v: i64, bits: u8) -> i64 {
    if bits >= 64 {
        v
    } else {
        let shift = 64 - bits as u32;
        (v << shift) >> shift
    }
}

fn const_ints(a: &Expr, b: &Expr) -> Option<(i64, i64)> {
    match (a.kind(), b.kind()) {
        (ExprKind::IntImm { value: x }, ExprKind::IntImm { value: y }) => Some((*x, *y)),
        _ => None,
    }
}

fn const_floats(a: &Expr, b: &Expr) -> Option<(f64, f64)> {
    match (a.kind(), b.kind()) {
        (ExprKind::FloatImm { value: x }, ExprKind::FloatImm { value: y }) => {
            Some((x.0, y.0))
        }
        _ => None,
    }
}

fn simplify_binary(e: &Expr, op: BinaryOp, a: &Expr, b: &Expr) -> Expr {
    let ty = e.ty();

    // Elementwise op of broadcasts is a broadcast of the op.
    if let (ExprKind::Broadcast { value: va, lanes: la }, ExprKind::Broadcast { value: vb, lanes: lb }) =
        (a.kind(), b.kind())
    {
        if la == lb {
            return Expr::broadcast(simplify(&Expr::binary(op, va.clone(), vb.clone())), *la);
        }
    }

    if let Some((x, y)) = const_ints(a, b) {
        let folded = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Div => (y != 0).then(|| div_floor(x, y)),
            BinaryOp::Mod => (y != 0).then(|| mod_floor(x, y)),
            BinaryOp::Min => Some(x.min(y)),
            BinaryOp::Max => Some(x.max(y)),
        };
        if let Some(v) = folded {
            return Expr::int_of(ty, wrap_int(v, ty.bits));
        }
    }
    if let Some((x, y)) = const_floats(a, b) {
        let folded = match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Mod => x.rem_euclid(y),
            BinaryOp::Min => x.min(y),
            BinaryOp::Max => x.max(y),
        };
        return Expr::float_of(ty, folded);
    }

    match op {
        BinaryOp::Add => {
            if is_const_zero(a) {
                return b.clone();
            }
            if is_const_zero(b) {
                return a.clone();
            }
            // (x + c1) + c2 -> x + (c1 + c2)
            if let (ExprKind::Binary { op: BinaryOp::Add, a: x, b: c1 }, true) =
                (a.kind(), b.is_const())
            {
                if c1.is_const() {
                    return simplify(&Expr::binary(
                        BinaryOp::Add,
                        x.clone(),
                        simplify(&Expr::binary(BinaryOp::Add, c1.clone(), b.clone())),
                    ));
                }
            }
            // (x - c1) + c2 -> x + (c2 - c1)
            if let (ExprKind::Binary { op: BinaryOp::Sub, a: x, b: c1 }, true) =
                (a.kind(), b.is_const())
            {
                if c1.is_const() {
                    return simplify(&Expr::binary(
                        BinaryOp::Add,
                        x.clone(),
                        simplify(&Expr::binary(BinaryOp::Sub, b.clone(), c1.clone())),
                    ));
                }
            }
        }
        BinaryOp::Sub => {
            if is_const_zero(b) {
                return a.clone();
            }
            if a == b {
                return Expr::zero(ty);
            }
            // (x + c1) - c2 -> x + (c1 - c2)
            if let (ExprKind::Binary { op: BinaryOp::Add, a: x, b: c1 }, true) =
                (a.kind(), b.is_const())
            {
                if c1.is_const() {
                    return simplify(&Expr::binary(
                        BinaryOp::Add,
                        x.clone(),
                        simplify(&Expr::binary(BinaryOp::Sub, c1.clone(), b.clone())),
                    ));
                }
            }
            // Cancellation through one level of +/-.
            if let (
                ExprKind::Binary { op: BinaryOp::Add, a: aa, b: ac },
                ExprKind::Binary { op: BinaryOp::Add, a: ba, b: bc },
            ) = (a.kind(), b.kind())
            {
                // (x + c1) - (x + c2) -> c1 - c2
                if aa == ba && ac.is_const() && bc.is_const() {
                    return simplify(&Expr::binary(BinaryOp::Sub, ac.clone(), bc.clone()));
                }
            }
            if let ExprKind::Binary { op: inner, a: ba, b: bb } = b.kind() {
                if *inner == BinaryOp::Sub && ba == a {
                    // a - (a - c) -> c
                    return bb.clone();
                }
                if *inner == BinaryOp::Add && ba == a {
                    // a - (a + c) -> 0 - c
                    return simplify(&Expr::binary(BinaryOp::Sub, Expr::zero(ty), bb.clone()));
                }
            }
            if let ExprKind::Binary { op: inner, a: aa, b: ab } = a.kind() {
                if *inner == BinaryOp::Add && aa == b {
                    // (b + c) - b -> c
                    return ab.clone();
                }
                if *inner == BinaryOp::Add && ab == b {
                    // (c + b) - b -> c
                    return aa.clone();
                }
                if *inner == BinaryOp::Sub && aa == b {
                    // (b - c) - b -> 0 - c
                    return simplify(&Expr::binary(BinaryOp::Sub, Expr::zero(ty), ab.clone()));
                }
            }
        }
        BinaryOp::Mul => {
            if is_const_zero(a) || is_const_zero(b) {
                return Expr::zero(ty);
            }
            if is_const_one(a) {
                return b.clone();
            }
            if is_const_one(b) {
                return a.clone();
            }
        }
        BinaryOp::Div => {
            if is_const_one(b) {
                return a.clone();
            }
            if is_const_zero(a) && !is_const_zero(b) {
                return Expr::zero(ty);
            }
        }
        BinaryOp::Mod => {
            if is_const_one(b) {
                return Expr::zero(ty);
            }
        }
        BinaryOp::Min | BinaryOp::Max => {
            if a == b {
                return a.clone();
            }
            // min(min(x, c1), c2) -> min(x, min(c1, c2)), same for max
            if let ExprKind::Binary { op: inner_op, a: x, b: c1 } = a.kind() {
                if *inner_op == op && c1.is_const() && b.is_const() {
                    return simplify(&Expr::binary(
                        op,
                        x.clone(),
                        simplify(&Expr::binary(op, c1.clone(), b.clone())),
                    ));
                }
            }
        }
    }
    e.clone()
}

fn div_floor(x: i64, y: i64) -> i64 {
    let q = x / y;
    if (x % y != 0) && ((x < 0) != (y < 0)) {
        q - 1
    } else {
        q
    }
}

fn mod_floor(x: i64, y: i64) -> i64 {
    x - div_floor(x, y) * y
}

fn simplify_cmp(e: &Expr, op: CmpOp, a: &Expr, b: &Expr) -> Expr {
    if let Some((x, y)) = const_ints(a, b) {
        let v = match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
        };
        return Expr::bool_imm(v);
    }
    if let Some((x, y)) = const_floats(a, b) {
        let v = match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
        };
        return Expr::bool_imm(v);
    }
    // Reflexive comparisons of pure expressions.
    if a == b && ops::is_pure(a) {
        return match op {
            CmpOp::Eq | CmpOp::Le | CmpOp::Ge => Expr::const_true(),
            CmpOp::Ne | CmpOp::Lt | CmpOp::Gt => Expr::const_false(),
        };
    }
    // x <=> x + c reduces to comparing zero against the offset.
    if let ExprKind::Binary { op: BinaryOp::Add, a: x, b: c } = b.kind() {
        if x == a && c.is_const() && ops::is_pure(a) {
            return simplify(&Expr::cmp(op, Expr::zero(c.ty()), c.clone()));
        }
    }
    if let ExprKind::Binary { op: BinaryOp::Add, a: x, b: c } = a.kind() {
        if x == b && c.is_const() && ops::is_pure(b) {
            return simplify(&Expr::cmp(op, c.clone(), Expr::zero(c.ty())));
        }
        // x + c1 <=> c2: move the constant across.
        if c.is_const() && b.is_const() && b.ty().is_int() {
            let rhs = simplify(&Expr::binary(BinaryOp::Sub, b.clone(), c.clone()));
            return simplify(&Expr::cmp(op, x.clone(), rhs));
        }
    }
    e.clone()
}

fn simplify_stmt_node(s: &Stmt) -> Stmt {
    match s.kind() {
        StmtKind::IfThenElse { condition, then_case, else_case } => {
            if is_const_true(condition) {
                then_case.clone()
            } else if is_const_false(condition) {
                else_case.clone().unwrap_or_else(Stmt::no_op)
            } else {
                s.clone()
            }
        }
        StmtKind::Block { first, rest } => {
            if first.is_no_op() {
                rest.clone()
            } else if rest.is_no_op() {
                first.clone()
            } else {
                s.clone()
            }
        }
        StmtKind::For { extent, .. } => {
            if is_const_zero(extent) {
                Stmt::no_op()
            } else {
                s.clone()
            }
        }
        _ => s.clone(),
    }
}

/// Extracts a constant float payload, seeing through broadcasts.
pub fn as_const_float(e: &Expr) -> Option<f64> {
    match e.kind() {
        ExprKind::FloatImm { value: FloatBits(v) } => Some(*v),
        ExprKind::Broadcast { value, .. } => as_const_float(value),
        _ => None,
    }
}

/// Extracts a constant integer payload, seeing through broadcasts.
pub fn as_const_int_deep(e: &Expr) -> Option<i64> {
    match e.kind() {
        ExprKind::Broadcast { value, .. } => as_const_int_deep(value),
        _ => e.as_const_int(),
    }
}

/// True if the constant is a positive (negative) number.
pub fn is_positive_const(e: &Expr) -> bool {
    as_const_int_deep(e).map(|v| v > 0).unwrap_or(false)
        || as_const_float(e).map(|v| v > 0.0).unwrap_or(false)
}

pub fn is_negative_const(e: &Expr) -> bool {
    as_const_int_deep(e).map(|v| v < 0).unwrap_or(false)
        || as_const_float(e).map(|v| v < 0.0).unwrap_or(false)
}

/// A conservative constant upper bound of an integer expression, if one
/// is syntactically evident.
pub fn find_constant_upper_bound(e: &Expr) -> Option<i64> {
    let e = simplify(e);
    match e.kind() {
        ExprKind::IntImm { value } => Some(*value),
        ExprKind::UIntImm { value } => i64::try_from(*value).ok(),
        ExprKind::Binary { op: BinaryOp::Min, a, b } => {
            match (find_constant_upper_bound(a), find_constant_upper_bound(b)) {
                (Some(x), Some(y)) => Some(x.min(y)),
                (Some(x), None) | (None, Some(x)) => Some(x),
                (None, None) => None,
            }
        }
        ExprKind::Binary { op: BinaryOp::Max, a, b } => {
            let x = find_constant_upper_bound(a)?;
            let y = find_constant_upper_bound(b)?;
            Some(x.max(y))
        }
        ExprKind::Select { true_value, false_value, .. } => {
            let x = find_constant_upper_bound(true_value)?;
            let y = find_constant_upper_bound(false_value)?;
            Some(x.max(y))
        }
        _ if e.ty().is_uint() && e.ty().bits < 64 => Some((1i64 << e.ty().bits) - 1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::ops::{ge, le, lt, min};
    use rasterlang_core::types::Type;

    #[test]
    fn constant_folding() {
        assert_eq!(simplify(&(Expr::i32(2) + 3)), Expr::i32(5));
        assert_eq!(simplify(&(Expr::i32(7) % 2)), Expr::i32(1));
        assert_eq!(simplify(&min(Expr::i32(4), Expr::i32(9))), Expr::i32(4));
    }

    #[test]
    fn euclidean_division() {
        assert_eq!(simplify(&(Expr::i32(-7) / 2)), Expr::i32(-4));
        assert_eq!(simplify(&(Expr::i32(-7) % 2)), Expr::i32(1));
    }

    #[test]
    fn identities() {
        let x = Expr::var_i32("x");
        assert_eq!(simplify(&(x.clone() + 0)), x);
        assert_eq!(simplify(&(x.clone() * 1)), x);
        assert_eq!(simplify(&(x.clone() * 0)), Expr::i32(0));
        assert_eq!(simplify(&(x.clone() - x.clone())), Expr::i32(0));
        assert_eq!(simplify(&min(x.clone(), x.clone())), x);
    }

    #[test]
    fn constant_association() {
        let x = Expr::var_i32("x");
        assert_eq!(simplify(&((x.clone() + 3) + 4)), x.clone() + 7);
        assert_eq!(simplify(&((x.clone() + 5) - 5)), x.clone());
        assert_eq!(simplify(&((x.clone() - 2) + 2)), x);
    }

    #[test]
    fn subtraction_cancellation() {
        let x = Expr::var_i32("x");
        let y = Expr::var_i32("y");
        // x - (x - 1) -> 1, the sliding-window extent shape.
        assert_eq!(simplify(&(x.clone() - (x.clone() - 1))), Expr::i32(1));
        assert_eq!(simplify(&((x.clone() + y.clone()) - x.clone())), y.clone());
        assert_eq!(
            simplify(&(x.clone() - (x.clone() + y.clone()))),
            simplify(&(Expr::i32(0) - y))
        );
    }

    #[test]
    fn proves_obvious_facts() {
        let x = Expr::var_i32("x");
        assert!(can_prove(&le(x.clone(), x.clone() + 1)));
        assert!(can_prove(&ge(Expr::i32(4), Expr::i32(4))));
        assert!(!can_prove(&lt(x.clone(), x)));
    }

    #[test]
    fn select_and_boolean_rules() {
        let x = Expr::var_i32("x");
        let c = lt(x.clone(), Expr::i32(3));
        assert_eq!(
            simplify(&Expr::select(Expr::const_true(), x.clone(), Expr::i32(0))),
            x.clone()
        );
        assert_eq!(simplify(&Expr::and(Expr::const_true(), c.clone())), c.clone());
        assert_eq!(simplify(&Expr::or(c, Expr::const_true())), Expr::const_true());
        assert_eq!(
            simplify(&Expr::not(Expr::not(lt(x.clone(), Expr::i32(1))))),
            lt(x, Expr::i32(1))
        );
    }

    #[test]
    fn broadcast_ops_fold_to_broadcast() {
        let a = Expr::broadcast(Expr::i32(2), 4);
        let b = Expr::broadcast(Expr::i32(3), 4);
        let out = simplify(&(a + b));
        assert_eq!(out, Expr::broadcast(Expr::i32(5), 4));
    }

    #[test]
    fn unused_let_is_dropped() {
        let e = Expr::let_in("t", Expr::var_i32("x") + 1, Expr::i32(7));
        assert_eq!(simplify(&e), Expr::i32(7));
    }

    #[test]
    fn stmt_folding() {
        let s = Stmt::if_then_else(
            Expr::const_false(),
            Stmt::free("a"),
            Some(Stmt::free("b")),
        );
        assert_eq!(simplify_stmt(&s), Stmt::free("b"));

        let z = Stmt::serial_for("i", Expr::i32(0), Expr::i32(0), Stmt::free("a"));
        assert!(simplify_stmt(&z).is_no_op());
    }

    #[test]
    fn upper_bound_queries() {
        let x = Expr::var_i32("x");
        assert_eq!(find_constant_upper_bound(&Expr::i32(12)), Some(12));
        assert_eq!(
            find_constant_upper_bound(&min(x.clone(), Expr::i32(8))),
            Some(8)
        );
        assert_eq!(find_constant_upper_bound(&x), None);
        let byte = Expr::var(Type::uint(8), "b");
        assert_eq!(find_constant_upper_bound(&byte), Some(255));
    }

    #[test]
    fn cast_folding() {
        let c = Expr::cast(Type::int(16), Expr::int_of(Type::int(32), 70000));
        let out = simplify(&c);
        assert_eq!(out.as_const_int(), Some(wrap_int(70000, 16)));
    }
}
