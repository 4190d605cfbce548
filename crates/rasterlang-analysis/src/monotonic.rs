//! Monotonicity classification of an expression in one free variable.
//!
//! Structural rules handle the common affine and min/max shapes; when they
//! give up on an integer scalar, a difference rewrite
//! `e[var+1] - e[var]` with sign inference takes over.

use rasterlang_core::expr::{BinaryOp, Expr, ExprKind};
use rasterlang_core::ops;
use rasterlang_core::substitute::{expr_uses_var, substitute};

use crate::simplify::{can_prove, is_negative_const, is_positive_const, simplify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monotonic {
    /// Does not depend on the variable.
    Constant,
    /// Non-decreasing in the variable.
    Increasing,
    /// Non-increasing in the variable.
    Decreasing,
    Unknown,
}

impl Monotonic {
    fn flip(self) -> Monotonic {
        match self {
            Monotonic::Increasing => Monotonic::Decreasing,
            Monotonic::Decreasing => Monotonic::Increasing,
            other => other,
        }
    }

    fn unify(self, other: Monotonic) -> Monotonic {
        use Monotonic::*;
        match (self, other) {
            (Constant, x) | (x, Constant) => x,
            (Increasing, Increasing) => Increasing,
            (Decreasing, Decreasing) => Decreasing,
            _ => Unknown,
        }
    }
}

/// Classifies `e` as a function of the free variable `var`.
pub fn is_monotonic(e: &Expr, var: &str) -> Monotonic {
    let result = structural(e, var);
    if result != Monotonic::Unknown {
        return result;
    }
    // Fall back on the symbolic difference `e[var+1] - e[var]` for scalar
    // integer expressions. For linear combinations the difference is just
    // the coefficient of the variable; otherwise ask the simplifier.
    if e.ty().is_int() && e.ty().is_scalar() {
        if let Some(coefficient) = linear_coefficient(e, var) {
            return match coefficient.cmp(&0) {
                std::cmp::Ordering::Equal => Monotonic::Constant,
                std::cmp::Ordering::Greater => Monotonic::Increasing,
                std::cmp::Ordering::Less => Monotonic::Decreasing,
            };
        }
        let next = substitute(var, Expr::var_i32(var) + 1, e);
        let diff = simplify(&(next - e.clone()));
        if can_prove(&ops::eq(diff.clone(), Expr::i32(0))) {
            return Monotonic::Constant;
        }
        if can_prove(&ops::ge(diff.clone(), Expr::i32(0))) {
            return Monotonic::Increasing;
        }
        if can_prove(&ops::le(diff, Expr::i32(0))) {
            return Monotonic::Decreasing;
        }
    }
    Monotonic::Unknown
}

/// The coefficient of `var` in `e`, when `e` is a linear combination of
/// variables and constants. `None` when `e` is not linear.
fn linear_coefficient(e: &Expr, var: &str) -> Option<i64> {
    match e.kind() {
        ExprKind::IntImm { .. } | ExprKind::UIntImm { .. } => Some(0),
        ExprKind::Variable { name, .. } => Some((name == var) as i64),
        ExprKind::Binary { op, a, b } => {
            let ca = linear_coefficient(a, var);
            let cb = linear_coefficient(b, var);
            match op {
                BinaryOp::Add => Some(ca? + cb?),
                BinaryOp::Sub => Some(ca? - cb?),
                BinaryOp::Mul => {
                    if let Some(k) = b.as_const_int() {
                        Some(ca? * k)
                    } else if let Some(k) = a.as_const_int() {
                        Some(cb? * k)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        }
        ExprKind::Call { args, .. }
            if (e.is_intrinsic(rasterlang_core::intrinsic::LIKELY)
                || e.is_intrinsic(rasterlang_core::intrinsic::LIKELY_IF_INNERMOST))
                && args.len() == 1 =>
        {
            linear_coefficient(&args[0], var)
        }
        _ => None,
    }
}

fn structural(e: &Expr, var: &str) -> Monotonic {
    match e.kind() {
        ExprKind::IntImm { .. }
        | ExprKind::UIntImm { .. }
        | ExprKind::FloatImm { .. }
        | ExprKind::StringImm { .. } => Monotonic::Constant,
        ExprKind::Variable { name, .. } => {
            if name == var {
                Monotonic::Increasing
            } else {
                Monotonic::Constant
            }
        }
        ExprKind::Binary { op, a, b } => {
            let ma = structural(a, var);
            let mb = structural(b, var);
            match op {
                BinaryOp::Add => ma.unify(mb),
                BinaryOp::Sub => ma.unify(mb.flip()),
                BinaryOp::Min | BinaryOp::Max => ma.unify(mb),
                BinaryOp::Mul => {
                    if mb == Monotonic::Constant && !expr_uses_var(b, var) {
                        scale_by_sign(ma, b)
                    } else if ma == Monotonic::Constant && !expr_uses_var(a, var) {
                        scale_by_sign(mb, a)
                    } else {
                        Monotonic::Unknown
                    }
                }
                BinaryOp::Div => {
                    if mb == Monotonic::Constant && !expr_uses_var(b, var) {
                        scale_by_sign(ma, b)
                    } else {
                        Monotonic::Unknown
                    }
                }
                BinaryOp::Mod => Monotonic::Unknown,
            }
        }
        ExprKind::Select { condition, true_value, false_value } => {
            if structural(condition, var) == Monotonic::Constant {
                structural(true_value, var).unify(structural(false_value, var))
            } else {
                Monotonic::Unknown
            }
        }
        ExprKind::Cast { value } => {
            // Widening casts preserve order.
            if e.ty().code == value.ty().code && e.ty().bits >= value.ty().bits {
                structural(value, var)
            } else {
                Monotonic::Unknown
            }
        }
        ExprKind::Broadcast { value, .. } => structural(value, var),
        ExprKind::Let { name, value, body } => {
            if name == var {
                // The binder shadows the variable of interest.
                structural(value, var)
            } else {
                let mv = structural(value, var);
                let mb = structural(body, var);
                if mv == Monotonic::Constant {
                    mb
                } else if mb == Monotonic::Constant && !expr_uses_var(body, name) {
                    Monotonic::Constant
                } else {
                    Monotonic::Unknown
                }
            }
        }
        ExprKind::Call { args, .. }
            if (e.is_intrinsic(rasterlang_core::intrinsic::LIKELY)
                || e.is_intrinsic(rasterlang_core::intrinsic::LIKELY_IF_INNERMOST))
                && args.len() == 1 =>
        {
            structural(&args[0], var)
        }
        _ => {
            if expr_uses_var(e, var) {
                Monotonic::Unknown
            } else {
                Monotonic::Constant
            }
        }
    }
}

fn scale_by_sign(m: Monotonic, factor: &Expr) -> Monotonic {
    if is_positive_const(factor) {
        m
    } else if is_negative_const(factor) {
        m.flip()
    } else {
        match m {
            Monotonic::Constant => Monotonic::Constant,
            _ => Monotonic::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::ops::{max, min, select};

    #[test]
    fn affine_classification() {
        let x = Expr::var_i32("x");
        assert_eq!(is_monotonic(&(x.clone() + 3), "x"), Monotonic::Increasing);
        assert_eq!(is_monotonic(&(Expr::i32(3) - x.clone()), "x"), Monotonic::Decreasing);
        assert_eq!(is_monotonic(&(x.clone() * -2), "x"), Monotonic::Decreasing);
        assert_eq!(is_monotonic(&Expr::var_i32("y"), "x"), Monotonic::Constant);
    }

    #[test]
    fn min_max_combination() {
        let x = Expr::var_i32("x");
        let e = min(x.clone() + 1, x.clone() * 2);
        assert_eq!(is_monotonic(&e, "x"), Monotonic::Increasing);
        let mixed = max(x.clone(), Expr::i32(10) - x);
        assert_eq!(is_monotonic(&mixed, "x"), Monotonic::Unknown);
    }

    #[test]
    fn select_with_invariant_condition() {
        let x = Expr::var_i32("x");
        let p = rasterlang_core::ops::lt(Expr::var_i32("n"), Expr::i32(4));
        let e = select(p, x.clone() + 1, x.clone() + 5);
        assert_eq!(is_monotonic(&e, "x"), Monotonic::Increasing);
    }

    #[test]
    fn difference_rewrite_catches_folded_forms() {
        // 2*x - x is increasing, but the product rule alone cannot see it.
        let x = Expr::var_i32("x");
        let e = x.clone() * 2 - x.clone();
        assert_eq!(is_monotonic(&e, "x"), Monotonic::Increasing);
    }

    #[test]
    fn shadowed_variable_is_constant() {
        let x = Expr::var_i32("x");
        let e = Expr::let_in("x", Expr::i32(3), Expr::var_i32("x") + 1);
        assert_eq!(is_monotonic(&e, "x"), Monotonic::Constant);
        let _ = x;
    }
}
