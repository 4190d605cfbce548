//! Convenience constructors over the IR, in the shape the passes consume.

use crate::expr::{intrinsic, BinaryOp, CallKind, CmpOp, Expr, ExprKind};
use crate::stmt::Stmt;
use crate::types::Type;
use crate::visit::{walk_expr, Visitor};

pub fn min(a: Expr, b: Expr) -> Expr {
    Expr::binary(BinaryOp::Min, a, b)
}

pub fn max(a: Expr, b: Expr) -> Expr {
    Expr::binary(BinaryOp::Max, a, b)
}

pub fn eq(a: Expr, b: Expr) -> Expr {
    Expr::cmp(CmpOp::Eq, a, b)
}

pub fn ne(a: Expr, b: Expr) -> Expr {
    Expr::cmp(CmpOp::Ne, a, b)
}

pub fn lt(a: Expr, b: Expr) -> Expr {
    Expr::cmp(CmpOp::Lt, a, b)
}

pub fn le(a: Expr, b: Expr) -> Expr {
    Expr::cmp(CmpOp::Le, a, b)
}

pub fn gt(a: Expr, b: Expr) -> Expr {
    Expr::cmp(CmpOp::Gt, a, b)
}

pub fn ge(a: Expr, b: Expr) -> Expr {
    Expr::cmp(CmpOp::Ge, a, b)
}

pub fn and(a: Expr, b: Expr) -> Expr {
    Expr::and(a, b)
}

pub fn or(a: Expr, b: Expr) -> Expr {
    Expr::or(a, b)
}

pub fn not(a: Expr) -> Expr {
    Expr::not(a)
}

pub fn select(c: Expr, t: Expr, f: Expr) -> Expr {
    Expr::select(c, t, f)
}

/// `max(lo, min(e, hi))`.
pub fn clamp(e: Expr, lo: Expr, hi: Expr) -> Expr {
    max(lo, min(e, hi))
}

/// Marks a boolean as expected-true for every vector lane.
pub fn likely(e: Expr) -> Expr {
    let ty = e.ty();
    Expr::call(ty, intrinsic::LIKELY, vec![e], CallKind::PureIntrinsic)
}

/// Like [`likely`], but the hint only applies on the innermost loop.
pub fn likely_if_innermost(e: Expr) -> Expr {
    let ty = e.ty();
    Expr::call(ty, intrinsic::LIKELY_IF_INNERMOST, vec![e], CallKind::PureIntrinsic)
}

/// Strips any `likely` / `likely_if_innermost` wrappers.
pub fn unwrap_tags(e: &Expr) -> Expr {
    if let ExprKind::Call { name, args, .. } = e.kind() {
        if (name == intrinsic::LIKELY || name == intrinsic::LIKELY_IF_INNERMOST)
            && args.len() == 1
        {
            return unwrap_tags(&args[0]);
        }
    }
    e.clone()
}

/// If `e` is a likely-tagged call, returns the tag name and its argument.
pub fn as_likely_tag(e: &Expr) -> Option<(&str, &Expr)> {
    if let ExprKind::Call { name, args, .. } = e.kind() {
        if (name == intrinsic::LIKELY || name == intrinsic::LIKELY_IF_INNERMOST)
            && args.len() == 1
        {
            return Some((name.as_str(), &args[0]));
        }
    }
    None
}

/// A value whose contents the pipeline promises never to read.
pub fn undef(ty: Type) -> Expr {
    Expr::call(ty, intrinsic::UNDEF, vec![], CallKind::PureIntrinsic)
}

pub fn saturating_add(a: Expr, b: Expr) -> Expr {
    let ty = a.ty();
    Expr::call(ty, intrinsic::SATURATING_ADD, vec![a, b], CallKind::PureIntrinsic)
}

/// Aggregates scalar fields into an opaque struct handle.
pub fn make_struct(args: Vec<Expr>) -> Expr {
    Expr::call(Type::handle(), intrinsic::MAKE_STRUCT, args, CallKind::Intrinsic)
}

/// A call to a pipeline-internal error reporter. The int32 result is the
/// error code the generated pipeline returns.
pub fn error_call(name: &str, args: Vec<Expr>) -> Expr {
    Expr::call(Type::int(32), name, args, CallKind::Extern)
}

struct PurityCheck {
    pure: bool,
}

impl Visitor for PurityCheck {
    fn visit_expr(&mut self, e: &Expr) {
        if let ExprKind::Call { kind, .. } = e.kind() {
            if !kind.is_pure() {
                self.pure = false;
            }
        }
        if self.pure {
            walk_expr(self, e);
        }
    }
}

/// True if evaluating `e` has no side effects.
pub fn is_pure(e: &Expr) -> bool {
    let mut check = PurityCheck { pure: true };
    check.visit_expr(e);
    check.pure
}

/// The `__root` placeholder loop name that anchors injection.
pub const ROOT_LOOP_NAME: &str = "__root";

/// The dummy outermost dimension appended to every stage's dim list.
pub const OUTERMOST_DIM: &str = "__outermost";

/// Wraps a statement in the placeholder loop that `lower` later peels off.
pub fn root_loop(body: Stmt) -> Stmt {
    Stmt::serial_for(ROOT_LOOP_NAME, Expr::i32(0), Expr::i32(1), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwrap_tags_strips_nested_likelies() {
        let x = Expr::var_i32("x");
        let tagged = likely(likely_if_innermost(lt(x.clone(), Expr::i32(4))));
        let stripped = unwrap_tags(&tagged);
        assert_eq!(stripped, lt(x, Expr::i32(4)));
    }

    #[test]
    fn as_likely_tag_matches_only_tags() {
        let c = lt(Expr::var_i32("x"), Expr::i32(4));
        assert!(as_likely_tag(&c).is_none());
        let likely_c = likely(c.clone());
        let (name, inner) = as_likely_tag(&likely_c).unwrap();
        assert_eq!(name, intrinsic::LIKELY);
        assert_eq!(inner, &c);
    }

    #[test]
    fn purity_sees_through_wrappers() {
        let pure = likely(Expr::var_i32("x") + 1);
        assert!(is_pure(&pure));
        let impure = error_call("halide_error_bad_fold", vec![Expr::string("f")]);
        assert!(!is_pure(&impure));
        assert!(!is_pure(&(Expr::var_i32("x") + impure)));
    }

    #[test]
    fn clamp_shape() {
        let e = clamp(Expr::var_i32("x"), Expr::i32(0), Expr::i32(7));
        match e.kind() {
            ExprKind::Binary { op, .. } => assert_eq!(*op, BinaryOp::Max),
            other => panic!("expected Binary, got {other:?}"),
        }
    }
}
