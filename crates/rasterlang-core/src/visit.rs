//! Read-only traversal over the IR.
//!
//! Implementations override [`Visitor::visit_expr`] / [`Visitor::visit_stmt`],
//! match the variants they care about, and delegate everything else to
//! [`walk_expr`] / [`walk_stmt`], which recurse into children in evaluation
//! order.

use crate::expr::{Expr, ExprKind};
use crate::stmt::{Stmt, StmtKind};

pub trait Visitor {
    fn visit_expr(&mut self, e: &Expr) {
        walk_expr(self, e);
    }

    fn visit_stmt(&mut self, s: &Stmt) {
        walk_stmt(self, s);
    }
}

/// Default recursion into an expression's children.
pub fn walk_expr<V: Visitor + ?Sized>(v: &mut V, e: &Expr) {
    match e.kind() {
        ExprKind::IntImm { .. }
        | ExprKind::UIntImm { .. }
        | ExprKind::FloatImm { .. }
        | ExprKind::StringImm { .. }
        | ExprKind::Variable { .. } => {}
        ExprKind::Cast { value } | ExprKind::Reinterpret { value } => v.visit_expr(value),
        ExprKind::Binary { a, b, .. }
        | ExprKind::Cmp { a, b, .. }
        | ExprKind::And { a, b }
        | ExprKind::Or { a, b } => {
            v.visit_expr(a);
            v.visit_expr(b);
        }
        ExprKind::Not { a } => v.visit_expr(a),
        ExprKind::Select { condition, true_value, false_value } => {
            v.visit_expr(condition);
            v.visit_expr(true_value);
            v.visit_expr(false_value);
        }
        ExprKind::Load { index, predicate, .. } => {
            v.visit_expr(predicate);
            v.visit_expr(index);
        }
        ExprKind::Ramp { base, stride, .. } => {
            v.visit_expr(base);
            v.visit_expr(stride);
        }
        ExprKind::Broadcast { value, .. } => v.visit_expr(value),
        ExprKind::Shuffle { vectors, .. } => {
            for vec in vectors {
                v.visit_expr(vec);
            }
        }
        ExprKind::VectorReduce { value, .. } => v.visit_expr(value),
        ExprKind::Let { value, body, .. } => {
            v.visit_expr(value);
            v.visit_expr(body);
        }
        ExprKind::Call { args, .. } => {
            for arg in args {
                v.visit_expr(arg);
            }
        }
    }
}

/// Default recursion into a statement's children.
pub fn walk_stmt<V: Visitor + ?Sized>(v: &mut V, s: &Stmt) {
    match s.kind() {
        StmtKind::LetStmt { value, body, .. } => {
            v.visit_expr(value);
            v.visit_stmt(body);
        }
        StmtKind::AssertStmt { condition, error } => {
            v.visit_expr(condition);
            v.visit_expr(error);
        }
        StmtKind::ProducerConsumer { body, .. } => v.visit_stmt(body),
        StmtKind::For { min, extent, body, .. } => {
            v.visit_expr(min);
            v.visit_expr(extent);
            v.visit_stmt(body);
        }
        StmtKind::Store { value, index, predicate, .. } => {
            v.visit_expr(predicate);
            v.visit_expr(value);
            v.visit_expr(index);
        }
        StmtKind::Provide { values, args, predicate, .. } => {
            v.visit_expr(predicate);
            for value in values {
                v.visit_expr(value);
            }
            for arg in args {
                v.visit_expr(arg);
            }
        }
        StmtKind::Allocate { extents, condition, body, new_expr, .. } => {
            for extent in extents {
                v.visit_expr(extent);
            }
            v.visit_expr(condition);
            if let Some(e) = new_expr {
                v.visit_expr(e);
            }
            v.visit_stmt(body);
        }
        StmtKind::Free { .. } => {}
        StmtKind::Realize { bounds, condition, body, .. } => {
            for range in bounds {
                v.visit_expr(&range.min);
                v.visit_expr(&range.extent);
            }
            v.visit_expr(condition);
            v.visit_stmt(body);
        }
        StmtKind::Block { first, rest } | StmtKind::Fork { first, rest } => {
            v.visit_stmt(first);
            v.visit_stmt(rest);
        }
        StmtKind::IfThenElse { condition, then_case, else_case } => {
            v.visit_expr(condition);
            v.visit_stmt(then_case);
            if let Some(e) = else_case {
                v.visit_stmt(e);
            }
        }
        StmtKind::Evaluate { value } => v.visit_expr(value),
        StmtKind::Prefetch { bounds, condition, body, directive, .. } => {
            for range in bounds {
                v.visit_expr(&range.min);
                v.visit_expr(&range.extent);
            }
            v.visit_expr(&directive.offset);
            v.visit_expr(condition);
            v.visit_stmt(body);
        }
        StmtKind::Atomic { body, .. } => v.visit_stmt(body),
        StmtKind::Acquire { semaphore, count, body } => {
            v.visit_expr(semaphore);
            v.visit_expr(count);
            v.visit_stmt(body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::VarBinding;
    use crate::stmt::{DeviceApi, ForType};

    struct CountVars {
        count: usize,
    }

    impl Visitor for CountVars {
        fn visit_expr(&mut self, e: &Expr) {
            if matches!(e.kind(), ExprKind::Variable { .. }) {
                self.count += 1;
            }
            walk_expr(self, e);
        }
    }

    #[test]
    fn visits_all_variables() {
        let x = Expr::var_i32("x");
        let y = Expr::var_i32("y");
        let body = Stmt::provide(
            "f",
            vec![x.clone() + y.clone()],
            vec![x.clone(), y.clone()],
            Expr::const_true(),
        );
        let s = Stmt::for_loop(
            "x",
            Expr::i32(0),
            Expr::var_i32("n"),
            ForType::Serial,
            DeviceApi::None,
            body,
        );
        let mut counter = CountVars { count: 0 };
        counter.visit_stmt(&s);
        // x+y, plus x and y as args, plus n in the loop extent.
        assert_eq!(counter.count, 5);
    }

    #[test]
    fn visits_load_index_and_predicate() {
        let l = Expr::load_unpredicated(
            crate::types::Type::int(32),
            "buf",
            Expr::var_i32("i"),
            VarBinding::Free,
        );
        let mut counter = CountVars { count: 0 };
        counter.visit_expr(&l);
        assert_eq!(counter.count, 1);
    }
}
