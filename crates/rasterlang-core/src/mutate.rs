//! Rewriting traversal over the IR.
//!
//! The default [`walk_expr`] / [`walk_stmt`] recursion rebuilds a node only
//! when some child actually changed; if every child comes back unchanged
//! under [`Expr::same_as`], the original handle is returned, so untouched
//! subtrees stay shared. Implementations override the hook methods, handle
//! the variants they care about, and delegate the rest.

use crate::expr::{Expr, ExprKind};
use crate::stmt::{Range, Stmt, StmtKind};

pub trait Mutator {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        walk_expr(self, e)
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        walk_stmt(self, s)
    }
}

fn mutate_all<M: Mutator + ?Sized>(m: &mut M, exprs: &[Expr]) -> (Vec<Expr>, bool) {
    let mut changed = false;
    let out: Vec<Expr> = exprs
        .iter()
        .map(|e| {
            let new = m.mutate_expr(e);
            changed |= !new.same_as(e);
            new
        })
        .collect();
    (out, changed)
}

fn mutate_ranges<M: Mutator + ?Sized>(m: &mut M, ranges: &[Range]) -> (Vec<Range>, bool) {
    let mut changed = false;
    let out: Vec<Range> = ranges
        .iter()
        .map(|r| {
            let min = m.mutate_expr(&r.min);
            let extent = m.mutate_expr(&r.extent);
            changed |= !min.same_as(&r.min) || !extent.same_as(&r.extent);
            Range { min, extent }
        })
        .collect();
    (out, changed)
}

/// Default rebuild of an expression, preserving identity when unchanged.
pub fn walk_expr<M: Mutator + ?Sized>(m: &mut M, e: &Expr) -> Expr {
    match e.kind() {
        ExprKind::IntImm { .. }
        | ExprKind::UIntImm { .. }
        | ExprKind::FloatImm { .. }
        | ExprKind::StringImm { .. }
        | ExprKind::Variable { .. } => e.clone(),
        ExprKind::Cast { value } => {
            let new = m.mutate_expr(value);
            if new.same_as(value) {
                e.clone()
            } else {
                Expr::cast(e.ty().with_lanes(new.lanes()), new)
            }
        }
        ExprKind::Reinterpret { value } => {
            let new = m.mutate_expr(value);
            if new.same_as(value) {
                e.clone()
            } else {
                Expr::reinterpret(e.ty().with_lanes(new.lanes()), new)
            }
        }
        ExprKind::Binary { op, a, b } => {
            let na = m.mutate_expr(a);
            let nb = m.mutate_expr(b);
            if na.same_as(a) && nb.same_as(b) {
                e.clone()
            } else {
                Expr::binary(*op, na, nb)
            }
        }
        ExprKind::Cmp { op, a, b } => {
            let na = m.mutate_expr(a);
            let nb = m.mutate_expr(b);
            if na.same_as(a) && nb.same_as(b) {
                e.clone()
            } else {
                Expr::cmp(*op, na, nb)
            }
        }
        ExprKind::And { a, b } => {
            let na = m.mutate_expr(a);
            let nb = m.mutate_expr(b);
            if na.same_as(a) && nb.same_as(b) {
                e.clone()
            } else {
                Expr::and(na, nb)
            }
        }
        ExprKind::Or { a, b } => {
            let na = m.mutate_expr(a);
            let nb = m.mutate_expr(b);
            if na.same_as(a) && nb.same_as(b) {
                e.clone()
            } else {
                Expr::or(na, nb)
            }
        }
        ExprKind::Not { a } => {
            let na = m.mutate_expr(a);
            if na.same_as(a) {
                e.clone()
            } else {
                Expr::not(na)
            }
        }
        ExprKind::Select { condition, true_value, false_value } => {
            let nc = m.mutate_expr(condition);
            let nt = m.mutate_expr(true_value);
            let nf = m.mutate_expr(false_value);
            if nc.same_as(condition) && nt.same_as(true_value) && nf.same_as(false_value) {
                e.clone()
            } else {
                Expr::select(nc, nt, nf)
            }
        }
        ExprKind::Load { name, index, predicate, alignment, binding } => {
            let np = m.mutate_expr(predicate);
            let ni = m.mutate_expr(index);
            if np.same_as(predicate) && ni.same_as(index) {
                e.clone()
            } else {
                let ty = e.ty().with_lanes(ni.lanes());
                Expr::load(ty, name.clone(), ni, np, *alignment, binding.clone())
            }
        }
        ExprKind::Ramp { base, stride, lanes } => {
            let nb = m.mutate_expr(base);
            let ns = m.mutate_expr(stride);
            if nb.same_as(base) && ns.same_as(stride) {
                e.clone()
            } else {
                Expr::ramp(nb, ns, *lanes)
            }
        }
        ExprKind::Broadcast { value, lanes } => {
            let nv = m.mutate_expr(value);
            if nv.same_as(value) {
                e.clone()
            } else {
                Expr::broadcast(nv, *lanes)
            }
        }
        ExprKind::Shuffle { vectors, indices } => {
            let (nv, changed) = mutate_all(m, vectors);
            if changed {
                Expr::shuffle(nv, indices.clone())
            } else {
                e.clone()
            }
        }
        ExprKind::VectorReduce { op, value } => {
            let nv = m.mutate_expr(value);
            if nv.same_as(value) {
                e.clone()
            } else {
                Expr::vector_reduce(*op, nv, e.lanes())
            }
        }
        ExprKind::Let { name, value, body } => {
            let nv = m.mutate_expr(value);
            let nb = m.mutate_expr(body);
            if nv.same_as(value) && nb.same_as(body) {
                e.clone()
            } else {
                Expr::let_in(name.clone(), nv, nb)
            }
        }
        ExprKind::Call { name, args, kind, value_index } => {
            let (new_args, changed) = mutate_all(m, args);
            if changed {
                Expr::call_indexed(e.ty(), name.clone(), new_args, *kind, *value_index)
            } else {
                e.clone()
            }
        }
    }
}

/// Default rebuild of a statement, preserving identity when unchanged.
pub fn walk_stmt<M: Mutator + ?Sized>(m: &mut M, s: &Stmt) -> Stmt {
    match s.kind() {
        StmtKind::LetStmt { name, value, body } => {
            let nv = m.mutate_expr(value);
            let nb = m.mutate_stmt(body);
            if nv.same_as(value) && nb.same_as(body) {
                s.clone()
            } else {
                Stmt::let_stmt(name.clone(), nv, nb)
            }
        }
        StmtKind::AssertStmt { condition, error } => {
            let nc = m.mutate_expr(condition);
            let ne = m.mutate_expr(error);
            if nc.same_as(condition) && ne.same_as(error) {
                s.clone()
            } else {
                Stmt::assert_stmt(nc, ne)
            }
        }
        StmtKind::ProducerConsumer { name, is_producer, body } => {
            let nb = m.mutate_stmt(body);
            if nb.same_as(body) {
                s.clone()
            } else if *is_producer {
                Stmt::producer(name.clone(), nb)
            } else {
                Stmt::consumer(name.clone(), nb)
            }
        }
        StmtKind::For { name, min, extent, for_type, device_api, body } => {
            let nmin = m.mutate_expr(min);
            let next = m.mutate_expr(extent);
            let nb = m.mutate_stmt(body);
            if nmin.same_as(min) && next.same_as(extent) && nb.same_as(body) {
                s.clone()
            } else {
                Stmt::for_loop(name.clone(), nmin, next, *for_type, *device_api, nb)
            }
        }
        StmtKind::Store { name, value, index, predicate, alignment, binding } => {
            let np = m.mutate_expr(predicate);
            let nv = m.mutate_expr(value);
            let ni = m.mutate_expr(index);
            if np.same_as(predicate) && nv.same_as(value) && ni.same_as(index) {
                s.clone()
            } else {
                Stmt::store(name.clone(), nv, ni, np, *alignment, binding.clone())
            }
        }
        StmtKind::Provide { name, values, args, predicate } => {
            let np = m.mutate_expr(predicate);
            let (nv, values_changed) = mutate_all(m, values);
            let (na, args_changed) = mutate_all(m, args);
            if !values_changed && !args_changed && np.same_as(predicate) {
                s.clone()
            } else {
                Stmt::provide(name.clone(), nv, na, np)
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
            let (ne, extents_changed) = mutate_all(m, extents);
            let nc = m.mutate_expr(condition);
            let nn = new_expr.as_ref().map(|e| m.mutate_expr(e));
            let nb = m.mutate_stmt(body);
            let new_expr_changed = match (&nn, new_expr) {
                (Some(a), Some(b)) => !a.same_as(b),
                _ => false,
            };
            if !extents_changed
                && nc.same_as(condition)
                && !new_expr_changed
                && nb.same_as(body)
            {
                s.clone()
            } else {
                Stmt::allocate(
                    name.clone(),
                    *ty,
                    *memory_type,
                    ne,
                    nc,
                    nb,
                    nn,
                    free_function.clone(),
                    *padding,
                )
            }
        }
        StmtKind::Free { .. } => s.clone(),
        StmtKind::Realize { name, types, memory_type, bounds, condition, body } => {
            let (nb, bounds_changed) = mutate_ranges(m, bounds);
            let nc = m.mutate_expr(condition);
            let nbody = m.mutate_stmt(body);
            if !bounds_changed && nc.same_as(condition) && nbody.same_as(body) {
                s.clone()
            } else {
                Stmt::realize(name.clone(), types.clone(), *memory_type, nb, nc, nbody)
            }
        }
        StmtKind::Block { first, rest } => {
            let nf = m.mutate_stmt(first);
            let nr = m.mutate_stmt(rest);
            if nf.same_as(first) && nr.same_as(rest) {
                s.clone()
            } else {
                Stmt::block(nf, nr)
            }
        }
        StmtKind::Fork { first, rest } => {
            let nf = m.mutate_stmt(first);
            let nr = m.mutate_stmt(rest);
            if nf.same_as(first) && nr.same_as(rest) {
                s.clone()
            } else {
                Stmt::fork(nf, nr)
            }
        }
        StmtKind::IfThenElse { condition, then_case, else_case } => {
            let nc = m.mutate_expr(condition);
            let nt = m.mutate_stmt(then_case);
            let ne = else_case.as_ref().map(|e| m.mutate_stmt(e));
            let else_changed = match (&ne, else_case) {
                (Some(a), Some(b)) => !a.same_as(b),
                _ => false,
            };
            if nc.same_as(condition) && nt.same_as(then_case) && !else_changed {
                s.clone()
            } else {
                Stmt::if_then_else(nc, nt, ne)
            }
        }
        StmtKind::Evaluate { value } => {
            let nv = m.mutate_expr(value);
            if nv.same_as(value) {
                s.clone()
            } else {
                Stmt::evaluate(nv)
            }
        }
        StmtKind::Prefetch { name, types, bounds, directive, condition, body } => {
            let (nb, bounds_changed) = mutate_ranges(m, bounds);
            let noffset = m.mutate_expr(&directive.offset);
            let nc = m.mutate_expr(condition);
            let nbody = m.mutate_stmt(body);
            if !bounds_changed
                && noffset.same_as(&directive.offset)
                && nc.same_as(condition)
                && nbody.same_as(body)
            {
                s.clone()
            } else {
                let mut nd = directive.clone();
                nd.offset = noffset;
                Stmt::prefetch(name.clone(), types.clone(), nb, nd, nc, nbody)
            }
        }
        StmtKind::Atomic { producer_name, mutex_name, body } => {
            let nb = m.mutate_stmt(body);
            if nb.same_as(body) {
                s.clone()
            } else {
                Stmt::atomic(producer_name.clone(), mutex_name.clone(), nb)
            }
        }
        StmtKind::Acquire { semaphore, count, body } => {
            let ns = m.mutate_expr(semaphore);
            let ncount = m.mutate_expr(count);
            let nb = m.mutate_stmt(body);
            if ns.same_as(semaphore) && ncount.same_as(count) && nb.same_as(body) {
                s.clone()
            } else {
                Stmt::acquire(ns, ncount, nb)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stmt::{DeviceApi, ForType};

    /// Replaces every int immediate with its value plus one.
    struct BumpInts;

    impl Mutator for BumpInts {
        fn mutate_expr(&mut self, e: &Expr) -> Expr {
            match e.kind() {
                ExprKind::IntImm { value } => Expr::int_of(e.ty(), value + 1),
                _ => walk_expr(self, e),
            }
        }
    }

    /// A mutator that touches nothing.
    struct Identity;

    impl Mutator for Identity {}

    #[test]
    fn identity_mutation_preserves_pointers() {
        let x = Expr::var_i32("x");
        let e = (x.clone() + 1) * x;
        let s = Stmt::for_loop(
            "i",
            Expr::i32(0),
            Expr::i32(8),
            ForType::Serial,
            DeviceApi::None,
            Stmt::evaluate(e),
        );
        let out = Identity.mutate_stmt(&s);
        assert!(out.same_as(&s));
    }

    #[test]
    fn changed_child_rebuilds_spine_only() {
        let x = Expr::var_i32("x");
        let left = x.clone() + 1;
        let right = x.clone() * x;
        let e = Expr::binary(crate::expr::BinaryOp::Add, left, right.clone());
        let out = BumpInts.mutate_expr(&e);
        assert!(!out.same_as(&e));
        match out.kind() {
            ExprKind::Binary { b, .. } => {
                // The untouched right subtree is shared, not copied.
                assert!(b.same_as(&right));
            }
            other => panic!("expected Binary, got {other:?}"),
        }
    }

    #[test]
    fn bump_reaches_loop_bounds() {
        let s = Stmt::serial_for("i", Expr::i32(0), Expr::i32(8), Stmt::no_op());
        let out = BumpInts.mutate_stmt(&s);
        match out.kind() {
            StmtKind::For { min, extent, .. } => {
                assert_eq!(min.as_const_int(), Some(1));
                assert_eq!(extent.as_const_int(), Some(9));
            }
            other => panic!("expected For, got {other:?}"),
        }
    }
}
