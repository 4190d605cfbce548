//! Elides stores of `undef` values.
//!
//! Definedness propagates bottom-up: an expression containing `undef`
//! (outside a select arm) is itself undefined, and a statement whose
//! meaning depends on an undefined expression disappears. A `Select` with
//! exactly one undefined side turns into a predicate on the enclosing
//! store instead.

use rasterlang_core::expr::{Expr, ExprKind};
use rasterlang_core::intrinsic;
use rasterlang_core::scope::Scope;
use rasterlang_core::stmt::{Range, Stmt, StmtKind};
use rasterlang_core::substitute::substitute;

struct RemoveUndef {
    dead_vars: Scope<()>,
    predicate: Option<Expr>,
}

impl RemoveUndef {
    fn mutate_expr(&mut self, e: &Expr) -> Option<Expr> {
        match e.kind() {
            ExprKind::IntImm { .. }
            | ExprKind::UIntImm { .. }
            | ExprKind::FloatImm { .. }
            | ExprKind::StringImm { .. } => Some(e.clone()),
            ExprKind::Variable { name, .. } => {
                if self.dead_vars.contains(name) {
                    None
                } else {
                    Some(e.clone())
                }
            }
            ExprKind::Cast { value } => {
                let v = self.mutate_expr(value)?;
                if v.same_as(value) {
                    Some(e.clone())
                } else {
                    Some(Expr::cast(e.ty(), v))
                }
            }
            ExprKind::Reinterpret { value } => {
                let v = self.mutate_expr(value)?;
                if v.same_as(value) {
                    Some(e.clone())
                } else {
                    Some(Expr::reinterpret(e.ty(), v))
                }
            }
            ExprKind::Binary { op, a, b } => {
                let na = self.mutate_expr(a)?;
                let nb = self.mutate_expr(b)?;
                if na.same_as(a) && nb.same_as(b) {
                    Some(e.clone())
                } else {
                    Some(Expr::binary(*op, na, nb))
                }
            }
            ExprKind::Cmp { op, a, b } => {
                let na = self.mutate_expr(a)?;
                let nb = self.mutate_expr(b)?;
                if na.same_as(a) && nb.same_as(b) {
                    Some(e.clone())
                } else {
                    Some(Expr::cmp(*op, na, nb))
                }
            }
            ExprKind::And { a, b } => {
                let na = self.mutate_expr(a)?;
                let nb = self.mutate_expr(b)?;
                Some(if na.same_as(a) && nb.same_as(b) {
                    e.clone()
                } else {
                    Expr::and(na, nb)
                })
            }
            ExprKind::Or { a, b } => {
                let na = self.mutate_expr(a)?;
                let nb = self.mutate_expr(b)?;
                Some(if na.same_as(a) && nb.same_as(b) {
                    e.clone()
                } else {
                    Expr::or(na, nb)
                })
            }
            ExprKind::Not { a } => {
                let na = self.mutate_expr(a)?;
                Some(if na.same_as(a) { e.clone() } else { Expr::not(na) })
            }
            ExprKind::Select { condition, true_value, false_value } => {
                let cond = self.mutate_expr(condition)?;
                let t = self.mutate_expr(true_value);
                let f = self.mutate_expr(false_value);
                match (t, f) {
                    (None, None) => None,
                    (Some(t), Some(f)) => {
                        if cond.same_as(condition)
                            && t.same_as(true_value)
                            && f.same_as(false_value)
                        {
                            Some(e.clone())
                        } else {
                            Some(Expr::select(cond, t, f))
                        }
                    }
                    // One defined side: the store becomes conditional.
                    (Some(t), None) => {
                        self.push_predicate(cond);
                        Some(t)
                    }
                    (None, Some(f)) => {
                        self.push_predicate(Expr::not(cond));
                        Some(f)
                    }
                }
            }
            ExprKind::Load { name, index, predicate, alignment, binding } => {
                let np = self.mutate_expr(predicate)?;
                let ni = self.mutate_expr(index)?;
                if np.same_as(predicate) && ni.same_as(index) {
                    Some(e.clone())
                } else {
                    Some(Expr::load(e.ty(), name.clone(), ni, np, *alignment, binding.clone()))
                }
            }
            ExprKind::Ramp { base, stride, lanes } => {
                let nb = self.mutate_expr(base)?;
                let ns = self.mutate_expr(stride)?;
                if nb.same_as(base) && ns.same_as(stride) {
                    Some(e.clone())
                } else {
                    Some(Expr::ramp(nb, ns, *lanes))
                }
            }
            ExprKind::Broadcast { value, lanes } => {
                let nv = self.mutate_expr(value)?;
                if nv.same_as(value) {
                    Some(e.clone())
                } else {
                    Some(Expr::broadcast(nv, *lanes))
                }
            }
            ExprKind::Shuffle { vectors, indices } => {
                let mut changed = false;
                let mut out = Vec::with_capacity(vectors.len());
                for v in vectors {
                    let nv = self.mutate_expr(v)?;
                    changed |= !nv.same_as(v);
                    out.push(nv);
                }
                if changed {
                    Some(Expr::shuffle(out, indices.clone()))
                } else {
                    Some(e.clone())
                }
            }
            ExprKind::VectorReduce { op, value } => {
                let nv = self.mutate_expr(value)?;
                if nv.same_as(value) {
                    Some(e.clone())
                } else {
                    Some(Expr::vector_reduce(*op, nv, e.lanes()))
                }
            }
            ExprKind::Let { name, value, body } => {
                let value = self.mutate_expr(value);
                if value.is_none() {
                    self.dead_vars.push(name.clone(), ());
                }
                let body = self.mutate_expr(body);
                if value.is_none() {
                    self.dead_vars.pop(name);
                }
                let body = body?;
                match value {
                    None => Some(body),
                    Some(value) => {
                        if value.same_as(get_let_value(e)) && body.same_as(get_let_body(e)) {
                            Some(e.clone())
                        } else {
                            if let Some(p) = &self.predicate {
                                self.predicate =
                                    Some(substitute(name, value.clone(), p));
                            }
                            Some(Expr::let_in(name.clone(), value, body))
                        }
                    }
                }
            }
            ExprKind::Call { name, args, kind, value_index } => {
                if e.is_intrinsic(intrinsic::UNDEF) {
                    return None;
                }
                let mut changed = false;
                let mut new_args = Vec::with_capacity(args.len());
                for a in args {
                    let na = self.mutate_expr(a)?;
                    changed |= !na.same_as(a);
                    new_args.push(na);
                }
                if changed {
                    Some(Expr::call_indexed(
                        e.ty(),
                        name.clone(),
                        new_args,
                        *kind,
                        *value_index,
                    ))
                } else {
                    Some(e.clone())
                }
            }
        }
    }

    fn push_predicate(&mut self, cond: Expr) {
        self.predicate = Some(match self.predicate.take() {
            Some(p) => Expr::and(p, cond),
            None => cond,
        });
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Option<Stmt> {
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => {
                let value = self.mutate_expr(value);
                if value.is_none() {
                    self.dead_vars.push(name.clone(), ());
                }
                let body = self.mutate_stmt(body);
                if value.is_none() {
                    self.dead_vars.pop(name);
                }
                let body = body?;
                match value {
                    None => Some(body),
                    Some(value) => Some(Stmt::let_stmt(name.clone(), value, body)),
                }
            }
            StmtKind::AssertStmt { condition, error } => {
                let c = self.mutate_expr(condition)?;
                Some(if c.same_as(condition) {
                    s.clone()
                } else {
                    Stmt::assert_stmt(c, error.clone())
                })
            }
            StmtKind::ProducerConsumer { name, is_producer, body } => {
                let b = self.mutate_stmt(body)?;
                Some(if b.same_as(body) {
                    s.clone()
                } else if *is_producer {
                    Stmt::producer(name.clone(), b)
                } else {
                    Stmt::consumer(name.clone(), b)
                })
            }
            StmtKind::For { name, min, extent, for_type, device_api, body } => {
                let nmin = self.mutate_expr(min)?;
                let next = self.mutate_expr(extent)?;
                let nbody = self.mutate_stmt(body)?;
                Some(
                    if nmin.same_as(min) && next.same_as(extent) && nbody.same_as(body) {
                        s.clone()
                    } else {
                        Stmt::for_loop(
                            name.clone(),
                            nmin,
                            next,
                            *for_type,
                            *device_api,
                            nbody,
                        )
                    },
                )
            }
            StmtKind::Store { name, value, index, predicate, alignment, binding } => {
                self.predicate = None;
                let nv = self.mutate_expr(value)?;
                let ni = self.mutate_expr(index)?;
                let np = self.mutate_expr(predicate)?;
                match self.predicate.take() {
                    Some(p) => Some(Stmt::if_then_else(
                        p,
                        Stmt::store(name.clone(), nv, ni, np, *alignment, binding.clone()),
                        None,
                    )),
                    None => Some(
                        if nv.same_as(value) && ni.same_as(index) && np.same_as(predicate) {
                            s.clone()
                        } else {
                            Stmt::store(
                                name.clone(),
                                nv,
                                ni,
                                np,
                                *alignment,
                                binding.clone(),
                            )
                        },
                    ),
                }
            }
            StmtKind::Provide { name, values, args, predicate } => {
                self.predicate = None;
                let mut changed = false;
                let mut new_values = Vec::with_capacity(values.len());
                for v in values {
                    let nv = self.mutate_expr(v)?;
                    changed |= !nv.same_as(v);
                    new_values.push(nv);
                }
                let mut new_args = Vec::with_capacity(args.len());
                for a in args {
                    let na = self.mutate_expr(a)?;
                    changed |= !na.same_as(a);
                    new_args.push(na);
                }
                let np = self.mutate_expr(predicate)?;
                changed |= !np.same_as(predicate);
                match self.predicate.take() {
                    Some(p) => Some(Stmt::if_then_else(
                        p,
                        Stmt::provide(name.clone(), new_values, new_args, np),
                        None,
                    )),
                    None => Some(if changed {
                        Stmt::provide(name.clone(), new_values, new_args, np)
                    } else {
                        s.clone()
                    }),
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
                let mut new_extents = Vec::with_capacity(extents.len());
                for x in extents {
                    new_extents.push(self.mutate_expr(x)?);
                }
                let nc = self.mutate_expr(condition)?;
                let nb = self.mutate_stmt(body)?;
                Some(Stmt::allocate(
                    name.clone(),
                    *ty,
                    *memory_type,
                    new_extents,
                    nc,
                    nb,
                    new_expr.clone(),
                    free_function.clone(),
                    *padding,
                ))
            }
            StmtKind::Free { .. } => Some(s.clone()),
            StmtKind::Realize { name, types, memory_type, bounds, condition, body } => {
                let mut new_bounds = Vec::with_capacity(bounds.len());
                for r in bounds {
                    new_bounds.push(Range::new(
                        self.mutate_expr(&r.min)?,
                        self.mutate_expr(&r.extent)?,
                    ));
                }
                let nc = self.mutate_expr(condition)?;
                let nb = self.mutate_stmt(body)?;
                Some(Stmt::realize(
                    name.clone(),
                    types.clone(),
                    *memory_type,
                    new_bounds,
                    nc,
                    nb,
                ))
            }
            StmtKind::Block { first, rest } => {
                let f = self.mutate_stmt(first);
                let r = self.mutate_stmt(rest);
                match (f, r) {
                    (None, r) => r,
                    (f, None) => f,
                    (Some(f), Some(r)) => {
                        Some(if f.same_as(first) && r.same_as(rest) {
                            s.clone()
                        } else {
                            Stmt::block(f, r)
                        })
                    }
                }
            }
            StmtKind::Fork { first, rest } => {
                let f = self.mutate_stmt(first);
                let r = self.mutate_stmt(rest);
                match (f, r) {
                    (None, r) => r,
                    (f, None) => f,
                    (Some(f), Some(r)) => Some(Stmt::fork(f, r)),
                }
            }
            StmtKind::IfThenElse { condition, then_case, else_case } => {
                let cond = self.mutate_expr(condition)?;
                let t = self.mutate_stmt(then_case);
                let e = else_case.as_ref().and_then(|e| self.mutate_stmt(e));
                match (t, e) {
                    (None, None) => None,
                    (Some(t), e) => Some(Stmt::if_then_else(cond, t, e)),
                    (None, Some(e)) => {
                        Some(Stmt::if_then_else(Expr::not(cond), e, None))
                    }
                }
            }
            StmtKind::Evaluate { value } => {
                let v = self.mutate_expr(value)?;
                Some(if v.same_as(value) { s.clone() } else { Stmt::evaluate(v) })
            }
            StmtKind::Prefetch { name, types, bounds, directive, condition, body } => {
                let nb = self.mutate_stmt(body)?;
                Some(Stmt::prefetch(
                    name.clone(),
                    types.clone(),
                    bounds.clone(),
                    directive.clone(),
                    condition.clone(),
                    nb,
                ))
            }
            StmtKind::Atomic { producer_name, mutex_name, body } => {
                let nb = self.mutate_stmt(body)?;
                Some(Stmt::atomic(producer_name.clone(), mutex_name.clone(), nb))
            }
            StmtKind::Acquire { semaphore, count, body } => {
                let ns = self.mutate_expr(semaphore)?;
                let ncount = self.mutate_expr(count)?;
                let nb = self.mutate_stmt(body)?;
                Some(Stmt::acquire(ns, ncount, nb))
            }
        }
    }
}

fn get_let_value(e: &Expr) -> &Expr {
    match e.kind() {
        ExprKind::Let { value, .. } => value,
        _ => unreachable!(),
    }
}

fn get_let_body(e: &Expr) -> &Expr {
    match e.kind() {
        ExprKind::Let { body, .. } => body,
        _ => unreachable!(),
    }
}

/// Removes all statements that store undefined values.
pub fn remove_undef(s: &Stmt) -> Stmt {
    let mut pass = RemoveUndef { dead_vars: Scope::new(), predicate: None };
    pass.mutate_stmt(s).unwrap_or_else(Stmt::no_op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::expr::{ModulusRemainder, VarBinding};
    use rasterlang_core::ops::{self, lt};
    use rasterlang_core::types::Type;

    fn store(value: Expr) -> Stmt {
        Stmt::store(
            "buf",
            value,
            Expr::var_i32("i"),
            Expr::const_true(),
            ModulusRemainder::unknown(),
            VarBinding::Free,
        )
    }

    #[test]
    fn store_of_undef_disappears() {
        let s = store(ops::undef(Type::int(32)));
        assert!(remove_undef(&s).is_no_op());
    }

    #[test]
    fn one_sided_select_becomes_conditional_store() {
        let x = Expr::var_i32("i");
        let cond = lt(x.clone(), Expr::i32(4));
        let s = store(Expr::select(cond.clone(), x.clone(), ops::undef(Type::int(32))));
        let out = remove_undef(&s);
        match out.kind() {
            StmtKind::IfThenElse { condition, then_case, else_case } => {
                assert_eq!(condition, &cond);
                assert!(else_case.is_none());
                assert!(matches!(then_case.kind(), StmtKind::Store { .. }));
            }
            other => panic!("expected a conditional store, got {other:?}"),
        }
    }

    #[test]
    fn block_collapses_around_dead_stores() {
        let live = store(Expr::i32(1));
        let dead = store(ops::undef(Type::int(32)));
        let s = Stmt::block(dead, live.clone());
        let out = remove_undef(&s);
        assert_eq!(out, live);
    }

    #[test]
    fn let_of_undef_poisons_uses() {
        let body = store(Expr::var_i32("t"));
        let s = Stmt::let_stmt("t", ops::undef(Type::int(32)), body);
        assert!(remove_undef(&s).is_no_op());
    }

    #[test]
    fn defined_code_is_untouched() {
        let s = Stmt::serial_for("i", Expr::i32(0), Expr::i32(4), store(Expr::var_i32("i")));
        let out = remove_undef(&s);
        assert!(out.same_as(&s));
    }
}
