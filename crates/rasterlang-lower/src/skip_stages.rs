//! Static gating of realizations whose value may never be read.
//!
//! For each realization, a predicate over the enclosing loop variables is
//! computed that characterizes whether anything inside the consume tree
//! actually reads the buffer. When the simplified predicate is not the
//! constant true, production is wrapped in a conditional on a
//! `<name>.needed` binding.

use tracing::debug;

use rasterlang_analysis::simplify::{is_const_one, simplify};
use rasterlang_core::expr::{CallKind, Expr, ExprKind};
use rasterlang_core::mutate::{walk_stmt as walk_stmt_mut, Mutator};
use rasterlang_core::scope::Scope;
use rasterlang_core::stmt::{Stmt, StmtKind};
use rasterlang_core::substitute::substitute;
use rasterlang_core::types::Type;
use rasterlang_core::visit::{walk_expr, walk_stmt, Visitor};

struct PredicateFinder<'a> {
    buffer: &'a str,
    predicate: Expr,
    varies: bool,
    varying: Scope<()>,
}

impl PredicateFinder<'_> {
    fn visit_let(&mut self, name: &str, value: &Expr, body_visit: impl FnOnce(&mut Self)) {
        let old_varies = self.varies;
        self.varies = false;
        self.visit_expr(value);
        let value_varies = self.varies;
        self.varies |= old_varies;
        if value_varies {
            self.varying.push(name.to_string(), ());
        }
        body_visit(self);
        if value_varies {
            self.varying.pop(name);
        }
        self.predicate = substitute(name, value.clone(), &self.predicate);
    }

    fn visit_conditional(
        &mut self,
        condition: &Expr,
        true_case: impl FnOnce(&mut Self),
        false_case: Option<impl FnOnce(&mut Self)>,
    ) {
        let old_predicate = self.predicate.clone();

        self.predicate = Expr::const_false();
        true_case(self);
        let true_predicate = self.predicate.clone();

        self.predicate = Expr::const_false();
        if let Some(f) = false_case {
            f(self);
        }
        let false_predicate = self.predicate.clone();

        let old_varies = self.varies;
        self.predicate = Expr::const_false();
        self.varies = false;
        self.visit_expr(condition);

        // A scalar condition wraps clean guards around each side; a vector
        // or varying condition merges them unconditionally.
        let condition_ok =
            condition.ty().is_scalar() && condition.ty() == Type::bool_scalar();
        if self.varies || !condition_ok {
            self.predicate = Expr::or(
                Expr::or(old_predicate, self.predicate.clone()),
                Expr::or(true_predicate, false_predicate),
            );
        } else {
            self.predicate = Expr::or(
                Expr::or(old_predicate, self.predicate.clone()),
                Expr::or(
                    Expr::and(condition.clone(), true_predicate),
                    Expr::and(Expr::not(condition.clone()), false_predicate),
                ),
            );
        }
        self.varies |= old_varies;
    }
}

impl Visitor for PredicateFinder<'_> {
    fn visit_expr(&mut self, e: &Expr) {
        match e.kind() {
            ExprKind::Variable { name, .. } => {
                self.varies |= self.varying.contains(name);
            }
            ExprKind::Let { name, value, body } => {
                let body = body.clone();
                self.visit_let(name, value, |this| this.visit_expr(&body));
            }
            ExprKind::Select { condition, true_value, false_value } => {
                let (t, f) = (true_value.clone(), false_value.clone());
                self.visit_conditional(
                    condition,
                    |this| this.visit_expr(&t),
                    Some(|this: &mut Self| this.visit_expr(&f)),
                );
            }
            ExprKind::Call { name, kind, .. } => {
                walk_expr(self, e);
                if matches!(kind, CallKind::PipelineFunc) && name == self.buffer {
                    self.predicate = Expr::const_true();
                }
            }
            _ => walk_expr(self, e),
        }
    }

    fn visit_stmt(&mut self, s: &Stmt) {
        match s.kind() {
            StmtKind::For { name, min, extent, body, .. } => {
                self.visit_expr(min);
                self.visit_expr(extent);
                let one = is_const_one(extent);
                if !one {
                    self.varying.push(name.clone(), ());
                }
                self.visit_stmt(body);
                if !one {
                    self.varying.pop(name);
                } else {
                    self.predicate = substitute(name, min.clone(), &self.predicate);
                }
            }
            StmtKind::LetStmt { name, value, body } => {
                let body = body.clone();
                self.visit_let(name, value, |this| this.visit_stmt(&body));
            }
            StmtKind::ProducerConsumer { name, is_producer, body } => {
                // Production of the buffer itself does not force it to be
                // needed; only the consume side counts.
                if !(*is_producer && name == self.buffer) {
                    self.visit_stmt(body);
                }
            }
            StmtKind::IfThenElse { condition, then_case, else_case } => {
                let t = then_case.clone();
                let e = else_case.clone();
                self.visit_conditional(
                    condition,
                    |this| this.visit_stmt(&t),
                    e.map(|e| move |this: &mut Self| this.visit_stmt(&e)),
                );
            }
            _ => walk_stmt(self, s),
        }
    }
}

struct ProductionGuarder<'a> {
    buffer: &'a str,
    needed: Expr,
}

impl Mutator for ProductionGuarder<'_> {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if let StmtKind::ProducerConsumer { name, is_producer: true, body } = s.kind() {
            if name == self.buffer {
                let guarded = Stmt::if_then_else(self.needed.clone(), body.clone(), None);
                return Stmt::producer(name.clone(), guarded);
            }
        }
        walk_stmt_mut(self, s)
    }
}

struct StageSkipper<'a> {
    buffer: &'a str,
}

impl Mutator for StageSkipper<'_> {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if let StmtKind::Realize { name, types, memory_type, bounds, condition, body } =
            s.kind()
        {
            if name == self.buffer {
                let mut finder = PredicateFinder {
                    buffer: self.buffer,
                    predicate: Expr::const_false(),
                    varies: false,
                    varying: Scope::new(),
                };
                finder.visit_stmt(body);
                let predicate = simplify(&finder.predicate);
                debug!(realization = %name, needed_when = ?predicate, "skip-stages predicate");
                if !is_const_one(&predicate) {
                    let needed_name = format!("{name}.needed");
                    let needed = Expr::var(Type::bool_scalar(), &needed_name);
                    let mut guarder =
                        ProductionGuarder { buffer: self.buffer, needed };
                    let body = guarder.mutate_stmt(body);
                    // The storage itself stays full-size: skipped values may
                    // still be loaded, they just must not be trusted.
                    let body = Stmt::let_stmt(needed_name, predicate, body);
                    return Stmt::realize(
                        name.clone(),
                        types.clone(),
                        *memory_type,
                        bounds.clone(),
                        condition.clone(),
                        body,
                    );
                }
            }
        }
        walk_stmt_mut(self, s)
    }
}

/// Gates production of every non-output realization on whether its value
/// is ever read.
pub fn skip_stages(s: &Stmt, order: &[String]) -> Stmt {
    let mut s = s.clone();
    for name in order.iter().rev().skip(1) {
        let mut skipper = StageSkipper { buffer: name };
        s = skipper.mutate_stmt(&s);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::function::{call_func, Function};
    use rasterlang_core::ops;
    use rasterlang_core::stmt::MemoryType;

    fn g() -> Function {
        Function::with_definition("g", vec!["x".to_string()], vec![Expr::var_i32("x")])
    }

    fn realize_g(body: Stmt) -> Stmt {
        Stmt::realize(
            "g",
            vec![Type::int(32)],
            MemoryType::Auto,
            vec![rasterlang_core::Range::new(Expr::i32(0), Expr::i32(8))],
            Expr::const_true(),
            body,
        )
    }

    #[test]
    fn invariant_select_produces_needed_let() {
        // produce g; consume: f(x) = select(p, g(x), 0)
        let p = Expr::var(Type::bool_scalar(), "p");
        let x = Expr::var_i32("x");
        let produce = Stmt::producer(
            "g",
            Stmt::provide("g", vec![x.clone()], vec![x.clone()], Expr::const_true()),
        );
        let consume = Stmt::consumer(
            "g",
            Stmt::provide(
                "f",
                vec![ops::select(p.clone(), call_func(&g(), vec![x.clone()], 0), Expr::i32(0))],
                vec![x.clone()],
                Expr::const_true(),
            ),
        );
        let s = realize_g(Stmt::block(produce, consume));
        let out = skip_stages(&s, &["g".to_string(), "f".to_string()]);

        match out.kind() {
            StmtKind::Realize { body, .. } => match body.kind() {
                StmtKind::LetStmt { name, value, body } => {
                    assert_eq!(name, "g.needed");
                    assert_eq!(value, &p);
                    // The produce side is now guarded on g.needed.
                    let mut found_guard = false;
                    let mut stack = vec![body.clone()];
                    while let Some(cur) = stack.pop() {
                        match cur.kind() {
                            StmtKind::ProducerConsumer { is_producer: true, body, .. } => {
                                if let StmtKind::IfThenElse { condition, .. } = body.kind() {
                                    assert_eq!(
                                        condition,
                                        &Expr::var(Type::bool_scalar(), "g.needed")
                                    );
                                    found_guard = true;
                                }
                            }
                            StmtKind::Block { first, rest } => {
                                stack.push(first.clone());
                                stack.push(rest.clone());
                            }
                            _ => {}
                        }
                    }
                    assert!(found_guard);
                }
                other => panic!("expected the .needed let, got {other:?}"),
            },
            other => panic!("expected Realize, got {other:?}"),
        }
    }

    #[test]
    fn unconditional_use_is_untouched() {
        let x = Expr::var_i32("x");
        let produce = Stmt::producer(
            "g",
            Stmt::provide("g", vec![x.clone()], vec![x.clone()], Expr::const_true()),
        );
        let consume = Stmt::consumer(
            "g",
            Stmt::provide(
                "f",
                vec![call_func(&g(), vec![x.clone()], 0)],
                vec![x],
                Expr::const_true(),
            ),
        );
        let s = realize_g(Stmt::block(produce, consume));
        let out = skip_stages(&s, &["g".to_string(), "f".to_string()]);
        assert!(out.same_as(&s));
    }

    #[test]
    fn extent_one_loops_substitute_their_min() {
        // The conditional read happens under a loop of extent 1, so the
        // predicate is expressed via the loop's min value.
        let i = Expr::var_i32("i");
        let p = ops::lt(i.clone(), Expr::i32(1));
        let x = Expr::var_i32("x");
        let read = Stmt::if_then_else(
            p,
            Stmt::evaluate(call_func(&g(), vec![x.clone()], 0)),
            None,
        );
        let consume = Stmt::consumer("g", Stmt::serial_for("i", Expr::i32(0), Expr::i32(1), read));
        let produce = Stmt::producer(
            "g",
            Stmt::provide("g", vec![x.clone()], vec![x], Expr::const_true()),
        );
        let s = realize_g(Stmt::block(produce, consume));
        let out = skip_stages(&s, &["g".to_string(), "f".to_string()]);
        // i < 1 with i = 0 simplifies to true: no gating at all.
        assert!(out.same_as(&s));
    }
}
