//! Inlining of pure functions at their call sites.

use tracing::{debug, warn};

use rasterlang_core::expr::{CallKind, Expr, ExprKind};
use rasterlang_core::function::Function;
use rasterlang_core::mutate::{walk_expr, walk_stmt, Mutator};
use rasterlang_core::qualify::qualify;
use rasterlang_core::stmt::{ForType, Stmt};
use rasterlang_core::substitute::substitute;

use crate::error::LowerError;

/// Checks that a function scheduled inline carries no directives that need
/// a loop nest of its own.
pub fn validate_inlined_schedule(f: &Function) -> Result<(), LowerError> {
    if !f.schedule.store_level.is_inlined() {
        return Err(LowerError::IllegalInlineSchedule {
            func: f.name.clone(),
            reason: "a storage location is meaningless for it".into(),
        });
    }
    if f.schedule.memoized {
        return Err(LowerError::IllegalInlineSchedule {
            func: f.name.clone(),
            reason: "it cannot be memoized".into(),
        });
    }
    if let Some(def) = &f.init_def {
        if !def.specializations.is_empty() {
            return Err(LowerError::IllegalInlineSchedule {
                func: f.name.clone(),
                reason: "it must not have specializations; specialize the caller instead"
                    .into(),
            });
        }
        for d in &def.schedule.dims {
            match d.for_type {
                ForType::Serial => {}
                ForType::Parallel
                | ForType::GpuBlock
                | ForType::GpuThread
                | ForType::Fork => {
                    return Err(LowerError::IllegalInlineSchedule {
                        func: f.name.clone(),
                        reason: format!("dimension '{}' cannot be parallelized", d.var),
                    });
                }
                ForType::Unrolled => {
                    return Err(LowerError::IllegalInlineSchedule {
                        func: f.name.clone(),
                        reason: format!("dimension '{}' cannot be unrolled", d.var),
                    });
                }
                ForType::Vectorized => {
                    return Err(LowerError::IllegalInlineSchedule {
                        func: f.name.clone(),
                        reason: format!("dimension '{}' cannot be vectorized", d.var),
                    });
                }
                ForType::Extern => {
                    return Err(LowerError::IllegalInlineSchedule {
                        func: f.name.clone(),
                        reason: format!("dimension '{}' cannot be extern", d.var),
                    });
                }
            }
        }
        for s in &def.schedule.splits {
            warn!(
                func = %f.name,
                var = %s.old_var,
                "split directive on an inlined function has no effect"
            );
        }
    }
    for b in &f.schedule.bounds {
        warn!(
            func = %f.name,
            var = %b.var,
            "bound directive on an inlined function has no effect"
        );
    }
    Ok(())
}

struct Inliner<'a> {
    func: &'a Function,
    found: usize,
}

impl Mutator for Inliner<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        match e.kind() {
            ExprKind::Call { name, args, kind: CallKind::PipelineFunc, value_index }
                if name == &self.func.name =>
            {
                let args: Vec<Expr> = args.iter().map(|a| self.mutate_expr(a)).collect();
                let def = self
                    .func
                    .init_def
                    .as_ref()
                    .expect("inlined function must have a pure definition");
                let prefix = format!("{}.", self.func.name);
                let mut body = qualify(&prefix, &def.values[*value_index]);

                assert_eq!(args.len(), self.func.args.len());
                for (formal, actual) in self.func.args.iter().zip(args) {
                    let bound_name = format!("{prefix}{formal}");
                    if actual.is_const() || actual.as_variable().is_some() {
                        body = substitute(&bound_name, actual, &body);
                    } else {
                        body = Expr::let_in(bound_name, actual, body);
                    }
                }
                self.found += 1;
                body
            }
            _ => walk_expr(self, e),
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        walk_stmt(self, s)
    }
}

/// Rewrites every call to `f` in `s` as a let-bound copy of its definition.
pub fn inline_function(s: &Stmt, f: &Function) -> Result<Stmt, LowerError> {
    assert!(f.can_be_inlined(), "illegal to inline '{}'", f.name);
    validate_inlined_schedule(f)?;
    let mut inliner = Inliner { func: f, found: 0 };
    let out = inliner.mutate_stmt(s);
    debug!(func = %f.name, call_sites = inliner.found, "inlined");
    Ok(out)
}

/// Expression flavor of [`inline_function`].
pub fn inline_function_in_expr(e: &Expr, f: &Function) -> Result<Expr, LowerError> {
    assert!(f.can_be_inlined(), "illegal to inline '{}'", f.name);
    validate_inlined_schedule(f)?;
    let mut inliner = Inliner { func: f, found: 0 };
    Ok(inliner.mutate_expr(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::function::call_func;
    use rasterlang_core::stmt::StmtKind;

    fn doubler() -> Function {
        let x = Expr::var_i32("x");
        Function::with_definition("g", vec!["x".to_string()], vec![x.clone() * 2])
    }

    #[test]
    fn variable_args_substitute_directly() {
        let g = doubler();
        let call = call_func(&g, vec![Expr::var_i32("x")], 0);
        let s = Stmt::provide("f", vec![call], vec![Expr::var_i32("x")], Expr::const_true());
        let out = inline_function(&s, &g).unwrap();
        match out.kind() {
            StmtKind::Provide { values, .. } => {
                assert_eq!(values[0], Expr::var_i32("x") * 2);
            }
            other => panic!("expected Provide, got {other:?}"),
        }
    }

    #[test]
    fn compound_args_get_let_bound() {
        let g = doubler();
        let arg = Expr::var_i32("x") + Expr::var_i32("y");
        let call = call_func(&g, vec![arg.clone()], 0);
        let s = Stmt::evaluate(call);
        let out = inline_function(&s, &g).unwrap();
        match out.kind() {
            StmtKind::Evaluate { value } => match value.kind() {
                ExprKind::Let { name, value: bound, .. } => {
                    assert_eq!(name, "g.x");
                    assert_eq!(bound, &arg);
                }
                other => panic!("expected Let, got {other:?}"),
            },
            other => panic!("expected Evaluate, got {other:?}"),
        }
    }

    #[test]
    fn nested_calls_inline_inside_out() {
        let g = doubler();
        let call = call_func(&g, vec![call_func(&g, vec![Expr::var_i32("x")], 0)], 0);
        let out = inline_function_in_expr(&call, &g).unwrap();
        // g(g(x)) == (x*2)*2 after both sites inline.
        assert_eq!(out, Expr::var_i32("x") * 2 * 2);
    }

    #[test]
    fn rejects_parallel_inlined_schedule() {
        let mut g = doubler();
        g.init_def.as_mut().unwrap().schedule.dims =
            rasterlang_core::StageSchedule::default_dims(&g.args.clone(), &[]);
        g.init_def.as_mut().unwrap().schedule.dims[0].for_type = ForType::Parallel;
        let s = Stmt::no_op();
        let err = inline_function(&s, &g).unwrap_err();
        assert!(matches!(err, LowerError::IllegalInlineSchedule { .. }));
    }
}
