//! Storage flattening: multidimensional Realize/Provide/Call sites become
//! flat Allocate/Store/Load with row-major strides.
//!
//! Internal allocations get `<buf>.min.<d>` / `.stride.<d>` lets derived
//! from their realization bounds; output and input buffers reference the
//! caller-supplied symbols of the same shape, so access lowering is
//! uniform across all three.

use tracing::trace;

use rasterlang_analysis::simplify::simplify;
use rasterlang_core::expr::{CallKind, Expr, ExprKind, ModulusRemainder, VarBinding};
use rasterlang_core::function::Environment;
use rasterlang_core::mutate::{walk_expr, walk_stmt, Mutator};
use rasterlang_core::stmt::{Stmt, StmtKind};
use rasterlang_core::substitute::stmt_uses_var;
use rasterlang_core::intrinsic;
use rasterlang_core::types::Type;

struct Flatten<'a> {
    env: &'a Environment,
}

impl Flatten<'_> {
    /// The flat index of a multidimensional site in `buf`.
    fn flat_index(&self, buf: &str, args: &[Expr]) -> Expr {
        let mut index: Option<Expr> = None;
        for (d, arg) in args.iter().enumerate() {
            let min = Expr::var_i32(format!("{buf}.min.{d}"));
            let stride = Expr::var_i32(format!("{buf}.stride.{d}"));
            let term = (arg.clone() - min) * stride;
            index = Some(match index {
                Some(acc) => acc + term,
                None => term,
            });
        }
        simplify(&index.expect("flattened access needs at least one dimension"))
    }

    fn buffer_name(&self, func: &str, value_index: usize) -> String {
        match self.env.get(func) {
            Some(f) => f.buffer_name(value_index),
            None => func.to_string(),
        }
    }
}

impl Mutator for Flatten<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        match e.kind() {
            ExprKind::Call { name, args, kind: CallKind::PipelineFunc, value_index } => {
                let args: Vec<Expr> = args.iter().map(|a| self.mutate_expr(a)).collect();
                let buf = self.buffer_name(name, *value_index);
                let index = self.flat_index(&buf, &args);
                Expr::load(
                    e.ty(),
                    buf,
                    index,
                    Expr::const_true(),
                    ModulusRemainder::unknown(),
                    VarBinding::Free,
                )
            }
            ExprKind::Call { name, args, kind: CallKind::Image, .. } => {
                let args: Vec<Expr> = args.iter().map(|a| self.mutate_expr(a)).collect();
                let index = self.flat_index(name, &args);
                Expr::load(
                    e.ty(),
                    name.clone(),
                    index,
                    Expr::const_true(),
                    ModulusRemainder::unknown(),
                    VarBinding::Param(name.clone()),
                )
            }
            _ => walk_expr(self, e),
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.kind() {
            StmtKind::Provide { name, values, args, predicate } => {
                let predicate = self.mutate_expr(predicate);
                let values: Vec<Expr> = values.iter().map(|v| self.mutate_expr(v)).collect();
                let args: Vec<Expr> = args.iter().map(|a| self.mutate_expr(a)).collect();
                let stores: Vec<Stmt> = values
                    .iter()
                    .enumerate()
                    .map(|(k, value)| {
                        let buf = self.buffer_name(name, k);
                        let index = self.flat_index(&buf, &args);
                        Stmt::store(
                            buf,
                            value.clone(),
                            index,
                            predicate.clone(),
                            ModulusRemainder::unknown(),
                            VarBinding::Free,
                        )
                    })
                    .collect();
                Stmt::block_of(stores).expect("Provide has at least one value")
            }
            StmtKind::Realize { name, types, memory_type, bounds, condition, body } => {
                let body = self.mutate_stmt(body);
                let mut out = body;
                // Tuple components get separate allocations, outermost
                // component first.
                for (k, ty) in types.iter().enumerate().rev() {
                    let buf = self.buffer_name(name, k);
                    trace!(buffer = %buf, dims = bounds.len(), "flattening realization");

                    // A descriptor for extern consumers, only when used.
                    if stmt_uses_var(&out, &format!("{buf}.buffer")) {
                        let mut args = vec![
                            Expr::string(buf.clone()),
                            Expr::i32(ty.bytes() as i32),
                            Expr::i32(bounds.len() as i32),
                        ];
                        for d in 0..bounds.len() {
                            args.push(Expr::var_i32(format!("{buf}.min.{d}")));
                            args.push(Expr::var_i32(format!("{buf}.extent.{d}")));
                            args.push(Expr::var_i32(format!("{buf}.stride.{d}")));
                        }
                        out = Stmt::let_stmt(
                            format!("{buf}.buffer"),
                            Expr::call(
                                Type::handle(),
                                intrinsic::CREATE_BUFFER_T,
                                args,
                                CallKind::Intrinsic,
                            ),
                            out,
                        );
                    }

                    let extents: Vec<Expr> =
                        bounds.iter().map(|r| r.extent.clone()).collect();
                    out = Stmt::allocate(
                        buf.clone(),
                        *ty,
                        *memory_type,
                        extents,
                        condition.clone(),
                        out,
                        None,
                        None,
                        0,
                    );

                    // Strides innermost-out, then extents and mins, so each
                    // let only references ones bound outside it.
                    for d in (0..bounds.len()).rev() {
                        let stride = if d == 0 {
                            Expr::i32(1)
                        } else {
                            Expr::var_i32(format!("{buf}.stride.{}", d - 1))
                                * Expr::var_i32(format!("{buf}.extent.{}", d - 1))
                        };
                        out = Stmt::let_stmt(format!("{buf}.stride.{d}"), stride, out);
                    }
                    for (d, r) in bounds.iter().enumerate().rev() {
                        out = Stmt::let_stmt(
                            format!("{buf}.extent.{d}"),
                            r.extent.clone(),
                            out,
                        );
                        out = Stmt::let_stmt(format!("{buf}.min.{d}"), r.min.clone(), out);
                    }
                }
                out
            }
            _ => walk_stmt(self, s),
        }
    }
}

/// Lowers every Realize/Provide/Call to flat Allocate/Store/Load.
pub fn storage_flattening(s: &Stmt, env: &Environment) -> Stmt {
    Flatten { env }.mutate_stmt(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::function::{call_func, Function};
    use rasterlang_core::stmt::{MemoryType, Range};

    fn g2d() -> Function {
        let x = Expr::var_i32("x");
        let y = Expr::var_i32("y");
        Function::with_definition("g", vec!["x".to_string(), "y".to_string()], vec![x + y])
    }

    fn env_with(funcs: &[Function]) -> Environment {
        let mut env = Environment::new();
        for f in funcs {
            env.insert(f.name.clone(), f.clone());
        }
        env
    }

    #[test]
    fn realize_becomes_allocate_with_stride_lets() {
        let g = g2d();
        let x = Expr::var_i32("x");
        let y = Expr::var_i32("y");
        let body = Stmt::provide(
            "g",
            vec![x.clone() + y.clone()],
            vec![x.clone(), y.clone()],
            Expr::const_true(),
        );
        let s = Stmt::realize(
            "g",
            vec![Type::int(32)],
            MemoryType::Auto,
            vec![
                Range::new(Expr::i32(0), Expr::i32(4)),
                Range::new(Expr::i32(0), Expr::i32(3)),
            ],
            Expr::const_true(),
            body,
        );
        let out = storage_flattening(&s, &env_with(&[g]));

        // Outer shape: min/extent/stride lets around an Allocate.
        let mut cur = out;
        let mut let_names = Vec::new();
        let alloc = loop {
            match cur.kind() {
                StmtKind::LetStmt { name, body, .. } => {
                    let_names.push(name.clone());
                    cur = body.clone();
                }
                StmtKind::Allocate { .. } => break cur.clone(),
                other => panic!("expected lets then Allocate, got {other:?}"),
            }
        };
        assert!(let_names.contains(&"g.stride.0".to_string()));
        assert!(let_names.contains(&"g.stride.1".to_string()));
        assert!(let_names.contains(&"g.min.1".to_string()));

        match alloc.kind() {
            StmtKind::Allocate { name, extents, body, .. } => {
                assert_eq!(name, "g");
                assert_eq!(extents.len(), 2);
                assert_eq!(extents[0].as_const_int(), Some(4));
                // The provide flattened to a store with a linear index.
                match body.kind() {
                    StmtKind::Store { name, index, .. } => {
                        assert_eq!(name, "g");
                        assert!(rasterlang_core::expr_uses_var(index, "g.stride.1"));
                    }
                    other => panic!("expected Store, got {other:?}"),
                }
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn calls_flatten_to_loads() {
        let g = g2d();
        let x = Expr::var_i32("x");
        let call = call_func(&g, vec![x.clone(), Expr::i32(0)], 0);
        let s = Stmt::evaluate(call);
        let out = storage_flattening(&s, &env_with(&[g]));
        match out.kind() {
            StmtKind::Evaluate { value } => match value.kind() {
                ExprKind::Load { name, index, .. } => {
                    assert_eq!(name, "g");
                    assert!(rasterlang_core::expr_uses_var(index, "g.min.0"));
                }
                other => panic!("expected Load, got {other:?}"),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn tuple_realizations_allocate_per_component() {
        let x = Expr::var_i32("x");
        let f = Function::with_definition(
            "f",
            vec!["x".to_string()],
            vec![x.clone(), x.clone() * 2],
        );
        let body = Stmt::provide(
            "f",
            vec![x.clone(), x.clone() * 2],
            vec![x.clone()],
            Expr::const_true(),
        );
        let s = Stmt::realize(
            "f",
            vec![Type::int(32), Type::int(32)],
            MemoryType::Auto,
            vec![Range::new(Expr::i32(0), Expr::i32(8))],
            Expr::const_true(),
            body,
        );
        let out = storage_flattening(&s, &env_with(&[f]));
        // Two allocations: f.0 and f.1, and the provide became two stores.
        let mut allocs = Vec::new();
        let mut stores = Vec::new();
        let mut stack = vec![out];
        while let Some(cur) = stack.pop() {
            match cur.kind() {
                StmtKind::Allocate { name, body, .. } => {
                    allocs.push(name.clone());
                    stack.push(body.clone());
                }
                StmtKind::LetStmt { body, .. } => stack.push(body.clone()),
                StmtKind::Block { first, rest } => {
                    stack.push(first.clone());
                    stack.push(rest.clone());
                }
                StmtKind::Store { name, .. } => stores.push(name.clone()),
                _ => {}
            }
        }
        allocs.sort();
        stores.sort();
        assert_eq!(allocs, vec!["f.0", "f.1"]);
        assert_eq!(stores, vec!["f.0", "f.1"]);
    }

    #[test]
    fn image_reads_keep_their_param_binding() {
        let x = Expr::var_i32("x");
        let read = Expr::call(Type::uint(8), "input", vec![x], CallKind::Image);
        let s = Stmt::evaluate(read);
        let out = storage_flattening(&s, &Environment::new());
        match out.kind() {
            StmtKind::Evaluate { value } => match value.kind() {
                ExprKind::Load { name, binding, .. } => {
                    assert_eq!(name, "input");
                    assert_eq!(binding, &VarBinding::Param("input".to_string()));
                }
                other => panic!("expected Load, got {other:?}"),
            },
            _ => unreachable!(),
        }
    }
}
