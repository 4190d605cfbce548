//! The lowering entry point: from a declarative pipeline plus schedules to
//! the imperative statement handed to a backend.

use indexmap::IndexMap;

use tracing::debug;

use rasterlang_analysis::order::realization_order;
use rasterlang_analysis::simplify::simplify_stmt;
use rasterlang_core::function::{Environment, Function};
use rasterlang_core::stmt::Stmt;
use rasterlang_core::Target;

use crate::bounds_binding::bind_bounds;
use crate::error::LowerError;
use crate::flatten::storage_flattening;
use crate::image_checks::{add_image_checks, BufferConstraints};
use crate::inject::schedule_functions;
use crate::remove_undef::remove_undef;
use crate::skip_stages::skip_stages;
use crate::storage_folding::storage_folding;
use crate::vectorize::vectorize_loops;

/// Everything the downstream code generator consumes.
#[derive(Debug, Clone)]
pub struct LoweredPipeline {
    pub stmt: Stmt,
    /// Realization order, leaves first.
    pub order: Vec<String>,
    pub fused_groups: Vec<Vec<String>>,
    pub env: Environment,
    /// The top-level output buffer names, in output order.
    pub output_buffers: Vec<String>,
    pub target: Target,
}

/// Lowers a pipeline. Deterministic and replayable: the same inputs yield
/// the same statement.
pub fn lower(
    outputs: &[Function],
    env: &Environment,
    target: &Target,
    constraints: &IndexMap<String, BufferConstraints>,
) -> Result<LoweredPipeline, LowerError> {
    let output_names: Vec<String> = outputs.iter().map(|f| f.name.clone()).collect();
    let (order, fused_groups) = realization_order(&output_names, env)?;
    debug!(?order, "realization order");

    let s = schedule_functions(outputs, &fused_groups, env, target)?;
    debug!("created initial loop nests");

    let s = bind_bounds(&s, outputs, env, target)?;
    debug!("bound symbolic loop bounds");

    let s = add_image_checks(&s, outputs, target, constraints)?;
    debug!("injected image checks");

    let s = simplify_stmt(&s);

    let s = skip_stages(&s, &order);
    debug!("computed stage skipping predicates");

    let s = storage_folding(&s, env)?;
    debug!("folded storage");

    let s = storage_flattening(&s, env);
    debug!("flattened storage");

    let s = remove_undef(&s);
    let s = simplify_stmt(&s);

    let s = vectorize_loops(&s, env)?;
    debug!("vectorized loops");

    let s = simplify_stmt(&s);

    let mut output_buffers = Vec::new();
    for f in outputs {
        for k in 0..f.outputs() {
            output_buffers.push(f.buffer_name(k));
        }
    }

    Ok(LoweredPipeline {
        stmt: s,
        order,
        fused_groups,
        env: env.clone(),
        output_buffers,
        target: target.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::expr::{CallKind, Expr, ExprKind};
    use rasterlang_core::function::call_func;
    use rasterlang_core::schedule::{
        Dim, DimType, FuncSchedule, LoopLevel, Split, SplitKind, TailStrategy,
    };
    use rasterlang_core::stmt::{DeviceApi, ForType, StmtKind};
    use rasterlang_core::types::Type;
    use rasterlang_core::visit::{walk_expr, walk_stmt, Visitor};

    fn output_of(mut f: Function) -> Function {
        f.schedule = FuncSchedule::root_default(&f.args.clone());
        f
    }

    fn env_of(funcs: &[Function]) -> Environment {
        let mut env = Environment::new();
        for f in funcs {
            env.insert(f.name.clone(), f.clone());
        }
        env
    }

    /// Collects facts about a lowered statement in one traversal.
    #[derive(Default)]
    struct Survey {
        loops: Vec<(String, ForType)>,
        stores: Vec<String>,
        allocates: Vec<String>,
        saw_ramp: bool,
        saw_assert: bool,
        saw_mod: bool,
    }

    impl Visitor for Survey {
        fn visit_stmt(&mut self, s: &Stmt) {
            match s.kind() {
                StmtKind::For { name, for_type, .. } => {
                    self.loops.push((name.clone(), *for_type));
                }
                StmtKind::Store { name, .. } => self.stores.push(name.clone()),
                StmtKind::Allocate { name, .. } => self.allocates.push(name.clone()),
                StmtKind::AssertStmt { .. } => self.saw_assert = true,
                _ => {}
            }
            walk_stmt(self, s);
        }

        fn visit_expr(&mut self, e: &Expr) {
            match e.kind() {
                ExprKind::Ramp { .. } => self.saw_ramp = true,
                ExprKind::Binary { op: rasterlang_core::BinaryOp::Mod, .. } => {
                    self.saw_mod = true;
                }
                _ => {}
            }
            walk_expr(self, e);
        }
    }

    fn survey(s: &Stmt) -> Survey {
        let mut out = Survey::default();
        out.visit_stmt(s);
        out
    }

    #[test]
    fn elementwise_pipeline_lowers_to_serial_nest() {
        let x = Expr::var_i32("x");
        let y = Expr::var_i32("y");
        let g = output_of(Function::with_definition(
            "g",
            vec!["x".to_string(), "y".to_string()],
            vec![x + y],
        ));
        let env = env_of(&[g.clone()]);
        let lowered =
            lower(&[g], &env, &Target::host(), &IndexMap::new()).unwrap();

        let facts = survey(&lowered.stmt);
        // Two serial loops, y outside x, and one store to the output.
        let loop_names: Vec<&str> = facts.loops.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(loop_names, vec!["g.s0.y", "g.s0.x"]);
        assert!(facts.loops.iter().all(|(_, t)| *t == ForType::Serial));
        assert_eq!(facts.stores, vec!["g"]);
        // Outputs are stored by the caller: no allocations.
        assert!(facts.allocates.is_empty());
        // The output buffer gets image checks.
        assert!(facts.saw_assert);
        assert_eq!(lowered.order, vec!["g"]);
        assert_eq!(lowered.output_buffers, vec!["g"]);
    }

    #[test]
    fn root_producer_is_allocated_and_consumed() {
        let x = Expr::var_i32("x");
        let mut h = Function::with_definition("h", vec!["x".to_string()], vec![x.clone()]);
        h.schedule.store_level = LoopLevel::Root;
        h.schedule.compute_level = LoopLevel::Root;
        let mut f = Function::with_definition("f", vec!["x".to_string()], vec![x.clone()]);
        f.init_def.as_mut().unwrap().values =
            vec![call_func(&h, vec![Expr::var_i32("x")], 0) + 1];
        let f = output_of(f);
        let env = env_of(&[f.clone(), h]);
        let lowered = lower(&[f], &env, &Target::host(), &IndexMap::new()).unwrap();

        let facts = survey(&lowered.stmt);
        assert!(facts.allocates.contains(&"h".to_string()));
        assert!(facts.stores.contains(&"h".to_string()));
        assert!(facts.stores.contains(&"f".to_string()));
        assert_eq!(lowered.order, vec!["h", "f"]);
    }

    #[test]
    fn inlined_producer_leaves_no_trace() {
        let x = Expr::var_i32("x");
        let h = Function::with_definition("h", vec!["x".to_string()], vec![x.clone() * 3]);
        let mut f = Function::with_definition("f", vec!["x".to_string()], vec![x.clone()]);
        f.init_def.as_mut().unwrap().values =
            vec![call_func(&h, vec![Expr::var_i32("x")], 0) + 1];
        let f = output_of(f);
        let env = env_of(&[f.clone(), h]);
        let lowered = lower(&[f], &env, &Target::host(), &IndexMap::new()).unwrap();

        let facts = survey(&lowered.stmt);
        assert_eq!(facts.stores, vec!["f"]);
        assert!(facts.allocates.is_empty());
    }

    #[test]
    fn vectorized_split_leaves_ramps_and_no_vector_loops() {
        let x = Expr::var_i32("x");
        let read = Expr::call(Type::int(32), "in", vec![x.clone()], CallKind::Image);
        let mut f =
            Function::with_definition("f", vec!["x".to_string()], vec![read * 2]);
        {
            let def = f.init_def.as_mut().unwrap();
            def.schedule.splits.push(Split {
                old_var: "x".to_string(),
                outer: "xo".to_string(),
                inner: "xi".to_string(),
                factor: Expr::i32(4),
                kind: SplitKind::Split,
                tail: TailStrategy::ShiftInwards,
            });
            let dims = &mut def.schedule.dims;
            let x_idx = dims.iter().position(|d| d.var == "x").unwrap();
            dims[x_idx] = Dim {
                var: "xi".to_string(),
                for_type: ForType::Vectorized,
                device_api: DeviceApi::None,
                dim_type: DimType::PureVar,
            };
            dims.insert(
                x_idx + 1,
                Dim {
                    var: "xo".to_string(),
                    for_type: ForType::Serial,
                    device_api: DeviceApi::None,
                    dim_type: DimType::PureVar,
                },
            );
        }
        let f = output_of(f);
        let env = env_of(&[f.clone()]);
        let lowered = lower(&[f], &env, &Target::host(), &IndexMap::new()).unwrap();

        let facts = survey(&lowered.stmt);
        assert!(
            facts.loops.iter().all(|(_, t)| *t != ForType::Vectorized),
            "no vectorized loops should remain"
        );
        assert!(facts.saw_ramp, "the vector loop should have become ramps");
        assert_eq!(facts.stores, vec!["f"]);
    }

    #[test]
    fn sliding_producer_folds_storage() {
        // h stored at f's loop, consumed as a two-tap window: the fold
        // shrinks the allocation and indexes mod 2.
        let x = Expr::var_i32("x");
        let mut h = Function::with_definition("h", vec!["x".to_string()], vec![x.clone()]);
        h.schedule.store_level = LoopLevel::Root;
        h.schedule.compute_level = LoopLevel::at("f", 0, "x");
        let mut f = Function::with_definition("f", vec!["x".to_string()], vec![x.clone()]);
        f.init_def.as_mut().unwrap().values = vec![
            call_func(&h, vec![Expr::var_i32("x") - 1], 0)
                + call_func(&h, vec![Expr::var_i32("x")], 0),
        ];
        let f = output_of(f);
        let env = env_of(&[f.clone(), h]);
        let lowered = lower(&[f], &env, &Target::host(), &IndexMap::new()).unwrap();

        let facts = survey(&lowered.stmt);
        assert!(facts.allocates.contains(&"h".to_string()));
        assert!(facts.saw_mod, "folded accesses should be taken modulo the factor");

        // The h allocation's innermost extent is the fold factor 2.
        struct FindAlloc {
            extent: Option<i64>,
        }
        impl Visitor for FindAlloc {
            fn visit_stmt(&mut self, s: &Stmt) {
                if let StmtKind::Allocate { name, extents, .. } = s.kind() {
                    if name == "h" {
                        self.extent = extents[0].as_const_int();
                    }
                }
                walk_stmt(self, s);
            }
        }
        let mut find = FindAlloc { extent: None };
        find.visit_stmt(&lowered.stmt);
        assert_eq!(find.extent, Some(2));
    }

    #[test]
    fn circular_pipelines_are_rejected() {
        let x = Expr::var_i32("x");
        let mut f = Function::with_definition("f", vec!["x".to_string()], vec![x.clone()]);
        let mut g = Function::with_definition("g", vec!["x".to_string()], vec![x.clone()]);
        f.init_def.as_mut().unwrap().values = vec![Expr::call_indexed(
            Type::int(32),
            "g",
            vec![Expr::var_i32("x")],
            CallKind::PipelineFunc,
            0,
        )];
        g.init_def.as_mut().unwrap().values = vec![Expr::call_indexed(
            Type::int(32),
            "f",
            vec![Expr::var_i32("x")],
            CallKind::PipelineFunc,
            0,
        )];
        let f = output_of(f);
        let env = env_of(&[f.clone(), g]);
        let err = lower(&[f], &env, &Target::host(), &IndexMap::new()).unwrap_err();
        assert!(matches!(err, LowerError::Order(_)));
    }
}
