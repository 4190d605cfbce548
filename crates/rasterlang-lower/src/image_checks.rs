//! Buffer validation and bounds-query synthesis.
//!
//! For every externally referenced buffer this pass defines the required /
//! constrained / proposed size symbols, asserts the caller's buffer covers
//! the required region and honors the declared constraints, guards against
//! 32-bit overflow, emits the bounds-query (inference mode) early-return
//! path that fills in proposed buffer layouts, and substitutes constrained
//! symbols downstream so later passes can fold them.

use indexmap::IndexMap;

use tracing::debug;

use rasterlang_analysis::bounds::{boxes_touched, AccessKind, Region};
use rasterlang_analysis::simplify::simplify;
use rasterlang_core::expr::{CallKind, CmpOp, Expr, ExprKind, VarBinding};
use rasterlang_core::function::Function;
use rasterlang_core::ops::{self, ge, le, lt};
use rasterlang_core::scope::Scope;
use rasterlang_core::stmt::Stmt;
use rasterlang_core::substitute::substitute_map_stmt;
use rasterlang_core::types::Type;
use rasterlang_core::visit::{walk_expr, walk_stmt, Visitor};
use rasterlang_core::{intrinsic, Feature, Target};

use crate::error::LowerError;

/// Caller-declared constraints on one buffer argument, by dimension.
#[derive(Debug, Clone, Default)]
pub struct BufferConstraints {
    pub mins: Vec<Option<Expr>>,
    pub extents: Vec<Option<Expr>>,
    pub strides: Vec<Option<Expr>>,
    /// Required host-pointer alignment in bytes, when stricter than the
    /// element size.
    pub host_alignment: Option<i64>,
}

impl BufferConstraints {
    fn min(&self, d: usize) -> Option<Expr> {
        self.mins.get(d).cloned().flatten()
    }
    fn extent(&self, d: usize) -> Option<Expr> {
        self.extents.get(d).cloned().flatten()
    }
    fn stride(&self, d: usize) -> Option<Expr> {
        self.strides.get(d).cloned().flatten()
    }
}

struct BufferInfo {
    ty: Option<Type>,
    dimensions: usize,
    is_output: bool,
    is_secondary_output: bool,
    /// The name boxes are recorded under (the func name for outputs).
    region_name: String,
}

/// Finds every externally referenced buffer: image reads, `.buffer`
/// handles, and the pipeline outputs.
struct FindBuffers {
    buffers: IndexMap<String, BufferInfo>,
}

impl Visitor for FindBuffers {
    fn visit_expr(&mut self, e: &Expr) {
        walk_expr(self, e);
        match e.kind() {
            ExprKind::Call { name, args, kind: CallKind::Image, .. } => {
                let dims = args.len();
                let entry = self.buffers.entry(name.clone()).or_insert(BufferInfo {
                    ty: None,
                    dimensions: dims,
                    is_output: false,
                    is_secondary_output: false,
                    region_name: name.clone(),
                });
                entry.ty = Some(e.ty().element_of());
                entry.dimensions = entry.dimensions.max(dims);
            }
            ExprKind::Variable { name, binding } if name.ends_with(".buffer") => {
                if let VarBinding::Param(param) | VarBinding::Image(param) = binding {
                    self.buffers.entry(param.clone()).or_insert(BufferInfo {
                        ty: None,
                        dimensions: 0,
                        is_output: false,
                        is_secondary_output: false,
                        region_name: param.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    fn visit_stmt(&mut self, s: &Stmt) {
        walk_stmt(self, s);
    }
}

fn abs_i64(e: Expr) -> Expr {
    ops::select(lt(e.clone(), Expr::i64(0)), Expr::i64(0) - e.clone(), e)
}

/// Inserts the image checks described in the module docs. `constraints`
/// maps buffer names to their declared constraints.
pub fn add_image_checks(
    s: &Stmt,
    outputs: &[Function],
    target: &Target,
    constraints: &IndexMap<String, BufferConstraints>,
) -> Result<Stmt, LowerError> {
    let no_asserts = target.has_feature(Feature::NoAsserts);
    let no_bounds_query = target.has_feature(Feature::NoBoundsQuery);

    let mut finder = FindBuffers { buffers: IndexMap::new() };
    finder.visit_stmt(s);
    let mut bufs = finder.buffers;

    for f in outputs {
        for (k, ty) in f.output_types.iter().enumerate() {
            bufs.insert(
                f.buffer_name(k),
                BufferInfo {
                    ty: Some(ty.element_of()),
                    dimensions: f.dimensions(),
                    is_output: true,
                    is_secondary_output: k > 0,
                    region_name: f.name.clone(),
                },
            );
        }
    }

    let boxes = boxes_touched(s, &Scope::new(), AccessKind::Both);

    let mut lets_overflow: Vec<(String, Expr)> = Vec::new();
    let mut lets_required: Vec<(String, Expr)> = Vec::new();
    let mut lets_constrained: Vec<(String, Expr)> = Vec::new();
    let mut lets_proposed: Vec<(String, Expr)> = Vec::new();
    let mut dims_no_overflow_asserts: Vec<Stmt> = Vec::new();
    let mut asserts_required: Vec<Stmt> = Vec::new();
    let mut asserts_constrained: Vec<Stmt> = Vec::new();
    let mut asserts_proposed: Vec<Stmt> = Vec::new();
    let mut asserts_elem_size: Vec<Stmt> = Vec::new();
    let mut asserts_host_alignment: Vec<Stmt> = Vec::new();
    let mut buffer_rewrites: Vec<Stmt> = Vec::new();

    let mut maybe_return_condition = Expr::const_false();

    // References to the actual sizes inside declared constraints are
    // replaced with the required sizes to derive proposed layouts.
    let mut replace_with_required: std::collections::HashMap<String, Expr> =
        std::collections::HashMap::new();
    for name in bufs.keys() {
        for d in 0..4usize {
            replace_with_required.insert(
                format!("{name}.min.{d}"),
                Expr::var_i32(format!("{name}.min.{d}.required")),
            );
            replace_with_required.insert(
                format!("{name}.extent.{d}"),
                Expr::var_i32(format!("{name}.extent.{d}.required")),
            );
            replace_with_required.insert(
                format!("{name}.stride.{d}"),
                Expr::var_i32(format!("{name}.stride.{d}.required")),
            );
        }
    }

    // Uses of the actual sizes downstream are replaced with the constrained
    // symbols so later passes can fold constants through them.
    let mut replace_with_constrained: std::collections::HashMap<String, Expr> =
        std::collections::HashMap::new();

    for (name, info) in &bufs {
        let constraint = constraints.get(name).cloned().unwrap_or_default();
        let dimensions = info.dimensions;

        let touched: Region = boxes
            .get(&info.region_name)
            .cloned()
            .unwrap_or_else(|| Region::new(Vec::new()));
        assert!(
            touched.is_empty() || touched.len() == dimensions,
            "box for '{name}' has the wrong dimensionality"
        );

        // Whether the caller requested a bounds query for this buffer.
        let host = Expr::var(Type::handle(), format!("{name}.host"));
        let dev = Expr::var(Type::uint(64), format!("{name}.dev"));
        let inference_mode = Expr::and(
            Expr::cmp(CmpOp::Eq, Expr::reinterpret(Type::uint(64), host), Expr::u64(0)),
            Expr::cmp(CmpOp::Eq, dev, Expr::u64(0)),
        );
        maybe_return_condition = Expr::or(maybe_return_condition, inference_mode.clone());

        let error_name = if info.is_output {
            format!("Output buffer {name}")
        } else {
            format!("Input buffer {name}")
        };

        // Element size must match the compiled type.
        if let Some(ty) = info.ty {
            let elem_size = Expr::var_i32(format!("{name}.elem_size"));
            let correct = Expr::i32(ty.bytes() as i32);
            let error = ops::error_call(
                "halide_error_bad_elem_size",
                vec![
                    Expr::string(error_name.clone()),
                    Expr::string(ty.to_string()),
                    elem_size.clone(),
                    correct.clone(),
                ],
            );
            asserts_elem_size
                .push(Stmt::assert_stmt(Expr::cmp(CmpOp::Eq, elem_size, correct), error));
        }

        if touched.maybe_unused() {
            debug!(buffer = %name, used = ?touched.used, "buffer is conditionally used");
        }

        for j in 0..dimensions {
            let actual_min = Expr::var_i32(format!("{name}.min.{j}"));
            let actual_extent = Expr::var_i32(format!("{name}.extent.{j}"));
            let actual_stride = Expr::var_i32(format!("{name}.stride.{j}"));

            let interval = &touched.bounds[j];
            let (Some(box_min), Some(box_max)) = (&interval.min, &interval.max) else {
                return Err(LowerError::UnboundedAccess { name: name.clone(), dim: j });
            };

            let mut min_required = box_min.clone();
            let mut extent_required =
                simplify(&((box_max.clone() + 1) - box_min.clone()));
            if let Some(used) = &touched.used {
                min_required = ops::select(used.clone(), min_required, actual_min.clone());
                extent_required =
                    ops::select(used.clone(), extent_required, actual_extent.clone());
            }

            let min_required_name = format!("{name}.min.{j}.required");
            let extent_required_name = format!("{name}.extent.{j}.required");
            let min_required_var = Expr::var_i32(&min_required_name);
            let extent_required_var = Expr::var_i32(&extent_required_name);
            lets_required.push((extent_required_name, extent_required));
            lets_required.push((min_required_name, min_required));

            // The region handed in must cover the region used.
            let actual_max = actual_min.clone() + actual_extent.clone() - 1;
            let mut max_required =
                min_required_var.clone() + extent_required_var.clone() - 1;
            if let Some(used) = &touched.used {
                max_required = ops::select(used.clone(), max_required, actual_max.clone());
            }
            let oob_condition = Expr::and(
                le(actual_min.clone(), min_required_var.clone()),
                ge(actual_max.clone(), max_required.clone()),
            );
            let oob_error = ops::error_call(
                "halide_error_access_out_of_bounds",
                vec![
                    Expr::string(error_name.clone()),
                    Expr::i32(j as i32),
                    min_required_var,
                    max_required,
                    actual_min.clone(),
                    actual_max,
                ],
            );
            asserts_required.push(Stmt::assert_stmt(oob_condition, oob_error));

            // A dense row-major stride suggestion for inference mode; never
            // asserted, only used to derive proposed strides.
            let stride_required = if j == 0 {
                Expr::i32(1)
            } else {
                Expr::var_i32(format!("{name}.stride.{}.required", j - 1))
                    * Expr::var_i32(format!("{name}.extent.{}.required", j - 1))
            };
            lets_required.push((format!("{name}.stride.{j}.required"), stride_required));

            // No dimension may address more memory than the target allows,
            // and the running extent product must not overflow.
            let max_size = Expr::u64(target.maximum_buffer_size());
            let actual_size = abs_i64(
                Expr::cast(Type::int(64), actual_extent.clone())
                    * Expr::cast(Type::int(64), actual_stride.clone()),
            );
            let allocation_error = ops::error_call(
                "halide_error_buffer_allocation_too_large",
                vec![Expr::string(name.clone()), actual_size.clone(), max_size.clone()],
            );
            dims_no_overflow_asserts.push(Stmt::assert_stmt(
                le(Expr::cast(Type::uint(64), actual_size), max_size.clone()),
                allocation_error,
            ));

            if !info.is_secondary_output {
                if j == 0 {
                    lets_overflow.push((
                        format!("{name}.total_extent.{j}"),
                        Expr::cast(Type::int(64), actual_extent.clone()),
                    ));
                } else {
                    let last = Expr::var(
                        Type::int(64),
                        format!("{name}.total_extent.{}", j - 1),
                    );
                    let this = Expr::cast(Type::int(64), actual_extent.clone()) * last;
                    let this_var =
                        Expr::var(Type::int(64), format!("{name}.total_extent.{j}"));
                    lets_overflow.push((format!("{name}.total_extent.{j}"), this));
                    let error = ops::error_call(
                        "halide_error_buffer_extents_too_large",
                        vec![
                            Expr::string(name.clone()),
                            this_var.clone(),
                            Expr::cast(Type::int(64), max_size.clone()),
                        ],
                    );
                    dims_no_overflow_asserts.push(Stmt::assert_stmt(
                        le(this_var, Expr::cast(Type::int(64), max_size)),
                        error,
                    ));
                }

                let negative_extent_error = ops::error_call(
                    "halide_error_buffer_extents_negative",
                    vec![
                        Expr::string(error_name.clone()),
                        Expr::i32(j as i32),
                        actual_extent.clone(),
                    ],
                );
                asserts_required.push(Stmt::assert_stmt(
                    ge(actual_extent.clone(), Expr::i32(0)),
                    negative_extent_error,
                ));
            }
        }

        // Inference mode rewrites the buffer with the proposed layout.
        let mut rewrite_args = vec![
            Expr::var_bound(
                Type::handle(),
                format!("{name}.buffer"),
                VarBinding::Param(name.clone()),
            ),
            Expr::i32(dimensions as i32),
        ];
        for d in 0..dimensions {
            rewrite_args.push(Expr::var_i32(format!("{name}.min.{d}.proposed")));
            rewrite_args.push(Expr::var_i32(format!("{name}.extent.{d}.proposed")));
            rewrite_args.push(Expr::var_i32(format!("{name}.stride.{d}.proposed")));
        }
        let rewrite = Stmt::evaluate(Expr::call(
            Type::int(32),
            intrinsic::REWRITE_BUFFER,
            rewrite_args,
            CallKind::Extern,
        ));
        buffer_rewrites.push(Stmt::if_then_else(inference_mode.clone(), rewrite, None));

        // Declared constraints: remember them, and pass the required region
        // through them to get the proposed layout.
        let mut dim_constraints: Vec<(String, Expr)> = Vec::new();
        for d in 0..dimensions {
            let min_name = format!("{name}.min.{d}");
            let extent_name = format!("{name}.extent.{d}");
            let stride_name = format!("{name}.stride.{d}");

            let (stride_constrained, extent_constrained, min_constrained) =
                if info.is_secondary_output {
                    if constraint.min(d).is_some() || constraint.extent(d).is_some() {
                        return Err(LowerError::SecondaryOutputConstraint {
                            buffer: name.clone(),
                        });
                    }
                    // Secondary outputs implicitly share the first output's
                    // min and extent.
                    let first = outputs
                        .iter()
                        .find(|f| f.name == info.region_name)
                        .expect("secondary output's function");
                    let min0_name = format!("{}.min.{d}", first.buffer_name(0));
                    let extent0_name = format!("{}.extent.{d}", first.buffer_name(0));
                    let min0 = replace_with_constrained
                        .get(&min0_name)
                        .cloned()
                        .unwrap_or_else(|| Expr::var_i32(min0_name));
                    let extent0 = replace_with_constrained
                        .get(&extent0_name)
                        .cloned()
                        .unwrap_or_else(|| Expr::var_i32(extent0_name));
                    (constraint.stride(d), Some(extent0), Some(min0))
                } else {
                    (constraint.stride(d), constraint.extent(d), constraint.min(d))
                };

            let required_var = |field: &str| -> Expr {
                Expr::var_i32(format!("{name}.{field}.{d}.required"))
            };

            match stride_constrained {
                Some(c) => {
                    dim_constraints.push((stride_name.clone(), c.clone()));
                    let proposed = rasterlang_core::substitute::substitute_map(
                        &replace_with_required,
                        &c,
                    );
                    lets_proposed.push((format!("{stride_name}.proposed"), proposed));
                }
                None => lets_proposed
                    .push((format!("{stride_name}.proposed"), required_var("stride"))),
            }
            match min_constrained {
                Some(c) => {
                    dim_constraints.push((min_name.clone(), c.clone()));
                    let proposed = rasterlang_core::substitute::substitute_map(
                        &replace_with_required,
                        &c,
                    );
                    lets_proposed.push((format!("{min_name}.proposed"), proposed));
                }
                None => {
                    lets_proposed.push((format!("{min_name}.proposed"), required_var("min")))
                }
            }
            match extent_constrained {
                Some(c) => {
                    dim_constraints.push((extent_name.clone(), c.clone()));
                    let proposed = rasterlang_core::substitute::substitute_map(
                        &replace_with_required,
                        &c,
                    );
                    lets_proposed.push((format!("{extent_name}.proposed"), proposed));
                }
                None => lets_proposed
                    .push((format!("{extent_name}.proposed"), required_var("extent"))),
            }

            // The constraints must not shrink the required region.
            let min_proposed = Expr::var_i32(format!("{min_name}.proposed"));
            let extent_proposed = Expr::var_i32(format!("{extent_name}.proposed"));
            let min_required = required_var("min");
            let extent_required = required_var("extent");
            let max_proposed = min_proposed.clone() + extent_proposed.clone() - 1;
            let max_required = min_required.clone() + extent_required.clone() - 1;
            let check = Expr::and(
                le(min_proposed.clone(), min_required.clone()),
                ge(max_proposed.clone(), max_required.clone()),
            );
            let error = ops::error_call(
                "halide_error_constraints_make_required_region_smaller",
                vec![
                    Expr::string(error_name.clone()),
                    Expr::i32(d as i32),
                    min_proposed,
                    max_proposed,
                    min_required,
                    max_required,
                ],
            );
            asserts_proposed.push(Stmt::assert_stmt(
                Expr::or(Expr::not(inference_mode.clone()), check),
                error,
            ));
        }

        // Assert each declared constraint holds, and route downstream uses
        // through the constrained symbol.
        for (var_name, value) in dim_constraints {
            let var = Expr::var_i32(&var_name);
            let constrained_var = Expr::var_i32(format!("{var_name}.constrained"));
            replace_with_constrained.insert(var_name.clone(), constrained_var.clone());
            lets_constrained.push((format!("{var_name}.constrained"), value.clone()));
            let error = ops::error_call(
                "halide_error_constraint_violated",
                vec![
                    Expr::string(var_name.clone()),
                    var.clone(),
                    Expr::string(format!("{value:?}")),
                    constrained_var.clone(),
                ],
            );
            asserts_constrained.push(Stmt::assert_stmt(
                Expr::cmp(CmpOp::Eq, var, constrained_var),
                error,
            ));
        }

        // Host alignment, when the caller promised something stricter than
        // the element size.
        if let Some(alignment) = constraint.host_alignment {
            let host = Expr::var(Type::handle(), format!("{name}.host"));
            let as_u64 = Expr::reinterpret(Type::uint(64), host);
            let condition = Expr::cmp(
                CmpOp::Eq,
                as_u64 % Expr::u64(alignment as u64),
                Expr::u64(0),
            );
            let error = ops::error_call(
                "halide_error_unaligned_host_ptr",
                vec![Expr::string(name.clone()), Expr::i32(alignment as i32)],
            );
            asserts_host_alignment.push(Stmt::assert_stmt(condition, error));
        }
    }

    // Assemble, inside out.
    let mut s = s.clone();

    if !no_asserts {
        for a in asserts_host_alignment.into_iter().rev() {
            s = Stmt::block(a, s);
        }
        for a in dims_no_overflow_asserts.into_iter().rev() {
            s = Stmt::block(a, s);
        }
        for (n, v) in lets_overflow.into_iter().rev() {
            s = Stmt::let_stmt(n, v, s);
        }
    }

    s = substitute_map_stmt(&replace_with_constrained, &s);

    if !no_asserts {
        for a in asserts_constrained.into_iter().rev() {
            s = Stmt::block(a, s);
        }
        for a in asserts_required.into_iter().rev() {
            s = Stmt::block(a, s);
        }
        for a in asserts_elem_size.into_iter().rev() {
            s = Stmt::block(a, s);
        }
    }

    if !no_bounds_query {
        s = Stmt::if_then_else(
            simplify(&Expr::not(maybe_return_condition)),
            s,
            None,
        );
        for r in buffer_rewrites.into_iter().rev() {
            s = Stmt::block(r, s);
        }
    }

    if !no_asserts {
        for a in asserts_proposed.into_iter().rev() {
            s = Stmt::block(a, s);
        }
    }

    for (n, v) in lets_proposed.into_iter().rev() {
        s = Stmt::let_stmt(n, v, s);
    }
    for (n, v) in lets_constrained.into_iter().rev() {
        s = Stmt::let_stmt(n, v, s);
    }
    for (n, v) in lets_required.into_iter().rev() {
        s = Stmt::let_stmt(n, v, s);
    }

    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::stmt::StmtKind;
    use rasterlang_core::substitute::stmt_uses_var;

    fn output_func() -> Function {
        Function::with_definition(
            "f",
            vec!["x".to_string()],
            vec![Expr::var_i32("x")],
        )
    }

    fn simple_pipeline_stmt() -> Stmt {
        // for x in [0, 8): f(x) = input(x) + 1
        let x = Expr::var_i32("x");
        let read = Expr::call(
            Type::int(32),
            "input",
            vec![x.clone()],
            CallKind::Image,
        );
        let body = Stmt::provide("f", vec![read + 1], vec![x], Expr::const_true());
        Stmt::serial_for("x", Expr::i32(0), Expr::i32(8), body)
    }

    #[test]
    fn emits_required_lets_and_oob_asserts() {
        let out = add_image_checks(
            &simple_pipeline_stmt(),
            &[output_func()],
            &Target::host(),
            &IndexMap::new(),
        )
        .unwrap();
        assert!(stmt_uses_var(&out, "input.min.0"));
        let mut saw_required_let = false;
        let mut saw_oob = false;
        let mut stack = vec![out];
        while let Some(cur) = stack.pop() {
            match cur.kind() {
                StmtKind::LetStmt { name, body, .. } => {
                    if name == "input.min.0.required" {
                        saw_required_let = true;
                    }
                    stack.push(body.clone());
                }
                StmtKind::Block { first, rest } => {
                    stack.push(first.clone());
                    stack.push(rest.clone());
                }
                StmtKind::IfThenElse { then_case, .. } => stack.push(then_case.clone()),
                StmtKind::AssertStmt { error, .. } => {
                    if let ExprKind::Call { name, .. } = error.kind() {
                        if name == "halide_error_access_out_of_bounds" {
                            saw_oob = true;
                        }
                    }
                }
                _ => {}
            }
        }
        assert!(saw_required_let);
        assert!(saw_oob);
    }

    #[test]
    fn no_asserts_feature_drops_assert_blocks() {
        let target = Target::host().with_feature(Feature::NoAsserts);
        let out = add_image_checks(
            &simple_pipeline_stmt(),
            &[output_func()],
            &target,
            &IndexMap::new(),
        )
        .unwrap();
        let mut stack = vec![out];
        while let Some(cur) = stack.pop() {
            match cur.kind() {
                StmtKind::AssertStmt { .. } => panic!("NoAsserts must drop asserts"),
                StmtKind::LetStmt { body, .. } => stack.push(body.clone()),
                StmtKind::Block { first, rest } => {
                    stack.push(first.clone());
                    stack.push(rest.clone());
                }
                StmtKind::IfThenElse { then_case, .. } => stack.push(then_case.clone()),
                _ => {}
            }
        }
    }

    #[test]
    fn bounds_query_wraps_body_and_rewrites() {
        let out = add_image_checks(
            &simple_pipeline_stmt(),
            &[output_func()],
            &Target::host(),
            &IndexMap::new(),
        )
        .unwrap();
        // Somewhere: an IfThenElse over the negated maybe-return condition,
        // and a rewrite_buffer call guarded by inference mode.
        let mut saw_rewrite = false;
        let mut stack = vec![out];
        while let Some(cur) = stack.pop() {
            match cur.kind() {
                StmtKind::LetStmt { body, .. } => stack.push(body.clone()),
                StmtKind::Block { first, rest } => {
                    stack.push(first.clone());
                    stack.push(rest.clone());
                }
                StmtKind::IfThenElse { then_case, .. } => stack.push(then_case.clone()),
                StmtKind::Evaluate { value } => {
                    if value.is_intrinsic(intrinsic::REWRITE_BUFFER)
                        || matches!(value.kind(),
                            ExprKind::Call { name, .. } if name == intrinsic::REWRITE_BUFFER)
                    {
                        saw_rewrite = true;
                    }
                }
                _ => {}
            }
        }
        assert!(saw_rewrite);
    }

    #[test]
    fn stride_constraint_produces_constrained_symbols() {
        let mut constraints = IndexMap::new();
        constraints.insert(
            "input".to_string(),
            BufferConstraints {
                strides: vec![Some(Expr::i32(1))],
                ..Default::default()
            },
        );
        let out = add_image_checks(
            &simple_pipeline_stmt(),
            &[output_func()],
            &Target::host(),
            &constraints,
        )
        .unwrap();
        assert!(stmt_uses_var(&out, "input.stride.0.constrained"));
    }

    #[test]
    fn secondary_output_constraints_are_rejected() {
        let x = Expr::var_i32("x");
        let f = Function::with_definition(
            "f",
            vec!["x".to_string()],
            vec![x.clone(), x.clone() + 1],
        );
        let s = Stmt::provide(
            "f",
            vec![x.clone(), x.clone() + 1],
            vec![x],
            Expr::const_true(),
        );
        let mut constraints = IndexMap::new();
        constraints.insert(
            "f.1".to_string(),
            BufferConstraints { mins: vec![Some(Expr::i32(0))], ..Default::default() },
        );
        let err =
            add_image_checks(&s, &[f], &Target::host(), &constraints).unwrap_err();
        assert!(matches!(err, LowerError::SecondaryOutputConstraint { .. }));
    }
}
