//! Schedule-driven loop-nest construction.
//!
//! Turns one definition of a function into the statement that computes it:
//! a Provide wrapped in the loops named by the stage's dim list, with
//! splits applied, reduction predicates guarded, bound variables defined,
//! and specializations dispatched. The bounds referenced here
//! (`<prefix><var>.min` / `.max`) are bound later by bounds binding.

use std::collections::HashMap;

use tracing::{debug, trace};

use rasterlang_analysis::simplify::simplify;
use rasterlang_core::expr::{CallKind, Expr, VarBinding};
use rasterlang_core::function::{
    Definition, Environment, ExternArgument, Function,
};
use rasterlang_core::ops::{self, likely};
use rasterlang_core::qualify::qualify;
use rasterlang_core::schedule::{
    DimType, Split, SplitKind, StageSchedule, TailStrategy,
};
use rasterlang_core::stmt::{ForType, PrefetchDirective, Stmt, StmtKind};
use rasterlang_core::substitute::{expr_uses_var, substitute_stmt};
use rasterlang_core::types::Type;
use rasterlang_core::{intrinsic, unique_name};

use crate::error::LowerError;

// ---------------------------------------------------------------------------
// Split application
// ---------------------------------------------------------------------------

/// One rewrite produced by applying a split directive. Applied in order:
/// predicates wrap the statement, substitutions rewrite it, lets wrap it.
enum SplitResult {
    Predicate(Expr),
    Substitution { name: String, value: Expr },
    Let { name: String, value: Expr },
}

fn loop_var(name: &str) -> Expr {
    Expr::var_i32(name)
}

fn loop_min_var(name: &str) -> Expr {
    Expr::var_i32(format!("{name}.loop_min"))
}

fn loop_max_var(name: &str) -> Expr {
    Expr::var_i32(format!("{name}.loop_max"))
}

fn loop_extent_var(name: &str) -> Expr {
    Expr::var_i32(format!("{name}.loop_extent"))
}

/// Rewrites references to a split's old variable in terms of the new loop
/// variables, possibly introducing a base let and a tail-guard predicate.
fn apply_split(
    split: &Split,
    is_update: bool,
    prefix: &str,
    dim_extent_alignment: &mut HashMap<String, Expr>,
) -> Vec<SplitResult> {
    match split.kind {
        SplitKind::Split => {
            let old_name = format!("{prefix}{}", split.old_var);
            let outer_name = format!("{prefix}{}", split.outer);
            let inner_name = format!("{prefix}{}", split.inner);
            let base_name = format!("{inner_name}.base");

            let old_min = loop_min_var(&old_name);
            let old_max = loop_max_var(&old_name);
            let base = loop_var(&outer_name) * split.factor.clone() + old_min;
            let replacement = Expr::var_i32(&base_name) + loop_var(&inner_name);

            // If the old extent is a known multiple of the factor, the last
            // tile is full and no tail handling is needed.
            let exact = dim_extent_alignment
                .get(&split.old_var)
                .and_then(|a| a.as_const_int())
                .zip(split.factor.as_const_int())
                .is_some_and(|(a, f)| f != 0 && a % f == 0);

            let tail = match split.tail {
                TailStrategy::Auto => {
                    if exact {
                        TailStrategy::RoundUp
                    } else if is_update {
                        // Updates may not recompute sites outside the domain.
                        TailStrategy::GuardWithIf
                    } else {
                        TailStrategy::ShiftInwards
                    }
                }
                explicit => explicit,
            };

            // The inner extent is now known to be the factor.
            dim_extent_alignment.insert(split.inner.clone(), split.factor.clone());

            let mut results = Vec::new();
            let base_value = match tail {
                TailStrategy::Auto => unreachable!("Auto resolved above"),
                TailStrategy::RoundUp => base,
                TailStrategy::GuardWithIf => {
                    results.push(SplitResult::Predicate(likely(ops::le(
                        loop_var(&old_name),
                        old_max.clone(),
                    ))));
                    base
                }
                TailStrategy::ShiftInwards => {
                    ops::min(base, old_max + (Expr::i32(1) - split.factor.clone()))
                }
            };
            results.push(SplitResult::Substitution { name: old_name, value: replacement });
            results.push(SplitResult::Let { name: base_name, value: base_value });
            results
        }
        SplitKind::Fuse => {
            // old_var is the fused result; inner and outer are the sources.
            let fused_name = format!("{prefix}{}", split.old_var);
            let inner_name = format!("{prefix}{}", split.inner);
            let outer_name = format!("{prefix}{}", split.outer);
            let fused = loop_var(&fused_name);
            let inner_extent = loop_extent_var(&inner_name);
            let inner_min = loop_min_var(&inner_name);
            let outer_min = loop_min_var(&outer_name);
            vec![
                SplitResult::Substitution {
                    name: inner_name,
                    value: fused.clone() % inner_extent.clone() + inner_min,
                },
                SplitResult::Substitution {
                    name: outer_name,
                    value: fused / inner_extent + outer_min,
                },
            ]
        }
        SplitKind::Rename | SplitKind::Purify => vec![SplitResult::Substitution {
            name: format!("{prefix}{}", split.old_var),
            value: loop_var(format!("{prefix}{}", split.outer).as_str()),
        }],
    }
}

/// The loop-bound definitions for the variables a split introduces, in
/// wrap order (later entries end up further out).
fn compute_loop_bounds_after_split(split: &Split, prefix: &str) -> Vec<(String, Expr)> {
    match split.kind {
        SplitKind::Split => {
            let old_name = format!("{prefix}{}", split.old_var);
            let outer_name = format!("{prefix}{}", split.outer);
            let inner_name = format!("{prefix}{}", split.inner);
            let factor = split.factor.clone();
            vec![
                (format!("{inner_name}.loop_min"), Expr::i32(0)),
                (format!("{inner_name}.loop_max"), simplify(&(factor.clone() - 1))),
                (format!("{inner_name}.loop_extent"), factor.clone()),
                (format!("{outer_name}.loop_min"), Expr::i32(0)),
                (
                    format!("{outer_name}.loop_max"),
                    loop_extent_var(&outer_name) - 1,
                ),
                (
                    format!("{outer_name}.loop_extent"),
                    (loop_extent_var(&old_name) + factor.clone() - 1) / factor,
                ),
            ]
        }
        SplitKind::Fuse => {
            let fused_name = format!("{prefix}{}", split.old_var);
            let inner_name = format!("{prefix}{}", split.inner);
            let outer_name = format!("{prefix}{}", split.outer);
            vec![
                (format!("{fused_name}.loop_min"), Expr::i32(0)),
                (
                    format!("{fused_name}.loop_max"),
                    loop_extent_var(&fused_name) - 1,
                ),
                (
                    format!("{fused_name}.loop_extent"),
                    loop_extent_var(&inner_name) * loop_extent_var(&outer_name),
                ),
            ]
        }
        SplitKind::Rename | SplitKind::Purify => {
            let old_name = format!("{prefix}{}", split.old_var);
            let outer_name = format!("{prefix}{}", split.outer);
            vec![
                (format!("{outer_name}.loop_min"), loop_min_var(&old_name)),
                (format!("{outer_name}.loop_max"), loop_max_var(&old_name)),
                (format!("{outer_name}.loop_extent"), loop_extent_var(&old_name)),
            ]
        }
    }
}

// ---------------------------------------------------------------------------
// Loop-nest assembly
// ---------------------------------------------------------------------------

enum Container {
    For { dim_idx: usize, name: String },
    Let { name: String, value: Expr },
    If { condition: Expr },
    /// A fused-dim bounds guard; sorts outward but never past a For.
    IfInner { name: String, condition: Expr },
}

impl Container {
    fn value(&self) -> Option<&Expr> {
        match self {
            Container::For { .. } => None,
            Container::Let { value, .. } => Some(value),
            Container::If { condition } | Container::IfInner { condition, .. } => {
                Some(condition)
            }
        }
    }

    fn name(&self) -> &str {
        match self {
            Container::For { name, .. } => name,
            Container::Let { name, .. } => name,
            Container::IfInner { name, .. } => name,
            Container::If { .. } => "",
        }
    }
}

fn rvar_order_is_preserved(schedule: &StageSchedule) -> Option<String> {
    let rvar_dims: Vec<&str> = schedule
        .dims
        .iter()
        .filter(|d| d.dim_type == DimType::ImpureRVar)
        .map(|d| d.var.as_str())
        .collect();
    let mut expected = schedule
        .rvars
        .iter()
        .map(|rv| rv.var.as_str())
        .filter(|v| rvar_dims.iter().any(|d| rasterlang_core::var_name_match(d, v)));
    for dim in rvar_dims.iter().copied() {
        match expected.next() {
            Some(v) if rasterlang_core::var_name_match(dim, v) => {}
            _ => return Some(dim.to_string()),
        }
    }
    None
}

/// Builds the loops around `body` as directed by one stage's schedule.
pub fn build_loop_nest(
    body: Stmt,
    prefix: &str,
    start_fuse: i64,
    func: &Function,
    def: &Definition,
    is_update: bool,
) -> Result<Stmt, LowerError> {
    let stage_s = &def.schedule;
    let func_s = &func.schedule;

    if let Some(var) = rvar_order_is_preserved(stage_s) {
        return Err(LowerError::ReorderedReductionVariable {
            func: func.name.clone(),
            stage: if is_update { 1 } else { 0 },
            var,
        });
    }

    let mut stmt = body.clone();

    // Extents known to be multiples of something, from bounds directives,
    // alignment directives, and reduction domains.
    let mut dim_extent_alignment: HashMap<String, Expr> = HashMap::new();
    for b in &func_s.bounds {
        if let Some(extent) = &b.extent {
            dim_extent_alignment.insert(b.var.clone(), extent.clone());
        }
        if let Some(modulus) = &b.modulus {
            dim_extent_alignment.insert(b.var.clone(), modulus.clone());
        }
    }
    for rv in &stage_s.rvars {
        dim_extent_alignment.insert(rv.var.clone(), rv.extent.clone());
    }

    // Define the stage args in terms of the loop variables.
    for split in &stage_s.splits {
        for result in apply_split(split, is_update, prefix, &mut dim_extent_alignment) {
            stmt = match result {
                SplitResult::Substitution { name, value } => {
                    substitute_stmt(&name, value, &stmt)
                }
                SplitResult::Let { name, value } => Stmt::let_stmt(name, value, stmt),
                SplitResult::Predicate(condition) => {
                    Stmt::if_then_else(condition, stmt, None)
                }
            };
        }
    }

    // Collect the desired loops, outermost first.
    let mut nest: Vec<Container> = Vec::new();
    for (i, dim) in stage_s.dims.iter().enumerate().rev() {
        nest.push(Container::For { dim_idx: i, name: format!("{prefix}{}", dim.var) });
    }
    let n_loops = stage_s.dims.len();

    // Strip the lets and tail guards the splits introduced back off.
    let mut pred_container: Vec<Container> = Vec::new();
    loop {
        if stmt.same_as(&body) {
            break;
        }
        match stmt.kind() {
            StmtKind::LetStmt { name, value, body: inner } => {
                nest.push(Container::Let { name: name.clone(), value: value.clone() });
                stmt = inner.clone();
            }
            StmtKind::IfThenElse { condition, then_case, else_case: None } => {
                pred_container.push(Container::If { condition: condition.clone() });
                stmt = then_case.clone();
            }
            _ => break,
        }
    }
    let n_lets = nest.len() - n_loops;

    // Fused dims get bounds guards so members with narrower domains do not
    // run out of bounds under the union loop. The __outermost dim is
    // excluded; it disappears later anyway.
    let mut n_predicates_inner = 0;
    if start_fuse >= 0 {
        for i in (start_fuse as usize)..stage_s.dims.len().saturating_sub(1) {
            let dim_var = format!("{prefix}{}", stage_s.dims[i].var);
            let var = loop_var(&dim_var);
            nest.push(Container::IfInner {
                name: dim_var.clone(),
                condition: likely(ops::ge(var.clone(), loop_min_var(&dim_var))),
            });
            nest.push(Container::IfInner {
                name: dim_var.clone(),
                condition: likely(ops::le(var, loop_max_var(&dim_var))),
            });
            n_predicates_inner += 2;
        }
    }

    // Reduction-domain predicates.
    for pred in def.split_predicate() {
        let pred = qualify(prefix, &pred);
        pred_container.push(Container::If { condition: likely(pred) });
    }
    let n_predicates = pred_container.len();
    nest.extend(pred_container);

    // Sort the lets outward as far as their dependencies allow.
    for i in n_loops..n_loops + n_lets {
        debug_assert!(matches!(nest[i], Container::Let { .. }));
        for j in (0..i).rev() {
            if !expr_uses_var(nest[j + 1].value().unwrap(), nest[j].name()) {
                nest.swap(j + 1, j);
            } else {
                break;
            }
        }
    }

    // Sort the fused-dim guards outward, but never past a For and never
    // when they contain an impure call.
    let inner_start = nest.len() - n_predicates_inner - n_predicates;
    for i in inner_start..nest.len() - n_predicates {
        debug_assert!(matches!(nest[i], Container::IfInner { .. }));
        if !ops::is_pure(nest[i].value().unwrap()) {
            continue;
        }
        for j in (0..i).rev() {
            if matches!(nest[j], Container::For { .. }) {
                break;
            }
            if !expr_uses_var(nest[j + 1].value().unwrap(), nest[j].name()) {
                nest.swap(j + 1, j);
            } else {
                break;
            }
        }
    }

    // Sort the remaining ifs outward so bounds inference sees the tightest
    // domains.
    for i in nest.len() - n_predicates..nest.len() {
        debug_assert!(matches!(nest[i], Container::If { .. }));
        if !ops::is_pure(nest[i].value().unwrap()) {
            continue;
        }
        for j in (0..i).rev() {
            if !expr_uses_var(nest[j + 1].value().unwrap(), nest[j].name()) {
                nest.swap(j + 1, j);
            } else {
                break;
            }
        }
    }

    // Rewrap the statement in the sorted containers.
    for container in nest.iter().rev() {
        stmt = match container {
            Container::Let { name, value } => {
                Stmt::let_stmt(name.clone(), value.clone(), stmt)
            }
            Container::If { condition } | Container::IfInner { condition, .. } => {
                Stmt::if_then_else(condition.clone(), stmt, None)
            }
            Container::For { dim_idx, name } => {
                let dim = &stage_s.dims[*dim_idx];
                Stmt::for_loop(
                    name.clone(),
                    loop_min_var(name),
                    loop_extent_var(name),
                    dim.for_type,
                    dim.device_api,
                    stmt,
                )
            }
        };
    }

    // Bounds for the variables the splits created.
    for split in stage_s.splits.iter().rev() {
        for (name, value) in compute_loop_bounds_after_split(split, prefix) {
            stmt = Stmt::let_stmt(name, value, stmt);
        }
    }

    // The dummy outermost loop always runs once.
    let outermost = format!("{prefix}{}", ops::OUTERMOST_DIM);
    stmt = Stmt::let_stmt(format!("{outermost}.loop_min"), Expr::i32(0), stmt);
    stmt = Stmt::let_stmt(format!("{outermost}.loop_max"), Expr::i32(0), stmt);
    stmt = Stmt::let_stmt(format!("{outermost}.loop_extent"), Expr::i32(1), stmt);

    // Loop bounds of the pure args in terms of the `.min`/`.max` symbols
    // that bounds binding defines.
    for arg in &func.args {
        let var = format!("{prefix}{arg}");
        let min = Expr::var_i32(format!("{var}.min"));
        let max = Expr::var_i32(format!("{var}.max"));
        stmt = Stmt::let_stmt(format!("{var}.loop_extent"), (max.clone() + 1) - min.clone(), stmt);
        stmt = Stmt::let_stmt(format!("{var}.loop_min"), min, stmt);
        stmt = Stmt::let_stmt(format!("{var}.loop_max"), max, stmt);
    }

    // Same for the reduction variables; their domain is explicit.
    for rv in &stage_s.rvars {
        let var = format!("{prefix}{}", rv.var);
        let min = Expr::var_i32(format!("{var}.min"));
        let max = Expr::var_i32(format!("{var}.max"));
        stmt = Stmt::let_stmt(format!("{var}.loop_extent"), (max.clone() + 1) - min.clone(), stmt);
        stmt = Stmt::let_stmt(format!("{var}.loop_max"), max, stmt);
        stmt = Stmt::let_stmt(format!("{var}.loop_min"), min, stmt);
        // The domain itself comes from the schedule.
        stmt = Stmt::let_stmt(
            format!("{var}.max"),
            simplify(&(rv.min.clone() + rv.extent.clone() - 1)),
            stmt,
        );
        stmt = Stmt::let_stmt(format!("{var}.min"), rv.min.clone(), stmt);
    }

    Ok(stmt)
}

// ---------------------------------------------------------------------------
// Provide nests and specializations
// ---------------------------------------------------------------------------

struct InjectPlaceholderPrefetch<'a> {
    env: &'a Environment,
    prefix: &'a str,
    directives: &'a [PrefetchDirective],
}

impl rasterlang_core::Mutator for InjectPlaceholderPrefetch<'_> {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        let s = rasterlang_core::mutate::walk_stmt(self, s);
        if let StmtKind::For { name, min, extent, for_type, device_api, body } = s.kind() {
            for d in self.directives {
                if name == &format!("{}{}", self.prefix, d.at) {
                    let types = self
                        .env
                        .get(&d.name)
                        .map(|f| f.output_types.clone())
                        .unwrap_or_default();
                    let body = Stmt::prefetch(
                        d.name.clone(),
                        types,
                        Vec::new(),
                        d.clone(),
                        Expr::const_true(),
                        body.clone(),
                    );
                    return Stmt::for_loop(
                        name.clone(),
                        min.clone(),
                        extent.clone(),
                        *for_type,
                        *device_api,
                        body,
                    );
                }
            }
        }
        s
    }
}

/// Builds the loop nest computing one definition, including specializations.
pub fn build_provide_loop_nest(
    env: &Environment,
    prefix: &str,
    func: &Function,
    def: &Definition,
    start_fuse: i64,
    is_update: bool,
) -> Result<Stmt, LowerError> {
    // The (multi-dimensional, multi-valued) store node.
    let values: Vec<Expr> = def.values.iter().map(|v| qualify(prefix, v)).collect();
    let site: Vec<Expr> = def.args.iter().map(|a| qualify(prefix, a)).collect();
    for (i, v) in values.iter().enumerate() {
        trace!(value = i, expr = ?v, "provide value");
    }
    let body = Stmt::provide(func.name.clone(), values, site, Expr::const_true());

    let mut stmt = build_loop_nest(body, prefix, start_fuse, func, def, is_update)?;

    if !def.schedule.prefetches.is_empty() {
        let mut injector = InjectPlaceholderPrefetch {
            env,
            prefix,
            directives: &def.schedule.prefetches,
        };
        stmt = rasterlang_core::Mutator::mutate_stmt(&mut injector, &stmt);
    }

    // Wrap in the specialized variants, innermost-first so the first
    // specialization in the list is checked first.
    for (i, s) in def.specializations.iter().enumerate().rev() {
        match &s.failure_message {
            None => {
                let then_case =
                    build_provide_loop_nest(env, prefix, func, &s.definition, start_fuse, is_update)?;
                stmt = Stmt::if_then_else(s.condition.clone(), then_case, Some(stmt));
            }
            Some(message) => {
                if i != def.specializations.len() - 1 {
                    return Err(LowerError::IllegalSpecialization {
                        func: func.name.clone(),
                        reason: "specialize_fail() must be the last specialization".into(),
                    });
                }
                if s.condition.as_const_int() != Some(1) {
                    return Err(LowerError::IllegalSpecialization {
                        func: func.name.clone(),
                        reason: "specialize_fail() requires a constant-true condition".into(),
                    });
                }
                let error = ops::error_call(
                    "halide_error_specialize_fail",
                    vec![Expr::string(message.clone())],
                );
                stmt = Stmt::assert_stmt(Expr::const_false(), error);
            }
        }
    }

    Ok(stmt)
}

// ---------------------------------------------------------------------------
// Extern stages
// ---------------------------------------------------------------------------

fn buffer_var(name: &str, binding: VarBinding) -> Expr {
    Expr::var_bound(Type::handle(), format!("{name}.buffer"), binding)
}

/// A cropped descriptor for the given stage region of `fn_name`, built on
/// the stack via `buffer_crop`.
fn make_crop(src_buffer: Expr, stage_name: &str, args: &[String], dims: usize) -> Expr {
    let alloca_size = Expr::call(
        Type::int(32),
        intrinsic::SIZE_OF_BUFFER_T,
        vec![],
        CallKind::PureIntrinsic,
    );
    let cropped = Expr::call(
        Type::handle(),
        intrinsic::ALLOCA,
        vec![alloca_size],
        CallKind::Intrinsic,
    );
    let shape = Expr::call(
        Type::handle(),
        intrinsic::ALLOCA,
        // One {min, extent, stride} triple of int32s per dimension.
        vec![Expr::i32(12 * dims as i32)],
        CallKind::Intrinsic,
    );
    let mut mins = Vec::new();
    let mut extents = Vec::new();
    for arg in args {
        let var = format!("{stage_name}{arg}");
        let min = Expr::var_i32(format!("{var}.min"));
        let max = Expr::var_i32(format!("{var}.max"));
        mins.push(min.clone());
        extents.push(max - min + 1);
    }
    Expr::call(
        Type::handle(),
        intrinsic::BUFFER_CROP,
        vec![cropped, shape, src_buffer, ops::make_struct(mins), ops::make_struct(extents)],
        CallKind::Extern,
    )
}

/// Builds the statement invoking an extern stage: argument marshalling,
/// optional crops, MSAN annotations, the call, crop retirement, and the
/// result check.
pub fn build_extern_produce(
    env: &Environment,
    f: &Function,
    target: &rasterlang_core::Target,
) -> Result<Stmt, LowerError> {
    let ext = f.extern_def.as_ref().expect("build_extern_produce on a non-extern function");
    let def = f
        .init_def
        .as_ref()
        .expect("extern functions carry a definition for their loop dims");

    // Crops are needed when the extern stage has non-extern loops besides
    // the placeholder outermost dim.
    let dims = &def.schedule.dims;
    let extern_count = dims.iter().filter(|d| d.for_type == ForType::Extern).count();
    let needs_crops = !dims.is_empty() && extern_count + 1 < dims.len();

    let mut extern_call_args: Vec<Expr> = Vec::new();
    let mut lets: Vec<(String, Expr)> = Vec::new();
    let mut buffers_to_annotate: Vec<(Expr, usize)> = Vec::new();
    let mut buffer_contents_to_annotate: Vec<Expr> = Vec::new();
    let mut cropped_buffers: Vec<(Expr, Expr)> = Vec::new();

    for arg in &ext.args {
        match arg {
            ExternArgument::Expr(e) => extern_call_args.push(e.clone()),
            ExternArgument::Func(input_name) => {
                let input = env
                    .get(input_name)
                    .unwrap_or_else(|| panic!("extern input '{input_name}' not in environment"));
                if input.can_be_inlined() && input.schedule.compute_level.is_inlined() {
                    return Err(LowerError::ExternWithInlinedInput {
                        func: f.name.clone(),
                        input: input_name.clone(),
                    });
                }
                let same_level = input.schedule.store_level == input.schedule.compute_level;
                if !needs_crops && same_level {
                    for k in 0..input.outputs() {
                        let buf = buffer_var(&input.buffer_name(k), VarBinding::Free);
                        extern_call_args.push(buf.clone());
                        buffers_to_annotate.push((buf.clone(), input.dimensions()));
                        buffer_contents_to_annotate.push(buf);
                    }
                } else {
                    // Crop just the required region in case the input was
                    // folded; a fold crossing the crop asserts at runtime.
                    let stage_name = input.stage_prefix(input.stages() - 1);
                    for k in 0..input.outputs() {
                        let src = buffer_var(&input.buffer_name(k), VarBinding::Free);
                        let cropped =
                            make_crop(src.clone(), &stage_name, &input.args, input.dimensions());
                        let buf_name = format!("{}.{}.tmp_buffer", input.name, k);
                        let buf = Expr::var(Type::handle(), buf_name.clone());
                        extern_call_args.push(buf.clone());
                        buffers_to_annotate.push((buf.clone(), input.dimensions()));
                        buffer_contents_to_annotate.push(buf.clone());
                        cropped_buffers.push((buf, src));
                        lets.push((buf_name, cropped));
                    }
                }
            }
            ExternArgument::Buffer(name) => {
                let buf = buffer_var(name, VarBinding::Image(name.clone()));
                extern_call_args.push(buf.clone());
                buffers_to_annotate.push((buf.clone(), f.dimensions()));
                buffer_contents_to_annotate.push(buf);
            }
            ExternArgument::ImageParam(name) => {
                // The caller fills both the descriptor and its contents;
                // annotating here could mask missed initialization.
                let buf = buffer_var(name, VarBinding::Param(name.clone()));
                extern_call_args.push(buf);
            }
        }
    }

    // Output buffer descriptors.
    let same_level = f.schedule.store_level == f.schedule.compute_level;
    if !needs_crops && same_level {
        for k in 0..f.outputs() {
            let buf = buffer_var(&f.buffer_name(k), VarBinding::Free);
            extern_call_args.push(buf.clone());
            buffers_to_annotate.push((buf, f.dimensions()));
        }
    } else {
        // Folded or nested storage: crop an output descriptor for just this
        // subregion.
        let stage_name = f.stage_prefix(0);
        for k in 0..f.outputs() {
            let src = buffer_var(&f.buffer_name(k), VarBinding::Free);
            let cropped = make_crop(src.clone(), &stage_name, &f.args, f.dimensions());
            let buf_name = format!("{}.{}.tmp_buffer", f.name, k);
            let buf = Expr::var(Type::handle(), buf_name.clone());
            extern_call_args.push(buf.clone());
            buffers_to_annotate.push((buf.clone(), f.dimensions()));
            cropped_buffers.push((buf, src));
            lets.push((buf_name, cropped));
        }
    }

    // MSAN wants the descriptors marked initialized before the call.
    let mut annotate: Option<Stmt> = None;
    if target.has_feature(rasterlang_core::Feature::Msan) {
        let mut push = |s: Stmt| {
            annotate = Some(match annotate.take() {
                Some(prev) => Stmt::block(prev, s),
                None => s,
            });
        };
        for (buf, dims) in &buffers_to_annotate {
            let size = Expr::call(
                Type::int(32),
                intrinsic::SIZE_OF_BUFFER_T,
                vec![],
                CallKind::PureIntrinsic,
            );
            push(Stmt::evaluate(ops::error_call(
                "halide_msan_annotate_memory_is_initialized",
                vec![buf.clone(), size],
            )));
            let shape = Expr::call(
                Type::handle(),
                intrinsic::BUFFER_GET_SHAPE,
                vec![buf.clone()],
                CallKind::Extern,
            );
            push(Stmt::evaluate(ops::error_call(
                "halide_msan_annotate_memory_is_initialized",
                vec![shape, Expr::i32(12 * *dims as i32)],
            )));
        }
        for buf in &buffer_contents_to_annotate {
            push(Stmt::evaluate(ops::error_call(
                "halide_msan_annotate_buffer_is_initialized",
                vec![buf.clone()],
            )));
        }
    }

    // The call itself, its result bound for the status check.
    let call = Expr::call(
        Type::int(32),
        ext.function_name.clone(),
        extern_call_args,
        CallKind::Extern,
    );
    let result_name = unique_name("t");
    let result = Expr::var_i32(&result_name);
    let error = ops::error_call(
        "halide_error_extern_stage_failed",
        vec![Expr::string(ext.function_name.clone()), result.clone()],
    );
    let mut check = Stmt::assert_stmt(ops::eq(result, Expr::i32(0)), error);

    // Retire the crops before checking, so device allocations made by the
    // extern stage against the crops are released on every path.
    if !cropped_buffers.is_empty() {
        let mut cleanup_args = Vec::new();
        for (cropped, parent) in &cropped_buffers {
            cleanup_args.push(cropped.clone());
            cleanup_args.push(parent.clone());
        }
        let one = cropped_buffers.len() == 1;
        if !one {
            cleanup_args.push(Expr::reinterpret(Type::handle(), Expr::u64(0)));
        }
        let cleanup_struct = ops::make_struct(cleanup_args);
        let retire = if one {
            intrinsic::BUFFER_RETIRE_CROP
        } else {
            intrinsic::BUFFER_RETIRE_CROPS
        };
        let cleanup = Expr::call(
            Type::int(32),
            retire,
            vec![cleanup_struct],
            CallKind::Extern,
        );
        check = Stmt::block(Stmt::evaluate(cleanup), check);
    }

    check = Stmt::let_stmt(result_name, call, check);

    if let Some(annotate) = annotate {
        check = Stmt::block(annotate, check);
    }

    for (name, value) in lets.into_iter().rev() {
        check = Stmt::let_stmt(name, value, check);
    }

    debug!(func = %f.name, extern_fn = %ext.function_name, "built extern produce");

    // Wrap in the extern loop nest; the reduction predicate does not apply
    // to extern stages.
    let mut def_no_pred = def.clone();
    def_no_pred.predicate = Expr::const_true();
    build_loop_nest(check, &f.stage_prefix(0), -1, f, &def_no_pred, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::schedule::Dim;
    use rasterlang_core::stmt::DeviceApi;
    use rasterlang_core::Target;

    fn elementwise_2d(name: &str) -> Function {
        let x = Expr::var_i32("x");
        let y = Expr::var_i32("y");
        Function::with_definition(
            name,
            vec!["x".to_string(), "y".to_string()],
            vec![x + y],
        )
    }

    fn strip_lets(mut s: &Stmt) -> &Stmt {
        while let StmtKind::LetStmt { body, .. } = s.kind() {
            s = body;
        }
        s
    }

    #[test]
    fn pointwise_nest_is_fors_around_a_provide() {
        let g = elementwise_2d("g");
        let def = g.init_def.clone().unwrap();
        let env = Environment::new();
        let stmt = build_provide_loop_nest(&env, "g.s0.", &g, &def, -1, false).unwrap();

        // Peel bound lets; the loops go __outermost, y, x from the outside in.
        let mut s = strip_lets(&stmt);
        let mut loops = Vec::new();
        loop {
            match s.kind() {
                StmtKind::For { name, body, .. } => {
                    loops.push(name.clone());
                    s = strip_lets(body);
                }
                _ => break,
            }
        }
        assert_eq!(loops, vec!["g.s0.__outermost", "g.s0.y", "g.s0.x"]);
        match s.kind() {
            StmtKind::Provide { name, values, args, .. } => {
                assert_eq!(name, "g");
                assert_eq!(args.len(), 2);
                assert_eq!(
                    values[0],
                    Expr::var_i32("g.s0.x") + Expr::var_i32("g.s0.y")
                );
            }
            other => panic!("expected Provide at the center, got {other:?}"),
        }
    }

    #[test]
    fn split_introduces_base_let_and_bounds() {
        let mut g = elementwise_2d("g");
        {
            let def = g.init_def.as_mut().unwrap();
            def.schedule.splits.push(Split {
                old_var: "x".to_string(),
                outer: "xo".to_string(),
                inner: "xi".to_string(),
                factor: Expr::i32(4),
                kind: SplitKind::Split,
                tail: TailStrategy::ShiftInwards,
            });
            // Replace x with xo, xi in the dim list.
            let dims = &mut def.schedule.dims;
            let x_idx = dims.iter().position(|d| d.var == "x").unwrap();
            dims[x_idx].var = "xi".to_string();
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
        let def = g.init_def.clone().unwrap();
        let stmt =
            build_provide_loop_nest(&Environment::new(), "g.s0.", &g, &def, -1, false).unwrap();

        // Somewhere in the nest there is a let for the shifted base.
        let mut found_base = false;
        let mut found_outer_extent = false;
        let mut s = stmt.clone();
        loop {
            match s.kind() {
                StmtKind::LetStmt { name, body, .. } => {
                    if name == "g.s0.xi.base" {
                        found_base = true;
                    }
                    if name == "g.s0.xo.loop_extent" {
                        found_outer_extent = true;
                    }
                    s = body.clone();
                }
                StmtKind::For { body, .. } => s = body.clone(),
                StmtKind::IfThenElse { then_case, .. } => s = then_case.clone(),
                _ => break,
            }
        }
        assert!(found_base, "split should introduce a .base let");
        assert!(found_outer_extent, "split should define the outer loop extent");
    }

    #[test]
    fn guard_with_if_adds_likely_predicate() {
        let mut g = elementwise_2d("g");
        {
            let def = g.init_def.as_mut().unwrap();
            def.schedule.splits.push(Split {
                old_var: "x".to_string(),
                outer: "xo".to_string(),
                inner: "xi".to_string(),
                factor: Expr::i32(4),
                kind: SplitKind::Split,
                tail: TailStrategy::GuardWithIf,
            });
            let dims = &mut def.schedule.dims;
            let x_idx = dims.iter().position(|d| d.var == "x").unwrap();
            dims[x_idx].var = "xi".to_string();
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
        let def = g.init_def.clone().unwrap();
        let stmt =
            build_provide_loop_nest(&Environment::new(), "g.s0.", &g, &def, -1, false).unwrap();

        // Hunt for an IfThenElse whose condition is a likely() call.
        let mut found_guard = false;
        let mut stack = vec![stmt];
        while let Some(s) = stack.pop() {
            match s.kind() {
                StmtKind::IfThenElse { condition, then_case, .. } => {
                    if condition.is_intrinsic(intrinsic::LIKELY) {
                        found_guard = true;
                    }
                    stack.push(then_case.clone());
                }
                StmtKind::LetStmt { body, .. } => stack.push(body.clone()),
                StmtKind::For { body, .. } => stack.push(body.clone()),
                _ => {}
            }
        }
        assert!(found_guard, "GuardWithIf should leave a likely() guard");
    }

    #[test]
    fn extern_produce_checks_the_status_code() {
        let mut f = elementwise_2d("f");
        f.extern_def = Some(rasterlang_core::ExternDefinition {
            function_name: "blur_stage".to_string(),
            args: vec![rasterlang_core::ExternArgument::ImageParam("input".to_string())],
        });
        // The whole stage is extern; no crops are needed.
        for d in &mut f.init_def.as_mut().unwrap().schedule.dims {
            if d.var != ops::OUTERMOST_DIM {
                d.for_type = ForType::Extern;
            }
        }
        let stmt = build_extern_produce(&Environment::new(), &f, &Target::host()).unwrap();

        // Somewhere inside: a let binding the extern result, checked == 0.
        let mut found_call = false;
        let mut found_check = false;
        let mut stack = vec![stmt];
        while let Some(s) = stack.pop() {
            match s.kind() {
                StmtKind::LetStmt { value, body, .. } => {
                    if let rasterlang_core::ExprKind::Call { name, args, .. } = value.kind() {
                        if name == "blur_stage" {
                            found_call = true;
                            // The input param descriptor and the output
                            // descriptor are both passed.
                            assert_eq!(args.len(), 2);
                            assert_eq!(args[0].as_variable(), Some("input.buffer"));
                            assert_eq!(args[1].as_variable(), Some("f.buffer"));
                        }
                    }
                    stack.push(body.clone());
                }
                StmtKind::AssertStmt { error, .. } => {
                    if let rasterlang_core::ExprKind::Call { name, .. } = error.kind() {
                        if name == "halide_error_extern_stage_failed" {
                            found_check = true;
                        }
                    }
                }
                StmtKind::For { body, .. } => stack.push(body.clone()),
                StmtKind::Block { first, rest } => {
                    stack.push(first.clone());
                    stack.push(rest.clone());
                }
                StmtKind::IfThenElse { then_case, .. } => stack.push(then_case.clone()),
                _ => {}
            }
        }
        assert!(found_call);
        assert!(found_check);
    }

    #[test]
    fn specialize_fail_must_be_last() {
        let mut g = elementwise_2d("g");
        let plain = g.init_def.clone().unwrap();
        {
            let def = g.init_def.as_mut().unwrap();
            def.specializations.push(rasterlang_core::Specialization {
                condition: Expr::const_true(),
                definition: plain.clone(),
                failure_message: Some("unsupported".into()),
            });
            def.specializations.push(rasterlang_core::Specialization {
                condition: ops::gt(Expr::var_i32("n"), Expr::i32(0)),
                definition: plain.clone(),
                failure_message: None,
            });
        }
        let def = g.init_def.clone().unwrap();
        let err = build_provide_loop_nest(&Environment::new(), "g.s0.", &g, &def, -1, false)
            .unwrap_err();
        assert!(matches!(err, LowerError::IllegalSpecialization { .. }));
    }

    #[test]
    fn specializations_nest_as_if_chains() {
        let mut g = elementwise_2d("g");
        let plain = g.init_def.clone().unwrap();
        let cond = ops::gt(Expr::var_i32("n"), Expr::i32(0));
        g.init_def.as_mut().unwrap().specializations.push(rasterlang_core::Specialization {
            condition: cond.clone(),
            definition: plain,
            failure_message: None,
        });
        let def = g.init_def.clone().unwrap();
        let stmt = build_provide_loop_nest(&Environment::new(), "g.s0.", &g, &def, -1, false)
            .unwrap();
        match stmt.kind() {
            StmtKind::IfThenElse { condition, else_case, .. } => {
                assert_eq!(condition, &cond);
                assert!(else_case.is_some());
            }
            other => panic!("expected a specialization IfThenElse, got {other:?}"),
        }
    }
}
