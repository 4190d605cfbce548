//! Realization injection: walking the outer loop nest and placing each
//! fused group's produce/consume blocks at its compute level and its
//! Realize at its store level, or inlining the group when it qualifies.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use rasterlang_analysis::simplify::{is_const_one, simplify};
use rasterlang_core::expr::{CallKind, Expr, ExprKind};
use rasterlang_core::function::{Definition, Environment, ExternArgument, Function};
use rasterlang_core::mutate::{walk_expr, walk_stmt, Mutator};
use rasterlang_core::ops::{self, ROOT_LOOP_NAME};
use rasterlang_core::schedule::{var_name_match, LoopAlignStrategy, LoopLevel};
use rasterlang_core::stmt::{DeviceApi, ForType, Range, Stmt, StmtKind};
use rasterlang_core::substitute::substitute_stmt;
use rasterlang_core::visit::{walk_expr as visit_walk_expr, walk_stmt as visit_walk_stmt, Visitor};
use rasterlang_core::Target;

use crate::error::LowerError;
use crate::inline::inline_function;
use crate::loop_nest::{build_extern_produce, build_provide_loop_nest};

// ---------------------------------------------------------------------------
// Use-site queries
// ---------------------------------------------------------------------------

struct UsesFunc<'a> {
    func: &'a str,
    result: bool,
}

impl UsesFunc<'_> {
    fn is_buffer_ref(&self, e: &Expr) -> bool {
        if let ExprKind::Variable { name, .. } = e.kind() {
            e.ty().is_handle()
                && name.starts_with(&format!("{}.", self.func))
                && name.ends_with(".buffer")
        } else {
            false
        }
    }
}

impl Visitor for UsesFunc<'_> {
    fn visit_expr(&mut self, e: &Expr) {
        if self.result {
            return;
        }
        match e.kind() {
            ExprKind::Call { name, .. } if name == self.func => self.result = true,
            _ => {
                if self.is_buffer_ref(e) {
                    self.result = true;
                } else {
                    visit_walk_expr(self, e);
                }
            }
        }
    }
}

/// A call to the function, or a reference to one of its buffers, counts as
/// a use.
pub fn function_is_used_in_stmt(f: &Function, s: &Stmt) -> bool {
    let mut v = UsesFunc { func: &f.name, result: false };
    v.visit_stmt(s);
    v.result
}

struct IsRealized<'a> {
    func: &'a str,
    result: bool,
}

impl Visitor for IsRealized<'_> {
    fn visit_stmt(&mut self, s: &Stmt) {
        if self.result {
            return;
        }
        if let StmtKind::Realize { name, .. } = s.kind() {
            if name == self.func {
                self.result = true;
                return;
            }
        }
        visit_walk_stmt(self, s);
    }
}

pub fn function_is_already_realized_in_stmt(f: &Function, s: &Stmt) -> bool {
    let mut v = IsRealized { func: &f.name, result: false };
    v.visit_stmt(s);
    v.result
}

// ---------------------------------------------------------------------------
// Statement injection at a loop level
// ---------------------------------------------------------------------------

struct InjectStmt<'a> {
    injected: &'a Stmt,
    level: &'a LoopLevel,
    found: bool,
}

impl Mutator for InjectStmt<'_> {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if let StmtKind::For { name, min, extent, for_type, device_api, body } = s.kind() {
            let mut new_body = self.mutate_stmt(body);
            if self.level.matches_loop(name) {
                self.found = true;
                new_body = Stmt::block(new_body, self.injected.clone());
            }
            if new_body.same_as(body) {
                s.clone()
            } else {
                Stmt::for_loop(
                    name.clone(),
                    min.clone(),
                    extent.clone(),
                    *for_type,
                    *device_api,
                    new_body,
                )
            }
        } else {
            walk_stmt(self, s)
        }
    }
}

/// Appends `injected` inside the loop named by `level` within `root`, or
/// after `root` for inline/root levels.
fn inject_stmt(root: Option<Stmt>, injected: Stmt, level: &LoopLevel) -> Stmt {
    let Some(root) = root else { return injected };
    if level.is_inlined() || level.is_root() {
        return Stmt::block(root, injected);
    }
    let mut injector = InjectStmt { injected: &injected, level, found: false };
    let result = injector.mutate_stmt(&root);
    assert!(injector.found, "fuse level {level:?} not found in producer nest");
    result
}

// ---------------------------------------------------------------------------
// Fused-bounds plumbing
// ---------------------------------------------------------------------------

struct CollectBounds {
    bounds: HashMap<String, Expr>,
}

impl Visitor for CollectBounds {
    fn visit_stmt(&mut self, s: &Stmt) {
        if let StmtKind::LetStmt { name, .. } = s.kind() {
            if name.ends_with(".loop_min")
                || name.ends_with(".loop_max")
                || name.ends_with(".loop_extent")
            {
                self.bounds
                    .entry(name.clone())
                    .or_insert_with(|| Expr::var_i32(name.clone()));
            }
        }
        visit_walk_stmt(self, s);
    }
}

fn collect_bounds(s: &Stmt) -> HashMap<String, Expr> {
    let mut v = CollectBounds { bounds: HashMap::new() };
    v.visit_stmt(s);
    v.bounds
}

struct SubstituteFusedBounds<'a> {
    replacements: &'a HashMap<String, Expr>,
}

impl Mutator for SubstituteFusedBounds<'_> {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if let StmtKind::For { name, min, extent, for_type, device_api, body } = s.kind() {
            let min_name = min.as_variable();
            let extent_name = extent.as_variable();
            if let (Some(min_name), Some(extent_name)) = (min_name, extent_name) {
                let min_val = self.replacements.get(min_name).cloned();
                let extent_val = self.replacements.get(extent_name).cloned();
                if let (Some(min_val), Some(extent_val)) = (min_val, extent_val) {
                    let body = self.mutate_stmt(body);

                    let last_dot = name.rfind('.').expect("stage-qualified loop name");
                    let new_var =
                        format!("{}.fused.{}", &name[..last_dot], &name[last_dot + 1..]);

                    // The child loop of a fused group is a scheduling point,
                    // not a real loop; it must not be a device transition.
                    let (for_type, device_api) = if is_const_one(&extent_val) {
                        (ForType::Serial, DeviceApi::None)
                    } else {
                        (*for_type, *device_api)
                    };

                    let stmt = Stmt::for_loop(
                        new_var.clone(),
                        Expr::var_i32(format!("{new_var}.loop_min")),
                        Expr::var_i32(format!("{new_var}.loop_extent")),
                        for_type,
                        device_api,
                        body,
                    );
                    let stmt = Stmt::let_stmt(
                        format!("{new_var}.loop_min"),
                        min_val.clone(),
                        stmt,
                    );
                    let stmt = Stmt::let_stmt(
                        format!("{new_var}.loop_max"),
                        simplify(&(min_val + extent_val.clone() - 1)),
                        stmt,
                    );
                    let stmt =
                        Stmt::let_stmt(format!("{new_var}.loop_extent"), extent_val, stmt);
                    return substitute_stmt(name, Expr::var_i32(new_var), &stmt);
                }
            }
        }
        walk_stmt(self, s)
    }
}

fn substitute_fused_bounds(s: Stmt, replacements: &HashMap<String, Expr>) -> Stmt {
    if replacements.is_empty() {
        s
    } else {
        SubstituteFusedBounds { replacements }.mutate_stmt(&s)
    }
}

struct ShiftLoopNest<'a> {
    shifts: &'a HashMap<String, Expr>,
}

impl Mutator for ShiftLoopNest<'_> {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        let s = walk_stmt(self, s);
        if let StmtKind::For { name, min, extent, for_type, device_api, body } = s.kind() {
            if let Some(shift) = self.shifts.get(name) {
                debug!(loop_name = %name, shift = ?shift, "shifting fused loop");
                let adjusted = Expr::var_i32(name.clone()) + shift.clone();
                let body = substitute_stmt(name, adjusted, body);
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
        s
    }
}

// ---------------------------------------------------------------------------
// The injector
// ---------------------------------------------------------------------------

pub struct InjectFunctionRealization<'a> {
    funcs: &'a [Function],
    is_output_list: &'a [bool],
    target: &'a Target,
    env: &'a Environment,
    compute_level: LoopLevel,
    store_level: LoopLevel,
    found_compute_level: bool,
    found_store_level: bool,
    error: Option<LowerError>,
}

impl<'a> InjectFunctionRealization<'a> {
    pub fn new(
        funcs: &'a [Function],
        is_output_list: &'a [bool],
        target: &'a Target,
        env: &'a Environment,
    ) -> Self {
        InjectFunctionRealization {
            funcs,
            is_output_list,
            target,
            env,
            compute_level: funcs[0].schedule.compute_level.clone(),
            store_level: funcs[0].schedule.store_level.clone(),
            found_compute_level: false,
            found_store_level: false,
            error: None,
        }
    }

    pub fn run(mut self, s: &Stmt) -> Result<(Stmt, bool, bool), LowerError> {
        let out = self.mutate_stmt(s);
        if let Some(e) = self.error {
            return Err(e);
        }
        Ok((out, self.found_compute_level, self.found_store_level))
    }

    fn fail(&mut self, e: LowerError) -> Stmt {
        if self.error.is_none() {
            self.error = Some(e);
        }
        Stmt::no_op()
    }

    fn build_realize(&self, s: Stmt, func: &Function, is_output: bool) -> Stmt {
        if is_output {
            // Output storage is passed in by the caller.
            return s;
        }
        let bounds: Vec<Range> = func
            .args
            .iter()
            .map(|arg| {
                Range::new(
                    Expr::var_i32(format!("{}.{arg}.min_realized", func.name)),
                    Expr::var_i32(format!("{}.{arg}.extent_realized", func.name)),
                )
            })
            .collect();
        Stmt::realize(
            func.name.clone(),
            func.output_types.clone(),
            func.schedule.memory_type,
            bounds,
            Expr::const_true(),
            s,
        )
    }

    fn build_realize_group(&self, mut s: Stmt) -> Stmt {
        for (f, is_output) in self.funcs.iter().zip(self.is_output_list) {
            if function_is_already_realized_in_stmt(f, &s) {
                continue;
            }
            if function_is_used_in_stmt(f, &s) || *is_output {
                s = self.build_realize(s, f, *is_output);
            }
        }
        s
    }

    fn build_produce_definition(
        &self,
        f: &Function,
        prefix: &str,
        def: &Definition,
        is_update: bool,
        replacements: &mut HashMap<String, Expr>,
        add_lets: &mut Vec<(String, Expr)>,
    ) -> Result<Stmt, LowerError> {
        let dims = &def.schedule.dims;
        let fuse_level = &def.schedule.fuse_level.level;

        let mut start_fuse: i64 = -1;
        if let LoopLevel::At { var, .. } = fuse_level {
            let idx = dims
                .iter()
                .position(|d| var_name_match(&d.var, var))
                .expect("fuse level var must be in the dim list");
            start_fuse = idx as i64;
        }

        // Child fused loops collapse to a single iteration pinned to the
        // parent's loop variable; collect the bound replacements that
        // accomplish that.
        for pair in &def.schedule.fused_pairs {
            let f2 = &self.env[&pair.func_2];
            let def2 = f2
                .definition(pair.stage_2)
                .expect("fused stage must exist");
            let dims2 = &def2.schedule.dims;

            let idx = dims
                .iter()
                .position(|d| var_name_match(&d.var, &pair.var_name))
                .expect("fused var must be in the parent dim list");
            start_fuse = if start_fuse < 0 {
                idx as i64
            } else {
                start_fuse.min(idx as i64)
            };

            for i in idx..dims.len() - 1 {
                let var_orig =
                    format!("{}.s{}.{}", pair.func_1, pair.stage_1, dims[i].var);
                let val = Expr::var_i32(&var_orig);

                let dim2_idx = dims2.len() - (dims.len() - i);
                let var =
                    format!("{}.s{}.{}", pair.func_2, pair.stage_2, dims2[dim2_idx].var);
                replacements.insert(format!("{var}.loop_extent"), Expr::i32(1));
                replacements.insert(format!("{var}.loop_min"), val.clone());
                replacements.insert(format!("{var}.loop_max"), val);
            }
        }

        let mut produce =
            build_provide_loop_nest(self.env, prefix, f, def, start_fuse, is_update)?;

        // Hoist the containing lets; the union bounds of the parent fused
        // loop may refer to them.
        while let StmtKind::LetStmt { name, value, body } = produce.kind() {
            add_lets.push((name.clone(), value.clone()));
            let body = body.clone();
            produce = body;
        }
        Ok(produce)
    }

    fn collect_all_dependence(&self, def: &Definition) -> Vec<rasterlang_core::FusedPair> {
        let mut visited = HashSet::new();
        let mut dependence = Vec::new();
        let mut stack: Vec<rasterlang_core::FusedPair> =
            def.schedule.fused_pairs.clone();
        while let Some(pair) = stack.pop() {
            let key = format!("{}.s{}.{}", pair.func_2, pair.stage_2, pair.var_name);
            if !visited.insert(key) {
                continue;
            }
            let f2 = &self.env[&pair.func_2];
            let def2 = f2.definition(pair.stage_2).expect("fused stage must exist");
            stack.extend(def2.schedule.fused_pairs.iter().cloned());
            dependence.push(pair);
        }
        dependence
    }

    /// Replaces the parent fused loop bounds with the union over the group.
    fn replace_parent_bound_with_union_bound(
        &self,
        f: &Function,
        produce: Stmt,
        bounds: &HashMap<String, Expr>,
    ) -> Stmt {
        let prefix = format!("{}.s0", f.name);
        let Some(def) = &f.init_def else { return produce };
        let dims = &def.schedule.dims;

        let mut replacements: HashMap<String, Expr> = HashMap::new();
        for pair in self.collect_all_dependence(def) {
            let f2 = &self.env[&pair.func_2];
            let def2 = f2.definition(pair.stage_2).expect("fused stage must exist");
            let dims2 = &def2.schedule.dims;

            let Some(idx) = dims.iter().position(|d| var_name_match(&d.var, &pair.var_name))
            else {
                continue;
            };
            for i in idx..dims.len() - 1 {
                let dim2_idx = dims2.len() - (dims.len() - i);
                let var_2 =
                    format!("{}.s{}.{}", pair.func_2, pair.stage_2, dims2[dim2_idx].var);
                let min_2 = bounds[&format!("{var_2}.loop_min")].clone();
                let max_2 = bounds[&format!("{var_2}.loop_max")].clone();

                let var_1 = format!("{prefix}.{}", dims[i].var);
                let (min_1, max_1) = match (
                    replacements.get(&format!("{var_1}.loop_min")),
                    replacements.get(&format!("{var_1}.loop_max")),
                ) {
                    (Some(min), Some(max)) => (min.clone(), max.clone()),
                    _ => (
                        bounds[&format!("{var_1}.loop_min")].clone(),
                        bounds[&format!("{var_1}.loop_max")].clone(),
                    ),
                };

                let new_min = simplify(&ops::min(min_1, min_2));
                let new_max = simplify(&ops::max(max_1, max_2));
                let new_extent = simplify(&((new_max.clone() + 1) - new_min.clone()));
                replacements.insert(format!("{var_1}.loop_min"), new_min);
                replacements.insert(format!("{var_1}.loop_max"), new_max);
                replacements.insert(format!("{var_1}.loop_extent"), new_extent);
            }
        }

        substitute_fused_bounds(produce, &replacements)
    }

    fn compute_shift_factor(
        &self,
        prefix: &str,
        def: &Definition,
        bounds: &mut HashMap<String, Expr>,
        shifts: &mut HashMap<String, Expr>,
    ) {
        let dims = &def.schedule.dims;
        let fuse_level = &def.schedule.fuse_level.level;
        let align = &def.schedule.fuse_level.align;

        let LoopLevel::At { func: parent_func, stage: parent_stage, var } = fuse_level else {
            return;
        };
        let start_fuse = dims
            .iter()
            .position(|d| var_name_match(&d.var, var))
            .expect("fuse level var must be in the dim list");

        for dim in dims.iter().take(dims.len() - 1).skip(start_fuse) {
            let var = &dim.var;
            let strategy = align
                .iter()
                .find(|(k, _)| var_name_match(var, k))
                .map(|(_, v)| *v);
            let strategy = match strategy {
                Some(LoopAlignStrategy::AlignStart) => LoopAlignStrategy::AlignStart,
                Some(LoopAlignStrategy::AlignEnd) => LoopAlignStrategy::AlignEnd,
                _ => continue,
            };

            let parent_prefix = format!("{parent_func}.s{parent_stage}.");
            let min_key = format!("{prefix}{var}.loop_min");
            let max_key = format!("{prefix}{var}.loop_max");
            let child_min = bounds[&min_key].clone();
            let child_max = bounds[&max_key].clone();

            let shift_val = match strategy {
                LoopAlignStrategy::AlignStart => {
                    let parent_min = bounds[&format!("{parent_prefix}{var}.loop_min")].clone();
                    simplify(&(parent_min - child_min.clone()))
                }
                LoopAlignStrategy::AlignEnd => {
                    let parent_max = bounds[&format!("{parent_prefix}{var}.loop_max")].clone();
                    simplify(&(parent_max - child_max.clone()))
                }
                _ => unreachable!(),
            };

            shifts.insert(
                format!("{prefix}{var}"),
                simplify(&(Expr::i32(0) - shift_val.clone())),
            );
            bounds.insert(min_key, simplify(&(shift_val.clone() + child_min)));
            bounds.insert(max_key, simplify(&(shift_val + child_max)));
        }
    }

    fn build_pipeline_group(&mut self, consumer: Stmt) -> Result<Stmt, LowerError> {
        let mut num_skipped = 0;
        for (f, is_output) in self.funcs.iter().zip(self.is_output_list) {
            let skip = function_is_already_realized_in_stmt(f, &consumer)
                || !(function_is_used_in_stmt(f, &consumer) || *is_output);
            if skip {
                num_skipped += 1;
            }
        }
        if num_skipped == self.funcs.len() {
            return Ok(consumer);
        }
        if num_skipped != 0 {
            return Err(LowerError::InvalidComputeWith {
                func: self.funcs[0].name.clone(),
                reason: "fused groups must be entirely used or entirely unused".into(),
            });
        }

        // Build the loops, parent (the last member) first.
        let mut producer: Option<Stmt> = None;
        let mut replacements: HashMap<String, Expr> = HashMap::new();
        let mut add_lets: Vec<(String, Expr)> = Vec::new();

        for f in self.funcs.iter().rev() {
            if f.has_extern_definition() {
                let produce = build_extern_produce(self.env, f, self.target)?;
                producer = Some(inject_stmt(producer, produce, &LoopLevel::Inlined));
            } else {
                let def = f.init_def.as_ref().expect("group member needs a definition");
                let produce = self.build_produce_definition(
                    f,
                    &f.stage_prefix(0),
                    def,
                    false,
                    &mut replacements,
                    &mut add_lets,
                )?;
                producer = Some(inject_stmt(
                    producer,
                    produce,
                    &def.schedule.fuse_level.level.clone(),
                ));
            }
        }

        // Update stages interleave round-robin until all are placed.
        let mut some_updated = true;
        let mut j = 0;
        while j == 0 || some_updated {
            some_updated = false;
            for f in self.funcs.iter().rev() {
                if j < f.updates.len() {
                    let def = &f.updates[j];
                    let prefix = f.stage_prefix(j + 1);
                    let update = self.build_produce_definition(
                        f,
                        &prefix,
                        def,
                        true,
                        &mut replacements,
                        &mut add_lets,
                    )?;
                    producer = Some(inject_stmt(
                        producer,
                        update,
                        &def.schedule.fuse_level.level.clone(),
                    ));
                    some_updated = true;
                }
            }
            j += 1;
        }

        let mut producer = producer.expect("group built at least one producer");

        // Rewrap the hoisted lets.
        for (name, value) in add_lets.into_iter().rev() {
            producer = Stmt::let_stmt(name, value, producer);
        }

        // Original bounds of the nests, before fusion touches them.
        let mut bounds = collect_bounds(&producer);

        // Alignment shifts, parent before children so parent bounds stay put.
        let mut shifts: HashMap<String, Expr> = HashMap::new();
        for f in self.funcs.iter().rev() {
            if let Some(def) = &f.init_def {
                self.compute_shift_factor(&f.stage_prefix(0), def, &mut bounds, &mut shifts);
            }
            for (k, def) in f.updates.iter().enumerate() {
                self.compute_shift_factor(
                    &f.stage_prefix(k + 1),
                    def,
                    &mut bounds,
                    &mut shifts,
                );
            }
        }
        if !shifts.is_empty() {
            producer = ShiftLoopNest { shifts: &shifts }.mutate_stmt(&producer);
        }

        // Pin the child fused loops to the parent's loop variable.
        producer = substitute_fused_bounds(producer, &replacements);

        // And give the parent the union of the group's bounds.
        let parent = self.funcs.last().expect("nonempty group");
        producer = self.replace_parent_bound_with_union_bound(parent, producer, &bounds);

        // Produce markers for every member, consume markers for non-outputs.
        for f in self.funcs {
            producer = Stmt::producer(f.name.clone(), producer);
        }
        let mut consumer = consumer;
        for (f, is_output) in self.funcs.iter().zip(self.is_output_list) {
            if !is_output {
                consumer = Stmt::consumer(f.name.clone(), consumer);
            }
        }

        if consumer.is_no_op() {
            Ok(producer)
        } else {
            Ok(Stmt::block(producer, consumer))
        }
    }
}

impl Mutator for InjectFunctionRealization<'_> {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if self.error.is_some() {
            return s.clone();
        }
        match s.kind() {
            StmtKind::For { name, min, extent, for_type, device_api, body } => {
                let mut inner = body.clone();

                // Dig through placeholder prefetches.
                let mut prefetches = Vec::new();
                while let StmtKind::Prefetch {
                    name, types, directive, condition, body, ..
                } = inner.kind()
                {
                    prefetches.push((
                        name.clone(),
                        types.clone(),
                        directive.clone(),
                        condition.clone(),
                    ));
                    inner = body.clone();
                }

                // Dig through the lets, stopping at a side-effecting value:
                // an extern consumer shows up as a let with an impure RHS,
                // and the producer must not land after it.
                let mut lets = Vec::new();
                while let StmtKind::LetStmt { name, value, body } = inner.kind() {
                    if !ops::is_pure(value) {
                        break;
                    }
                    lets.push((name.clone(), value.clone()));
                    inner = body.clone();
                }

                // An inlined extern consumed inside a vectorized loop gets
                // realized immediately around the vector loop.
                if self.funcs[0].has_extern_definition()
                    && self.funcs[0].schedule.compute_level.is_inlined()
                    && *for_type == ForType::Vectorized
                    && !function_is_already_realized_in_stmt(&self.funcs[0], s)
                    && function_is_used_in_stmt(&self.funcs[0], s)
                {
                    debug!(func = %self.funcs[0].name, loop_name = %name,
                           "realizing inlined extern around vector loop");
                    let group = match self.build_pipeline_group(s.clone()) {
                        Ok(g) => g,
                        Err(e) => return self.fail(e),
                    };
                    let out =
                        self.build_realize(group, &self.funcs[0], self.is_output_list[0]);
                    self.found_store_level = true;
                    self.found_compute_level = true;
                    return out;
                }

                let mut new_body = self.mutate_stmt(&inner);
                if self.error.is_some() {
                    return s.clone();
                }

                if self.compute_level.matches_loop(name) {
                    debug!(loop_name = %name, "found compute level");
                    new_body = match self.build_pipeline_group(new_body) {
                        Ok(b) => b,
                        Err(e) => return self.fail(e),
                    };
                    self.found_compute_level = true;
                }

                if self.found_compute_level && self.store_level.matches_loop(name) {
                    debug!(loop_name = %name, "found store level");
                    new_body = self.build_realize_group(new_body);
                    self.found_store_level = true;
                }

                for (let_name, value) in lets.into_iter().rev() {
                    new_body = Stmt::let_stmt(let_name, value, new_body);
                }
                for (pf_name, types, directive, condition) in prefetches.into_iter().rev() {
                    new_body =
                        Stmt::prefetch(pf_name, types, Vec::new(), directive, condition, new_body);
                }

                if new_body.same_as(body) {
                    s.clone()
                } else {
                    Stmt::for_loop(
                        name.clone(),
                        min.clone(),
                        extent.clone(),
                        *for_type,
                        *device_api,
                        new_body,
                    )
                }
            }
            StmtKind::Provide { name, .. } => {
                // An inlined function with update stages needs a realization
                // around each consumer Provide.
                if name != &self.funcs[0].name
                    && !self.funcs[0].is_pure()
                    && self.funcs[0].schedule.compute_level.is_inlined()
                    && function_is_used_in_stmt(&self.funcs[0], s)
                {
                    let group = match self.build_pipeline_group(s.clone()) {
                        Ok(g) => g,
                        Err(e) => return self.fail(e),
                    };
                    let out =
                        self.build_realize(group, &self.funcs[0], self.is_output_list[0]);
                    self.found_store_level = true;
                    self.found_compute_level = true;
                    return out;
                }
                s.clone()
            }
            _ => walk_stmt(self, s),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule validation
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Site {
    is_parallel: bool,
    level: LoopLevel,
}

struct ComputeLegalSchedules<'a> {
    func: &'a Function,
    sites: Vec<Site>,
    sites_allowed: Vec<Site>,
    found: bool,
}

impl ComputeLegalSchedules<'_> {
    fn register_use(&mut self) {
        if !self.found {
            self.found = true;
            self.sites_allowed = self.sites.clone();
        } else {
            let common: Vec<Site> = self
                .sites
                .iter()
                .filter(|s1| {
                    self.sites_allowed
                        .iter()
                        .any(|s2| s1.level.matches_level(&s2.level))
                })
                .cloned()
                .collect();
            self.sites_allowed = common;
        }
    }
}

impl Visitor for ComputeLegalSchedules<'_> {
    fn visit_stmt(&mut self, s: &Stmt) {
        if let StmtKind::For { name, min, extent, for_type, body, .. } = s.kind() {
            self.visit_expr(min);
            self.visit_expr(extent);
            let level = parse_loop_level(name);
            self.sites.push(Site {
                is_parallel: for_type.is_unordered_parallel(),
                level,
            });
            self.visit_stmt(body);
            self.sites.pop();
        } else {
            visit_walk_stmt(self, s);
        }
    }

    fn visit_expr(&mut self, e: &Expr) {
        visit_walk_expr(self, e);
        match e.kind() {
            ExprKind::Call { name, .. } if name == &self.func.name => self.register_use(),
            ExprKind::Variable { name, .. }
                if e.ty().is_handle()
                    && name.starts_with(&format!("{}.", self.func.name))
                    && name.ends_with(".buffer") =>
            {
                self.register_use()
            }
            _ => {}
        }
    }
}

fn parse_loop_level(loop_name: &str) -> LoopLevel {
    if loop_name == ROOT_LOOP_NAME {
        return LoopLevel::Root;
    }
    let first_dot = loop_name.find('.').expect("qualified loop name");
    let last_dot = loop_name.rfind('.').unwrap();
    let func = &loop_name[..first_dot];
    let var = &loop_name[last_dot + 1..];
    let stage = loop_name[first_dot + 1..]
        .split('.')
        .next()
        .and_then(|s| s.strip_prefix('s'))
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(0);
    LoopLevel::at(func, stage, var)
}

fn level_to_source(level: &LoopLevel) -> String {
    match level {
        LoopLevel::Inlined => "compute_inline()".to_string(),
        LoopLevel::Root => "compute_root()".to_string(),
        LoopLevel::At { func, var, .. } => format!("compute_at({func}, {var})"),
    }
}

/// Checks one function's schedule against the IR built so far. Returns
/// whether a realization should be injected at all: a function that is
/// neither an output nor used anywhere is silently dropped.
fn validate_schedule(
    f: &Function,
    s: &Stmt,
    target: &Target,
    is_output: bool,
    env: &Environment,
) -> Result<bool, LowerError> {
    // Extern stages reject inlined func inputs and enforce sane loop types.
    if let Some(ext) = &f.extern_def {
        for arg in &ext.args {
            if let ExternArgument::Func(input) = arg {
                let g = &env[input];
                if g.schedule.compute_level.is_inlined() && g.can_be_inlined() {
                    return Err(LowerError::ExternWithInlinedInput {
                        func: f.name.clone(),
                        input: input.clone(),
                    });
                }
            }
        }
        if let Some(def) = &f.init_def {
            let mut in_extern_prefix =
                def.schedule.dims.first().map(|d| d.for_type) == Some(ForType::Extern);
            for d in &def.schedule.dims {
                match d.for_type {
                    ForType::Extern => {
                        if !in_extern_prefix {
                            return Err(LowerError::IllegalExternLoops {
                                func: f.name.clone(),
                                reason: format!(
                                    "extern loop '{}' may not sit outside a non-extern loop",
                                    d.var
                                ),
                            });
                        }
                    }
                    ForType::Serial | ForType::Parallel | ForType::Unrolled => {
                        in_extern_prefix = false;
                    }
                    other => {
                        return Err(LowerError::IllegalExternLoops {
                            func: f.name.clone(),
                            reason: format!(
                                "loop type {other:?} is not supported on extern stages ('{}')",
                                d.var
                            ),
                        });
                    }
                }
            }
        }
    }

    // Device placement requires the matching target feature.
    let mut definitions: Vec<&Definition> = Vec::new();
    if let Some(d) = &f.init_def {
        definitions.push(d);
    }
    definitions.extend(f.updates.iter());
    let mut i = 0;
    while i < definitions.len() {
        let def: &Definition = definitions[i];
        for spec in &def.specializations {
            definitions.push(&spec.definition);
        }
        i += 1;
    }
    for def in &definitions {
        for d in &def.schedule.dims {
            if !target.supports_device_api(d.device_api) {
                return Err(LowerError::UnsupportedDeviceApi {
                    func: f.name.clone(),
                    api: format!("{:?}", d.device_api),
                    target: format!("{:?}/{:?}", target.arch, target.os),
                });
            }
        }
        if def.schedule.allow_race_conditions
            && target.has_feature(rasterlang_core::Feature::Tsan)
        {
            warn!(
                func = %f.name,
                "allow_race_conditions() may report benign data races under ThreadSanitizer"
            );
        }
    }

    let store_at = &f.schedule.store_level;
    let compute_at = &f.schedule.compute_level;

    // Outputs are stored by the caller; anything but root is an error.
    if is_output {
        return if store_at.is_root() && compute_at.is_root() {
            Ok(true)
        } else {
            Err(LowerError::OutputNotRoot { func: f.name.clone() })
        };
    }

    let mut legal = ComputeLegalSchedules {
        func: f,
        sites: Vec::new(),
        sites_allowed: Vec::new(),
        found: false,
    };
    legal.visit_stmt(s);

    if !legal.found {
        // Not an output and never called: drop it.
        return Ok(false);
    }

    if store_at.is_inlined() && compute_at.is_inlined() {
        if f.is_pure() {
            crate::inline::validate_inlined_schedule(f)?;
        }
        return Ok(true);
    }

    let sites = &legal.sites_allowed;
    let mut store_idx = None;
    let mut compute_idx = None;
    for (i, site) in sites.iter().enumerate() {
        if site.level.matches_level(store_at) {
            store_idx = Some(i);
        }
        if site.level.matches_level(compute_at) && store_idx.is_some() {
            compute_idx = Some(i);
        }
    }

    if let (Some(si), Some(ci)) = (store_idx, compute_idx) {
        // A parallel loop between the store and compute sites races.
        let racy = sites[si + 1..=ci].iter().any(|s| s.is_parallel);
        if !racy {
            return Ok(true);
        }
        return Err(LowerError::InvalidComputeSite {
            func: f.name.clone(),
            reason: format!(
                "stored outside a parallel loop but computed within it \
                 ({} / {})",
                level_to_source(store_at),
                level_to_source(compute_at)
            ),
        });
    }

    let mut legal_sites: Vec<String> =
        sites.iter().map(|s| level_to_source(&s.level)).collect();
    legal_sites.dedup();
    Err(LowerError::InvalidComputeSite {
        func: f.name.clone(),
        reason: format!(
            "{} is not among the legal locations: [{}]",
            level_to_source(compute_at),
            legal_sites.join(", ")
        ),
    })
}

fn validate_fused_group_schedule(
    fused_groups: &[Vec<String>],
    env: &Environment,
) -> Result<(), LowerError> {
    for group in fused_groups {
        for fn_name in group {
            let f = &env[fn_name];
            if f.has_extern_definition() {
                continue;
            }
            for stage in 0..f.stages() {
                let Some(def) = f.definition(stage) else { continue };
                for p in &def.schedule.fused_pairs {
                    let f1 = &env[&p.func_1];
                    let f2 = &env[&p.func_2];
                    let def2 = f2.definition(p.stage_2).expect("fused stage must exist");

                    if !f2
                        .init_def
                        .as_ref()
                        .map(|d| d.specializations.is_empty())
                        .unwrap_or(true)
                    {
                        return Err(LowerError::InvalidComputeWith {
                            func: p.func_2.clone(),
                            reason: "a fused function must not have specializations".into(),
                        });
                    }
                    for (name, func) in [(&p.func_1, f1), (&p.func_2, f2)] {
                        if func.schedule.compute_level.is_inlined() {
                            return Err(LowerError::InvalidComputeWith {
                                func: (*name).clone(),
                                reason: "a fused function cannot be scheduled inline".into(),
                            });
                        }
                        if func.has_extern_definition() {
                            return Err(LowerError::InvalidComputeWith {
                                func: (*name).clone(),
                                reason: "a fused function cannot have an extern definition"
                                    .into(),
                            });
                        }
                    }
                    if !f1
                        .schedule
                        .compute_level
                        .matches_level(&f2.schedule.compute_level)
                    {
                        return Err(LowerError::InvalidComputeWith {
                            func: p.func_2.clone(),
                            reason: format!(
                                "compute levels of {} and {} do not match",
                                p.func_1, p.func_2
                            ),
                        });
                    }

                    let dims1 = &def.schedule.dims;
                    let dims2 = &def2.schedule.dims;
                    let i1 = dims1
                        .iter()
                        .position(|d| var_name_match(&d.var, &p.var_name))
                        .ok_or_else(|| LowerError::InvalidComputeWith {
                            func: p.func_1.clone(),
                            reason: format!("cannot find '{}' in its dims", p.var_name),
                        })?;
                    let i2 = dims2
                        .iter()
                        .position(|d| var_name_match(&d.var, &p.var_name))
                        .ok_or_else(|| LowerError::InvalidComputeWith {
                            func: p.func_2.clone(),
                            reason: format!("cannot find '{}' in its dims", p.var_name),
                        })?;

                    let n1 = dims1.len() - i1 - 1;
                    let n2 = dims2.len() - i2 - 1;
                    if n1 != n2 {
                        return Err(LowerError::InvalidComputeWith {
                            func: p.func_2.clone(),
                            reason: "the fused dim counts do not match".into(),
                        });
                    }
                    for k in 0..n1 {
                        let d1 = &dims1[i1 + k];
                        let d2 = &dims2[i2 + k];
                        let compatible = (var_name_match(&d1.var, &d2.var)
                            || var_name_match(&d2.var, &d1.var))
                            && d1.for_type == d2.for_type
                            && d1.device_api == d2.device_api
                            && d1.dim_type == d2.dim_type;
                        if !compatible {
                            return Err(LowerError::InvalidComputeWith {
                                func: p.func_2.clone(),
                                reason: format!(
                                    "fused dims {} and {} do not match",
                                    d1.var, d2.var
                                ),
                            });
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Outermost-loop cleanup
// ---------------------------------------------------------------------------

struct RemoveLoopsOverOutermost;

impl Mutator for RemoveLoopsOverOutermost {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.kind() {
            StmtKind::For { name, min, extent, device_api, body, .. }
                if name.ends_with(&format!(".{}", ops::OUTERMOST_DIM))
                    && is_const_one(&simplify(extent))
                    && *device_api == DeviceApi::None =>
            {
                self.mutate_stmt(&substitute_stmt(name, min.clone(), body))
            }
            StmtKind::LetStmt { name, value, body }
                if name.ends_with(&format!(".{}.loop_extent", ops::OUTERMOST_DIM))
                    || name.ends_with(&format!(".{}.loop_min", ops::OUTERMOST_DIM))
                    || name.ends_with(&format!(".{}.loop_max", ops::OUTERMOST_DIM)) =>
            {
                self.mutate_stmt(&substitute_stmt(name, simplify(value), body))
            }
            _ => walk_stmt(self, s),
        }
    }
}

/// Drops the trivial loops over the `__outermost` dummy dim along with
/// their bound definitions. Idempotent.
pub fn remove_loops_over_outermost(s: &Stmt) -> Stmt {
    RemoveLoopsOverOutermost.mutate_stmt(s)
}

fn group_should_be_inlined(funcs: &[Function]) -> bool {
    funcs.len() == 1
        && (funcs[0].has_extern_definition()
            || funcs[0]
                .init_def
                .as_ref()
                .map(|d| d.schedule.fused_pairs.is_empty())
                .unwrap_or(true))
        && funcs[0].can_be_inlined()
        && funcs[0].schedule.compute_level.is_inlined()
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Builds the full statement computing `outputs`, injecting or inlining
/// every fused group in reverse realization order.
pub fn schedule_functions(
    outputs: &[Function],
    fused_groups: &[Vec<String>],
    env: &Environment,
    target: &Target,
) -> Result<Stmt, LowerError> {
    let mut s = ops::root_loop(Stmt::no_op());

    validate_fused_group_schedule(fused_groups, env)?;

    for group in fused_groups.iter().rev() {
        let mut funcs: Vec<Function> = Vec::new();
        let mut is_output_list: Vec<bool> = Vec::new();
        for name in group {
            let f = env[name].clone();
            let is_output = outputs.iter().any(|o| o.name == f.name);
            // A reference in the function DAG may not survive into the IR
            // (e.g. an unused tuple component); such functions are dropped.
            if validate_schedule(&f, &s, target, is_output, env)? {
                funcs.push(f);
                is_output_list.push(is_output);
            }
        }
        if funcs.is_empty() {
            continue;
        }

        if group_should_be_inlined(&funcs) {
            debug!(func = %funcs[0].name, "inlining");
            s = inline_function(&s, &funcs[0])?;
        } else {
            debug!(group = ?funcs.iter().map(|f| &f.name).collect::<Vec<_>>(), "injecting realization");
            let injector =
                InjectFunctionRealization::new(&funcs, &is_output_list, target, env);
            let (out, found_compute, found_store) = injector.run(&s)?;
            assert!(
                found_compute && found_store,
                "store/compute levels not found for group containing '{}'",
                funcs[0].name
            );
            s = out;
        }
    }

    // Peel the placeholder loop over __root, then the trivial loops over
    // the dummy outermost dims.
    let s = match s.kind() {
        StmtKind::For { name, body, .. } if name == ROOT_LOOP_NAME => body.clone(),
        _ => unreachable!("the root placeholder loop must survive injection"),
    };
    Ok(remove_loops_over_outermost(&s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::function::call_func;
    use rasterlang_core::substitute::stmt_uses_var;

    fn pointwise(name: &str) -> Function {
        Function::with_definition(name, vec!["x".to_string()], vec![Expr::var_i32("x")])
    }

    fn output_of(mut f: Function) -> Function {
        f.schedule = rasterlang_core::FuncSchedule::root_default(&f.args.clone());
        f
    }

    fn env_of(funcs: &[Function]) -> Environment {
        let mut env = Environment::new();
        for f in funcs {
            env.insert(f.name.clone(), f.clone());
        }
        env
    }

    #[test]
    fn single_output_builds_bare_nest() {
        let f = output_of(pointwise("f"));
        let env = env_of(&[f.clone()]);
        let s = schedule_functions(
            &[f],
            &[vec!["f".to_string()]],
            &env,
            &Target::host(),
        )
        .unwrap();
        // The root and __outermost loops are gone.
        assert!(!stmt_uses_var(&s, ROOT_LOOP_NAME));
        let mut cur = s;
        let mut saw_for = false;
        loop {
            match cur.kind() {
                StmtKind::LetStmt { body, .. }
                | StmtKind::ProducerConsumer { body, .. } => cur = body.clone(),
                StmtKind::For { name, body, .. } => {
                    assert!(!name.ends_with(ops::OUTERMOST_DIM));
                    saw_for = true;
                    cur = body.clone();
                }
                _ => break,
            }
        }
        assert!(saw_for);
    }

    #[test]
    fn inlined_callee_disappears_into_caller() {
        let g = pointwise("g");
        let mut f = pointwise("f");
        f.init_def.as_mut().unwrap().values =
            vec![call_func(&g, vec![Expr::var_i32("x")], 0) + 1];
        let f = output_of(f);
        let env = env_of(&[f.clone(), g]);
        let s = schedule_functions(
            &[f],
            &[vec!["g".to_string()], vec!["f".to_string()]],
            &env,
            &Target::host(),
        )
        .unwrap();
        // No realize or producer node for g anywhere.
        assert!(!function_is_already_realized_in_stmt(&pointwise("g"), &s));
        assert!(!function_is_used_in_stmt(&pointwise("g"), &s));
    }

    #[test]
    fn compute_root_callee_gets_realize_and_producer() {
        let mut g = pointwise("g");
        g.schedule.store_level = LoopLevel::Root;
        g.schedule.compute_level = LoopLevel::Root;
        let mut f = pointwise("f");
        f.init_def.as_mut().unwrap().values =
            vec![call_func(&g, vec![Expr::var_i32("x")], 0)];
        let f = output_of(f);
        let env = env_of(&[f.clone(), g.clone()]);
        let s = schedule_functions(
            &[f],
            &[vec!["g".to_string()], vec!["f".to_string()]],
            &env,
            &Target::host(),
        )
        .unwrap();
        assert!(function_is_already_realized_in_stmt(&g, &s));
        // There is a produce marker for g and its consumer wraps f's nest.
        let mut found_produce = false;
        let mut stack = vec![s];
        while let Some(cur) = stack.pop() {
            match cur.kind() {
                StmtKind::ProducerConsumer { name, is_producer, body } => {
                    if name == "g" && *is_producer {
                        found_produce = true;
                    }
                    stack.push(body.clone());
                }
                StmtKind::Realize { body, .. } => stack.push(body.clone()),
                StmtKind::Block { first, rest } => {
                    stack.push(first.clone());
                    stack.push(rest.clone());
                }
                StmtKind::LetStmt { body, .. } => stack.push(body.clone()),
                StmtKind::For { body, .. } => stack.push(body.clone()),
                _ => {}
            }
        }
        assert!(found_produce);
    }

    #[test]
    fn compute_at_must_name_a_use_site() {
        let mut g = pointwise("g");
        g.schedule.store_level = LoopLevel::at("f", 0, "nonexistent");
        g.schedule.compute_level = LoopLevel::at("f", 0, "nonexistent");
        let mut f = pointwise("f");
        f.init_def.as_mut().unwrap().values =
            vec![call_func(&g, vec![Expr::var_i32("x")], 0)];
        let f = output_of(f);
        let env = env_of(&[f.clone(), g]);
        let err = schedule_functions(
            &[f],
            &[vec!["g".to_string()], vec!["f".to_string()]],
            &env,
            &Target::host(),
        )
        .unwrap_err();
        assert!(matches!(err, LowerError::InvalidComputeSite { .. }));
    }

    #[test]
    fn outputs_must_be_root() {
        let mut f = pointwise("f");
        f.schedule.store_level = LoopLevel::Inlined;
        f.schedule.compute_level = LoopLevel::Inlined;
        let env = env_of(&[f.clone()]);
        let err = schedule_functions(
            &[f],
            &[vec!["f".to_string()]],
            &env,
            &Target::host(),
        )
        .unwrap_err();
        assert!(matches!(err, LowerError::OutputNotRoot { .. }));
    }

    #[test]
    fn remove_loops_over_outermost_is_idempotent() {
        let inner = Stmt::provide(
            "f",
            vec![Expr::var_i32("x")],
            vec![Expr::var_i32("x")],
            Expr::const_true(),
        );
        let s = Stmt::let_stmt(
            "f.s0.__outermost.loop_extent",
            Expr::i32(1),
            Stmt::serial_for(
                "f.s0.__outermost",
                Expr::i32(0),
                Expr::i32(1),
                inner,
            ),
        );
        let once = remove_loops_over_outermost(&s);
        let twice = remove_loops_over_outermost(&once);
        assert_eq!(once, twice);
        assert!(!matches!(once.kind(), StmtKind::For { .. }));
    }
}
