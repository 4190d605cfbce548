//! The declarative pipeline model: functions, definitions, specializations,
//! extern stages, and the name -> Function environment.

use indexmap::IndexMap;

use crate::error::CoreError;
use crate::expr::{CallKind, Expr, ExprKind};
use crate::schedule::{FuncSchedule, StageSchedule};
use crate::types::Type;
use crate::visit::{walk_expr, Visitor};

/// One definition of a function: values stored to a target site, under an
/// optional predicate, with its own stage schedule and specializations.
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    /// The store site, one expression per pure dimension.
    pub args: Vec<Expr>,
    /// The tuple of stored values.
    pub values: Vec<Expr>,
    /// Reduction-domain predicate; `const_true` when absent.
    pub predicate: Expr,
    pub schedule: StageSchedule,
    pub specializations: Vec<Specialization>,
}

impl Definition {
    pub fn new(args: Vec<Expr>, values: Vec<Expr>) -> Definition {
        Definition {
            args,
            values,
            predicate: Expr::const_true(),
            schedule: StageSchedule::default(),
            specializations: Vec::new(),
        }
    }

    /// The predicate split on top-level `&&`s, innermost conjuncts first.
    pub fn split_predicate(&self) -> Vec<Expr> {
        let mut out = Vec::new();
        split_conjuncts(&self.predicate, &mut out);
        out.retain(|p| p.as_const_int() != Some(1));
        out
    }
}

fn split_conjuncts(e: &Expr, out: &mut Vec<Expr>) {
    if let ExprKind::And { a, b } = e.kind() {
        split_conjuncts(a, out);
        split_conjuncts(b, out);
    } else {
        out.push(e.clone());
    }
}

/// A guarded alternative definition. A specialization with a failure
/// message has no body; it lowers to an assert.
#[derive(Debug, Clone, PartialEq)]
pub struct Specialization {
    pub condition: Expr,
    pub definition: Definition,
    pub failure_message: Option<String>,
}

/// One argument passed to an extern stage.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternArgument {
    /// A plain scalar expression.
    Expr(Expr),
    /// The buffer of another pipeline function.
    Func(String),
    /// A named image owned by the module.
    Buffer(String),
    /// A buffer parameter supplied by the caller.
    ImageParam(String),
}

/// An externally implemented stage replacing the loop-nest body.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternDefinition {
    pub function_name: String,
    pub args: Vec<ExternArgument>,
}

/// A named multidimensional function: pure dimensions, output types, an
/// initial definition, update definitions, and schedules.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    /// Pure dimension names, innermost first.
    pub args: Vec<String>,
    pub output_types: Vec<Type>,
    pub init_def: Option<Definition>,
    pub updates: Vec<Definition>,
    pub extern_def: Option<ExternDefinition>,
    pub schedule: FuncSchedule,
}

impl Function {
    /// A function with a pure definition and the default inline schedule.
    pub fn with_definition(
        name: impl Into<String>,
        args: Vec<String>,
        values: Vec<Expr>,
    ) -> Function {
        let name = name.into();
        let output_types: Vec<Type> = values.iter().map(|v| v.ty()).collect();
        let site: Vec<Expr> = args.iter().map(Expr::var_i32).collect();
        let mut def = Definition::new(site, values);
        def.schedule.dims = StageSchedule::default_dims(&args, &[]);
        Function {
            schedule: FuncSchedule::inlined_default(&args),
            name,
            args,
            output_types,
            init_def: Some(def),
            updates: Vec::new(),
            extern_def: None,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.args.len()
    }

    pub fn outputs(&self) -> usize {
        self.output_types.len()
    }

    pub fn has_pure_definition(&self) -> bool {
        self.init_def.is_some()
    }

    pub fn has_extern_definition(&self) -> bool {
        self.extern_def.is_some()
    }

    pub fn has_update_definition(&self) -> bool {
        !self.updates.is_empty()
    }

    /// A pure function has exactly one definition with no reduction domain.
    pub fn is_pure(&self) -> bool {
        !self.has_update_definition()
            && !self.has_extern_definition()
            && self
                .init_def
                .as_ref()
                .is_some_and(|d| d.schedule.rvars.is_empty())
    }

    pub fn can_be_inlined(&self) -> bool {
        self.is_pure() && self.has_pure_definition()
    }

    /// The definition for stage `k` (0 = init, k>0 = update k-1).
    pub fn definition(&self, stage: usize) -> Option<&Definition> {
        if stage == 0 {
            self.init_def.as_ref()
        } else {
            self.updates.get(stage - 1)
        }
    }

    /// Total stage count (init plus updates).
    pub fn stages(&self) -> usize {
        (self.init_def.is_some() as usize) + self.updates.len()
    }

    /// The canonical `<name>.s<k>.` prefix for a stage.
    pub fn stage_prefix(&self, stage: usize) -> String {
        format!("{}.s{}.", self.name, stage)
    }

    /// The name of this function's k'th output buffer symbol.
    pub fn buffer_name(&self, k: usize) -> String {
        if self.outputs() > 1 {
            format!("{}.{}", self.name, k)
        } else {
            self.name.clone()
        }
    }
}

/// The environment of every function reachable from the outputs, keyed by
/// name. Insertion order is preserved, which keeps downstream iteration
/// deterministic.
pub type Environment = IndexMap<String, Function>;

struct FindCalls {
    calls: Vec<String>,
}

impl Visitor for FindCalls {
    fn visit_expr(&mut self, e: &Expr) {
        if let ExprKind::Call { name, kind: CallKind::PipelineFunc, .. } = e.kind() {
            if !self.calls.contains(name) {
                self.calls.push(name.clone());
            }
        }
        walk_expr(self, e);
    }
}

/// Every distinct pipeline function called from this function's
/// definitions (including specializations) or extern arguments.
pub fn direct_callees(f: &Function) -> Vec<String> {
    let mut finder = FindCalls { calls: Vec::new() };
    let mut visit_def = |def: &Definition, finder: &mut FindCalls| {
        for v in &def.values {
            finder.visit_expr(v);
        }
        for a in &def.args {
            finder.visit_expr(a);
        }
        finder.visit_expr(&def.predicate);
    };
    if let Some(def) = &f.init_def {
        visit_def(def, &mut finder);
        for s in &def.specializations {
            finder.visit_expr(&s.condition);
            visit_def(&s.definition, &mut finder);
        }
    }
    for def in &f.updates {
        visit_def(def, &mut finder);
        for s in &def.specializations {
            finder.visit_expr(&s.condition);
            visit_def(&s.definition, &mut finder);
        }
    }
    if let Some(ext) = &f.extern_def {
        for arg in &ext.args {
            if let ExternArgument::Func(name) = arg {
                if !finder.calls.contains(name) {
                    finder.calls.push(name.clone());
                }
            }
        }
    }
    finder.calls
}

/// Builds the environment reachable from `outputs`. Every callee must be
/// registered in `known`; a call to an unregistered name is an error.
pub fn build_environment(
    outputs: &[Function],
    known: &[Function],
) -> Result<Environment, CoreError> {
    let mut env = Environment::new();
    let mut stack: Vec<String> = Vec::new();
    for f in outputs {
        insert(f, &mut env)?;
        stack.push(f.name.clone());
    }
    while let Some(name) = stack.pop() {
        let callees = direct_callees(&env[&name]);
        for callee in callees {
            if env.contains_key(&callee) {
                continue;
            }
            let f = known
                .iter()
                .find(|f| f.name == callee)
                .ok_or_else(|| CoreError::UnknownFunction { name: callee.clone() })?;
            insert(f, &mut env)?;
            stack.push(callee);
        }
    }
    Ok(env)
}

fn insert(f: &Function, env: &mut Environment) -> Result<(), CoreError> {
    if let Some(existing) = env.get(&f.name) {
        if existing != f {
            return Err(CoreError::DuplicateFunction { name: f.name.clone() });
        }
        return Ok(());
    }
    env.insert(f.name.clone(), f.clone());
    Ok(())
}

/// A call expression reading component `value_index` of a pipeline function.
pub fn call_func(f: &Function, args: Vec<Expr>, value_index: usize) -> Expr {
    Expr::call_indexed(
        f.output_types[value_index],
        f.name.clone(),
        args,
        CallKind::PipelineFunc,
        value_index,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;

    fn pointwise(name: &str) -> Function {
        let x = Expr::var_i32("x");
        Function::with_definition(name, vec!["x".to_string()], vec![x])
    }

    #[test]
    fn pure_function_properties() {
        let f = pointwise("f");
        assert!(f.is_pure());
        assert!(f.can_be_inlined());
        assert_eq!(f.dimensions(), 1);
        assert_eq!(f.stages(), 1);
        assert_eq!(f.stage_prefix(0), "f.s0.");
    }

    #[test]
    fn split_predicate_flattens_conjunctions() {
        let x = Expr::var_i32("x");
        let mut def = Definition::new(vec![x.clone()], vec![x.clone()]);
        def.predicate = Expr::and(
            ops::lt(x.clone(), Expr::i32(10)),
            ops::ge(x.clone(), Expr::i32(2)),
        );
        let parts = def.split_predicate();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], ops::lt(x.clone(), Expr::i32(10)));
    }

    #[test]
    fn environment_is_closed_over_calls() {
        let g = pointwise("g");
        let mut f = pointwise("f");
        let call = call_func(&g, vec![Expr::var_i32("x")], 0);
        f.init_def.as_mut().unwrap().values = vec![call];

        let env = build_environment(&[f.clone()], &[f.clone(), g.clone()]).unwrap();
        assert_eq!(env.len(), 2);
        assert!(env.contains_key("g"));

        let missing = build_environment(&[f], &[]);
        assert!(matches!(missing, Err(CoreError::UnknownFunction { .. })));
    }

    #[test]
    fn buffer_names_for_tuples() {
        let x = Expr::var_i32("x");
        let f = Function::with_definition(
            "f",
            vec!["x".to_string()],
            vec![x.clone(), x + 1],
        );
        assert_eq!(f.buffer_name(0), "f.0");
        assert_eq!(f.buffer_name(1), "f.1");
        let g = pointwise("g");
        assert_eq!(g.buffer_name(0), "g");
    }
}
