//! Realization order: fused-group partitioning and a deterministic
//! leaves-first topological sort of the calls-into DAG.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::graphmap::DiGraphMap;
use thiserror::Error;
use tracing::debug;

use rasterlang_core::function::{direct_callees, Environment};

#[derive(Debug, Error)]
pub enum OrderError {
    /// Non-fused dependencies form a cycle.
    #[error("circular pipeline: functions {names:?} depend on each other")]
    CircularPipeline { names: Vec<String> },

    /// A fused pair names a function outside the environment.
    #[error("compute_with of '{func}' refers to unknown function '{with}'")]
    UnknownFusedFunction { func: String, with: String },
}

/// The realization order of `env`, leaves first, plus the fused groups in
/// the same order. Functions requested to be computed with each other form
/// one group; rank ties break by name.
pub fn realization_order(
    outputs: &[String],
    env: &Environment,
) -> Result<(Vec<String>, Vec<Vec<String>>), OrderError> {
    // Union fused stages into groups keyed by a representative name.
    let mut group_of: BTreeMap<String, String> = BTreeMap::new();
    for name in env.keys() {
        group_of.insert(name.clone(), name.clone());
    }
    for (name, f) in env {
        for stage in 0..f.stages() {
            let Some(def) = f.definition(stage) else { continue };
            for pair in &def.schedule.fused_pairs {
                if !env.contains_key(&pair.func_2) {
                    return Err(OrderError::UnknownFusedFunction {
                        func: name.clone(),
                        with: pair.func_2.clone(),
                    });
                }
                union(&mut group_of, name, &pair.func_2);
            }
        }
    }

    // The calls-into DAG between groups.
    let names: Vec<&String> = env.keys().collect();
    let index_of: BTreeMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();
    let rep_index = |name: &str| -> usize {
        let rep = find(&group_of, name);
        index_of[rep.as_str()]
    };

    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for name in env.keys() {
        graph.add_node(rep_index(name));
    }
    for (name, f) in env {
        let caller = rep_index(name);
        for callee in direct_callees(f) {
            if !env.contains_key(&callee) {
                continue;
            }
            let callee = rep_index(&callee);
            if callee != caller {
                graph.add_edge(callee, caller, ());
            }
        }
    }

    // Kahn's algorithm with a name-ordered frontier for determinism.
    let mut remaining_deps: BTreeMap<usize, usize> = graph
        .nodes()
        .map(|n| {
            (
                n,
                graph
                    .neighbors_directed(n, petgraph::Direction::Incoming)
                    .count(),
            )
        })
        .collect();
    let mut frontier: BTreeSet<&String> = remaining_deps
        .iter()
        .filter(|(_, deps)| **deps == 0)
        .map(|(n, _)| names[*n])
        .collect();

    let mut group_order: Vec<usize> = Vec::new();
    while let Some(name) = frontier.iter().next().cloned() {
        frontier.remove(name);
        let n = index_of[name.as_str()];
        group_order.push(n);
        for succ in graph.neighbors_directed(n, petgraph::Direction::Outgoing) {
            let deps = remaining_deps.get_mut(&succ).unwrap();
            *deps -= 1;
            if *deps == 0 {
                frontier.insert(names[succ]);
            }
        }
    }

    if group_order.len() != graph.node_count() {
        let mut stuck: Vec<String> = remaining_deps
            .iter()
            .filter(|(_, deps)| **deps > 0)
            .map(|(n, _)| names[*n].clone())
            .collect();
        stuck.sort();
        return Err(OrderError::CircularPipeline { names: stuck });
    }

    // Expand groups back into member lists and a flat order.
    let mut order = Vec::new();
    let mut fused_groups = Vec::new();
    for rep in group_order {
        let rep_name = names[rep];
        let mut members: Vec<String> = env
            .keys()
            .filter(|n| find(&group_of, n) == *find(&group_of, rep_name))
            .cloned()
            .collect();
        sort_group_members(&mut members, env);
        debug!(group = ?members, "realization group");
        order.extend(members.iter().cloned());
        fused_groups.push(members);
    }

    let _ = outputs; // Outputs participate through env; kept for the signature.
    Ok((order, fused_groups))
}

/// Orders a fused group so producers come first and the fusion parent (the
/// stage nothing in the group fuses into) comes last.
fn sort_group_members(members: &mut [String], env: &Environment) {
    members.sort();
    members.sort_by_key(|name| {
        let f = &env[name];
        let is_parent = (0..f.stages()).all(|stage| {
            f.definition(stage)
                .map(|d| d.schedule.fuse_level.level.is_inlined())
                .unwrap_or(true)
        });
        is_parent as usize
    });
}

fn find(group_of: &BTreeMap<String, String>, name: &str) -> String {
    let mut current = name.to_string();
    while group_of[&current] != current {
        current = group_of[&current].clone();
    }
    current
}

fn union(group_of: &mut BTreeMap<String, String>, a: &str, b: &str) {
    let ra = find(group_of, a);
    let rb = find(group_of, b);
    if ra != rb {
        // Deterministic representative: the lexicographically smaller name.
        if ra < rb {
            group_of.insert(rb, ra);
        } else {
            group_of.insert(ra, rb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasterlang_core::expr::Expr;
    use rasterlang_core::function::{build_environment, call_func, Function};
    use rasterlang_core::schedule::FusedPair;

    fn pointwise(name: &str) -> Function {
        Function::with_definition(name, vec!["x".to_string()], vec![Expr::var_i32("x")])
    }

    fn calling(name: &str, callee: &Function) -> Function {
        let mut f = pointwise(name);
        f.init_def.as_mut().unwrap().values =
            vec![call_func(callee, vec![Expr::var_i32("x")], 0)];
        f
    }

    #[test]
    fn leaves_come_first() {
        let h = pointwise("h");
        let g = calling("g", &h);
        let f = calling("f", &g);
        let env = build_environment(&[f.clone()], &[f, g, h]).unwrap();
        let (order, groups) = realization_order(&["f".to_string()], &env).unwrap();
        assert_eq!(order, vec!["h", "g", "f"]);
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn name_breaks_rank_ties() {
        let b = pointwise("b");
        let a = pointwise("a");
        let mut f = pointwise("f");
        let call_a = call_func(&a, vec![Expr::var_i32("x")], 0);
        let call_b = call_func(&b, vec![Expr::var_i32("x")], 0);
        f.init_def.as_mut().unwrap().values = vec![call_a + call_b];
        let env = build_environment(&[f.clone()], &[f, a, b]).unwrap();
        let (order, _) = realization_order(&["f".to_string()], &env).unwrap();
        assert_eq!(order, vec!["a", "b", "f"]);
    }

    #[test]
    fn fused_functions_share_a_group() {
        let g = pointwise("g");
        let mut h = pointwise("h");
        // h.compute_with(g, x): recorded on h as a fused pair with g.
        h.init_def.as_mut().unwrap().schedule.fused_pairs.push(FusedPair {
            func_1: "h".to_string(),
            stage_1: 0,
            func_2: "g".to_string(),
            stage_2: 0,
            var_name: "x".to_string(),
        });
        let mut f = pointwise("f");
        let call_g = call_func(&g, vec![Expr::var_i32("x")], 0);
        let call_h = call_func(&h, vec![Expr::var_i32("x")], 0);
        f.init_def.as_mut().unwrap().values = vec![call_g + call_h];
        let env = build_environment(&[f.clone()], &[f, g, h]).unwrap();
        let (_, groups) = realization_order(&["f".to_string()], &env).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec!["g".to_string(), "h".to_string()]);
    }

    #[test]
    fn cycles_are_reported() {
        // f and g call each other without fusion: a user error.
        let mut f = pointwise("f");
        let mut g = pointwise("g");
        f.init_def.as_mut().unwrap().values = vec![call_func(&g, vec![Expr::var_i32("x")], 0)];
        g.init_def.as_mut().unwrap().values = vec![rasterlang_core::Expr::call_indexed(
            rasterlang_core::Type::int(32),
            "f",
            vec![Expr::var_i32("x")],
            rasterlang_core::CallKind::PipelineFunc,
            0,
        )];
        let mut env = Environment::new();
        env.insert("f".to_string(), f);
        env.insert("g".to_string(), g);
        let err = realization_order(&["f".to_string()], &env).unwrap_err();
        assert!(matches!(err, OrderError::CircularPipeline { .. }));
    }
}
