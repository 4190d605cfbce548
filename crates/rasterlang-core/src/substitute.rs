//! Name-keyed and structural substitution over the IR.
//!
//! The name-keyed forms replace free references only: descending into a
//! `Let`, `LetStmt`, or `For` that rebinds a name hides that name for the
//! duration of its body.

use std::collections::HashMap;

use crate::expr::{Expr, ExprKind};
use crate::mutate::{walk_expr, walk_stmt, Mutator};
use crate::scope::Scope;
use crate::stmt::{Stmt, StmtKind};
use crate::visit::{self, Visitor};

struct Substitute<'a> {
    replace: &'a HashMap<String, Expr>,
    hidden: Scope<()>,
}

impl Substitute<'_> {
    fn find_replacement(&self, name: &str) -> Option<Expr> {
        if self.hidden.contains(name) {
            None
        } else {
            self.replace.get(name).cloned()
        }
    }
}

impl Mutator for Substitute<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        match e.kind() {
            ExprKind::Variable { name, .. } => {
                self.find_replacement(name).unwrap_or_else(|| e.clone())
            }
            ExprKind::Let { name, value, body } => {
                let new_value = self.mutate_expr(value);
                self.hidden.push(name.clone(), ());
                let new_body = self.mutate_expr(body);
                self.hidden.pop(name);
                if new_value.same_as(value) && new_body.same_as(body) {
                    e.clone()
                } else {
                    Expr::let_in(name.clone(), new_value, new_body)
                }
            }
            _ => walk_expr(self, e),
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => {
                let new_value = self.mutate_expr(value);
                self.hidden.push(name.clone(), ());
                let new_body = self.mutate_stmt(body);
                self.hidden.pop(name);
                if new_value.same_as(value) && new_body.same_as(body) {
                    s.clone()
                } else {
                    Stmt::let_stmt(name.clone(), new_value, new_body)
                }
            }
            StmtKind::For { name, min, extent, for_type, device_api, body } => {
                let new_min = self.mutate_expr(min);
                let new_extent = self.mutate_expr(extent);
                self.hidden.push(name.clone(), ());
                let new_body = self.mutate_stmt(body);
                self.hidden.pop(name);
                if new_min.same_as(min) && new_extent.same_as(extent) && new_body.same_as(body)
                {
                    s.clone()
                } else {
                    Stmt::for_loop(
                        name.clone(),
                        new_min,
                        new_extent,
                        *for_type,
                        *device_api,
                        new_body,
                    )
                }
            }
            _ => walk_stmt(self, s),
        }
    }
}

/// Replaces free references to `name` in an expression.
pub fn substitute(name: &str, replacement: Expr, e: &Expr) -> Expr {
    let mut map = HashMap::new();
    map.insert(name.to_string(), replacement);
    substitute_map(&map, e)
}

/// Replaces free references to `name` in a statement.
pub fn substitute_stmt(name: &str, replacement: Expr, s: &Stmt) -> Stmt {
    let mut map = HashMap::new();
    map.insert(name.to_string(), replacement);
    substitute_map_stmt(&map, s)
}

/// Simultaneous substitution of several names in an expression.
pub fn substitute_map(map: &HashMap<String, Expr>, e: &Expr) -> Expr {
    Substitute { replace: map, hidden: Scope::new() }.mutate_expr(e)
}

/// Simultaneous substitution of several names in a statement.
pub fn substitute_map_stmt(map: &HashMap<String, Expr>, s: &Stmt) -> Stmt {
    Substitute { replace: map, hidden: Scope::new() }.mutate_stmt(s)
}

struct SubstituteExpr<'a> {
    find: &'a Expr,
    replacement: &'a Expr,
}

impl Mutator for SubstituteExpr<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        if e == self.find {
            self.replacement.clone()
        } else {
            walk_expr(self, e)
        }
    }
}

/// Replaces every subtree structurally equal to `find`. Linear in the node
/// size per match attempt; use sparingly.
pub fn substitute_expr(find: &Expr, replacement: &Expr, e: &Expr) -> Expr {
    SubstituteExpr { find, replacement }.mutate_expr(e)
}

/// Statement flavor of [`substitute_expr`].
pub fn substitute_expr_stmt(find: &Expr, replacement: &Expr, s: &Stmt) -> Stmt {
    SubstituteExpr { find, replacement }.mutate_stmt(s)
}

struct UsesVar<'a> {
    name: &'a str,
    hidden: Scope<()>,
    found: bool,
}

impl Visitor for UsesVar<'_> {
    fn visit_expr(&mut self, e: &Expr) {
        if self.found {
            return;
        }
        match e.kind() {
            ExprKind::Variable { name, .. } => {
                if name == self.name && !self.hidden.contains(name) {
                    self.found = true;
                }
            }
            ExprKind::Let { name, value, body } => {
                self.visit_expr(value);
                self.hidden.push(name.clone(), ());
                self.visit_expr(body);
                self.hidden.pop(name);
            }
            _ => visit::walk_expr(self, e),
        }
    }

    fn visit_stmt(&mut self, s: &Stmt) {
        if self.found {
            return;
        }
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => {
                self.visit_expr(value);
                self.hidden.push(name.clone(), ());
                self.visit_stmt(body);
                self.hidden.pop(name);
            }
            StmtKind::For { name, min, extent, body, .. } => {
                self.visit_expr(min);
                self.visit_expr(extent);
                self.hidden.push(name.clone(), ());
                self.visit_stmt(body);
                self.hidden.pop(name);
            }
            _ => visit::walk_stmt(self, s),
        }
    }
}

/// True if the expression references `name` free.
pub fn expr_uses_var(e: &Expr, name: &str) -> bool {
    let mut v = UsesVar { name, hidden: Scope::new(), found: false };
    v.visit_expr(e);
    v.found
}

/// True if the statement references `name` free.
pub fn stmt_uses_var(s: &Stmt, name: &str) -> bool {
    let mut v = UsesVar { name, hidden: Scope::new(), found: false };
    v.visit_stmt(s);
    v.found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;

    #[test]
    fn replaces_free_references() {
        let x = Expr::var_i32("x");
        let e = x.clone() + x.clone();
        let out = substitute("x", Expr::i32(3), &e);
        assert_eq!(out, Expr::i32(3) + Expr::i32(3));
    }

    #[test]
    fn respects_let_shadowing() {
        // let x = 1 in x + y
        let e = Expr::let_in("x", Expr::i32(1), Expr::var_i32("x") + Expr::var_i32("y"));
        let out = substitute("x", Expr::i32(9), &e);
        // The bound x stays; only free names are touched.
        assert_eq!(out, e);
        let out = substitute("y", Expr::i32(9), &e);
        assert_eq!(
            out,
            Expr::let_in("x", Expr::i32(1), Expr::var_i32("x") + Expr::i32(9))
        );
    }

    #[test]
    fn respects_for_shadowing() {
        let body = Stmt::evaluate(Expr::var_i32("i"));
        let s = Stmt::serial_for("i", Expr::var_i32("i"), Expr::i32(4), body.clone());
        let out = substitute_stmt("i", Expr::i32(7), &s);
        // Loop min is outside the binding, the body is inside it.
        assert_eq!(
            out,
            Stmt::serial_for("i", Expr::i32(7), Expr::i32(4), body)
        );
    }

    #[test]
    fn substitution_of_absent_name_is_identity() {
        let e = Expr::var_i32("a") * Expr::i32(2);
        let out = substitute("zzz", Expr::i32(1), &e);
        assert!(out.same_as(&e));
    }

    #[test]
    fn structural_substitution() {
        let x = Expr::var_i32("x");
        let find = x.clone() + 1;
        let e = ops::min(x.clone() + 1, x.clone());
        let out = substitute_expr(&find, &Expr::i32(0), &e);
        assert_eq!(out, ops::min(Expr::i32(0), x));
    }

    #[test]
    fn idempotent_map_substitutes_idempotently() {
        let mut map = HashMap::new();
        map.insert("a".to_string(), Expr::var_i32("b") + 1);
        map.insert("c".to_string(), Expr::i32(3));
        let e = Expr::var_i32("a") * Expr::var_i32("c");
        let once = substitute_map(&map, &e);
        let twice = substitute_map(&map, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn uses_var_sees_through_bindings() {
        let e = Expr::let_in("x", Expr::var_i32("y"), Expr::var_i32("x"));
        assert!(expr_uses_var(&e, "y"));
        assert!(!expr_uses_var(&e, "x"));
        let s = Stmt::serial_for("i", Expr::i32(0), Expr::i32(4), Stmt::evaluate(Expr::var_i32("i")));
        assert!(!stmt_uses_var(&s, "i"));
    }
}
