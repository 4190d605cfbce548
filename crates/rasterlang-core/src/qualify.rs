//! Name qualification: prefixing every free name in a definition body so a
//! stage's variables live in their own `<func>.s<k>.` namespace.

use crate::expr::{Expr, ExprKind, VarBinding};
use crate::mutate::{walk_expr, Mutator};

struct Qualify<'a> {
    prefix: &'a str,
}

impl Mutator for Qualify<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        match e.kind() {
            ExprKind::Variable { name, binding } => {
                // Buffer parameters and images are global names.
                if binding.is_buffer() {
                    e.clone()
                } else {
                    Expr::var_bound(
                        e.ty(),
                        format!("{}{}", self.prefix, name),
                        binding.clone(),
                    )
                }
            }
            ExprKind::Let { name, value, body } => {
                let value = self.mutate_expr(value);
                let body = self.mutate_expr(body);
                Expr::let_in(format!("{}{}", self.prefix, name), value, body)
            }
            _ => walk_expr(self, e),
        }
    }
}

/// Prefixes every variable and let binder in `e` with `prefix`. Variables
/// bound to buffer parameters are left alone.
pub fn qualify(prefix: &str, e: &Expr) -> Expr {
    Qualify { prefix }.mutate_expr(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    #[test]
    fn prefixes_free_variables() {
        let e = Expr::var_i32("x") + Expr::var_i32("y");
        let out = qualify("f.s0.", &e);
        assert_eq!(out, Expr::var_i32("f.s0.x") + Expr::var_i32("f.s0.y"));
    }

    #[test]
    fn prefixes_let_binders_and_uses() {
        let e = Expr::let_in("t", Expr::var_i32("x"), Expr::var_i32("t") + 1);
        let out = qualify("g.s1.", &e);
        assert_eq!(
            out,
            Expr::let_in("g.s1.t", Expr::var_i32("g.s1.x"), Expr::var_i32("g.s1.t") + 1)
        );
    }

    #[test]
    fn leaves_buffer_params_alone() {
        let buf = Expr::var_bound(
            Type::handle(),
            "input.buffer",
            VarBinding::Param("input".into()),
        );
        let out = qualify("f.s0.", &(buf.clone() /* handle passes through */));
        assert_eq!(out, buf);
    }

    #[test]
    fn rdom_vars_are_prefixed() {
        let r = Expr::var_bound(Type::int(32), "rx", VarBinding::ReductionDomain);
        let out = qualify("f.s1.", &r);
        assert_eq!(
            out,
            Expr::var_bound(Type::int(32), "f.s1.rx", VarBinding::ReductionDomain)
        );
    }
}
