//! Lexical symbol tables used by every pass.
//!
//! A [`Scope`] maps a name to a stack of bindings; `push`/`pop` pairs must
//! balance within a traversal. Losing balance is a fatal internal error,
//! so `pop` panics rather than returning an `Option`.

use std::collections::HashMap;

use smallvec::SmallVec;

#[derive(Debug, Clone)]
pub struct Scope<T> {
    bindings: HashMap<String, SmallVec<[T; 2]>>,
}

impl<T> Scope<T> {
    pub fn new() -> Scope<T> {
        Scope { bindings: HashMap::new() }
    }

    pub fn push(&mut self, name: impl Into<String>, value: T) {
        self.bindings.entry(name.into()).or_default().push(value);
    }

    pub fn pop(&mut self, name: &str) -> T {
        let stack = self
            .bindings
            .get_mut(name)
            .unwrap_or_else(|| panic!("popping '{name}' which was never pushed"));
        let value = stack
            .pop()
            .unwrap_or_else(|| panic!("unbalanced pop of '{name}'"));
        if stack.is_empty() {
            self.bindings.remove(name);
        }
        value
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// The innermost binding for `name`.
    pub fn get(&self, name: &str) -> Option<&T> {
        self.bindings.get(name).and_then(|stack| stack.last())
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Iterates over the innermost binding of every name, in no particular
    /// order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.bindings
            .iter()
            .filter_map(|(k, v)| v.last().map(|value| (k.as_str(), value)))
    }
}

impl<T> Default for Scope<T> {
    fn default() -> Self {
        Scope::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn innermost_binding_wins() {
        let mut s: Scope<i32> = Scope::new();
        s.push("x", 1);
        s.push("x", 2);
        assert_eq!(s.get("x"), Some(&2));
        assert_eq!(s.pop("x"), 2);
        assert_eq!(s.get("x"), Some(&1));
        assert_eq!(s.pop("x"), 1);
        assert!(!s.contains("x"));
    }

    #[test]
    #[should_panic]
    fn unbalanced_pop_panics() {
        let mut s: Scope<i32> = Scope::new();
        s.push("x", 1);
        s.pop("x");
        s.pop("x");
    }

    #[test]
    fn iter_sees_innermost_only() {
        let mut s: Scope<i32> = Scope::new();
        s.push("a", 1);
        s.push("a", 2);
        s.push("b", 3);
        let mut seen: Vec<(&str, i32)> = s.iter().map(|(k, v)| (k, *v)).collect();
        seen.sort();
        assert_eq!(seen, vec![("a", 2), ("b", 3)]);
    }
}
