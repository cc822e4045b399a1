//! Variable bindings with an undo trail.
//!
//! Every binding pushes the previous value onto the trail; backtracking to a
//! recorded [`Bsp`] replays the trail in reverse.

use std::collections::HashMap;

use crate::term::{List, Symbol, Term, Value};

/// Binding stack pointer: a position in the trail.
pub type Bsp = usize;

#[derive(Debug, Default, Clone)]
pub struct BindingManager {
    bindings: HashMap<Symbol, Term>,
    trail: Vec<(Symbol, Option<Term>)>,
}

impl BindingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bsp(&self) -> Bsp {
        self.trail.len()
    }

    pub fn bind(&mut self, var: &Symbol, value: Term) {
        let previous = self.bindings.insert(var.clone(), value);
        self.trail.push((var.clone(), previous));
    }

    pub fn value(&self, var: &Symbol) -> Option<&Term> {
        self.bindings.get(var)
    }

    pub fn is_bound(&self, var: &Symbol) -> bool {
        self.bindings.contains_key(var)
    }

    /// Undo every binding made after `to`.
    pub fn backtrack(&mut self, to: Bsp) {
        while self.trail.len() > to {
            if let Some((var, previous)) = self.trail.pop() {
                match previous {
                    Some(v) => self.bindings.insert(var, v),
                    None => self.bindings.remove(&var),
                };
            }
        }
    }

    /// Follow variable bindings until reaching a non-variable or an unbound variable.
    pub fn deref(&self, term: &Term) -> Term {
        let mut current = term.clone();
        // A chain longer than the number of bindings would have to be a cycle.
        for _ in 0..=self.bindings.len() {
            let next = match current.value() {
                Value::Variable(s) | Value::RestVariable(s) => match self.bindings.get(s) {
                    Some(v) => v.clone(),
                    None => return current,
                },
                _ => return current,
            };
            current = next;
        }
        current
    }

    /// Whether binding `var` to `term` would make a cyclic term.
    pub fn occurs(&self, var: &Symbol, term: &Term) -> bool {
        self.deep_deref(term).contains_variable(var)
    }

    /// Substitute bindings everywhere inside `term`, splicing bound rest variables.
    pub fn deep_deref(&self, term: &Term) -> Term {
        let term = self.deref(term);
        match term.value() {
            Value::List(list) => {
                let mut elements: Vec<Term> =
                    list.elements.iter().map(|e| self.deep_deref(e)).collect();
                let mut rest_var = None;
                if let Some(rest) = &list.rest_var {
                    let tail = self.deref(&Term::new(Value::Variable(rest.clone())));
                    match tail.value() {
                        Value::List(_) => {
                            let tail = self.deep_deref(&tail);
                            if let Value::List(tail) = tail.value() {
                                elements.extend(tail.elements.iter().cloned());
                                rest_var = tail.rest_var.clone();
                            }
                        }
                        Value::Variable(s) | Value::RestVariable(s) => rest_var = Some(s.clone()),
                        _ => rest_var = Some(rest.clone()),
                    }
                }
                term.clone_with_value(Value::List(List { elements, rest_var }))
            }
            _ => term.map_children(&mut |child: &Term| self.deep_deref(child)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s)
    }

    #[test]
    fn backtrack_restores_previous_state() {
        let mut b = BindingManager::new();
        b.bind(&sym("x"), Term::int(1));
        let mark = b.bsp();
        b.bind(&sym("y"), Term::int(2));
        b.bind(&sym("x"), Term::int(3));
        b.backtrack(mark);
        assert_eq!(b.value(&sym("x")), Some(&Term::int(1)));
        assert!(!b.is_bound(&sym("y")));
    }

    #[test]
    fn deref_follows_chains() {
        let mut b = BindingManager::new();
        b.bind(&sym("x"), Term::var("y"));
        b.bind(&sym("y"), Term::string("end"));
        assert_eq!(b.deref(&Term::var("x")), Term::string("end"));
        assert_eq!(b.deref(&Term::var("z")), Term::var("z"));
    }

    #[test]
    fn deep_deref_splices_rest_lists() {
        let mut b = BindingManager::new();
        b.bind(&sym("t"), Term::list(vec![Term::int(2), Term::int(3)]));
        b.bind(&sym("h"), Term::int(1));
        let list = Term::new(Value::List(List {
            elements: vec![Term::var("h")],
            rest_var: Some(sym("t")),
        }));
        assert_eq!(
            b.deep_deref(&list),
            Term::list(vec![Term::int(1), Term::int(2), Term::int(3)])
        );
    }
}
