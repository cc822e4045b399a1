//! Goal rewriting applied to rule bodies and queries before evaluation.
//!
//! Attribute lookups and arithmetic inside goals are lifted into separate
//! goals that bind a fresh temporary, so the evaluator only ever sees them
//! in the three-argument form `.(object, field, result)` / `op(a, b, result)`:
//!
//! ```text
//! r.owner = a        =>  .(r, "owner", _value_1) and _value_1 = a
//! x.active           =>  .(x, "active", _value_2) and _value_2 = true
//! n + 1 > 3          =>  +(n, 1, _op_3) and _op_3 > 3
//! ```
//!
//! Lifted goals stay inside the branch they came from, so `not` and `or`
//! keep their meaning.

use crate::rules::Rule;
use crate::term::{Call, Operation, Operator, Symbol, Term, Value};

/// Rewrite a goal, drawing temporary names from `fresh`.
pub fn rewrite_goal<F>(goal: &Term, fresh: &mut F) -> Term
where
    F: FnMut(&str) -> Symbol,
{
    let mut prelude = Vec::new();
    let rewritten = match goal.value() {
        Value::Expression(op) if matches!(op.operator, Operator::And | Operator::Or | Operator::Not) => {
            goal.clone_with_value(Value::Expression(Operation {
                operator: op.operator,
                args: op.args.iter().map(|a| rewrite_goal(a, fresh)).collect(),
            }))
        }
        Value::Call(c) if c.name.as_str() == "forall" => goal.clone_with_value(Value::Call(Call {
            name: c.name.clone(),
            args: c.args.iter().map(|a| rewrite_goal(a, fresh)).collect(),
        })),
        Value::Call(c) => goal.clone_with_value(Value::Call(Call {
            name: c.name.clone(),
            args: c.args.iter().map(|a| lift(a, &mut prelude, fresh)).collect(),
        })),
        Value::Expression(op) if op.operator == Operator::Dot && op.args.len() == 2 => {
            let value = lift(goal, &mut prelude, fresh);
            goal.clone_with_value(Value::Expression(Operation {
                operator: Operator::Unify,
                args: vec![value, Term::boolean(true)],
            }))
        }
        Value::Expression(op) if op.operator == Operator::Isa => {
            let mut args = op.args.clone();
            if let Some(left) = args.first_mut() {
                *left = lift(left, &mut prelude, fresh);
            }
            goal.clone_with_value(Value::Expression(Operation {
                operator: Operator::Isa,
                args,
            }))
        }
        // Already-lifted three-argument forms.
        Value::Expression(op) if op.args.len() == 3 => goal.clone(),
        Value::Expression(op) => goal.clone_with_value(Value::Expression(Operation {
            operator: op.operator,
            args: op.args.iter().map(|a| lift(a, &mut prelude, fresh)).collect(),
        })),
        _ => goal.clone(),
    };

    if prelude.is_empty() {
        return rewritten;
    }
    prelude.push(rewritten);
    goal.clone_with_value(Value::Expression(Operation {
        operator: Operator::And,
        args: prelude,
    }))
}

/// Rewrite the body of a rule; heads are left as written.
pub fn rewrite_rule<F>(rule: Rule, fresh: &mut F) -> Rule
where
    F: FnMut(&str) -> Symbol,
{
    Rule {
        body: rewrite_goal(&rule.body, fresh),
        ..rule
    }
}

fn lift<F>(term: &Term, prelude: &mut Vec<Term>, fresh: &mut F) -> Term
where
    F: FnMut(&str) -> Symbol,
{
    match term.value() {
        Value::Expression(op) if op.operator == Operator::Dot && op.args.len() == 2 => {
            let object = lift(&op.args[0], prelude, fresh);
            let field = match op.args[1].value() {
                Value::Call(c) => op.args[1].clone_with_value(Value::Call(Call {
                    name: c.name.clone(),
                    args: c.args.iter().map(|a| lift(a, prelude, fresh)).collect(),
                })),
                _ => op.args[1].clone(),
            };
            let result = Term::new(Value::Variable(fresh("value")));
            prelude.push(term.clone_with_value(Value::Expression(Operation {
                operator: Operator::Dot,
                args: vec![object, field, result.clone()],
            })));
            result
        }
        Value::Expression(op) if op.operator.is_arithmetic() && op.args.len() == 2 => {
            let left = lift(&op.args[0], prelude, fresh);
            let right = lift(&op.args[1], prelude, fresh);
            let result = Term::new(Value::Variable(fresh("op")));
            prelude.push(term.clone_with_value(Value::Expression(Operation {
                operator: op.operator,
                args: vec![left, right, result.clone()],
            })));
            result
        }
        Value::Expression(_) => term.clone(),
        Value::List(_) | Value::Dictionary(_) | Value::Call(_) => {
            term.map_children(&mut |child: &Term| lift(child, prelude, fresh))
        }
        _ => term.clone(),
    }
}
