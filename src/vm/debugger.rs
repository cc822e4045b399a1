//! Interactive stepping for traced queries.
//!
//! Commands arrive through `Query::debug_command`; their output is delivered
//! as the next `Debug` event.

use crate::error::DebugError;

pub const HELP: &str = "\
Debugger commands:
  c, continue          resume until the next debug() call
  s, step, into        stop at the next query
  n, next, over        stop at the next query at the same depth or shallower
  o, out               stop at the next query above the current depth
  b, bindings          show all current bindings
  var [name ...]       show the named variables, or list all variable names
  g, goals             show the pending goal stack
  q, queries, stack    show the active query stack
  l, line [n]          show the source position of the current query (n levels up)
  h, help              show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugCommand {
    Continue,
    StepInto,
    StepOver,
    StepOut,
    Bindings,
    Var(Vec<String>),
    Goals,
    Queries,
    Line(usize),
    Help,
}

impl DebugCommand {
    pub fn parse(input: &str) -> Result<Self, DebugError> {
        let mut parts = input.split_whitespace();
        let head = parts.next().unwrap_or("");
        let rest: Vec<String> = parts.map(str::to_string).collect();
        Ok(match head {
            "c" | "continue" => DebugCommand::Continue,
            "s" | "step" | "into" => DebugCommand::StepInto,
            "n" | "next" | "over" => DebugCommand::StepOver,
            "o" | "out" => DebugCommand::StepOut,
            "b" | "bindings" => DebugCommand::Bindings,
            "var" => DebugCommand::Var(rest),
            "g" | "goals" => DebugCommand::Goals,
            "q" | "queries" | "stack" => DebugCommand::Queries,
            "l" | "line" => {
                let levels = match rest.first() {
                    Some(n) => n.parse().map_err(|_| DebugError::UnknownCommand {
                        command: input.to_string(),
                    })?,
                    None => 0,
                };
                DebugCommand::Line(levels)
            }
            "h" | "help" => DebugCommand::Help,
            _ => {
                return Err(DebugError::UnknownCommand {
                    command: input.to_string(),
                });
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Into,
    Over { depth: usize },
    Out { depth: usize },
}

#[derive(Debug, Default)]
pub struct Debugger {
    step: Option<Step>,
    active: bool,
}

impl Debugger {
    /// A session exists once a traced query has emitted its first debug event.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    /// Break at the next query, e.g. on `debug()`.
    pub fn break_next(&mut self) {
        self.active = true;
        self.step = Some(Step::Into);
    }

    pub fn resume(&mut self) {
        self.step = None;
    }

    pub fn step_into(&mut self) {
        self.step = Some(Step::Into);
    }

    pub fn step_over(&mut self, depth: usize) {
        self.step = Some(Step::Over { depth });
    }

    pub fn step_out(&mut self, depth: usize) {
        self.step = Some(Step::Out { depth });
    }

    /// Whether a query at `depth` should pause; consumes the pending step.
    pub fn should_break(&mut self, depth: usize) -> bool {
        let hit = match self.step {
            None => false,
            Some(Step::Into) => true,
            Some(Step::Over { depth: d }) => depth <= d,
            Some(Step::Out { depth: d }) => depth < d,
        };
        if hit {
            self.step = None;
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!(DebugCommand::parse("s").unwrap(), DebugCommand::StepInto);
        assert_eq!(DebugCommand::parse("over").unwrap(), DebugCommand::StepOver);
        assert_eq!(
            DebugCommand::parse("var x y").unwrap(),
            DebugCommand::Var(vec!["x".into(), "y".into()])
        );
        assert_eq!(DebugCommand::parse("line 2").unwrap(), DebugCommand::Line(2));
        assert!(matches!(
            DebugCommand::parse("frobnicate"),
            Err(DebugError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn step_over_skips_deeper_queries() {
        let mut dbg = Debugger::default();
        dbg.step_over(2);
        assert!(!dbg.should_break(3));
        assert!(dbg.should_break(2));
        assert!(!dbg.should_break(1));
    }

    #[test]
    fn step_out_waits_for_a_shallower_query() {
        let mut dbg = Debugger::default();
        dbg.step_out(2);
        assert!(!dbg.should_break(2));
        assert!(dbg.should_break(1));
    }
}
