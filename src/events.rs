//! Events a query reports to its host.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::term::{Operator, Symbol, Term};

/// Variable name to value for one solution.
pub type Bindings = BTreeMap<Symbol, Term>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryEvent {
    /// No more solutions. Repeated calls keep returning `Done`.
    Done,

    /// One solution.
    Result { bindings: Bindings },

    /// Look up `attribute` on a host object (with `args`, a method call).
    /// Answer with `call_result(call_id, ...)`.
    ExternalCall {
        call_id: u64,
        instance: Term,
        attribute: Symbol,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Vec<Term>>,
    },

    /// A yes/no question only the host can answer.
    /// Answer with `question_result(call_id, ...)`.
    Question { call_id: u64, question: Question },

    /// Trace or debugger output; only produced when tracing is on.
    Debug { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Question {
    /// Is `instance` an instance of `class_tag`?
    Isa { instance: Term, class_tag: Symbol },
    /// Does `args[0] operator args[1]` hold for host values?
    Compare { operator: Operator, args: Vec<Term> },
}

impl QueryEvent {
    pub fn is_done(&self) -> bool {
        matches!(self, QueryEvent::Done)
    }

    /// The call id awaiting an answer, for suspending events.
    pub fn call_id(&self) -> Option<u64> {
        match self {
            QueryEvent::ExternalCall { call_id, .. } | QueryEvent::Question { call_id, .. } => {
                Some(*call_id)
            }
            _ => None,
        }
    }
}
