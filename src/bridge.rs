//! Bookkeeping for calls that suspend a query until the host answers.
//!
//! Call ids are allocated per query, strictly increasing from 1. A query has
//! at most one outstanding call; answers must carry exactly its id.

use crate::error::BridgeError;
use crate::term::Term;

/// The call a suspended query is waiting on.
#[derive(Debug, Clone, PartialEq)]
pub enum Suspension {
    /// An attribute lookup or method call; the answer is unified with `result`.
    Call { call_id: u64, result: Term },
    /// A yes/no question; a "no" fails the current branch.
    Question { call_id: u64 },
}

impl Suspension {
    pub fn call_id(&self) -> u64 {
        match self {
            Suspension::Call { call_id, .. } | Suspension::Question { call_id } => *call_id,
        }
    }
}

#[derive(Debug)]
pub struct Bridge {
    next_call_id: u64,
    pending: Option<Suspension>,
    application_error: Option<String>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self {
            next_call_id: 1,
            pending: None,
            application_error: None,
        }
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_call_id;
        self.next_call_id += 1;
        id
    }

    /// Suspend on an external call whose answer binds `result`.
    pub fn suspend_call(&mut self, result: Term) -> u64 {
        let call_id = self.allocate();
        self.pending = Some(Suspension::Call { call_id, result });
        call_id
    }

    pub fn suspend_question(&mut self) -> u64 {
        let call_id = self.allocate();
        self.pending = Some(Suspension::Question { call_id });
        call_id
    }

    pub fn pending(&self) -> Option<&Suspension> {
        self.pending.as_ref()
    }

    /// Take the pending call if `call_id` names it. On mismatch nothing changes.
    pub fn answer_call(&mut self, call_id: u64) -> Result<Term, BridgeError> {
        match &self.pending {
            Some(Suspension::Call { call_id: id, result }) if *id == call_id => {
                let result = result.clone();
                self.pending = None;
                Ok(result)
            }
            _ => Err(BridgeError::Mismatch { call_id }),
        }
    }

    pub fn answer_question(&mut self, call_id: u64) -> Result<(), BridgeError> {
        match &self.pending {
            Some(Suspension::Question { call_id: id }) if *id == call_id => {
                self.pending = None;
                Ok(())
            }
            _ => Err(BridgeError::Mismatch { call_id }),
        }
    }

    /// Record a host failure; it surfaces on the next `next_event`.
    pub fn record_application_error(&mut self, message: String) {
        self.pending = None;
        self.application_error = Some(message);
    }

    pub fn take_application_error(&mut self) -> Option<String> {
        self.application_error.take()
    }

    /// Forget any pending call, e.g. once the query has terminated.
    pub fn reset(&mut self) {
        self.pending = None;
    }
}
