//! A running query as seen by the host.

use crate::error::{BridgeError, GateResult};
use crate::events::QueryEvent;
use crate::message::Message;
use crate::term::Term;
use crate::vm::Vm;

/// Handle for one query. Drive it with [`Query::next_event`] and answer every
/// `ExternalCall` or `Question` before asking for the next event.
pub struct Query {
    vm: Vm,
    term: Term,
}

impl Query {
    pub(crate) fn new(vm: Vm, term: Term) -> Self {
        Self { vm, term }
    }

    /// The query as submitted, after rewriting.
    pub fn term(&self) -> &Term {
        &self.term
    }

    pub fn next_event(&mut self) -> GateResult<QueryEvent> {
        if let Some(call_id) = self.vm.pending_call() {
            return Err(BridgeError::Unanswered { call_id }.into());
        }
        Ok(self.vm.next_event()?)
    }

    /// Answer an `ExternalCall`. `None` means the host has no value, which
    /// fails the current branch.
    pub fn call_result(&mut self, call_id: u64, value: Option<Term>) -> GateResult<()> {
        Ok(self.vm.call_result(call_id, value)?)
    }

    pub fn question_result(&mut self, call_id: u64, answer: bool) -> GateResult<()> {
        Ok(self.vm.question_result(call_id, answer)?)
    }

    /// Report a host failure; the next event is an application error.
    pub fn application_error(&mut self, message: impl Into<String>) {
        self.vm.application_error(message.into());
    }

    pub fn bind(&mut self, name: &str, value: Term) -> GateResult<()> {
        Ok(self.vm.bind(name, value)?)
    }

    pub fn debug_command(&mut self, command: &str) -> GateResult<()> {
        Ok(self.vm.debug_command(command)?)
    }

    pub fn source_info(&self) -> String {
        self.vm.source_info()
    }

    pub fn next_message(&self) -> Option<Message> {
        self.vm.next_message()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, RwLock};

    use super::*;
    use crate::error::{BindError, EvalError, GateError};
    use crate::kb::{KnowledgeBase, Source};
    use crate::parser::parse_query;
    use crate::vm::DEFAULT_MAX_GOALS;

    fn query(kb: &Arc<RwLock<KnowledgeBase>>, src: &str) -> Query {
        let term = kb.read().unwrap().rewrite_query(&parse_query(src).unwrap());
        Query::new(Vm::new(kb, term.clone(), false, DEFAULT_MAX_GOALS), term)
    }

    #[test]
    fn unanswered_calls_block_progress() {
        let kb = Arc::new(RwLock::new(KnowledgeBase::new()));
        let mut q = query(&kb, "x.name = \"a\"");
        q.bind("x", Term::external(0, None)).unwrap();
        let call_id = q.next_event().unwrap().call_id().unwrap();
        assert!(matches!(
            q.next_event(),
            Err(GateError::Bridge(BridgeError::Unanswered { .. }))
        ));
        q.call_result(call_id, Some(Term::string("a"))).unwrap();
        assert!(matches!(q.next_event().unwrap(), QueryEvent::Result { .. }));
    }

    #[test]
    fn application_errors_terminate_the_query() {
        let kb = Arc::new(RwLock::new(KnowledgeBase::new()));
        let mut q = query(&kb, "x.name = 1");
        q.bind("x", Term::external(0, None)).unwrap();
        q.next_event().unwrap();
        q.application_error("no such attribute");
        assert!(matches!(
            q.next_event(),
            Err(GateError::Eval(EvalError::Application { .. }))
        ));
        assert!(matches!(
            q.bind("x", Term::int(1)),
            Err(GateError::Bind(BindError::Finished { .. }))
        ));
    }

    #[test]
    fn source_info_points_at_the_active_query() {
        let mut kb = KnowledgeBase::new();
        kb.load(&[Source::named("f(x) if x.a = 1;", "policy.polar")], false)
            .unwrap();
        let kb = Arc::new(RwLock::new(kb));
        let mut q = query(&kb, "f(y)");
        assert_eq!(q.source_info(), "no active query");
        q.bind("y", Term::external(3, None)).unwrap();
        q.next_event().unwrap();
        assert!(q.source_info().contains("policy.polar"));
    }
}
