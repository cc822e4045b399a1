//! Engine facade: top-level API for the akh-gate policy engine.
//!
//! The `Engine` owns the knowledge base, the load-time message queue and
//! the configuration. Queries hold only a weak reference to the knowledge
//! base, so dropping the engine invalidates them.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::EngineConfig;
use crate::error::{ConfigError, EvalError, GateResult};
use crate::filter::{Filter, FilterPlan, ResultEvent, Types};
use crate::kb::{KnowledgeBase, Source};
use crate::message::{Message, MessageQueue};
use crate::parser::parse_query;
use crate::query::Query;
use crate::rules::Rule;
use crate::term::{Symbol, Term, Value};
use crate::vm::Vm;

pub struct Engine {
    config: EngineConfig,
    kb: Arc<RwLock<KnowledgeBase>>,
    messages: MessageQueue,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            kb: Arc::new(RwLock::new(KnowledgeBase::new())),
            messages: MessageQueue::new(),
        }
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> GateResult<Self> {
        if config.max_goal_stack == 0 {
            return Err(ConfigError::Invalid {
                message: "max_goal_stack must be at least 1".into(),
            }
            .into());
        }
        tracing::info!(
            max_goal_stack = config.max_goal_stack,
            warn_missing_allow = config.warn_missing_allow,
            "initializing akh-gate engine"
        );
        Ok(Self {
            config,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn kb(&self) -> RwLockReadGuard<'_, KnowledgeBase> {
        self.kb.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn kb_mut(&self) -> RwLockWriteGuard<'_, KnowledgeBase> {
        self.kb.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Knowledge base ────────────────────────────────────────────────

    /// Load policy sources; all-or-nothing. Warnings go to the message queue.
    pub fn load(&self, sources: &[Source]) -> GateResult<()> {
        let warnings = self.kb_mut().load(sources, self.config.warn_missing_allow)?;
        self.messages.extend(warnings);
        Ok(())
    }

    pub fn load_str(&self, src: &str) -> GateResult<()> {
        self.load(&[Source::new(src)])
    }

    pub fn clear_rules(&self) {
        self.kb_mut().clear_rules();
    }

    pub fn register_constant(&self, name: &str, value: Term) {
        self.kb_mut().register_constant(Symbol::new(name), value);
    }

    /// Record the method resolution order of a host class, nearest first.
    pub fn register_mro(&self, class: &str, mro: Vec<String>) {
        let mro = mro.into_iter().map(Symbol).collect();
        self.kb_mut().register_mro(Symbol::new(class), mro);
    }

    pub fn next_external_id(&self) -> u64 {
        self.kb().new_external_id()
    }

    pub fn next_message(&self) -> Option<Message> {
        self.messages.next()
    }

    /// All rules, in load order, after rewriting.
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        self.kb().rules().to_vec()
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Open the oldest inline `?=` query not yet run.
    pub fn next_inline_query(&self, trace: bool) -> Option<Query> {
        let term = self.kb_mut().next_inline_query()?;
        Some(self.open(term, trace))
    }

    pub fn new_query(&self, src: &str, trace: bool) -> GateResult<Query> {
        let term = parse_query(src).map_err(|e| EvalError::MalformedGoal {
            goal: format!("{src}: {e}"),
        })?;
        self.new_query_from_term(term, trace)
    }

    pub fn new_query_from_term(&self, term: Term, trace: bool) -> GateResult<Query> {
        match term.value() {
            Value::Expression(_) | Value::Call(_) | Value::Boolean(_) | Value::Variable(_) => {}
            other => {
                return Err(EvalError::MalformedGoal {
                    goal: format!("{term} ({} is not a goal)", other.type_name()),
                }
                .into());
            }
        }
        let term = self.kb().rewrite_query(&term);
        Ok(self.open(term, trace))
    }

    fn open(&self, term: Term, trace: bool) -> Query {
        let trace = trace || self.config.default_trace;
        tracing::debug!(query = %term, trace, "query opened");
        let vm = Vm::new(&self.kb, term.clone(), trace, self.config.max_goal_stack);
        Query::new(vm, term)
    }

    // ── Filters ───────────────────────────────────────────────────────

    pub fn build_filter_plan(
        &self,
        types: &Types,
        results: &[ResultEvent],
        variable: &str,
        class_tag: &str,
    ) -> GateResult<FilterPlan> {
        let kb = self.kb();
        Ok(FilterPlan::build(types, results, variable, class_tag, kb.mro())?)
    }

    pub fn build_data_filter(
        &self,
        types: &Types,
        results: &[ResultEvent],
        variable: &str,
        class_tag: &str,
    ) -> GateResult<Filter> {
        let kb = self.kb();
        Ok(Filter::build(types, results, variable, class_tag, kb.mro())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GateError, LoadError};
    use crate::events::QueryEvent;
    use crate::message::MessageKind;

    #[test]
    fn rejects_invalid_config() {
        let config = EngineConfig {
            max_goal_stack: 0,
            ..Default::default()
        };
        assert!(matches!(Engine::new(config), Err(GateError::Config(_))));
    }

    #[test]
    fn failed_load_leaves_rules_untouched() {
        let engine = Engine::default();
        engine.load_str("f(1);").unwrap();
        let err = engine.load_str("f(2); g(").unwrap_err();
        assert!(matches!(err, GateError::Load(LoadError::Parse(_))));
        assert_eq!(engine.rules().len(), 1);
    }

    #[test]
    fn load_warnings_reach_the_queue() {
        let engine = Engine::default();
        engine.load_str("f(x) if g(y);").unwrap();
        let mut warnings = Vec::new();
        while let Some(m) = engine.next_message() {
            assert_eq!(m.kind, MessageKind::Warning);
            warnings.push(m.msg);
        }
        assert!(warnings.iter().any(|w| w.contains("Singleton")));
        assert!(warnings.iter().any(|w| w.contains("allow")));
    }

    #[test]
    fn malformed_goals_are_eval_errors() {
        let engine = Engine::default();
        assert!(matches!(
            engine.new_query("f(", false),
            Err(GateError::Eval(EvalError::MalformedGoal { .. }))
        ));
        assert!(matches!(
            engine.new_query_from_term(Term::int(3), false),
            Err(GateError::Eval(EvalError::MalformedGoal { .. }))
        ));
    }

    #[test]
    fn queries_outliving_the_engine_fail_cleanly() {
        let engine = Engine::default();
        engine.load_str("f(1);").unwrap();
        let mut q = engine.new_query("f(x)", false).unwrap();
        drop(engine);
        assert!(matches!(
            q.next_event(),
            Err(GateError::Eval(EvalError::KnowledgeBaseReleased))
        ));
    }

    #[test]
    fn default_trace_applies_to_every_query() {
        let engine = Engine::new(EngineConfig {
            default_trace: true,
            ..Default::default()
        })
        .unwrap();
        engine.load_str("f(1);").unwrap();
        let mut q = engine.new_query("f(x)", false).unwrap();
        assert!(matches!(q.next_event().unwrap(), QueryEvent::Debug { .. }));
    }
}
