//! The knowledge base: rules, rule types, constants, class hierarchy and
//! inline queries.
//!
//! One knowledge base lives inside each engine behind an `Arc<RwLock<_>>`.
//! Queries hold only a weak reference and read it under a shared lock at
//! each rule selection, so they observe loads that happen mid-query.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::LoadError;
use crate::message::Message;
use crate::parser::{Line, parse_lines};
use crate::rewrite::{rewrite_goal, rewrite_rule};
use crate::rules::{RESERVED_NAMES, Rule};
use crate::symbol::AtomicIdAllocator;
use crate::term::{Symbol, Term};

/// Rules whose absence is reported after a load.
const ENTRY_POINTS: &[&str] = &["allow", "allow_field", "allow_request"];

/// One policy source handed to [`KnowledgeBase::load`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub src: String,
    #[serde(default)]
    pub filename: Option<String>,
}

impl Source {
    pub fn new(src: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            filename: None,
        }
    }

    pub fn named(src: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            filename: Some(filename.into()),
        }
    }
}

#[derive(Debug)]
pub struct KnowledgeBase {
    rules: Vec<Arc<Rule>>,
    by_name: HashMap<Symbol, Vec<Arc<Rule>>>,
    /// Canonical text of every rule as written, for duplicate detection.
    rule_keys: HashSet<String>,
    /// Declared rule types by name; rules with a declared name must fit one.
    rule_types: HashMap<Symbol, Vec<Rule>>,
    constants: BTreeMap<Symbol, Term>,
    mro: HashMap<Symbol, Vec<Symbol>>,
    inline_queries: VecDeque<Term>,
    loaded_sources: HashSet<String>,
    external_ids: AtomicIdAllocator,
    temporaries: AtomicIdAllocator,
}

impl Default for KnowledgeBase {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            by_name: HashMap::new(),
            rule_keys: HashSet::new(),
            rule_types: HashMap::new(),
            constants: BTreeMap::new(),
            mro: HashMap::new(),
            inline_queries: VecDeque::new(),
            loaded_sources: HashSet::new(),
            external_ids: AtomicIdAllocator::starting_from(0),
            temporaries: AtomicIdAllocator::starting_from(1),
        }
    }

    // ── Loading ────────────────────────────────────────────────────────

    /// Parse, validate and add `sources`. Nothing is added unless every
    /// source is accepted. Returns the load warnings.
    pub fn load(
        &mut self,
        sources: &[Source],
        warn_missing_allow: bool,
    ) -> Result<Vec<Message>, LoadError> {
        let mut filenames = HashSet::new();
        for source in sources {
            if let Some(name) = &source.filename {
                if self.loaded_sources.contains(name) || !filenames.insert(name.clone()) {
                    return Err(LoadError::DuplicateSource {
                        filename: name.clone(),
                    });
                }
            }
        }

        let mut staged: Vec<(String, Rule)> = Vec::new();
        let mut staged_types: Vec<Rule> = Vec::new();
        let mut staged_queries = Vec::new();
        let mut staged_keys = HashSet::new();
        for source in sources {
            let lines = parse_lines(&source.src, source.filename.as_deref())
                .map_err(|e| LoadError::Parse(Box::new(e)))?;
            for line in lines {
                match line {
                    Line::Rule(rule) => {
                        rule.validate()?;
                        let key = rule.to_string();
                        if self.rule_keys.contains(&key) || !staged_keys.insert(key.clone()) {
                            return Err(LoadError::DuplicateRule { rule: key });
                        }
                        staged.push((key, rule));
                    }
                    Line::RuleType(declared) => {
                        declared.validate()?;
                        let known = staged_types.contains(&declared)
                            || self.rule_types_named(&declared.name).contains(&declared);
                        if !known {
                            staged_types.push(declared);
                        }
                    }
                    Line::Query(term) => staged_queries.push(term),
                }
            }
        }
        for (_, rule) in &staged {
            self.check_rule_type(rule, &staged_types)?;
        }

        // Everything checked; commit.
        let mut fresh = |prefix: &str| self.temporaries.gensym(prefix);
        let rewritten: Vec<(String, Rule)> = staged
            .into_iter()
            .map(|(key, rule)| (key, rewrite_rule(rule, &mut fresh)))
            .collect();
        let queries: Vec<Term> = staged_queries
            .iter()
            .map(|q| rewrite_goal(q, &mut fresh))
            .collect();

        self.loaded_sources.extend(filenames);
        for declared in staged_types {
            self.rule_types
                .entry(declared.name.clone())
                .or_default()
                .push(declared);
        }
        let mut added = Vec::with_capacity(rewritten.len());
        for (key, rule) in rewritten {
            let rule = Arc::new(rule);
            self.rule_keys.insert(key);
            self.by_name
                .entry(rule.name.clone())
                .or_default()
                .push(Arc::clone(&rule));
            self.rules.push(Arc::clone(&rule));
            added.push(rule);
        }
        self.inline_queries.extend(queries);

        tracing::info!(
            rules = added.len(),
            total = self.rules.len(),
            inline_queries = self.inline_queries.len(),
            "policy loaded"
        );
        Ok(self.load_warnings(&added, warn_missing_allow))
    }

    /// A rule whose name has declared types must fit at least one of them.
    fn check_rule_type(&self, rule: &Rule, staged_types: &[Rule]) -> Result<(), LoadError> {
        let declared: Vec<&Rule> = self
            .rule_types_named(&rule.name)
            .iter()
            .chain(staged_types.iter().filter(|t| t.name == rule.name))
            .collect();
        if declared.is_empty() {
            return Ok(());
        }
        let is_subclass = |class: &Symbol, ancestor: &Symbol| {
            matches!((class.as_str(), ancestor.as_str()), ("Integer" | "Float", "Number"))
                || self.is_subclass(class, ancestor).unwrap_or(false)
        };
        if declared.iter().any(|d| rule.conforms_to(d, is_subclass)) {
            return Ok(());
        }
        Err(LoadError::IncompatibleRule {
            rule: rule.to_string(),
            name: rule.name.to_string(),
            declared: declared
                .iter()
                .map(|d| format!("type {d}"))
                .collect::<Vec<_>>()
                .join(" "),
        })
    }

    fn load_warnings(&self, added: &[Arc<Rule>], warn_missing_allow: bool) -> Vec<Message> {
        let mut warnings = Vec::new();
        for rule in added {
            let location = rule
                .source
                .as_ref()
                .map(|s| format!(" at {s}"))
                .unwrap_or_default();
            for var in rule.singletons(|s| self.constants.contains_key(s)) {
                warnings.push(Message::warning(format!(
                    "Singleton variable {var} is unused or undefined{location}; \
                     if intentional, rename it to _{var} or _"
                )));
            }
            for called in rule.called_rules() {
                if !self.by_name.contains_key(&called) && !RESERVED_NAMES.contains(&called.as_str()) {
                    warnings.push(Message::warning(format!(
                        "Call to undefined rule \"{called}\" in {}{location}",
                        rule.name
                    )));
                }
            }
        }
        if warn_missing_allow
            && !ENTRY_POINTS
                .iter()
                .any(|name| self.by_name.contains_key(&Symbol::new(*name)))
        {
            warnings.push(Message::warning(
                "Your policy does not contain an allow rule, which usually means \
                 that no actions are allowed. Did you mean to add an allow rule to \
                 the top of your policy?",
            ));
        }
        warnings
    }

    /// Remove every rule, inline query and loaded filename.
    /// Rule types, constants and the class hierarchy survive.
    pub fn clear_rules(&mut self) {
        self.rules.clear();
        self.by_name.clear();
        self.rule_keys.clear();
        self.inline_queries.clear();
        self.loaded_sources.clear();
        tracing::info!("rules cleared");
    }

    // ── Rules ──────────────────────────────────────────────────────────

    /// All rules in load order.
    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    /// Rules named `name`, in load order.
    pub fn rules_named(&self, name: &Symbol) -> &[Arc<Rule>] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Declared types for rules named `name`, in declaration order.
    pub fn rule_types_named(&self, name: &Symbol) -> &[Rule] {
        self.rule_types.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_rules(&self, name: &Symbol) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn next_inline_query(&mut self) -> Option<Term> {
        self.inline_queries.pop_front()
    }

    // ── Constants and classes ──────────────────────────────────────────

    pub fn register_constant(&mut self, name: Symbol, value: Term) {
        tracing::debug!(name = %name, value = %value, "constant registered");
        self.constants.insert(name, value);
    }

    pub fn constants(&self) -> &BTreeMap<Symbol, Term> {
        &self.constants
    }

    pub fn is_constant(&self, name: &Symbol) -> bool {
        self.constants.contains_key(name)
    }

    /// Record the ancestors of `class`, nearest first.
    pub fn register_mro(&mut self, class: Symbol, mro: Vec<Symbol>) {
        self.mro.insert(class, mro);
    }

    pub fn mro(&self) -> &HashMap<Symbol, Vec<Symbol>> {
        &self.mro
    }

    /// `Some(true)` if `class` is `ancestor` or descends from it; `None` when
    /// the hierarchy of `class` is unknown.
    pub fn is_subclass(&self, class: &Symbol, ancestor: &Symbol) -> Option<bool> {
        if class == ancestor {
            return Some(true);
        }
        self.mro.get(class).map(|mro| mro.contains(ancestor))
    }

    // ── Ids ────────────────────────────────────────────────────────────

    /// Next external instance id; the first is 0.
    pub fn new_external_id(&self) -> u64 {
        self.external_ids.next_id()
    }

    pub fn gensym(&self, prefix: &str) -> Symbol {
        self.temporaries.gensym(prefix)
    }

    /// Rewrite a query term so lookups and arithmetic are lifted into goals.
    pub fn rewrite_query(&self, term: &Term) -> Term {
        rewrite_goal(term, &mut |prefix: &str| self.gensym(prefix))
    }
}
