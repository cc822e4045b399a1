// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # akh-gate
//!
//! A resumable rule engine for authorization policies. Policies are loaded
//! into a knowledge base; queries run as explicit state machines that
//! suspend whenever they need something from the host application (an
//! attribute of a host object, a class check, a comparison) and resume once
//! the host answers.
//!
//! ## Architecture
//!
//! - **Terms** (`term`, `codec`): immutable values, JSON at the boundary
//! - **Front end** (`parser`, `rules`, `rewrite`): policy text to rules
//! - **Knowledge base** (`kb`): rules in load order, constants, class hierarchy
//! - **Evaluator** (`vm`): backtracking search with partial evaluation
//! - **Bridge** (`bridge`, `events`): call ids correlating suspensions with answers
//! - **Filters** (`filter`): partial results compiled into data-store queries
//! - **Boundary** (`ffi`): C ABI with JSON payloads
//!
//! ## Library usage
//!
//! ```no_run
//! use akh_gate::engine::Engine;
//! use akh_gate::events::QueryEvent;
//! use akh_gate::term::Term;
//!
//! let engine = Engine::default();
//! engine.load_str(r#"allow(actor, "read", resource) if resource.owner = actor;"#).unwrap();
//!
//! let mut query = engine.new_query(r#"allow("alice", "read", doc)"#, false).unwrap();
//! query.bind("doc", Term::external(engine.next_external_id(), Some("Doc"))).unwrap();
//! loop {
//!     match query.next_event().unwrap() {
//!         QueryEvent::ExternalCall { call_id, .. } => {
//!             query.call_result(call_id, Some(Term::string("alice"))).unwrap();
//!         }
//!         QueryEvent::Result { .. } => println!("allowed"),
//!         QueryEvent::Done => break,
//!         _ => {}
//!     }
//! }
//! ```

pub mod bridge;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ffi;
pub mod filter;
pub mod host;
pub mod kb;
pub mod message;
pub mod parser;
pub mod query;
pub mod rewrite;
pub mod rules;
pub mod symbol;
pub mod term;
pub mod vm;

pub use engine::Engine;
pub use error::{GateError, GateResult};
pub use query::Query;
