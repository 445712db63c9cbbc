//! Workflow model and step resolution.
//!
//! - `condition` -- JSON condition DSL: evaluate, explain, validate
//! - `compiler` -- structural validation and indexing, canonical JSON
//! - `cache` -- bounded FIFO cache of compiled workflows
//! - `context` -- execution context, loop-variable projection, templates
//! - `interpreter` -- the pure step-resolution state machine

pub mod cache;
pub mod compiler;
pub mod condition;
pub mod context;
pub mod interpreter;
