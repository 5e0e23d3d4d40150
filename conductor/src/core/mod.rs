//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod coverage;
pub mod findings;
pub mod fix_strategy;
pub mod gates;
pub mod invariants;
pub mod next_action;
pub mod ownership;
pub mod phase;
pub mod state_doc;
pub mod state_paths;
pub mod step_machine;
pub mod task_graph;
pub mod task_parser;
pub mod types;
