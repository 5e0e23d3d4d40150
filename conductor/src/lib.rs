//! Resumable multi-stage workflow engine.
//!
//! A phase moves through `design -> analyze -> implement -> verify`, each step
//! guarded by a quality gate. All progress lives in one schema-validated state
//! document, so any invocation can be interrupted and resumed by a fresh process.
//!
//! - **[`core`]**: Pure, deterministic logic (step rules, task graph, gates,
//!   coverage, next-action derivation). No I/O.
//! - **[`io`]**: Side-effecting operations (state store, artifacts, config,
//!   collaborator processes, journal).
//!
//! [`coordinator`] runs worker jobs in ownership-safe batches, [`autofix`] drives
//! the bounded detect/fix loop on top of it, and [`lifecycle`] ties everything
//! into the entry points the CLI exposes.

pub mod autofix;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod lifecycle;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
