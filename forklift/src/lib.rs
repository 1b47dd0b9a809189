//! Host-side orchestrator for agent-driven fork maintenance.
//!
//! One invocation merges upstream into a fork inside a sandboxed container,
//! verifies that upstream was integrated, rewrites the agent's commits to the
//! operator's identity, and force-pushes under lease. The layering mirrors a
//! strict split:
//!
//! - **[`core`]**: pure, deterministic logic (state machine, naming, verdicts).
//!   No I/O.
//! - **[`io`]**: side-effecting adapters (git, filesystem, container runtime).
//!
//! [`run`] drives one run through both layers; `main` maps the result to an
//! exit code from [`exit_codes`].

pub mod core;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
