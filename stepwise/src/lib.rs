//! Plan execution engine with self-healing retries.
//!
//! A plan is an ordered list of file and command steps. The executor runs each
//! step, classifies failures, and asks an external fixer service for corrected
//! steps when a failure looks like a logic error. Long-running commands run
//! detached in their own terminal session and are tracked until shutdown.
//!
//! - **[`core`]**: Pure logic (step model, validation, classification, retry
//!   decisions, JSON extraction). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, shell, fixer HTTP client,
//!   detached processes, config, reports). Behind traits where tests need fakes.
//!
//! [`executor`] and [`heal`] coordinate the two to run a plan.

pub mod core;
pub mod executor;
pub mod exit_codes;
pub mod heal;
pub mod io;
pub mod logging;
pub mod plan;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
