//! Deterministic, pure logic shared by the plan executor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod extract;
pub mod retry;
pub mod types;
pub mod validator;
