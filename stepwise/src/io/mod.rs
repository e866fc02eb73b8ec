//! I/O helpers for stepwise commands.

pub mod config;
pub mod confirm;
pub mod detached;
pub mod files;
pub mod fixer;
pub mod monitor;
pub mod prompt;
pub mod registry;
pub mod run_log;
pub mod shell;
pub mod workspace;
