//! Event payroll CLI library.
//!
//! This crate provides the command-line interface over the session
//! tracker, participation ledger, and payroll calculator.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands};
pub use config::Config;
