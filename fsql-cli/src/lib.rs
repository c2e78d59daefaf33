//! fsql CLI - command-line runner for annotated SQL migrations.
//!
//! This crate provides the `fsql` binary: file discovery and loading,
//! configuration, and styled progress output around the `fsql-migrate`
//! pipeline and the `fsql-postgres` executor.

pub mod cli;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod error;
pub mod loader;
pub mod logging;
pub mod output;
