//! Command implementations for the CLI.
//!
//! Each command is implemented in its own module.

pub mod documents;
pub mod ingest;
pub mod init;
pub mod query;
