//! Library surface for the `rhash-store` maintenance CLI: a thin
//! re-export of [`storage_core`] plus the subcommand dispatch the binary
//! drives, kept here so it stays unit-testable without going through
//! argument parsing.

pub use storage_core::*;

pub mod cli;
