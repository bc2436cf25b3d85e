//! CLI command handlers
//!
//! This module contains the handlers behind each `screenrec` subcommand
//! and the processing view that renders a pipeline run.

pub mod processing;
pub mod recording;
