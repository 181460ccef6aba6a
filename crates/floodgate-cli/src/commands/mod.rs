//! CLI subcommands.

pub mod serve;
pub mod status;
