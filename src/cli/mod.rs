//! CLI module
//!
//! Command-line interface for running a single download job.

pub mod args;
pub mod progress;

pub use args::CliArgs;
pub use progress::ProgressDisplay;
