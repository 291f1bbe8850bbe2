//! Command-line front end for vmrunner.
//!
//! Parses the command line, wires the Host Compute Service and the console
//! pipe connector together and runs one subcommand.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;
pub mod signal;

pub use cli::{Cli, Command};
pub use error::CliError;
