//! Core types for the vmrunner utility VM driver.
//!
//! Defines the VM identifier, the user-facing VM configuration and the
//! declarative document the Host Compute Service consumes at creation time,
//! plus the command-line joining shared by both guest execution paths.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod command;
pub mod config;
pub mod error;
pub mod id;

pub use command::shell_join;
pub use config::{VmConfig, DEFAULT_IMAGE_DIR, DEFAULT_KERNEL_ARGS};
pub use error::CoreError;
pub use id::{VmId, DEFAULT_VM_ID};
