//! `signalbus` operator commands.
//!
//! The binary reads a TOML manifest of signal tables, connects to Postgres and
//! a message bus, and runs one of the commands in [`cli::Command`].

pub mod cli;
pub mod commands;
pub mod manifest;

pub use cli::{Cli, Command};
pub use commands::{CommandError, execute};
pub use manifest::{Manifest, ManifestError, SignalEntry};
