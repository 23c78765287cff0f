//! Process-wide logging setup shared by signalbus binaries.

pub mod tracing;

pub use crate::tracing::{LogFormat, init, init_with};
