//! Command-line surface of the `flowdump` binary.

pub mod args;

pub use args::{validate, Cli};
