//! Configuration for the tally CLI and server.
#![warn(missing_docs)]

mod config;

pub use self::config::*;
