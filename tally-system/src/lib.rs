//! Foundational system components for tally's services.
//!
//! Every long running component of the server is a [`Service`]. A service owns its state
//! exclusively and receives messages through its [`Addr`]. Messages are handled one by one in the
//! order they were sent, which makes a service a serial state machine that never needs a lock.
//!
//! Lifecycle is controlled by a [`Controller`]. There is no global controller, each server
//! instance owns one and hands [`ShutdownHandle`]s to its services.
#![warn(missing_docs)]

mod controller;
mod service;
mod statsd;

pub use self::controller::*;
pub use self::service::*;
