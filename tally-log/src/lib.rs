//! Logging facade and setup for tally.
//!
//! All crates in the workspace log through the macros re-exported here, which forward to
//! [`tracing`]. The binary calls [`init`] once on startup, tests call [`init_test!`].
//!
//! # Logging Errors
//!
//! Errors are logged with their full chain of sources by wrapping them in [`LogError`]:
//!
//! ```
//! if let Err(error) = std::env::var("FOO") {
//!     tally_log::error!("env failed: {}", tally_log::LogError(&error));
//! }
//! ```
//!
//! Structured fields can be attached the same way `tracing` does it:
//!
//! ```
//! let error = std::io::Error::other("socket closed");
//! tally_log::error!(error = &error as &dyn std::error::Error, "read failed");
//! ```

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
mod test;
#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

#[doc(inline)]
pub use tracing::{debug, error, info, trace, warn};
