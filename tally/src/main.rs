//! The tally metrics server.
//!
//! tally receives metrics from clients in the statsd line protocol over UDP, aggregates them in
//! memory and periodically flushes the aggregates to one or more backends.
//!
//! Run `tally --help` for the available commands. The configuration is read from `config.yml`
//! in the folder passed with `--config`, see the `tally-config` crate for all options.

mod cli;
mod cliapp;
mod setup;

use std::process;

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            tally_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
