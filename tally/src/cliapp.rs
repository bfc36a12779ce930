//! This module implements the definition of the command line app.

use std::path::PathBuf;

use clap::{Arg, ArgAction, Command, value_parser};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "tally aggregates statsd metrics and flushes them to backends.";

pub fn make_app() -> Command {
    Command::new("tally")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .env("TALLY_CONFIG")
                .value_parser(value_parser!(PathBuf))
                .help("The path to the config folder."),
        )
        .subcommand(
            Command::new("run")
                .about("Run the server")
                .after_help(
                    "This runs tally in the foreground until it's shut down. It will bind to \
                     the address configured in the config file, unless it is overridden with \
                     --bind.",
                )
                .arg(
                    Arg::new("bind")
                        .value_name("ADDR")
                        .long("bind")
                        .short('b')
                        .env("TALLY_BIND")
                        .help("The address and port to receive metrics on."),
                )
                .arg(
                    Arg::new("workers")
                        .value_name("COUNT")
                        .long("workers")
                        .env("TALLY_WORKERS")
                        .help("The number of aggregation workers."),
                )
                .arg(
                    Arg::new("readers")
                        .value_name("COUNT")
                        .long("readers")
                        .env("TALLY_READERS")
                        .help("The number of tasks reading from the socket."),
                )
                .arg(
                    Arg::new("log_level")
                        .value_name("LEVEL")
                        .long("log-level")
                        .env("TALLY_LOG_LEVEL")
                        .help("The log level, one of off, error, warn, info, debug or trace."),
                )
                .arg(
                    Arg::new("shutdown_timeout")
                        .value_name("SECONDS")
                        .long("shutdown-timeout")
                        .env("TALLY_SHUTDOWN_TIMEOUT")
                        .help("The maximum time to wait for a graceful shutdown."),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the configuration")
                .subcommand_required(true)
                .arg_required_else_help(true)
                .subcommand(
                    Command::new("init")
                        .about("Write a default configuration")
                        .after_help(
                            "This writes a config.yml with all default values into the config \
                             folder. An existing config is only replaced with --overwrite.",
                        )
                        .arg(
                            Arg::new("overwrite")
                                .long("overwrite")
                                .action(ArgAction::SetTrue)
                                .help("Replace an existing config instead of failing."),
                        ),
                )
                .subcommand(
                    Command::new("show")
                        .about("Show the effective configuration")
                        .after_help("This prints the loaded config including all defaults."),
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app() {
        make_app().debug_assert();
    }

    #[test]
    fn test_run_overrides() {
        let matches = make_app()
            .try_get_matches_from(["tally", "-c", "/etc/tally", "run", "--workers", "4"])
            .unwrap();

        assert_eq!(
            matches.get_one::<PathBuf>("config"),
            Some(&PathBuf::from("/etc/tally"))
        );
        let (name, run) = matches.subcommand().unwrap();
        assert_eq!(name, "run");
        assert_eq!(run.get_one::<String>("workers").map(String::as_str), Some("4"));
    }
}
