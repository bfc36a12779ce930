use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::ArgMatches;
use tally_config::{Config, OverridableConfig};
use tally_server::Server;
use tally_system::Controller;

use crate::cliapp::make_app;
use crate::setup;

/// The config folder used if none is passed.
const DEFAULT_CONFIG_PATH: &str = ".tally";

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();
    let config_path = matches
        .get_one::<PathBuf>("config")
        .map(PathBuf::as_path)
        .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

    match matches.subcommand() {
        Some(("config", matches)) => manage_config(config_path, matches),
        Some(("run", matches)) => {
            let mut config = load_config(config_path)?;
            config.apply_override(extract_config_args(matches))?;
            run(config)
        }
        _ => unreachable!(),
    }
}

/// Loads the config from the given folder, falling back to defaults if it has no config.
fn load_config(path: &Path) -> Result<Config> {
    if Config::config_exists(path) {
        Ok(Config::from_path(path)?)
    } else {
        Ok(Config::default())
    }
}

/// Extracts config overrides from the arguments of the `run` command.
fn extract_config_args(matches: &ArgMatches) -> OverridableConfig {
    let arg = |name: &str| matches.get_one::<String>(name).cloned();

    OverridableConfig {
        bind: arg("bind"),
        workers: arg("workers"),
        readers: arg("readers"),
        log_level: arg("log_level"),
        shutdown_timeout: arg("shutdown_timeout"),
    }
}

fn manage_config(path: &Path, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("init", matches)) => init_config(path, matches.get_flag("overwrite")),
        Some(("show", _)) => show_config(path),
        _ => unreachable!(),
    }
}

#[allow(clippy::print_stdout)]
fn init_config(path: &Path, overwrite: bool) -> Result<()> {
    if Config::config_exists(path) && !overwrite {
        bail!(
            "config already exists in {}, pass --overwrite to replace it",
            path.display()
        );
    }

    Config::default()
        .save_in_folder(path)
        .with_context(|| format!("could not write config to {}", path.display()))?;

    println!("wrote default config to {}", path.display());
    Ok(())
}

#[allow(clippy::print_stdout)]
fn show_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    print!("{}", config.to_yaml_string()?);
    Ok(())
}

/// Runs the server until it is shut down by a signal.
pub fn run(config: Config) -> Result<()> {
    setup::init_logging(&config);
    setup::dump_spawn_infos(&config);
    setup::init_metrics(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("tally-worker")
        .enable_all()
        .build()
        .context("could not create the runtime")?;

    runtime.block_on(run_server(Arc::new(config)))
}

async fn run_server(config: Arc<Config>) -> Result<()> {
    let controller = Controller::new();
    let server = Server::new(Arc::clone(&config))?;
    let mut server_task = tokio::spawn(server.run(controller.shutdown_handle()));

    tokio::select! {
        result = &mut server_task => return Ok(result??),
        result = controller.shutdown_on_signal(config.shutdown_timeout()) => {
            result.context("could not listen for shutdown signals")?;
        }
    }

    server_task.await??;
    Ok(())
}
