use tally_config::Config;
use tally_statsd::MetricsClientConfig;

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        tally_log::info!("launching tally without config folder");
    } else {
        tally_log::info!(
            "launching tally from config folder {}",
            config.path().display()
        );
    }
    tally_log::info!("  bind address: {}", config.bind_addr());
    tally_log::info!("  backends: {}", config.backends().join(", "));
    tally_log::info!(
        "  workers: {}, readers: {}",
        config.aggregator_config().max_workers,
        config.max_readers()
    );
    match &config.cloud_config().provider {
        Some(provider) => tally_log::info!("  cloud provider: {provider}"),
        None => tally_log::info!("  cloud provider: -"),
    }
    tally_log::info!("  log level: {}", config.logging().level);
}

/// Initialize the logging system.
pub fn init_logging(config: &Config) {
    tally_log::init(config.logging());
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) {
    let Some(host) = config.statsd_addr() else {
        return;
    };

    let mut default_tags = config.metrics_default_tags().clone();
    if let Some(hostname_tag) = config.metrics_hostname_tag() {
        if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
            default_tags.insert(hostname_tag.to_owned(), hostname);
        }
    }

    tally_statsd::init(MetricsClientConfig {
        prefix: config.metrics_prefix(),
        host,
        default_tags,
        sample_rate: config.metrics_sample_rate().into(),
    });
}
