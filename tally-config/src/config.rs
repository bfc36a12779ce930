use std::collections::BTreeMap;
use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_cloud::CloudConfig;
use tally_log::{Level, LogConfig};
use tally_metrics::AggregatorConfig;

/// The basename of the config file within the config directory.
const CONFIG_FILE_NAME: &str = "config.yml";

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => write!(f, " (file {})", file_name.display()),
            ConfigErrorSource::FieldOverride(name) => write!(f, " (field {name})"),
        }
    }
}

/// Indicates config related errors.
#[derive(Debug, thiserror::Error)]
#[error("{kind}{origin}")]
pub struct ConfigError {
    kind: ConfigErrorKind,
    origin: ConfigErrorSource,
    #[source]
    error: Option<Box<dyn Error + Send + Sync>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            kind,
            origin: ConfigErrorSource::None,
            error: None,
        }
    }

    #[inline]
    fn wrap<E>(error: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            kind,
            origin: ConfigErrorSource::None,
            error: Some(Box::new(error)),
        }
    }

    #[inline]
    fn for_field<E>(error: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(error, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, p: impl AsRef<Path>) -> Self {
        self.origin = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.origin = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

/// Indicates config related errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to save a file.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// Structure used to hold information about configuration overrides via
/// CLI parameters or environment variables.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The address to receive metrics on.
    pub bind: Option<String>,
    /// The number of aggregation workers.
    pub workers: Option<String>,
    /// The number of packet readers.
    pub readers: Option<String>,
    /// The log level.
    pub log_level: Option<String>,
    /// The shutdown timeout in seconds.
    pub shutdown_timeout: Option<String>,
}

/// Controls how metrics are received.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Server {
    /// The address to bind the UDP socket to.
    pub bind: SocketAddr,
    /// The number of tasks concurrently reading from the socket.
    ///
    /// Defaults to the number of CPUs.
    pub max_readers: usize,
    /// The size of the receive buffer of every reader in bytes.
    ///
    /// Datagrams larger than this are truncated and will most likely fail to parse.
    pub max_packet_size: usize,
    /// The size of the socket's receive buffer in bytes (`SO_RCVBUF`).
    ///
    /// Defaults to the system default.
    pub receive_buffer_size: Option<usize>,
    /// The maximum time in seconds to wait for a graceful shutdown.
    pub shutdown_timeout: u64,
}

impl Default for Server {
    fn default() -> Self {
        Server {
            bind: SocketAddr::from(([0, 0, 0, 0], 8125)),
            max_readers: num_cpus::get(),
            max_packet_size: 8192,
            receive_buffer_size: None,
            shutdown_timeout: 10,
        }
    }
}

/// Controls internal reporting to statsd.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Defaults to `None`, which disables reporting.
    pub statsd: Option<String>,
    /// Common prefix that should be added to all metrics.
    ///
    /// Defaults to `"tally"`.
    pub prefix: String,
    /// Default tags to apply to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Tag name to report the hostname to for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    ///
    /// Defaults to `1.0`.
    pub sample_rate: f32,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: None,
            prefix: "tally".to_owned(),
            default_tags: BTreeMap::new(),
            hostname_tag: None,
            sample_rate: 1.0,
        }
    }
}

fn default_backends() -> Vec<String> {
    vec!["null".to_owned()]
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct ConfigValues {
    #[serde(default)]
    server: Server,
    #[serde(default)]
    aggregator: AggregatorConfig,
    #[serde(default)]
    cloud: CloudConfig,
    #[serde(default = "default_backends")]
    backends: Vec<String>,
    #[serde(default)]
    logging: LogConfig,
    #[serde(default)]
    metrics: Metrics,
}

impl Default for ConfigValues {
    fn default() -> Self {
        Self {
            server: Server::default(),
            aggregator: AggregatorConfig::default(),
            cloud: CloudConfig::default(),
            backends: default_backends(),
            logging: LogConfig::default(),
            metrics: Metrics::default(),
        }
    }
}

/// Config struct.
#[derive(Clone, Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// The folder must contain a `config.yml`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let file_path = path.join(CONFIG_FILE_NAME);
        let file = fs::File::open(&file_path).map_err(|e| {
            ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&file_path)
        })?;

        let values: ConfigValues = serde_yaml::from_reader(io::BufReader::new(file))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&file_path))?;

        let config = Config { values, path };
        config.validate().map_err(|e| e.file(&file_path))?;
        Ok(config)
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        let config = Config {
            values: serde_json::from_value(value)
                .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?,
            path: PathBuf::new(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters).
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        let server = &mut self.values.server;

        if let Some(bind) = overrides.bind {
            server.bind = bind
                .parse::<SocketAddr>()
                .map_err(|err| ConfigError::for_field(err, "bind"))?;
        }

        if let Some(readers) = overrides.readers {
            server.max_readers = readers
                .parse()
                .map_err(|err| ConfigError::for_field(err, "readers"))?;
        }

        if let Some(shutdown_timeout) = overrides.shutdown_timeout {
            server.shutdown_timeout = shutdown_timeout
                .parse()
                .map_err(|err| ConfigError::for_field(err, "shutdown_timeout"))?;
        }

        if let Some(workers) = overrides.workers {
            self.values.aggregator.max_workers = workers
                .parse()
                .map_err(|err| ConfigError::for_field(err, "workers"))?;
        }

        if let Some(log_level) = overrides.log_level {
            self.values.logging.level = log_level
                .parse::<Level>()
                .map_err(|err| ConfigError::for_field(err, "log_level"))?;
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field| Err(ConfigError::new(ConfigErrorKind::InvalidValue).field(field));

        if self.values.server.max_readers == 0 {
            return invalid("server.max_readers");
        }
        if self.values.server.max_packet_size == 0 {
            return invalid("server.max_packet_size");
        }
        if self.values.aggregator.max_workers == 0 {
            return invalid("aggregator.max_workers");
        }
        if self.values.aggregator.max_queue_size == 0 {
            return invalid("aggregator.max_queue_size");
        }
        if self.values.aggregator.flush_interval_ms == 0 {
            return invalid("aggregator.flush_interval_ms");
        }
        if self.values.backends.is_empty() {
            return invalid("backends");
        }

        Ok(())
    }

    /// Checks if the config is already initialized.
    pub fn config_exists<P: AsRef<Path>>(path: P) -> bool {
        fs::metadata(path.as_ref().join(CONFIG_FILE_NAME)).is_ok()
    }

    /// Saves the config to `config.yml` in the given folder.
    ///
    /// The folder is created if it does not exist.
    pub fn save_in_folder<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if fs::metadata(path).is_err() {
            fs::create_dir_all(path)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(path))?;
        }

        let file_path = path.join(CONFIG_FILE_NAME);
        let mut file = fs::File::create(&file_path).map_err(|e| {
            ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile).file(&file_path)
        })?;

        file.write_all(self.to_yaml_string()?.as_bytes())
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile).file(&file_path))
    }

    /// Returns the path of the config folder.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps out a YAML string of the values.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Returns the address to receive metrics on.
    pub fn bind_addr(&self) -> SocketAddr {
        self.values.server.bind
    }

    /// Returns the number of tasks reading from the socket.
    pub fn max_readers(&self) -> usize {
        self.values.server.max_readers
    }

    /// Returns the size of the receive buffer of every reader.
    pub fn max_packet_size(&self) -> usize {
        self.values.server.max_packet_size
    }

    /// Returns the size of the socket receive buffer, if configured.
    pub fn receive_buffer_size(&self) -> Option<usize> {
        self.values.server.receive_buffer_size
    }

    /// Returns the maximum time to wait for a graceful shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.server.shutdown_timeout)
    }

    /// Returns the configuration of aggregation and flushing.
    pub fn aggregator_config(&self) -> &AggregatorConfig {
        &self.values.aggregator
    }

    /// Returns the configuration of cloud enrichment.
    pub fn cloud_config(&self) -> &CloudConfig {
        &self.values.cloud
    }

    /// Returns the names of the backends receiving flushed batches.
    pub fn backends(&self) -> &[String] {
        &self.values.backends
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the socket address of statsd if configured.
    pub fn statsd_addr(&self) -> Option<&str> {
        self.values.metrics.statsd.as_deref()
    }

    /// Returns the prefix that should be added to all metrics.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the default tags for statsd metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns the name of the hostname tag that should be attached to each outgoing metric.
    pub fn metrics_hostname_tag(&self) -> Option<&str> {
        self.values.metrics.hostname_tag.as_deref()
    }

    /// Returns the global sample rate for all metrics.
    pub fn metrics_sample_rate(&self) -> f32 {
        self.values.metrics.sample_rate
    }
}
