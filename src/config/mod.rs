//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

use crate::{
    cache::MetricOrdering,
    domain::request::{AreaType, ResponseFormat},
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "ondata";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_STORAGE_DIR: &str = "storage";
const DEFAULT_CONTAINER: &str = "apiv2cache";
const DEFAULT_PUBLIC_URL: &str = "http://127.0.0.1:3000";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_MAX_WAIT_CYCLES: u32 = 29;
const DEFAULT_LEASE_SECS: u64 = 15;
const MIN_LEASE_SECS: u64 = 15;
const MAX_LEASE_SECS: u64 = 60;
const DEFAULT_BATCH_SIZE: u32 = 15;
const DEFAULT_PAGE_SIZE: u32 = 10_000;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub storage: StorageSettings,
    pub cache: CacheSettings,
    pub producer: ProducerSettings,
    pub service: ServiceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
    /// Restrict results to metrics flagged as released.
    pub released_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Filesystem,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "filesystem" | "fs" => Ok(Self::Filesystem),
            other => Err(format!("unknown backend `{other}` (expected memory|filesystem)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub directory: PathBuf,
    pub container: String,
    /// Base URL redirects point at, without a trailing slash.
    pub public_base_url: String,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub max_wait_cycles: u32,
    pub lease: Duration,
    pub key_metric_order: MetricOrdering,
    pub redirect_formats: Vec<ResponseFormat>,
}

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub batch_size: NonZeroU32,
    pub page_size: NonZeroU32,
    pub batched_area_types: Vec<AreaType>,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Public origin used to build `Content-Location` permalinks.
    pub public_url: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("ONDATA")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.redirect_formats")
            .with_list_parse_key("producer.batched_area_types")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    storage: RawStorageSettings,
    cache: RawCacheSettings,
    producer: RawProducerSettings,
    service: RawServiceSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(backend) = overrides.storage_backend.as_ref() {
            self.storage.backend = Some(backend.clone());
        }
        if let Some(directory) = overrides.storage_directory.as_ref() {
            self.storage.directory = Some(directory.clone());
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(seconds) = overrides.cache_poll_interval_seconds {
            self.cache.poll_interval_seconds = Some(seconds);
        }
        if let Some(cycles) = overrides.cache_max_wait_cycles {
            self.cache.max_wait_cycles = Some(cycles);
        }
        if let Some(seconds) = overrides.cache_lease_seconds {
            self.cache.lease_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            storage,
            cache,
            producer,
            service,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            storage: build_storage_settings(storage)?,
            cache: build_cache_settings(cache)?,
            producer: build_producer_settings(producer)?,
            service: build_service_settings(service)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
        released_only: database.released_only.unwrap_or(true),
    })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let backend = match storage.backend {
        Some(value) => StorageBackend::from_str(&value)
            .map_err(|reason| LoadError::invalid("storage.backend", reason))?,
        None => StorageBackend::Memory,
    };

    let directory = storage
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "storage.directory",
            "path must not be empty",
        ));
    }

    let container = storage
        .container
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_CONTAINER.to_string());
    if container.is_empty() || container.contains('/') {
        return Err(LoadError::invalid(
            "storage.container",
            "must be a single non-empty path segment",
        ));
    }

    let public_base_url = parse_base_url(
        storage.public_base_url.as_deref(),
        "storage.public_base_url",
    )?;

    Ok(StorageSettings {
        backend,
        directory,
        container,
        public_base_url,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let poll_secs = cache
        .poll_interval_seconds
        .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
    if poll_secs == 0 {
        return Err(LoadError::invalid(
            "cache.poll_interval_seconds",
            "must be greater than zero",
        ));
    }

    let lease_secs = cache.lease_seconds.unwrap_or(DEFAULT_LEASE_SECS);
    if !(MIN_LEASE_SECS..=MAX_LEASE_SECS).contains(&lease_secs) {
        return Err(LoadError::invalid(
            "cache.lease_seconds",
            format!("must be between {MIN_LEASE_SECS} and {MAX_LEASE_SECS} seconds"),
        ));
    }

    let key_metric_order = cache.key_metric_order.unwrap_or_default();

    let redirect_formats = match cache.redirect_formats {
        Some(values) => values
            .iter()
            .map(|value| ResponseFormat::from_str(value))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| LoadError::invalid("cache.redirect_formats", err.to_string()))?,
        None => vec![
            ResponseFormat::Csv,
            ResponseFormat::Json,
            ResponseFormat::Jsonl,
            ResponseFormat::Xml,
        ],
    };

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        poll_interval: Duration::from_secs(poll_secs),
        max_wait_cycles: cache.max_wait_cycles.unwrap_or(DEFAULT_MAX_WAIT_CYCLES),
        lease: Duration::from_secs(lease_secs),
        key_metric_order,
        redirect_formats,
    })
}

fn build_producer_settings(producer: RawProducerSettings) -> Result<ProducerSettings, LoadError> {
    let batch_size = non_zero_u32(
        producer.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).into(),
        "producer.batch_size",
    )?;
    let page_size = non_zero_u32(
        producer.page_size.unwrap_or(DEFAULT_PAGE_SIZE).into(),
        "producer.page_size",
    )?;

    let batched_area_types = match producer.batched_area_types {
        Some(values) => values
            .iter()
            .map(|value| AreaType::from_str(value))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| LoadError::invalid("producer.batched_area_types", err.to_string()))?,
        None => vec![
            AreaType::Utla,
            AreaType::Ltla,
            AreaType::NhsTrust,
            AreaType::Msoa,
        ],
    };

    Ok(ProducerSettings {
        batch_size,
        page_size,
        batched_area_types,
    })
}

fn build_service_settings(service: RawServiceSettings) -> Result<ServiceSettings, LoadError> {
    Ok(ServiceSettings {
        public_url: parse_base_url(service.public_url.as_deref(), "service.public_url")?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
    released_only: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    backend: Option<String>,
    directory: Option<PathBuf>,
    container: Option<String>,
    public_base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    poll_interval_seconds: Option<u64>,
    max_wait_cycles: Option<u32>,
    lease_seconds: Option<u64>,
    key_metric_order: Option<MetricOrdering>,
    redirect_formats: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawProducerSettings {
    batch_size: Option<u32>,
    page_size: Option<u32>,
    batched_area_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServiceSettings {
    public_url: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_base_url(value: Option<&str>, key: &'static str) -> Result<String, LoadError> {
    let candidate = value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_PUBLIC_URL);
    let url = Url::parse(candidate)
        .map_err(|err| LoadError::invalid(key, format!("invalid URL `{candidate}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(key, "scheme must be http or https"));
    }
    Ok(candidate.trim_end_matches('/').to_string())
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
