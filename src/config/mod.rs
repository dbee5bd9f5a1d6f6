//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "keystash";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_MAX_REQUEST_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 500_000;
const DEFAULT_CHUNK_PARALLELISM: u64 = 4;
const DEFAULT_STATE_CACHE_CAPACITY: u64 = 10_000;
const DEFAULT_BULK_DELETE_BLOCK_SIZE: u64 = 100;
const DEFAULT_BULK_DELETE_MAX_RETRIES: u64 = 3;
const DEFAULT_BULK_DELETE_CONCURRENCY: u64 = 2;
const DEFAULT_CONSUME_INTERVAL_MS: u64 = 1000;
const DEFAULT_CONSUME_BATCH_LIMIT: u64 = 500;

/// Command-line arguments for the keystash binary.
#[derive(Debug, Parser)]
#[command(name = "keystash", version, about = "Chunked multi-tenant key/value cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "KEYSTASH_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the cache HTTP service.
    Serve(Box<ServeArgs>),
    /// Apply database migrations and exit.
    Migrate(MigrateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the maximum accepted request body.
    #[arg(long = "server-max-request-bytes", value_name = "BYTES")]
    pub server_max_request_bytes: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Largest payload stored as a single chunk.
    #[arg(long = "store-max-payload-size", value_name = "BYTES")]
    pub store_max_payload_size: Option<u64>,

    #[arg(long = "store-chunk-parallelism", value_name = "COUNT")]
    pub store_chunk_parallelism: Option<u64>,

    /// TTL applied to writes that carry none; 0 disables it.
    #[arg(long = "store-default-ttl-seconds", value_name = "SECONDS")]
    pub store_default_ttl_seconds: Option<u64>,

    /// Entries kept hydrated in memory; the rest reload from the journal.
    #[arg(long = "store-state-cache-capacity", value_name = "COUNT")]
    pub store_state_cache_capacity: Option<u64>,

    #[arg(
        long = "store-cache-name-needed-first",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub store_cache_name_needed_first: Option<bool>,

    #[arg(long = "bulk-delete-block-size", value_name = "COUNT")]
    pub bulk_delete_block_size: Option<u64>,

    #[arg(long = "bulk-delete-max-retries", value_name = "COUNT")]
    pub bulk_delete_max_retries: Option<u64>,

    /// Bulk delete jobs run at once by this process.
    #[arg(long = "bulk-delete-concurrency", value_name = "COUNT")]
    pub bulk_delete_concurrency: Option<u64>,

    #[arg(long = "projection-consume-interval-ms", value_name = "MILLIS")]
    pub projection_consume_interval_ms: Option<u64>,

    #[arg(long = "projection-consume-batch-limit", value_name = "COUNT")]
    pub projection_consume_batch_limit: Option<u64>,

    /// Toggle the tenant usage ledger.
    #[arg(
        long = "usage-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub usage_enabled: Option<bool>,

    /// Per-tenant allotment of cached bytes; 0 disables it.
    #[arg(long = "usage-max-bytes-per-org", value_name = "BYTES")]
    pub usage_max_bytes_per_org: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub store: StoreSettings,
    pub bulk_delete: BulkDeleteSettings,
    pub projection: ProjectionSettings,
    pub usage: UsageSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
    pub max_request_bytes: NonZeroUsize,
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
    /// Absent selects the in-memory repositories.
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub max_payload_size: NonZeroUsize,
    pub chunk_parallelism: NonZeroUsize,
    pub default_ttl: Option<Duration>,
    pub state_cache_capacity: NonZeroUsize,
    pub cache_name_needed_first: bool,
}

#[derive(Debug, Clone)]
pub struct BulkDeleteSettings {
    pub block_size: NonZeroUsize,
    pub max_retries: NonZeroU32,
    pub concurrency: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct ProjectionSettings {
    pub consume_interval: Duration,
    pub consume_batch_limit: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct UsageSettings {
    pub enabled: bool,
    pub max_bytes_per_org: Option<NonZeroU64>,
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

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("KEYSTASH").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Migrate(args)) => raw.apply_database_override(&args.database),
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
    store: RawStoreSettings,
    bulk_delete: RawBulkDeleteSettings,
    projection: RawProjectionSettings,
    usage: RawUsageSettings,
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
        if let Some(bytes) = overrides.server_max_request_bytes {
            self.server.max_request_bytes = Some(bytes);
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
        if let Some(size) = overrides.store_max_payload_size {
            self.store.max_payload_size = Some(size);
        }
        if let Some(value) = overrides.store_chunk_parallelism {
            self.store.chunk_parallelism = Some(value);
        }
        if let Some(seconds) = overrides.store_default_ttl_seconds {
            self.store.default_ttl_seconds = Some(seconds);
        }
        if let Some(capacity) = overrides.store_state_cache_capacity {
            self.store.state_cache_capacity = Some(capacity);
        }
        if let Some(needed) = overrides.store_cache_name_needed_first {
            self.store.cache_name_needed_first = Some(needed);
        }
        if let Some(size) = overrides.bulk_delete_block_size {
            self.bulk_delete.block_size = Some(size);
        }
        if let Some(retries) = overrides.bulk_delete_max_retries {
            self.bulk_delete.max_retries = Some(retries);
        }
        if let Some(concurrency) = overrides.bulk_delete_concurrency {
            self.bulk_delete.concurrency = Some(concurrency);
        }
        if let Some(millis) = overrides.projection_consume_interval_ms {
            self.projection.consume_interval_ms = Some(millis);
        }
        if let Some(limit) = overrides.projection_consume_batch_limit {
            self.projection.consume_batch_limit = Some(limit);
        }
        if let Some(enabled) = overrides.usage_enabled {
            self.usage.enabled = Some(enabled);
        }
        if let Some(bytes) = overrides.usage_max_bytes_per_org {
            self.usage.max_bytes_per_org = Some(bytes);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            store,
            bulk_delete,
            projection,
            usage,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            store: build_store_settings(store)?,
            bulk_delete: build_bulk_delete_settings(bulk_delete)?,
            projection: build_projection_settings(projection)?,
            usage: build_usage_settings(usage),
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

    let max_request_bytes = non_zero_usize(
        server.max_request_bytes.unwrap_or(DEFAULT_MAX_REQUEST_BYTES),
        "server.max_request_bytes",
    )?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
        max_request_bytes,
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
    })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let max_payload_size = non_zero_usize(
        store.max_payload_size.unwrap_or(DEFAULT_MAX_PAYLOAD_SIZE),
        "store.max_payload_size",
    )?;
    let chunk_parallelism = non_zero_usize(
        store.chunk_parallelism.unwrap_or(DEFAULT_CHUNK_PARALLELISM),
        "store.chunk_parallelism",
    )?;
    let default_ttl = store
        .default_ttl_seconds
        .filter(|seconds| *seconds > 0)
        .map(Duration::from_secs);
    let state_cache_capacity = non_zero_usize(
        store
            .state_cache_capacity
            .unwrap_or(DEFAULT_STATE_CACHE_CAPACITY),
        "store.state_cache_capacity",
    )?;

    Ok(StoreSettings {
        max_payload_size,
        chunk_parallelism,
        default_ttl,
        state_cache_capacity,
        cache_name_needed_first: store.cache_name_needed_first.unwrap_or(false),
    })
}

fn build_bulk_delete_settings(
    bulk_delete: RawBulkDeleteSettings,
) -> Result<BulkDeleteSettings, LoadError> {
    Ok(BulkDeleteSettings {
        block_size: non_zero_usize(
            bulk_delete
                .block_size
                .unwrap_or(DEFAULT_BULK_DELETE_BLOCK_SIZE),
            "bulk_delete.block_size",
        )?,
        max_retries: non_zero_u32(
            bulk_delete
                .max_retries
                .unwrap_or(DEFAULT_BULK_DELETE_MAX_RETRIES),
            "bulk_delete.max_retries",
        )?,
        concurrency: non_zero_usize(
            bulk_delete
                .concurrency
                .unwrap_or(DEFAULT_BULK_DELETE_CONCURRENCY),
            "bulk_delete.concurrency",
        )?,
    })
}

fn build_projection_settings(
    projection: RawProjectionSettings,
) -> Result<ProjectionSettings, LoadError> {
    let interval_ms = projection
        .consume_interval_ms
        .unwrap_or(DEFAULT_CONSUME_INTERVAL_MS);
    if interval_ms == 0 {
        return Err(LoadError::invalid(
            "projection.consume_interval_ms",
            "must be greater than zero",
        ));
    }

    Ok(ProjectionSettings {
        consume_interval: Duration::from_millis(interval_ms),
        consume_batch_limit: non_zero_usize(
            projection
                .consume_batch_limit
                .unwrap_or(DEFAULT_CONSUME_BATCH_LIMIT),
            "projection.consume_batch_limit",
        )?,
    })
}

fn build_usage_settings(usage: RawUsageSettings) -> UsageSettings {
    UsageSettings {
        enabled: usage.enabled.unwrap_or(true),
        max_bytes_per_org: usage.max_bytes_per_org.and_then(NonZeroU64::new),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    max_request_bytes: Option<u64>,
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
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    max_payload_size: Option<u64>,
    chunk_parallelism: Option<u64>,
    default_ttl_seconds: Option<u64>,
    state_cache_capacity: Option<u64>,
    cache_name_needed_first: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBulkDeleteSettings {
    block_size: Option<u64>,
    max_retries: Option<u64>,
    concurrency: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawProjectionSettings {
    consume_interval_ms: Option<u64>,
    consume_batch_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUsageSettings {
    enabled: Option<bool>,
    max_bytes_per_org: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize)
        .ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.server.port = Some(4000);
        raw.logging.level = Some("info".to_string());
        raw.store.max_payload_size = Some(1024);

        let overrides = ServeOverrides {
            server_port: Some(4321),
            log_level: Some("debug".to_string()),
            store_max_payload_size: Some(2048),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert_eq!(settings.store.max_payload_size.get(), 2048);
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

        assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
        assert!(settings.database.url.is_none());
        assert_eq!(settings.store.max_payload_size.get(), 500_000);
        assert_eq!(settings.store.default_ttl, None);
        assert!(!settings.store.cache_name_needed_first);
        assert_eq!(settings.bulk_delete.block_size.get(), 100);
        assert_eq!(settings.bulk_delete.max_retries.get(), 3);
        assert_eq!(settings.bulk_delete.concurrency.get(), 2);
        assert_eq!(settings.store.state_cache_capacity.get(), 10_000);
        assert!(settings.usage.enabled);
        assert!(settings.usage.max_bytes_per_org.is_none());
        assert!(matches!(settings.logging.format, LogFormat::Compact));
    }

    #[test]
    fn zero_ttl_and_quota_mean_disabled() {
        let mut raw = RawSettings::default();
        raw.apply_serve_overrides(&ServeOverrides {
            store_default_ttl_seconds: Some(0),
            usage_max_bytes_per_org: Some(0),
            ..Default::default()
        });
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(settings.store.default_ttl.is_none());
        assert!(settings.usage.max_bytes_per_org.is_none());
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let mut raw = RawSettings::default();
        raw.bulk_delete.block_size = Some(0);

        let err = Settings::from_raw(raw).expect_err("invalid block size");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "bulk_delete.block_size",
                ..
            }
        ));
    }

    #[test]
    fn blank_database_url_selects_memory() {
        let mut raw = RawSettings::default();
        raw.database.url = Some("   ".to_string());
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(settings.database.url.is_none());
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        let overrides = ServeOverrides {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["keystash"]);
        let command = args
            .command
            .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
        assert!(matches!(command, Command::Serve(_)));
    }

    #[test]
    fn parse_serve_arguments() {
        let args = CliArgs::parse_from([
            "keystash",
            "serve",
            "--store-cache-name-needed-first",
            "true",
            "--bulk-delete-block-size",
            "7",
        ]);

        match args.command.expect("serve command") {
            Command::Serve(serve) => {
                assert_eq!(serve.overrides.store_cache_name_needed_first, Some(true));
                assert_eq!(serve.overrides.bulk_delete_block_size, Some(7));
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_migrate_arguments() {
        let args = CliArgs::parse_from([
            "keystash",
            "migrate",
            "--database-url",
            "postgres://example",
        ]);

        match args.command.expect("migrate command") {
            Command::Migrate(migrate) => {
                assert_eq!(
                    migrate.database.database_url.as_deref(),
                    Some("postgres://example")
                );
            }
            _ => panic!("wrong command parsed"),
        }
    }
}
