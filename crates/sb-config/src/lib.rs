//! Configuration for the sync daemon.
//!
//! Options come from a TOML file and CLI flags; a flag given on the command
//! line always wins over the same key in the file, and documented defaults
//! apply last.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use sb_common::{parse_namespace, Result, SyncError};
pub use sb_common::ResumeStrategy;

pub const NAME: &str = "searchbridge";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const MONGO_URL_DEFAULT: &str = "mongodb://localhost:27017";
pub const RESUME_NAME_DEFAULT: &str = "default";
pub const HTTP_ADDR_DEFAULT: &str = ":8010";

const FLUSH_BUFFER_SIZE_DEFAULT: usize = 10;
const FLUSH_INTERVAL_DEFAULT: i64 = 10;
const CHANNEL_SIZE_DEFAULT: usize = 512;
const BUFFER_SIZE_DEFAULT: usize = 32;
const BUFFER_DURATION_DEFAULT: &str = "75ms";

// ============================================================================
// Engine descriptors
// ============================================================================

/// Static configuration for one downstream engine. Empty strings mean unset,
/// matching the TOML layout where optional keys are simply omitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Namespace")]
    pub namespace: String,
    #[serde(rename = "ChangeStreamNS", default)]
    pub change_stream_ns: String,
    #[serde(rename = "DirectReadNS", default)]
    pub direct_read_ns: String,
    #[serde(rename = "FunctionName", default)]
    pub function_name: String,
}

impl EngineConfig {
    pub fn direct_read_ns(&self) -> Option<&str> {
        (!self.direct_read_ns.is_empty()).then_some(self.direct_read_ns.as_str())
    }

    pub fn change_stream_ns(&self) -> Option<&str> {
        (!self.change_stream_ns.is_empty()).then_some(self.change_stream_ns.as_str())
    }

    pub fn function_name(&self) -> Option<&str> {
        (!self.function_name.is_empty()).then_some(self.function_name.as_str())
    }
}

// ============================================================================
// Source tuning
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SourceSettings {
    pub channel_size: usize,
    pub buffer_size: usize,
    pub buffer_duration: String,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            channel_size: CHANNEL_SIZE_DEFAULT,
            buffer_size: BUFFER_SIZE_DEFAULT,
            buffer_duration: BUFFER_DURATION_DEFAULT.to_string(),
        }
    }
}

impl SourceSettings {
    pub fn buffer_duration(&self) -> Result<Duration> {
        parse_duration(&self.buffer_duration)
    }
}

/// Parses durations of the form `75ms`, `2s`, `1m`, `1h`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| SyncError::Config(format!("duration is missing a unit: {}", s)))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| SyncError::Config(format!("invalid duration: {}", s)))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(SyncError::Config(format!("invalid duration unit: {}", s))),
    }
}

// ============================================================================
// CLI flags
// ============================================================================

#[derive(Debug, Parser, Default)]
#[command(name = "sb-syncd", version, about = "Stream MongoDB changes into search engines")]
pub struct Cli {
    /// Location of the TOML configuration file
    #[arg(short = 'f', value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// True to enable the internal http server
    #[arg(long)]
    pub enable_http_server: bool,

    /// The address the internal http server listens on
    #[arg(long)]
    pub http_server_addr: Option<String>,

    /// App search connection URL
    #[arg(long)]
    pub app_search_url: Option<String>,

    /// App search api key
    #[arg(long)]
    pub app_search_api_key: Option<String>,

    /// The number of concurrent indexing workers
    #[arg(long)]
    pub app_search_clients: Option<usize>,

    /// Core MongoDB connection URL
    #[arg(long)]
    pub core_mongo_url: Option<String>,

    /// Learn MongoDB connection URL
    #[arg(long)]
    pub learn_mongo_url: Option<String>,

    /// Engagement MongoDB connection URL
    #[arg(long)]
    pub engagement_mongo_url: Option<String>,

    /// Test MongoDB connection URL
    #[arg(long)]
    pub test_mongo_url: Option<String>,

    /// Override the database name which contains the oplog
    #[arg(long)]
    pub mongo_oplog_database_name: Option<String>,

    /// Override the collection name which contains the oplog
    #[arg(long)]
    pub mongo_oplog_collection_name: Option<String>,

    /// True to output verbose messages
    #[arg(long)]
    pub verbose: bool,

    /// True to store the last synced position and resume on a subsequent run
    #[arg(long)]
    pub resume: bool,

    /// Strategy to use for resuming. 0=timestamp,1=token
    #[arg(long)]
    pub resume_strategy: Option<u8>,

    /// Timestamp to resume syncing from
    #[arg(long)]
    pub resume_from_timestamp: Option<i64>,

    /// True to speed up resume-state writes at the cost of error checking
    #[arg(long)]
    pub resume_write_unsafe: bool,

    /// True to replay all events from the beginning of the change history
    #[arg(long)]
    pub replay: bool,

    /// Enable stats collection
    #[arg(long)]
    pub stats: bool,

    /// Enable profiling endpoints
    #[arg(long)]
    pub pprof: bool,

    /// Name under which to load/store the resume state
    #[arg(long)]
    pub resume_name: Option<String>,

    /// Set to true to read directly from MongoDB collections on startup
    #[arg(long)]
    pub direct_reads: bool,

    /// Set to true to observe changes via change streams
    #[arg(long)]
    pub change_streams: bool,

    /// Set to true to exit after direct reads are complete
    #[arg(long)]
    pub exit_after_direct_reads: bool,

    /// Set to true to forward delete operations downstream
    #[arg(long)]
    pub index_deletes: bool,

    /// After this number of docs the batch is flushed downstream
    #[arg(long)]
    pub flush_buffer_size: Option<usize>,

    /// Interval (in seconds) at which batches are flushed downstream
    #[arg(long)]
    pub flush_interval: Option<i64>,
}

// ============================================================================
// TOML file layout
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct FileConfig {
    enable_http_server: bool,
    http_server_addr: String,
    core_mongo_url: String,
    learn_mongo_url: String,
    engagement_mongo_url: String,
    test_mongo_url: String,
    mongo_oplog_database_name: String,
    mongo_oplog_collection_name: String,
    gtm_settings: SourceSettings,
    resume_name: String,
    verbose: bool,
    stats: bool,
    pprof: bool,
    resume: bool,
    resume_strategy: Option<ResumeStrategy>,
    resume_write_unsafe: bool,
    resume_from_timestamp: i64,
    replay: bool,
    app_search_url: String,
    app_search_api_key: String,
    app_search_clients: Option<usize>,
    direct_reads: bool,
    change_streams: bool,
    exit_after_direct_reads: bool,
    index_deletes: bool,
    flush_buffer_size: Option<usize>,
    flush_interval: Option<i64>,
    #[serde(rename = "EngineConfig")]
    engine_config: Vec<EngineConfig>,
}

// ============================================================================
// Merged configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub enable_http_server: bool,
    pub http_server_addr: String,
    pub core_mongo_url: String,
    pub learn_mongo_url: String,
    pub engagement_mongo_url: String,
    pub test_mongo_url: String,
    pub oplog_database: Option<String>,
    pub oplog_collection: Option<String>,
    pub source_settings: SourceSettings,
    pub resume_name: String,
    pub verbose: bool,
    pub stats: bool,
    pub pprof: bool,
    pub resume: bool,
    pub resume_strategy: ResumeStrategy,
    pub resume_write_unsafe: bool,
    pub resume_from_timestamp: i64,
    pub replay: bool,
    pub app_search_url: String,
    pub app_search_api_key: String,
    pub app_search_clients: usize,
    pub direct_reads: bool,
    pub change_streams: bool,
    pub exit_after_direct_reads: bool,
    pub index_deletes: bool,
    pub flush_buffer_size: usize,
    pub flush_interval: i64,
    pub engines: Vec<EngineConfig>,
}

fn pick(cli: Option<String>, file: String, default: &str) -> String {
    match cli {
        Some(v) if !v.is_empty() => v,
        _ if !file.is_empty() => file,
        _ => default.to_string(),
    }
}

impl Config {
    /// Builds the effective configuration from parsed CLI flags, loading the
    /// TOML file when one is named.
    pub fn load(cli: Cli) -> Result<Config> {
        let file = match &cli.config_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    SyncError::Config(format!(
                        "unable to read config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                toml::from_str::<FileConfig>(&raw).map_err(|e| {
                    SyncError::Config(format!(
                        "unable to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?
            }
            None => FileConfig::default(),
        };

        let resume_strategy = match cli.resume_strategy {
            Some(raw) => ResumeStrategy::try_from(raw).map_err(SyncError::Config)?,
            None => file.resume_strategy.unwrap_or_default(),
        };

        let config = Config {
            enable_http_server: cli.enable_http_server || file.enable_http_server,
            http_server_addr: pick(cli.http_server_addr, file.http_server_addr, HTTP_ADDR_DEFAULT),
            core_mongo_url: pick(cli.core_mongo_url, file.core_mongo_url, MONGO_URL_DEFAULT),
            learn_mongo_url: pick(cli.learn_mongo_url, file.learn_mongo_url, MONGO_URL_DEFAULT),
            engagement_mongo_url: pick(
                cli.engagement_mongo_url,
                file.engagement_mongo_url,
                MONGO_URL_DEFAULT,
            ),
            test_mongo_url: pick(cli.test_mongo_url, file.test_mongo_url, MONGO_URL_DEFAULT),
            oplog_database: cli
                .mongo_oplog_database_name
                .or((!file.mongo_oplog_database_name.is_empty())
                    .then_some(file.mongo_oplog_database_name)),
            oplog_collection: cli
                .mongo_oplog_collection_name
                .or((!file.mongo_oplog_collection_name.is_empty())
                    .then_some(file.mongo_oplog_collection_name)),
            source_settings: file.gtm_settings,
            resume_name: pick(cli.resume_name, file.resume_name, RESUME_NAME_DEFAULT),
            verbose: cli.verbose || file.verbose,
            stats: cli.stats || file.stats,
            pprof: cli.pprof || file.pprof,
            resume: cli.resume || file.resume,
            resume_strategy,
            resume_write_unsafe: cli.resume_write_unsafe || file.resume_write_unsafe,
            resume_from_timestamp: cli.resume_from_timestamp.unwrap_or(file.resume_from_timestamp),
            replay: cli.replay || file.replay,
            app_search_url: pick(cli.app_search_url, file.app_search_url, ""),
            app_search_api_key: pick(cli.app_search_api_key, file.app_search_api_key, ""),
            app_search_clients: cli
                .app_search_clients
                .or(file.app_search_clients)
                .filter(|&n| n > 0)
                .unwrap_or(1),
            direct_reads: cli.direct_reads || file.direct_reads,
            change_streams: cli.change_streams || file.change_streams,
            exit_after_direct_reads: cli.exit_after_direct_reads || file.exit_after_direct_reads,
            index_deletes: cli.index_deletes || file.index_deletes,
            flush_buffer_size: cli
                .flush_buffer_size
                .or(file.flush_buffer_size)
                .unwrap_or(FLUSH_BUFFER_SIZE_DEFAULT),
            flush_interval: cli
                .flush_interval
                .or(file.flush_interval)
                .unwrap_or(FLUSH_INTERVAL_DEFAULT),
            engines: file.engine_config,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engines.is_empty() {
            return Err(SyncError::Config("no engine configuration found".to_string()));
        }
        for engine in &self.engines {
            if engine.name.is_empty() {
                return Err(SyncError::Config(format!(
                    "engine for namespace {} has no name",
                    engine.namespace
                )));
            }
            parse_namespace(&engine.namespace)?;
        }
        self.source_settings.buffer_duration()?;
        Ok(())
    }

    /// Source namespaces to bulk-scan on startup. Engines opt in by setting
    /// `DirectReadNS`; the scan itself targets the engine's source namespace.
    pub fn direct_read_ns_list(&self) -> Vec<String> {
        if !self.direct_reads {
            return Vec::new();
        }
        self.engines
            .iter()
            .filter(|e| e.direct_read_ns().is_some())
            .map(|e| e.namespace.clone())
            .collect()
    }

    /// Source namespaces to subscribe to via change streams.
    pub fn change_stream_ns_list(&self) -> Vec<String> {
        self.engines
            .iter()
            .filter(|e| e.change_stream_ns().is_some())
            .map(|e| e.namespace.clone())
            .collect()
    }

    /// The diagnostic server bind address. Accepts the `:port` shorthand.
    pub fn http_addr(&self) -> Result<SocketAddr> {
        let raw = if self.http_server_addr.starts_with(':') {
            format!("0.0.0.0{}", self.http_server_addr)
        } else {
            self.http_server_addr.clone()
        };
        raw.parse()
            .map_err(|e| SyncError::Config(format!("invalid http server address {}: {}", raw, e)))
    }

    pub fn user_agent(&self) -> String {
        format!("{} v{}", NAME, VERSION)
    }
}
