//! Configuration management for Pocketclaw
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//! The resulting [`Config`] is treated as read-only by every component
//! once the runtime starts.

use crate::error::{PocketclawError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for Pocketclaw
///
/// Every section carries defaults so an empty file (or no file at all)
/// yields a usable configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Agent loop behavior
    #[serde(default)]
    pub agent: AgentConfig,
    /// Session history limits and persistence
    #[serde(default)]
    pub session: SessionConfig,
    /// Inference backends and fallback policy
    #[serde(default)]
    pub inference: InferenceConfig,
    /// Messaging surfaces and reconnect policy
    #[serde(default)]
    pub transport: TransportConfig,
    /// Capability allow-lists and sandbox settings
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Metrics exporter
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Async executor sizing
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Agent loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Time budget for a whole turn, capability calls included (milliseconds)
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,

    /// Number of most recent history messages sent with each request
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Whether capability results trigger one additional generation round
    #[serde(default = "default_true")]
    pub follow_up_round: bool,

    /// Maximum number of turns processed concurrently across sessions
    #[serde(default = "default_max_concurrent_turns")]
    pub max_concurrent_turns: usize,

    /// Grace period for in-flight turns during shutdown (milliseconds)
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Sampling temperature passed to backends
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Upper bound on generated output units
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Optional system prompt prepended to every request
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_turn_timeout_ms() -> u64 {
    30_000
}

fn default_context_window() -> usize {
    20
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_turns() -> usize {
    4
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_output_tokens() -> u32 {
    1024
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            turn_timeout_ms: default_turn_timeout_ms(),
            context_window: default_context_window(),
            follow_up_round: true,
            max_concurrent_turns: default_max_concurrent_turns(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            system_prompt: None,
        }
    }
}

impl AgentConfig {
    /// Turn timeout as a `Duration`
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    /// Shutdown grace period as a `Duration`
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Durable store implementation used for sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Embedded sled database on disk
    #[default]
    Sled,
    /// Process-local map, lost on exit
    Memory,
}

/// Session store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum number of messages retained per session
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Maximum aggregate content bytes retained per session
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Idle time after which a session is removed (seconds)
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,

    /// Interval between expiry sweeps (seconds)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Budget for cached session bodies held in memory (megabytes)
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: usize,

    /// Durable store implementation
    #[serde(default)]
    pub storage: StorageKind,

    /// Directory for the sled database; defaults to the platform data dir
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_max_messages() -> usize {
    50
}

fn default_max_bytes() -> usize {
    64 * 1024
}

fn default_expiry_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_memory_limit_mb() -> usize {
    10
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_bytes: default_max_bytes(),
            expiry_secs: default_expiry_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            memory_limit_mb: default_memory_limit_mb(),
            storage: StorageKind::default(),
            directory: None,
        }
    }
}

impl SessionConfig {
    /// Resolve the directory used by the sled store
    pub fn storage_dir(&self) -> PathBuf {
        if let Some(dir) = &self.directory {
            return dir.clone();
        }
        directories::ProjectDirs::from("", "", "pocketclaw")
            .map(|dirs| dirs.data_dir().join("sessions"))
            .unwrap_or_else(|| PathBuf::from(".pocketclaw").join("sessions"))
    }
}

/// Wire protocol spoken by an inference backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Chat-completions style API (OpenRouter, OpenAI and compatibles)
    #[default]
    OpenaiCompat,
    /// Ollama chat API
    Ollama,
}

/// Single inference backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Wire protocol
    #[serde(default)]
    pub kind: BackendKind,

    /// Base URL of the API
    pub base_url: String,

    /// Model identifier sent with each request
    pub model: String,

    /// Inline API key (prefer `api_key_env` or the keyring)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Look the key up in the OS keyring
    #[serde(default)]
    pub use_keyring: bool,

    /// HTTP request timeout (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// Inference router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Backend attempted first
    #[serde(default = "default_primary_backend")]
    pub primary: String,

    /// Ordered fallback backends
    #[serde(default)]
    pub fallbacks: Vec<String>,

    /// Declared backends by name
    #[serde(default = "default_backends")]
    pub backends: BTreeMap<String, BackendConfig>,

    /// Consecutive failures before a backend is skipped
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an unavailable backend is skipped (seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// In-place retries after a rate-limit rejection
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,

    /// Initial backoff when no retry-after hint is given (milliseconds)
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Upper bound on any single rate-limit wait (milliseconds)
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

fn default_primary_backend() -> String {
    "openrouter".to_string()
}

fn default_backends() -> BTreeMap<String, BackendConfig> {
    let mut backends = BTreeMap::new();
    backends.insert(
        "openrouter".to_string(),
        BackendConfig {
            kind: BackendKind::OpenaiCompat,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "openai/gpt-4o-mini".to_string(),
            api_key: None,
            api_key_env: Some("OPENROUTER_API_KEY".to_string()),
            use_keyring: false,
            request_timeout_secs: default_request_timeout_secs(),
        },
    );
    backends
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_max_rate_limit_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    250
}

fn default_retry_max_ms() -> u64 {
    5_000
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_backend(),
            fallbacks: Vec::new(),
            backends: default_backends(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl InferenceConfig {
    /// Primary followed by fallbacks, in priority order
    pub fn chain(&self) -> Vec<String> {
        std::iter::once(self.primary.clone())
            .chain(self.fallbacks.iter().cloned())
            .collect()
    }
}

/// Messaging surface implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceKind {
    /// Local terminal (stdin/stdout)
    Console,
    /// Telegram Bot API long polling
    Telegram,
}

/// Single messaging surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceConfig {
    /// Unique surface identifier
    pub id: String,

    /// Surface implementation
    pub kind: SurfaceKind,

    /// Administrative enable flag
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Inline bot token
    #[serde(default)]
    pub token: Option<String>,

    /// Environment variable holding the bot token
    #[serde(default)]
    pub token_env: Option<String>,

    /// Override of the surface API base URL
    #[serde(default)]
    pub api_base: Option<String>,

    /// Long-poll timeout (seconds)
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

fn default_poll_timeout_secs() -> u64 {
    30
}

impl SurfaceConfig {
    /// Console surface with default settings
    pub fn console(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: SurfaceKind::Console,
            enabled: true,
            token: None,
            token_env: None,
            api_base: None,
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }

    /// Resolve the bot token from the inline value or the named variable
    pub fn resolve_token(&self) -> Option<String> {
        self.token.clone().or_else(|| {
            self.token_env
                .as_ref()
                .and_then(|name| std::env::var(name).ok())
        })
    }
}

/// Transport framework configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// First reconnect delay (milliseconds)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Largest reconnect delay (milliseconds)
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,

    /// Fraction of the delay added as random jitter (0.0 - 1.0)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Replies buffered per surface while disconnected
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,

    /// Capacity of the canonical inbound event queue
    #[serde(default = "default_inbound_queue_depth")]
    pub inbound_queue_depth: usize,

    /// Give up reconnecting after this many attempts (unbounded when unset)
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,

    /// Configured surfaces
    #[serde(default)]
    pub surfaces: Vec<SurfaceConfig>,
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_ceiling_ms() -> u64 {
    60_000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_outbound_queue_depth() -> usize {
    32
}

fn default_inbound_queue_depth() -> usize {
    256
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_ceiling_ms: default_backoff_ceiling_ms(),
            jitter_ratio: default_jitter_ratio(),
            outbound_queue_depth: default_outbound_queue_depth(),
            inbound_queue_depth: default_inbound_queue_depth(),
            max_reconnect_attempts: None,
            surfaces: Vec::new(),
        }
    }
}

impl TransportConfig {
    /// Make sure an enabled console surface exists
    pub fn ensure_console(&mut self) {
        match self
            .surfaces
            .iter_mut()
            .find(|surface| surface.kind == SurfaceKind::Console)
        {
            Some(surface) => surface.enabled = true,
            None => self.surfaces.push(SurfaceConfig::console("console")),
        }
    }
}

/// Filesystem capability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemToolConfig {
    /// Enable read_file, write_file and list_directory
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Largest file read_file will return (bytes)
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

impl Default for FilesystemToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

/// Shell capability settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShellToolConfig {
    /// Enable the shell capability
    #[serde(default)]
    pub enabled: bool,

    /// Programs allowed by exact name
    #[serde(default)]
    pub allowlist: Vec<String>,

    /// Extra regex patterns rejected in the full command line
    #[serde(default)]
    pub denylist: Vec<String>,

    /// Override of the default capability timeout (milliseconds)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Network fetch capability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchToolConfig {
    /// Enable the fetch capability
    #[serde(default)]
    pub enabled: bool,

    /// Hosts allowed even when they resolve to private addresses
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Largest response body returned (bytes)
    #[serde(default = "default_fetch_max_bytes")]
    pub max_bytes: usize,

    /// Override of the default capability timeout (milliseconds)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_fetch_max_bytes() -> usize {
    256 * 1024
}

impl Default for FetchToolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_hosts: Vec::new(),
            max_bytes: default_fetch_max_bytes(),
            timeout_ms: None,
        }
    }
}

/// Hardware bus type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    /// Inter-Integrated Circuit
    I2c,
    /// Serial Peripheral Interface
    Spi,
    /// General purpose I/O line
    Gpio,
}

/// Allow-listed hardware device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Identifier the assistant uses to address the device
    pub id: String,
    /// Bus type
    pub bus: BusKind,
    /// Bus address (I2C address, SPI chip select, GPIO line)
    pub address: String,
    /// Reject write operations
    #[serde(default)]
    pub read_only: bool,
}

/// Hardware bus capability settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceToolConfig {
    /// Enable the device capability
    #[serde(default)]
    pub enabled: bool,

    /// Devices the assistant may address
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Outbound messaging capability settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagingToolConfig {
    /// Enable the send_message capability
    #[serde(default)]
    pub enabled: bool,

    /// Extra `surface:user` targets besides the current conversation
    #[serde(default)]
    pub allowed_targets: Vec<String>,
}

/// Scheduled job capability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleToolConfig {
    /// Enable the schedule capability
    #[serde(default)]
    pub enabled: bool,

    /// Maximum pending jobs
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    /// Longest allowed delay (seconds)
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_jobs() -> usize {
    16
}

fn default_max_delay_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for ScheduleToolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_jobs: default_max_jobs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// Capability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default per-invocation timeout (milliseconds)
    #[serde(default = "default_tool_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Per-stream capture bound for capability output (bytes)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Root directory filesystem and shell capabilities are confined to
    #[serde(default)]
    pub sandbox_root: Option<PathBuf>,

    /// Filesystem capabilities
    #[serde(default)]
    pub filesystem: FilesystemToolConfig,

    /// Shell capability
    #[serde(default)]
    pub shell: ShellToolConfig,

    /// Network fetch capability
    #[serde(default)]
    pub fetch: FetchToolConfig,

    /// Hardware bus capability
    #[serde(default)]
    pub device: DeviceToolConfig,

    /// Outbound messaging capability
    #[serde(default)]
    pub messaging: MessagingToolConfig,

    /// Scheduled job capability
    #[serde(default)]
    pub schedule: ScheduleToolConfig,
}

fn default_tool_timeout_ms() -> u64 {
    10_000
}

fn default_max_output_bytes() -> usize {
    16 * 1024
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_tool_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
            sandbox_root: None,
            filesystem: FilesystemToolConfig::default(),
            shell: ShellToolConfig::default(),
            fetch: FetchToolConfig::default(),
            device: DeviceToolConfig::default(),
            messaging: MessagingToolConfig::default(),
            schedule: ScheduleToolConfig::default(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable lines
    Pretty,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Optional file that receives a copy of the log output
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

/// Metrics exporter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Socket address for the Prometheus endpoint (requires the `prometheus` feature)
    #[serde(default)]
    pub listen: Option<String>,
}

/// Executor sizing
///
/// A single worker thread selects the current-thread scheduler, which suits
/// single-core boards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Threads driving async tasks
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Upper bound on threads used for blocking storage and process work
    #[serde(default = "default_max_blocking_threads")]
    pub max_blocking_threads: usize,
}

fn default_worker_threads() -> usize {
    2
}

fn default_max_blocking_threads() -> usize {
    8
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            max_blocking_threads: default_max_blocking_threads(),
        }
    }
}

impl RuntimeConfig {
    /// Build the tokio runtime described by this section
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the runtime's threads or drivers cannot be created
    pub fn build(&self) -> std::io::Result<tokio::runtime::Runtime> {
        let mut builder = if self.worker_threads <= 1 {
            tokio::runtime::Builder::new_current_thread()
        } else {
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            builder.worker_threads(self.worker_threads);
            builder
        };
        builder
            .max_blocking_threads(self.max_blocking_threads.max(1))
            .thread_name("pocketclaw-worker")
            .enable_all()
            .build()
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// A missing file is not an error; defaults are used instead.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    /// Parse a YAML configuration file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PocketclawError::Config(format!("Failed to read config file: {}", e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse YAML text; an empty document yields the defaults
    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
            .map_err(|e| PocketclawError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(primary) = std::env::var("POCKETCLAW_PRIMARY_BACKEND") {
            self.inference.primary = primary;
        }

        if let Ok(fallbacks) = std::env::var("POCKETCLAW_FALLBACK_BACKENDS") {
            self.inference.fallbacks = fallbacks
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            tracing::debug!(fallbacks = ?self.inference.fallbacks, "Env override: POCKETCLAW_FALLBACK_BACKENDS");
        }

        if let Ok(timeout) = std::env::var("POCKETCLAW_TURN_TIMEOUT_MS") {
            if let Ok(value) = timeout.parse() {
                self.agent.turn_timeout_ms = value;
            } else {
                tracing::warn!("Invalid POCKETCLAW_TURN_TIMEOUT_MS: {}", timeout);
            }
        }

        if let Ok(window) = std::env::var("POCKETCLAW_CONTEXT_WINDOW") {
            if let Ok(value) = window.parse() {
                self.agent.context_window = value;
            } else {
                tracing::warn!("Invalid POCKETCLAW_CONTEXT_WINDOW: {}", window);
            }
        }

        if let Ok(concurrency) = std::env::var("POCKETCLAW_MAX_CONCURRENT_TURNS") {
            if let Ok(value) = concurrency.parse() {
                self.agent.max_concurrent_turns = value;
            } else {
                tracing::warn!("Invalid POCKETCLAW_MAX_CONCURRENT_TURNS: {}", concurrency);
            }
        }

        if let Ok(dir) = std::env::var("POCKETCLAW_SESSION_DIR") {
            self.session.directory = Some(PathBuf::from(dir));
        }

        if let Ok(root) = std::env::var("POCKETCLAW_SANDBOX_ROOT") {
            self.tools.sandbox_root = Some(PathBuf::from(root));
        }

        if let Ok(threads) = std::env::var("POCKETCLAW_WORKER_THREADS") {
            if let Ok(value) = threads.parse() {
                self.runtime.worker_threads = value;
            } else {
                tracing::warn!("Invalid POCKETCLAW_WORKER_THREADS: {}", threads);
            }
        }

        if let Ok(level) = std::env::var("POCKETCLAW_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = std::env::var("POCKETCLAW_LOG_FORMAT") {
            match format.to_lowercase().as_str() {
                "json" => self.logging.format = LogFormat::Json,
                "pretty" => self.logging.format = LogFormat::Pretty,
                _ => tracing::warn!("Invalid POCKETCLAW_LOG_FORMAT: {}", format),
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(backend) = &cli.backend {
            self.inference.primary = backend.clone();
            self.inference.fallbacks.retain(|name| name != backend);
        }
        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
        }
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::Config` describing the first failed check
    pub fn validate(&self) -> Result<()> {
        fn fail(message: impl Into<String>) -> Result<()> {
            Err(PocketclawError::Config(message.into()).into())
        }

        if self.agent.turn_timeout_ms == 0 {
            return fail("agent.turn_timeout_ms must be greater than 0");
        }
        if self.agent.context_window == 0 {
            return fail("agent.context_window must be greater than 0");
        }
        if self.agent.max_concurrent_turns == 0 {
            return fail("agent.max_concurrent_turns must be greater than 0");
        }
        if !(0.0..=2.0).contains(&self.agent.temperature) {
            return fail("agent.temperature must be between 0.0 and 2.0");
        }

        if self.session.max_messages == 0 {
            return fail("session.max_messages must be greater than 0");
        }
        if self.session.max_bytes == 0 {
            return fail("session.max_bytes must be greater than 0");
        }
        if self.session.expiry_secs == 0 {
            return fail("session.expiry_secs must be greater than 0");
        }
        if self.session.sweep_interval_secs == 0 {
            return fail("session.sweep_interval_secs must be greater than 0");
        }

        if !self.inference.backends.contains_key(&self.inference.primary) {
            return fail(format!(
                "inference.primary '{}' is not declared under inference.backends",
                self.inference.primary
            ));
        }
        let mut seen = HashSet::new();
        for name in self.inference.chain() {
            if !self.inference.backends.contains_key(&name) {
                return fail(format!(
                    "inference fallback '{}' is not declared under inference.backends",
                    name
                ));
            }
            if !seen.insert(name.clone()) {
                return fail(format!(
                    "backend '{}' appears more than once in the fallback chain",
                    name
                ));
            }
        }
        if self.inference.failure_threshold == 0 {
            return fail("inference.failure_threshold must be greater than 0");
        }
        if self.inference.retry_base_ms > self.inference.retry_max_ms {
            return fail("inference.retry_base_ms must not exceed inference.retry_max_ms");
        }

        if self.transport.backoff_base_ms == 0 {
            return fail("transport.backoff_base_ms must be greater than 0");
        }
        if self.transport.backoff_base_ms > self.transport.backoff_ceiling_ms {
            return fail("transport.backoff_base_ms must not exceed transport.backoff_ceiling_ms");
        }
        if !(0.0..=1.0).contains(&self.transport.jitter_ratio) {
            return fail("transport.jitter_ratio must be between 0.0 and 1.0");
        }
        if self.transport.outbound_queue_depth == 0 || self.transport.inbound_queue_depth == 0 {
            return fail("transport queue depths must be greater than 0");
        }
        let mut surface_ids = HashSet::new();
        for surface in &self.transport.surfaces {
            if surface.id.trim().is_empty() {
                return fail("transport surface id cannot be empty");
            }
            if !surface_ids.insert(surface.id.as_str()) {
                return fail(format!("duplicate transport surface id '{}'", surface.id));
            }
            if surface.enabled
                && surface.kind == SurfaceKind::Telegram
                && surface.resolve_token().is_none()
            {
                return fail(format!(
                    "telegram surface '{}' is enabled but has no token",
                    surface.id
                ));
            }
        }

        if self.tools.default_timeout_ms == 0 {
            return fail("tools.default_timeout_ms must be greater than 0");
        }
        if self.tools.max_output_bytes == 0 {
            return fail("tools.max_output_bytes must be greater than 0");
        }
        let needs_sandbox = self.tools.filesystem.enabled || self.tools.shell.enabled;
        if needs_sandbox {
            match &self.tools.sandbox_root {
                Some(root) if root.is_dir() => {}
                Some(root) => {
                    return fail(format!(
                        "tools.sandbox_root '{}' does not exist or is not a directory",
                        root.display()
                    ))
                }
                None if self.tools.shell.enabled => {
                    return fail("tools.sandbox_root is required when the shell capability is enabled")
                }
                None => {}
            }
        }
        for pattern in &self.tools.shell.denylist {
            if let Err(e) = regex::Regex::new(pattern) {
                return fail(format!("invalid shell denylist pattern '{}': {}", pattern, e));
            }
        }
        let mut device_ids = HashSet::new();
        for device in &self.tools.device.devices {
            if !device_ids.insert(device.id.as_str()) {
                return fail(format!("duplicate device id '{}'", device.id));
            }
        }
        for target in &self.tools.messaging.allowed_targets {
            if target.split_once(':').is_none() {
                return fail(format!(
                    "messaging target '{}' must have the form surface:user",
                    target
                ));
            }
        }
        if self.tools.schedule.max_jobs == 0 {
            return fail("tools.schedule.max_jobs must be greater than 0");
        }

        if self.runtime.worker_threads == 0 {
            return fail("runtime.worker_threads must be greater than 0");
        }
        if self.runtime.max_blocking_threads == 0 {
            return fail("runtime.max_blocking_threads must be greater than 0");
        }

        Ok(())
    }

    /// Filesystem capabilities are registered only with a sandbox root
    pub fn filesystem_enabled(&self) -> bool {
        self.tools.filesystem.enabled && self.tools.sandbox_root.is_some()
    }
}
