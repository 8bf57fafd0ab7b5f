use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

/// Environment variable naming a TOML configuration file.
pub const CONFIG_PATH_ENV: &str = "OOPJIT_CONFIG";

pub const SCHEDULER_PREFIX: &str = "OOPJIT_SCHEDULER_";
pub const ADMISSION_PREFIX: &str = "OOPJIT_ADMISSION_";
pub const TRANSPORT_PREFIX: &str = "OOPJIT_TRANSPORT_";
pub const ARENA_PREFIX: &str = "OOPJIT_ARENA_";
pub const SERVER_PREFIX: &str = "OOPJIT_SERVER_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Error reading config file {path}: {err}")]
    Read { path: String, err: std::io::Error },
    #[error("Error parsing config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Error deserializing config from env: {err}. From config: {from:?}")]
    Env { err: envy::Error, from: String },
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    pub scheduler: SchedulerConfig,
    pub admission: AdmissionConfig,
    pub transport: TransportConfig,
    pub arena: ArenaConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Background compiler threads.
    pub worker_threads: usize,
    /// Compile background requests on the calling thread when the pending
    /// queue grows past `hybrid_foreground_queue_threshold`.
    pub hybrid_foreground: bool,
    pub hybrid_foreground_queue_threshold: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            hybrid_foreground: false,
            hybrid_foreground_queue_threshold: 32,
        }
    }
}

/// Speculative admission thresholds, in bytecodes requested this epoch,
/// plus the hard limits past which a function is never compiled.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub speculation_cap: u64,
    pub profile_based_speculation_cap: u64,
    pub max_function_bytecode_count: u32,
    pub max_function_bytecode_length: u32,
    pub max_context_native_code_bytes: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            speculation_cap: 1,
            profile_based_speculation_cap: 1600,
            max_function_bytecode_count: 120_000,
            max_function_bytecode_length: 4_800_000,
            max_context_native_code_bytes: 7 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub max_connect_attempts: u32,
    pub process_poll_interval_ms: u64,
    pub max_frame_size: u32,
    /// How often the compile server looks for clients that exited without
    /// closing their contexts.
    pub client_reap_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay_ms: 10,
            max_retry_delay_ms: 200,
            max_connect_attempts: 10,
            process_poll_interval_ms: 5,
            max_frame_size: 64 * 1024 * 1024,
            client_reap_interval_ms: 1000,
        }
    }
}

impl TransportConfig {
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn process_poll_interval(&self) -> Duration {
        Duration::from_millis(self.process_poll_interval_ms)
    }

    pub fn client_reap_interval(&self) -> Duration {
        Duration::from_millis(self.client_reap_interval_ms.max(1))
    }

    /// Linear backoff before retry number `attempt` (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_retry_delay()
            .saturating_mul(attempt)
            .min(self.max_retry_delay())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub max_arena_bytes: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            max_arena_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            port: 3910,
        }
    }
}

impl JitConfig {
    /// Reads the file named by [`CONFIG_PATH_ENV`] when set, otherwise builds
    /// the config from `OOPJIT_<SECTION>_<FIELD>` variables and defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path),
            Err(_) => Self::from_env(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            err,
        })?;
        debug!(path = %path.display(), "Loading JIT config");
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            scheduler: section_from_env(SCHEDULER_PREFIX, "SchedulerConfig")?,
            admission: section_from_env(ADMISSION_PREFIX, "AdmissionConfig")?,
            transport: section_from_env(TRANSPORT_PREFIX, "TransportConfig")?,
            arena: section_from_env(ARENA_PREFIX, "ArenaConfig")?,
            server: section_from_env(SERVER_PREFIX, "ServerConfig")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.worker_threads == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.worker_threads must be at least 1".to_string(),
            ));
        }
        if self.transport.max_connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "transport.max_connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.transport.initial_retry_delay_ms > self.transport.max_retry_delay_ms {
            return Err(ConfigError::Invalid(
                "transport.initial_retry_delay_ms exceeds transport.max_retry_delay_ms"
                    .to_string(),
            ));
        }
        if self.transport.max_frame_size == 0 || self.arena.max_arena_bytes == 0 {
            return Err(ConfigError::Invalid(
                "frame and arena sizes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn section_from_env<T: serde::de::DeserializeOwned>(
    prefix: &str,
    name: &str,
) -> Result<T, ConfigError> {
    envy::prefixed(prefix)
        .from_env::<T>()
        .map_err(|err| ConfigError::Env {
            err,
            from: name.to_string(),
        })
}
