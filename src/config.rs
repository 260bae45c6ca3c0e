use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub bus: BusConfig,
    pub admin: AdminConfig,
    pub providers: ProvidersConfig,
    pub cache: CacheConfig,
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "memory" or "postgres"
    pub backend: String,
    pub uri: String,
    pub db_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// "memory" or "redis"
    pub backend: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Shared secret guarding the admin surface. Empty disables admin access.
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub openai: ProviderConfig,
    pub anthropic: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Deadline for unary upstream calls, in seconds. Streams get a total
    /// bound of ten times this value.
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            store: StoreConfig {
                backend: "memory".to_string(),
                uri: "postgres://localhost:5432".to_string(),
                db_name: "llm_gateway".to_string(),
            },
            bus: BusConfig {
                backend: "memory".to_string(),
                url: "redis://localhost:6379".to_string(),
            },
            admin: AdminConfig {
                api_key: String::new(),
            },
            providers: ProvidersConfig {
                openai: ProviderConfig {
                    api_key: None,
                    base_url: "https://api.openai.com".to_string(),
                },
                anthropic: ProviderConfig {
                    api_key: None,
                    base_url: "https://api.anthropic.com".to_string(),
                },
            },
            cache: CacheConfig {
                ttl_seconds: 3600,
                max_entries: 10_000,
            },
            upstream: UpstreamConfig { timeout_seconds: 60 },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder =
            ConfigBuilder::builder().add_source(config::Config::try_from(&Config::default())?);

        if Path::new("config.yaml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        builder = builder.add_source(
            Environment::with_prefix("GATEWAY")
                .prefix_separator("_")
                .separator("__"),
        );

        builder.build()?.try_deserialize()
    }
}
