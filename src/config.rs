use anyhow::{anyhow, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct AppConfig {
    pub(crate) database: DatabaseConfig,
    pub(crate) api: ApiConfig,
    pub(crate) feed: FeedConfig,
    pub(crate) betting: BettingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct DatabaseConfig {
    pub(crate) url: String,
    pub(crate) min_pool_size: u32,
    pub(crate) max_pool_size: u32,
    pub(crate) max_lifetime_seconds: u64,
    pub(crate) acquire_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct ApiConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct FeedConfig {
    pub(crate) base_url: String,
    pub(crate) request_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct BettingConfig {
    pub(crate) auto_finalize_seconds: u64,
}

pub(crate) fn load_config() -> Result<AppConfig> {
    let cfg = AppConfig {
        database: DatabaseConfig {
            url: env_required("DATABASE_URL")?,
            min_pool_size: env_u32("DB_MIN_POOL_SIZE", 5),
            max_pool_size: env_u32("DB_MAX_POOL_SIZE", 40),
            max_lifetime_seconds: env_u64("DB_MAX_LIFETIME_SECONDS", 1800),
            acquire_timeout_seconds: env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30),
        },
        api: ApiConfig {
            host: env_string("API_HOST", "0.0.0.0"),
            port: env_u16("API_PORT", 8000),
            cors_origins: env_list("CORS_ORIGINS", &["*"]),
        },
        feed: FeedConfig {
            base_url: env_required("MATCH_FEED_BASE_URL")?,
            request_timeout_seconds: env_u64("MATCH_FEED_TIMEOUT_SECONDS", 10),
        },
        betting: BettingConfig {
            auto_finalize_seconds: env_u64("AUTO_FINALIZE_SECONDS", 90),
        },
    };
    if cfg.betting.auto_finalize_seconds == 0 {
        return Err(anyhow!("AUTO_FINALIZE_SECONDS must be > 0"));
    }
    Ok(cfg)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {key}"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => parse_list_value(&v)
            .unwrap_or_else(|| default.iter().map(|s| (*s).to_string()).collect()),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

fn parse_list_value(raw: &str) -> Option<Vec<String>> {
    if let Ok(v) = serde_json::from_str::<Vec<String>>(raw) {
        return Some(v.into_iter().filter(|s| !s.trim().is_empty()).collect());
    }
    let parts: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}
