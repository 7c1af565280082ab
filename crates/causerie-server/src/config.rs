use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use thiserror::Error;

use causerie_shared::constants::DEFAULT_LISTEN_PORT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("STORE_DSN is required (SQLite path, or \":memory:\")")]
    MissingStoreDsn,

    #[error("IDENTITY_VERIFIER_SECRET is required (64 hex chars, Ed25519 verifying key)")]
    MissingIdentitySecret,

    #[error("IDENTITY_VERIFIER_SECRET is invalid: {0}")]
    BadIdentitySecret(String),
}

/// Which day window the per-rule `max_messages_per_day` limit counts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleWindow {
    /// The last 24 hours, ending now.
    Rolling24h,
    /// The current calendar day in UTC.
    UtcDay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsOrigins {
    Any,
    List(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_host: IpAddr,
    pub listen_port: u16,
    pub store_dsn: PathBuf,
    /// WebSocket URLs of the other instances in the cluster. Empty means
    /// single-node mode: no cross-node fanout, presence limited to this
    /// process.
    pub bus_peers: Vec<String>,
    /// Ed25519 verifying key of the identity provider.
    pub identity_verifier_key: [u8; 32],
    pub cors_origins: CorsOrigins,
    pub rate_limit_max: usize,
    pub rate_limit_window_ms: u64,
    pub rule_window: RuleWindow,
    pub request_timeout_secs: u64,
    /// Stable-per-process id used on mesh links.
    pub node_id: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let store_dsn = std::env::var("STORE_DSN")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingStoreDsn)?;

        let secret_hex =
            std::env::var("IDENTITY_VERIFIER_SECRET").map_err(|_| ConfigError::MissingIdentitySecret)?;
        let identity_verifier_key = parse_hex_key(&secret_hex).map_err(ConfigError::BadIdentitySecret)?;

        let mut config = Self {
            listen_host: [0, 0, 0, 0].into(),
            listen_port: DEFAULT_LISTEN_PORT,
            store_dsn,
            bus_peers: Vec::new(),
            identity_verifier_key,
            cors_origins: CorsOrigins::Any,
            rate_limit_max: 100,
            rate_limit_window_ms: 60_000,
            rule_window: RuleWindow::Rolling24h,
            request_timeout_secs: 10,
            node_id: uuid::Uuid::new_v4().to_string(),
        };

        if let Ok(host) = std::env::var("LISTEN_HOST") {
            match host.parse::<IpAddr>() {
                Ok(parsed) => config.listen_host = parsed,
                Err(_) => tracing::warn!(value = %host, "Invalid LISTEN_HOST, using default"),
            }
        }

        if let Ok(port) = std::env::var("LISTEN_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) => config.listen_port = parsed,
                Err(_) => tracing::warn!(value = %port, "Invalid LISTEN_PORT, using default"),
            }
        }

        if let Ok(peers) = std::env::var("BUS_PEERS") {
            config.bus_peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(origins) = std::env::var("CORS_ORIGINS") {
            config.cors_origins = parse_cors_origins(&origins);
        }

        if let Ok(val) = std::env::var("RATE_LIMIT_MAX") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.rate_limit_max = n,
                _ => tracing::warn!(value = %val, "Invalid RATE_LIMIT_MAX, using default"),
            }
        }

        if let Ok(val) = std::env::var("RATE_LIMIT_WINDOW_MS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.rate_limit_window_ms = n,
                _ => tracing::warn!(value = %val, "Invalid RATE_LIMIT_WINDOW_MS, using default"),
            }
        }

        if let Ok(val) = std::env::var("RULE_WINDOW") {
            match val.as_str() {
                "rolling" => config.rule_window = RuleWindow::Rolling24h,
                "utc-day" => config.rule_window = RuleWindow::UtcDay,
                _ => tracing::warn!(value = %val, "Invalid RULE_WINDOW, using default"),
            }
        }

        if let Ok(val) = std::env::var("REQUEST_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.request_timeout_secs = n,
                _ => tracing::warn!(value = %val, "Invalid REQUEST_TIMEOUT_SECS, using default"),
            }
        }

        if let Ok(id) = std::env::var("NODE_ID") {
            if !id.is_empty() {
                config.node_id = id;
            }
        }

        Ok(config)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_host, self.listen_port)
    }
}

fn parse_cors_origins(value: &str) -> CorsOrigins {
    let value = value.trim();
    if value == "*" || value.is_empty() {
        return CorsOrigins::Any;
    }
    CorsOrigins::List(
        value
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

fn parse_hex_key(hex_str: &str) -> Result<[u8; 32], String> {
    let hex_str = hex_str.trim();
    if hex_str.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex_str.len()));
    }
    let bytes = hex::decode(hex_str).map_err(|e| e.to_string())?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_key() {
        let hex = "ab".repeat(32);
        let key = parse_hex_key(&hex).unwrap();
        assert_eq!(key, [0xab; 32]);
    }

    #[test]
    fn test_parse_hex_key_wrong_length() {
        assert!(parse_hex_key("abcd").is_err());
    }

    #[test]
    fn test_parse_hex_key_bad_chars() {
        assert!(parse_hex_key(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_cors_origins() {
        assert_eq!(parse_cors_origins("*"), CorsOrigins::Any);
        assert_eq!(
            parse_cors_origins("https://a.example, https://b.example"),
            CorsOrigins::List(vec![
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ])
        );
    }
}
