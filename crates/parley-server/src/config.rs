use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "secret",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PARLEY_JWT_SECRET is unset or still a placeholder; it must match the identity provider's signing secret")]
    InsecureSecret,

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub attachment_dir: PathBuf,
    pub public_url: String,
    pub presence_ttl: Duration,
    pub typing_ttl: Duration,
    pub sweep_interval: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let jwt_secret = lookup("PARLEY_JWT_SECRET").unwrap_or_default();
        if jwt_secret.trim().is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            return Err(ConfigError::InsecureSecret);
        }

        let host = lookup("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse(&lookup, "PARLEY_PORT", 3210)?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| ConfigError::Invalid {
                name: "PARLEY_HOST",
                value: host.clone(),
            })?;

        let public_url = lookup("PARLEY_PUBLIC_URL").unwrap_or_else(|| format!("http://localhost:{}", port));

        Ok(Self {
            addr,
            db_path: lookup("PARLEY_DB_PATH")
                .unwrap_or_else(|| "parley.db".into())
                .into(),
            jwt_secret,
            attachment_dir: lookup("PARLEY_ATTACHMENT_DIR")
                .unwrap_or_else(|| "./attachments".into())
                .into(),
            public_url,
            presence_ttl: Duration::from_secs(parse(&lookup, "PARLEY_PRESENCE_TTL_SECS", 60)?),
            typing_ttl: Duration::from_secs(parse(&lookup, "PARLEY_TYPING_TTL_SECS", 5)?),
            sweep_interval: Duration::from_secs(parse(&lookup, "PARLEY_SWEEP_INTERVAL_SECS", 10)?),
        })
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
