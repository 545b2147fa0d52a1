use std::net::SocketAddr;

const DEV_JWT_SECRET: &str = "dev-insecure-change-me";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind: SocketAddr,
    pub jwt_secret: Vec<u8>,
    pub allowed_origins: Vec<String>,
    pub read_only: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let bind = match get("MEDSCREEN_BIND") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "MEDSCREEN_BIND",
                value: raw,
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let jwt_secret = match get("MEDSCREEN_JWT_SECRET") {
            Some(v) => v.into_bytes(),
            None => {
                tracing::warn!("MEDSCREEN_JWT_SECRET not set; using the development secret");
                DEV_JWT_SECRET.as_bytes().to_vec()
            }
        };

        // Examples:
        // - MEDSCREEN_ALLOWED_ORIGINS=http://localhost:5173
        // - MEDSCREEN_ALLOWED_ORIGINS=https://clinic.example.com,https://ward.example.com
        let allowed_origins = get("MEDSCREEN_ALLOWED_ORIGINS")
            .unwrap_or_else(|| "*".to_string())
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        let read_only = get("MEDSCREEN_READ_ONLY").is_some_and(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        });

        Ok(Self {
            database_url,
            bind,
            jwt_secret,
            allowed_origins,
            read_only,
        })
    }
}
