use pam_core::models::UserLocation;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use url::Url;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub ws_url: Url,
    pub user_id: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub refresh_url: Option<Url>,
    pub token_ttl: Option<Duration>,
    pub fallback_url: Option<Url>,
    pub tts_url: Option<Url>,
    pub tts_voice: String,
    pub store_dir: PathBuf,
    pub user_location: Option<UserLocation>,
    pub log_level: Level,
}

fn parse_url(var: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::InvalidValue(var.to_string(), e.to_string()))
}

fn optional_url(var: &str) -> Result<Option<Url>, ConfigError> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| parse_url(var, &v))
        .transpose()
}

/// Parses `lat,lng` into a location.
fn parse_location(value: &str) -> Result<UserLocation, ConfigError> {
    let invalid = || {
        ConfigError::InvalidValue(
            "PAM_LOCATION".to_string(),
            format!("'{}' is not a 'lat,lng' pair", value),
        )
    };
    let (lat, lng) = value.split_once(',').ok_or_else(invalid)?;
    let latitude: f64 = lat.trim().parse().map_err(|_| invalid())?;
    let longitude: f64 = lng.trim().parse().map_err(|_| invalid())?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(invalid());
    }
    Ok(UserLocation {
        latitude,
        longitude,
    })
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let ws_url_str = std::env::var("PAM_WS_URL")
            .map_err(|_| ConfigError::MissingVar("PAM_WS_URL".to_string()))?;
        let ws_url = parse_url("PAM_WS_URL", &ws_url_str)?;
        if !matches!(ws_url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidValue(
                "PAM_WS_URL".to_string(),
                format!("scheme '{}' is not ws or wss", ws_url.scheme()),
            ));
        }

        let user_id = std::env::var("PAM_USER_ID").ok().filter(|v| !v.is_empty());
        let access_token = std::env::var("PAM_ACCESS_TOKEN")
            .ok()
            .filter(|v| !v.is_empty());
        let refresh_token = std::env::var("PAM_REFRESH_TOKEN")
            .ok()
            .filter(|v| !v.is_empty());
        let refresh_url = optional_url("PAM_REFRESH_URL")?;

        if refresh_url.is_some() && refresh_token.is_none() {
            return Err(ConfigError::MissingVar(
                "PAM_REFRESH_TOKEN must be set when PAM_REFRESH_URL is".to_string(),
            ));
        }

        let token_ttl = match std::env::var("PAM_TOKEN_TTL_SECS") {
            Ok(value) => Some(Duration::from_secs(value.parse::<u64>().map_err(|_| {
                ConfigError::InvalidValue(
                    "PAM_TOKEN_TTL_SECS".to_string(),
                    format!("'{}' is not a number of seconds", value),
                )
            })?)),
            Err(_) => None,
        };

        let fallback_url = optional_url("PAM_FALLBACK_URL")?;
        let tts_url = optional_url("PAM_TTS_URL")?;
        let tts_voice = std::env::var("PAM_TTS_VOICE").unwrap_or_else(|_| "default".to_string());

        let store_dir = std::env::var("PAM_STORE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.pam"));

        let user_location = std::env::var("PAM_LOCATION")
            .ok()
            .map(|v| parse_location(&v))
            .transpose()?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            ws_url,
            user_id,
            access_token,
            refresh_token,
            refresh_url,
            token_ttl,
            fallback_url,
            tts_url,
            tts_voice,
            store_dir,
            user_location,
            log_level,
        })
    }
}
