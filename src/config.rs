//! Process configuration: endpoint from the environment (and `.env`),
//! optional JSON service settings from `HVCTL_CONFIG`.

use hvctl_esxi::error::{EsxiError, EsxiErrorKind};
use hvctl_esxi::types::Endpoint;
use hvctl_esxi::ServiceConfig;
use secrecy::SecretString;
use std::path::PathBuf;
use thiserror::Error;

pub const ENV_HOST: &str = "ESXI_HOST";
pub const ENV_PORT: &str = "ESXI_PORT";
pub const ENV_USER: &str = "ESXI_USER";
pub const ENV_PASSWORD: &str = "ESXI_PASSWORD";
pub const ENV_INSECURE: &str = "ESXI_INSECURE";
pub const ENV_CONFIG: &str = "HVCTL_CONFIG";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Missing configuration: {name} is not set")]
    MissingConfig { name: &'static str },

    #[error("Missing credential: {name} is not set")]
    MissingCredential { name: &'static str },

    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Cannot read {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot parse {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Esxi(#[from] EsxiError),
}

impl AppError {
    /// Process exit code: 2 for configuration problems, 3 for rejected
    /// credentials, 4 when the host cannot be reached, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingConfig { .. }
            | Self::MissingCredential { .. }
            | Self::InvalidValue { .. }
            | Self::ConfigRead { .. }
            | Self::ConfigParse { .. } => 2,
            Self::Esxi(e) if e.kind == EsxiErrorKind::AuthError => 3,
            Self::Esxi(e) if e.is_connection_failure() => 4,
            Self::Esxi(_) => 1,
        }
    }
}

#[derive(Debug)]
pub struct AppConfig {
    pub endpoint: Endpoint,
    pub service: ServiceConfig,
}

impl AppConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, AppError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                log::warn!("Ignoring unreadable .env file: {}", e);
            }
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let host = var(ENV_HOST).ok_or(AppError::MissingConfig { name: ENV_HOST })?;
        let password = var(ENV_PASSWORD).ok_or(AppError::MissingCredential { name: ENV_PASSWORD })?;
        let user = var(ENV_USER).unwrap_or_else(|| "root".to_string());

        let port = match var(ENV_PORT) {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| AppError::InvalidValue { name: ENV_PORT, value: raw })?,
            None => 443,
        };
        let insecure = match var(ENV_INSECURE) {
            Some(raw) => parse_flag(&raw).ok_or(AppError::InvalidValue { name: ENV_INSECURE, value: raw })?,
            // Bare ESXi ships a self-signed certificate.
            None => true,
        };

        let service = match var(ENV_CONFIG) {
            Some(path) => load_service_config(PathBuf::from(path))?,
            None => ServiceConfig::default(),
        };

        Ok(Self {
            endpoint: Endpoint::new(host.trim(), user, SecretString::new(password))
                .with_port(port)
                .with_insecure(insecure),
            service,
        })
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn load_service_config(path: PathBuf) -> Result<ServiceConfig, AppError> {
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(source) => return Err(AppError::ConfigRead { path, source }),
    };
    serde_json::from_str(&raw).map_err(|source| AppError::ConfigParse { path, source })
}
