use chrono_tz::Tz;
use std::env;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// bcrypt accepts work factors in this range.
pub const MIN_BCRYPT_COST: u32 = 4;
pub const MAX_BCRYPT_COST: u32 = 31;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct LogSettings {
    /// `EnvFilter` directives
    pub filter: String,
    pub format: LogFormat,
    /// When set, a daily-rolling JSON log file is written here as well
    pub dir: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub page_size: usize,
    /// Base for absolute pagination links; the request's Host is used otherwise
    pub public_url: Option<String>,
    pub bcrypt_cost: u32,
    /// Zone for timestamps submitted without a UTC offset
    pub time_zone: Tz,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8000),
            data_dir: PathBuf::from("carbon_data"),
            page_size: 10,
            public_url: None,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            time_zone: Tz::UTC,
            log: LogSettings {
                filter: "carbon_usage=info,tower_http=info".to_string(),
                format: LogFormat::Text,
                dir: None,
            },
        }
    }
}

impl Settings {
    /// Read settings from `CARBON_*` variables (plus `RUST_LOG`), falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Settings::default();

        let host: IpAddr = parse_var("CARBON_HOST", defaults.bind_addr.ip())?;
        let port: u16 = parse_var("CARBON_PORT", defaults.bind_addr.port())?;

        let page_size: usize = parse_var("CARBON_PAGE_SIZE", defaults.page_size)?;
        if page_size == 0 {
            return Err(invalid("CARBON_PAGE_SIZE", "0", "page size must be at least 1"));
        }

        let bcrypt_cost: u32 = parse_var("CARBON_BCRYPT_COST", defaults.bcrypt_cost)?;
        if !(MIN_BCRYPT_COST..=MAX_BCRYPT_COST).contains(&bcrypt_cost) {
            return Err(invalid(
                "CARBON_BCRYPT_COST",
                bcrypt_cost,
                format!("cost must be between {} and {}", MIN_BCRYPT_COST, MAX_BCRYPT_COST),
            ));
        }

        let time_zone: Tz = parse_var("CARBON_TIME_ZONE", defaults.time_zone)?;

        let public_url = match non_empty_var("CARBON_PUBLIC_URL") {
            Some(raw) => {
                Url::parse(&raw).map_err(|err| invalid("CARBON_PUBLIC_URL", &raw, err))?;
                Some(raw.trim_end_matches('/').to_string())
            }
            None => None,
        };

        let format = match non_empty_var("CARBON_LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(invalid("CARBON_LOG_FORMAT", other, "expected `text` or `json`"))
            }
        };

        Ok(Self {
            bind_addr: SocketAddr::new(host, port),
            data_dir: non_empty_var("CARBON_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            page_size,
            public_url,
            bcrypt_cost,
            time_zone,
            log: LogSettings {
                filter: non_empty_var("RUST_LOG").unwrap_or(defaults.log.filter),
                format,
                dir: non_empty_var("CARBON_LOG_DIR").map(PathBuf::from),
            },
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match non_empty_var(key) {
        Some(raw) => raw.trim().parse().map_err(|err| invalid(key, &raw, err)),
        None => Ok(default),
    }
}

fn invalid(key: &'static str, value: impl Display, reason: impl Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
