use std::env;
use std::time::Duration;

use crate::error::AppError;

/// Selects the in-process store instead of a remote one.
pub const MEMORY_STORE: &str = "memory";
/// Selects the fixed fleet directory instead of the HTTP one.
pub const STATIC_FLEET: &str = "static";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Http,
    Socket,
    Udp,
}

impl Mode {
    fn parse(raw: &str) -> Result<Self, AppError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Mode::Http),
            "socket" => Ok(Mode::Socket),
            "udp" => Ok(Mode::Udp),
            other => Err(AppError::Internal(format!("invalid MODES entry: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_addr: String,
    pub socket_addr: String,
    pub udp_addr: String,
    pub modes: Vec<Mode>,
    pub log_level: String,
    pub log_format: String,
    pub store_addr: String,
    pub store_password: Option<String>,
    pub store_max_idle: usize,
    pub store_idle_timeout: Duration,
    pub store_timeout: Duration,
    pub fleet_base_url: String,
    pub fleet_timeout: Duration,
    pub auth_server_addr: Option<String>,
    pub hook_endpoints: Vec<String>,
    pub search_tier1_meter: u32,
    pub search_tier2_meter: u32,
    pub search_tier3_meter: u32,
    pub detect_arriving_meter: u32,
    pub detect_arrived_meter: u32,
    pub push_interval: Duration,
    pub viewer_queue_size: usize,
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let modes = vars
            .list("MODES", "http,socket,udp")
            .iter()
            .map(|raw| Mode::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        if modes.is_empty() {
            return Err(AppError::Internal("MODES must name at least one listener".to_string()));
        }

        let viewer_queue_size = vars.parse_or_default("VIEWER_QUEUE_SIZE", 256)?;
        if viewer_queue_size == 0 {
            return Err(AppError::Internal("VIEWER_QUEUE_SIZE must be > 0".to_string()));
        }

        Ok(Self {
            http_addr: vars.string("HTTP_ADDR", "0.0.0.0:8000"),
            socket_addr: vars.string("SOCKET_ADDR", "0.0.0.0:8010"),
            udp_addr: vars.string("UDP_ADDR", "0.0.0.0:9000"),
            modes,
            log_level: vars.string("LOG_LEVEL", "info"),
            log_format: vars.string("LOG_FORMAT", "compact"),
            store_addr: vars.string("STORE_ADDR", "127.0.0.1:9851"),
            store_password: vars.optional("STORE_PASSWORD"),
            store_max_idle: vars.parse_or_default("STORE_MAX_IDLE", 3)?,
            store_idle_timeout: vars.seconds("STORE_IDLE_TIMEOUT_SECS", 240)?,
            store_timeout: vars.seconds("STORE_TIMEOUT_SECS", 10)?,
            fleet_base_url: vars.string("FLEET_BASE_URL", STATIC_FLEET),
            fleet_timeout: vars.seconds("FLEET_TIMEOUT_SECS", 10)?,
            auth_server_addr: vars.optional("AUTH_SERVER_ADDR"),
            hook_endpoints: vars.list("HOOK_ENDPOINTS", ""),
            search_tier1_meter: vars.parse_or_default("SEARCH_TIER1_METER", 5000)?,
            search_tier2_meter: vars.parse_or_default("SEARCH_TIER2_METER", 10000)?,
            search_tier3_meter: vars.parse_or_default("SEARCH_TIER3_METER", 0)?,
            detect_arriving_meter: vars.parse_or_default("DETECT_ARRIVING_METER", 500)?,
            detect_arrived_meter: vars.parse_or_default("DETECT_ARRIVED_METER", 50)?,
            push_interval: vars.seconds("PUSH_INTERVAL_SECS", 5)?,
            viewer_queue_size,
            cors_allowed_origins: vars.list("CORS_ALLOWED_ORIGINS", "*"),
        })
    }

    pub fn runs(&self, mode: Mode) -> bool {
        self.modes.contains(&mode)
    }

    pub fn uses_memory_store(&self) -> bool {
        self.store_addr.eq_ignore_ascii_case(MEMORY_STORE)
    }

    pub fn uses_static_fleet(&self) -> bool {
        self.fleet_base_url.eq_ignore_ascii_case(STATIC_FLEET)
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn list(&self, key: &str, default: &str) -> Vec<String> {
        self.string(key, default)
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn parse_or_default<T>(&self, key: &str, default: T) -> Result<T, AppError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw
                .parse::<T>()
                .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
            None => Ok(default),
        }
    }

    fn seconds(&self, key: &str, default: u64) -> Result<Duration, AppError> {
        self.parse_or_default(key, default).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{Config, Mode};

    fn config(pairs: &[(&str, &str)]) -> Result<Config, crate::error::AppError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_run_every_listener() {
        let config = config(&[]).unwrap();
        assert_eq!(config.modes, vec![Mode::Http, Mode::Socket, Mode::Udp]);
        assert_eq!(config.http_addr, "0.0.0.0:8000");
        assert_eq!(config.search_tier1_meter, 5000);
        assert_eq!(config.search_tier3_meter, 0);
        assert_eq!(config.push_interval, Duration::from_secs(5));
        assert_eq!(config.cors_allowed_origins, vec!["*".to_string()]);
        assert!(config.hook_endpoints.is_empty());
        assert!(config.uses_static_fleet());
        assert!(!config.uses_memory_store());
    }

    #[test]
    fn lists_are_trimmed_and_split() {
        let config = config(&[
            ("MODES", " udp , http "),
            ("HOOK_ENDPOINTS", "http://a/hooks, http://b/hooks,"),
            ("STORE_ADDR", "memory"),
        ])
        .unwrap();
        assert_eq!(config.modes, vec![Mode::Udp, Mode::Http]);
        assert!(config.runs(Mode::Udp));
        assert!(!config.runs(Mode::Socket));
        assert_eq!(
            config.hook_endpoints,
            vec!["http://a/hooks".to_string(), "http://b/hooks".to_string()]
        );
        assert!(config.uses_memory_store());
    }

    #[test]
    fn invalid_numbers_are_reported_by_key() {
        let err = config(&[("SEARCH_TIER2_METER", "far")]).unwrap_err();
        assert!(err.to_string().contains("SEARCH_TIER2_METER"));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(config(&[("MODES", "http,grpc")]).is_err());
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = config(&[("STORE_PASSWORD", "  "), ("STORE_MAX_IDLE", "")]).unwrap();
        assert_eq!(config.store_password, None);
        assert_eq!(config.store_max_idle, 3);
    }
}
