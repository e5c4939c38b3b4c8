use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub db_url: String,
    pub store_write_timeout_ms: u64,
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub rate_limit_window_secs: u64,
    pub rate_limit_positions_per_window: u32,
    pub rate_limit_commands_per_window: u32,
    pub cors_allow_any_origin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("FLEETLOCK_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("FLEETLOCK_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "FLEETLOCK_BIND_ADDR",
        )?;

        // Tenant identity arrives as a proxy-injected header, so exposing
        // the gateway directly is only safe when that proxy is in front.
        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("FLEETLOCK_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);
        if !bind_addr.ip().is_loopback() && !dev_allow_nonlocal_bind {
            return Err(StartupError {
                code: "ERR_NONLOCAL_BIND",
                message: "non-local bind requires FLEETLOCK_DEV_ALLOW_NONLOCAL_BIND; refuse startup"
                    .to_string(),
            });
        }

        let db_url = require_nonempty(kv, "FLEETLOCK_DB_URL")?;

        let store_write_timeout_ms = parse_u64(
            kv.get("FLEETLOCK_STORE_WRITE_TIMEOUT_MS"),
            2000,
            "FLEETLOCK_STORE_WRITE_TIMEOUT_MS",
        )?;

        let default_page_size = parse_u32(
            kv.get("FLEETLOCK_DEFAULT_PAGE_SIZE"),
            50,
            "FLEETLOCK_DEFAULT_PAGE_SIZE",
        )?;
        let max_page_size = parse_u32(
            kv.get("FLEETLOCK_MAX_PAGE_SIZE"),
            500,
            "FLEETLOCK_MAX_PAGE_SIZE",
        )?;
        if default_page_size == 0 || max_page_size == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "page sizes must be positive".to_string(),
            });
        }
        if default_page_size > max_page_size {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "FLEETLOCK_DEFAULT_PAGE_SIZE must be <= FLEETLOCK_MAX_PAGE_SIZE"
                    .to_string(),
            });
        }

        let rate_limit_window_secs = parse_u64(
            kv.get("FLEETLOCK_RATE_LIMIT_WINDOW_SECS"),
            60,
            "FLEETLOCK_RATE_LIMIT_WINDOW_SECS",
        )?;
        if rate_limit_window_secs == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "FLEETLOCK_RATE_LIMIT_WINDOW_SECS must be positive".to_string(),
            });
        }
        let rate_limit_positions_per_window = parse_u32(
            kv.get("FLEETLOCK_RATE_LIMIT_POSITIONS_PER_WINDOW"),
            0,
            "FLEETLOCK_RATE_LIMIT_POSITIONS_PER_WINDOW",
        )?;
        let rate_limit_commands_per_window = parse_u32(
            kv.get("FLEETLOCK_RATE_LIMIT_COMMANDS_PER_WINDOW"),
            0,
            "FLEETLOCK_RATE_LIMIT_COMMANDS_PER_WINDOW",
        )?;

        let cors_allow_any_origin =
            parse_bool(kv.get("FLEETLOCK_CORS_ALLOW_ANY_ORIGIN")).unwrap_or(false);

        Ok(GatewayConfig {
            bind_addr,
            db_url,
            store_write_timeout_ms,
            default_page_size,
            max_page_size,
            rate_limit_window_secs,
            rate_limit_positions_per_window,
            rate_limit_commands_per_window,
            cors_allow_any_origin,
        })
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|err| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: format!("failed to read FLEETLOCK_CONFIG_PATH {}: {}", path, err),
    })?;

    let mut kv = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: format!("malformed line in config file: {}", line),
            });
        };
        kv.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(kv)
}

fn require_nonempty(kv: &HashMap<String, String>, key: &'static str) -> Result<String, StartupError> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} is required", key),
        })
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value.map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be host:port", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value.map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an unsigned integer", key),
        }),
    }
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value.map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an unsigned integer", key),
        }),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}
