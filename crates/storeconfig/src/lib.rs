//! Object store configuration file parser
//!
//! Parses INI-style configuration files (`shmstore.conf`) shared by the
//! store server, the manager and clients, and maps them onto typed option
//! structs.
//!
//! ```text
//! [global]
//! store socket = /run/shmstore/store.sock
//!
//! [store]
//! store capacity = 4G
//!
//! [client]
//! manager socket = /run/shmstore/manager.sock
//! release delay = 64
//! ```
//!
//! Keys are matched with spaces and underscores treated alike, so
//! `store socket` and `store_socket` name the same option.
//!
//! # Example
//!
//! ```no_run
//! use storeconfig::{ClientOptions, StoreConfig};
//!
//! let config = StoreConfig::from_file("/etc/shmstore/shmstore.conf").unwrap();
//! let client = ClientOptions::from_store_config(&config, ClientOptions::SECTIONS);
//! println!("store socket: {}", client.store_socket);
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(String),

    #[error("Missing required option: {0}")]
    MissingOption(String),
}

/// Trait for types that can be parsed from configuration values
pub trait ConfigValue: Sized + Clone {
    /// Parse from a string value in the configuration file
    fn parse_config_value(s: &str) -> Result<Self, ConfigError>;

    /// Get the type name for error messages
    fn type_name() -> &'static str;
}

/// Size value in bytes (supports prefixes: K, M, G, T, KB, MB, GB, TB)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size(pub u64);

impl ConfigValue for Size {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        parse_size(s).map(Size)
    }

    fn type_name() -> &'static str {
        "size"
    }
}

/// Duration value (supports time units: s, ms, us, m, h, d)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duration(pub std::time::Duration);

impl ConfigValue for Duration {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        parse_duration(s).map(Duration)
    }

    fn type_name() -> &'static str {
        "duration"
    }
}

/// Count value (plain integer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count(pub u64);

impl ConfigValue for Count {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        s.trim()
            .parse()
            .map(Count)
            .map_err(|_| ConfigError::ParseError(format!("Invalid count: {}", s)))
    }

    fn type_name() -> &'static str {
        "count"
    }
}

impl ConfigValue for String {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        Ok(s.to_string())
    }

    fn type_name() -> &'static str {
        "string"
    }
}

/// A configuration option with name, type, and default value
pub struct ConfigOption<T: ConfigValue> {
    name: &'static str,
    default: T,
}

impl<T: ConfigValue> ConfigOption<T> {
    pub const fn new(name: &'static str, default: T) -> Self {
        Self {
            name,
            default,
        }
    }

    /// Get the value from config, falling back to the default
    ///
    /// A value that is present but does not parse also falls back to the
    /// default; use [`ConfigOption::try_get`] to surface the parse error.
    pub fn get(&self, config: &StoreConfig, sections: &[&str]) -> T {
        self.try_get(config, sections)
            .unwrap_or_else(|_| self.default.clone())
    }

    /// Get the value from config, reporting values that fail to parse
    pub fn try_get(&self, config: &StoreConfig, sections: &[&str]) -> Result<T, ConfigError> {
        match config.get_with_fallback(sections, self.name) {
            Some(raw) => T::parse_config_value(raw).map_err(|e| {
                ConfigError::ParseError(format!(
                    "option '{}' expects a {}: {}",
                    self.name,
                    T::type_name(),
                    e
                ))
            }),
            None => Ok(self.default.clone()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Split `"1.5 GB"` into its number and upper-cased unit
fn split_quantity(s: &str) -> Result<(f64, String), ConfigError> {
    let s = s.trim().replace('_', "");
    let (number, unit) = s.split_at(
        s.find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len()),
    );
    let number: f64 = number
        .parse()
        .map_err(|_| ConfigError::ParseError(format!("Invalid number: '{}'", number)))?;
    Ok((number, unit.trim().to_ascii_uppercase()))
}

/// Byte count with an optional binary prefix
fn parse_size(s: &str) -> Result<u64, ConfigError> {
    let (number, unit) = split_quantity(s)?;
    let shift = match unit.as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        _ => return Err(ConfigError::ParseError(format!("Unknown size unit: {}", unit))),
    };
    Ok((number * (1u64 << shift) as f64) as u64)
}

/// Seconds unless a unit says otherwise
fn parse_duration(s: &str) -> Result<std::time::Duration, ConfigError> {
    let (number, unit) = split_quantity(s)?;
    let scale = match unit.as_str() {
        "US" | "USEC" => 1e-6,
        "MS" | "MSEC" => 1e-3,
        "" | "S" | "SEC" | "SECS" | "SECONDS" => 1.0,
        "M" | "MIN" | "MINS" | "MINUTES" => 60.0,
        "H" | "HOUR" | "HOURS" => 3600.0,
        "D" | "DAY" | "DAYS" => 86400.0,
        _ => return Err(ConfigError::ParseError(format!("Unknown time unit: {}", unit))),
    };
    Ok(std::time::Duration::from_secs_f64(number * scale))
}

fn normalize_key(key: &str) -> String {
    key.trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// A parsed configuration file
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    sections: HashMap<String, HashMap<String, String>>,
}

impl StoreConfig {
    /// Parse a configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current_section = String::from("global");

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') {
                if !line.ends_with(']') || line.len() < 3 {
                    return Err(ConfigError::ParseError(format!(
                        "line {}: malformed section header '{}'",
                        lineno + 1,
                        line
                    )));
                }
                current_section = line[1..line.len() - 1].trim().to_string();
                sections.entry(current_section.clone()).or_default();
                continue;
            }

            match line.find('=') {
                Some(eq_pos) => {
                    let key = normalize_key(&line[..eq_pos]);
                    let value = line[eq_pos + 1..].trim().to_string();
                    sections
                        .entry(current_section.clone())
                        .or_default()
                        .insert(key, value);
                }
                None => {
                    return Err(ConfigError::ParseError(format!(
                        "line {}: expected 'key = value', got '{}'",
                        lineno + 1,
                        line
                    )))
                }
            }
        }

        Ok(Self { sections })
    }

    /// Get a configuration value from a specific section
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(&normalize_key(key)))
            .map(|v| v.as_str())
    }

    /// Get a configuration value, checking multiple sections in order
    pub fn get_with_fallback(&self, sections: &[&str], key: &str) -> Option<&str> {
        sections
            .iter()
            .find_map(|section| self.get(section, key))
    }

    /// Get a required value, checking sections in order
    pub fn require(&self, sections: &[&str], key: &str) -> Result<&str, ConfigError> {
        self.get_with_fallback(sections, key)
            .ok_or_else(|| ConfigError::MissingOption(key.to_string()))
    }

    pub fn sections(&self) -> Vec<&str> {
        self.sections.keys().map(|s| s.as_str()).collect()
    }
}

/// Define a configuration struct with typed options
///
/// # Example
///
/// ```
/// use storeconfig::{define_options, StoreConfig, Size, Count};
///
/// define_options! {
///     /// Cache configuration
///     pub struct CacheConfig {
///         /// Bytes to keep in memory
///         cache_size: Size = Size(64 * 1024 * 1024),
///         /// Number of shards
///         cache_shards: Count = Count(8),
///     }
/// }
///
/// let config = StoreConfig::parse("[cache]\ncache size = 16M\n").unwrap();
/// let cache = CacheConfig::from_store_config(&config, &["cache", "global"]);
/// assert_eq!(cache.cache_size.0, 16 * 1024 * 1024);
/// assert_eq!(cache.cache_shards.0, 8);
/// ```
#[macro_export]
macro_rules! define_options {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field:ident: $ty:ty = $default:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                pub $field: $ty,
            )*
        }

        impl $name {
            /// Create with default values
            pub fn new() -> Self {
                Self {
                    $(
                        $field: $default,
                    )*
                }
            }

            /// Load from a configuration file with section fallback;
            /// unparsable values fall back to their defaults
            pub fn from_store_config(
                config: &$crate::StoreConfig,
                sections: &[&str],
            ) -> Self {
                Self {
                    $(
                        $field: {
                            let opt = $crate::ConfigOption::new(stringify!($field), $default);
                            opt.get(config, sections)
                        },
                    )*
                }
            }

            /// Load from a configuration file, rejecting unparsable values
            pub fn try_from_store_config(
                config: &$crate::StoreConfig,
                sections: &[&str],
            ) -> Result<Self, $crate::ConfigError> {
                Ok(Self {
                    $(
                        $field: {
                            let opt = $crate::ConfigOption::new(stringify!($field), $default);
                            opt.try_get(config, sections)?
                        },
                    )*
                })
            }

            /// Get option names (for introspection)
            pub fn option_names() -> &'static [&'static str] {
                &[
                    $(stringify!($field),)*
                ]
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

/// Default path of the store socket
pub const DEFAULT_STORE_SOCKET: &str = "/tmp/shmstore/store.sock";

/// Default path of the manager socket
pub const DEFAULT_MANAGER_SOCKET: &str = "/tmp/shmstore/manager.sock";

define_options! {
    /// Store server options (`[store]`, then `[global]`)
    pub struct StoreOptions {
        /// Unix socket the store listens on
        store_socket: String = String::from(DEFAULT_STORE_SOCKET),

        /// Total bytes of data and metadata the store may hold
        store_capacity: Size = Size(1024 * 1024 * 1024),

        /// Events buffered per subscriber before it is considered stalled
        notification_queue: Count = Count(1024),
    }
}

impl StoreOptions {
    pub const SECTIONS: &'static [&'static str] = &["store", "global"];
}

define_options! {
    /// Manager options (`[manager]`, then `[global]`)
    pub struct ManagerOptions {
        /// Unix socket the manager listens on
        manager_socket: String = String::from(DEFAULT_MANAGER_SOCKET),

        /// Address this manager advertises to peers
        manager_address: String = String::from("127.0.0.1"),

        /// Port this manager advertises to peers
        manager_port: Count = Count(23894),

        /// Peer stores as comma-separated `address:port=socket` entries
        manager_peers: String = String::new(),
    }
}

impl ManagerOptions {
    pub const SECTIONS: &'static [&'static str] = &["manager", "global"];
}

define_options! {
    /// Client options (`[client]`, then `[global]`)
    pub struct ClientOptions {
        /// Unix socket of the store
        store_socket: String = String::from(DEFAULT_STORE_SOCKET),

        /// Unix socket of the manager; empty means no manager link
        manager_socket: String = String::new(),

        /// Released objects kept referenced before the release is sent
        release_delay: Count = Count(64),

        /// Upper bound on a non-blocking request round trip
        request_timeout: Duration = Duration(std::time::Duration::from_secs(30)),
    }
}

impl ClientOptions {
    pub const SECTIONS: &'static [&'static str] = &["client", "global"];
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = r#"
; Test configuration
[global]
store socket = /run/shmstore/store.sock
request_timeout = 5s

[store]
store capacity = 512M
notification queue = 16

[client]
manager socket = /run/shmstore/manager.sock
release delay = 0

[manager]
manager port = 12345
manager peers = 10.0.0.2:7000=/run/peer/store.sock
"#;

    #[test]
    fn test_parse_config() {
        let config = StoreConfig::parse(TEST_CONFIG).unwrap();

        assert_eq!(
            config.get("global", "store socket"),
            Some("/run/shmstore/store.sock")
        );
        assert_eq!(config.get("store", "store_capacity"), Some("512M"));
        assert_eq!(config.get("manager", "manager  port"), Some("12345"));
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(StoreConfig::parse("[store\n").is_err());
        assert!(StoreConfig::parse("[store]\njust a key\n").is_err());
    }

    #[test]
    fn test_get_with_fallback() {
        let config = StoreConfig::parse(TEST_CONFIG).unwrap();

        assert_eq!(
            config.get_with_fallback(&["client", "global"], "store socket"),
            Some("/run/shmstore/store.sock")
        );
        assert_eq!(
            config.get_with_fallback(&["client", "global"], "release delay"),
            Some("0")
        );
        assert_eq!(
            config.get_with_fallback(&["client", "global"], "nonexistent"),
            None
        );
        assert!(config.require(&["client"], "nonexistent").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("100").unwrap(), 100);
        assert_eq!(parse_size("100B").unwrap(), 100);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("100M").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_size("1GB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("100_M").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_size("1.5M").unwrap(), (1.5 * 1024.0 * 1024.0) as u64);
        assert!(parse_size("12Q").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            parse_duration("30").unwrap(),
            std::time::Duration::from_secs(30)
        );
        assert_eq!(
            parse_duration("5min").unwrap(),
            std::time::Duration::from_secs(300)
        );
        assert_eq!(
            parse_duration("500ms").unwrap(),
            std::time::Duration::from_millis(500)
        );
        assert!(parse_duration("5 fortnights").is_err());
    }

    #[test]
    fn test_config_option_try_get() {
        let config = StoreConfig::parse("[client]\nrelease delay = lots\n").unwrap();
        let opt = ConfigOption::new("release_delay", Count(64));
        assert!(opt.try_get(&config, &["client"]).is_err());
        assert_eq!(opt.get(&config, &["client"]).0, 64);
    }

    #[test]
    fn test_store_options() {
        let config = StoreConfig::parse(TEST_CONFIG).unwrap();
        let store = StoreOptions::from_store_config(&config, StoreOptions::SECTIONS);

        assert_eq!(store.store_socket, "/run/shmstore/store.sock");
        assert_eq!(store.store_capacity.0, 512 * 1024 * 1024);
        assert_eq!(store.notification_queue.0, 16);
    }

    #[test]
    fn test_client_options() {
        let config = StoreConfig::parse(TEST_CONFIG).unwrap();
        let client = ClientOptions::try_from_store_config(&config, ClientOptions::SECTIONS).unwrap();

        assert_eq!(client.manager_socket, "/run/shmstore/manager.sock");
        assert_eq!(client.release_delay.0, 0);
        assert_eq!(client.request_timeout.0, std::time::Duration::from_secs(5));

        let defaults = ClientOptions::default();
        assert_eq!(defaults.release_delay.0, 64);
        assert!(defaults.manager_socket.is_empty());
        assert_eq!(ClientOptions::option_names().len(), 4);
    }

    #[test]
    fn test_manager_options() {
        let config = StoreConfig::parse(TEST_CONFIG).unwrap();
        let manager = ManagerOptions::from_store_config(&config, ManagerOptions::SECTIONS);
        assert_eq!(manager.manager_port.0, 12345);
        assert_eq!(manager.manager_address, "127.0.0.1");
        // Only the first '=' separates key and value
        assert_eq!(manager.manager_peers, "10.0.0.2:7000=/run/peer/store.sock");
        assert!(ManagerOptions::default().manager_peers.is_empty());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shmstore.conf");
        std::fs::write(&path, TEST_CONFIG).unwrap();
        let config = StoreConfig::from_file(&path).unwrap();
        assert!(config.sections().contains(&"manager"));
        assert!(StoreConfig::from_file(dir.path().join("missing.conf")).is_err());
    }
}
