use crate::domain::{
    config::BridgeConfig,
    error::{BridgeError, BridgeResult},
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment keys for the serial device, most specific first.
pub const SERIAL_PORT_VARS: [&str; 2] = ["SERIAL_PORT", "S2TCP_SERIAL_PORT"];
/// Environment keys for the listening port, most specific first.
pub const TCP_PORT_VARS: [&str; 2] = ["TCP_PORT", "S2TCP_TCP_PORT"];

/// Configuration manager
///
/// Layers, lowest precedence first: built-in defaults, the config file,
/// environment variables. Command line overrides are applied by the caller.
pub struct ConfigManager {
    global_config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Create new configuration manager
    pub fn new() -> Self {
        Self {
            global_config_path: Self::get_global_config_path(),
        }
    }

    /// Manager that only reads the given file, if any.
    pub fn with_path(path: Option<PathBuf>) -> Self {
        Self {
            global_config_path: path,
        }
    }

    /// Load defaults plus the config file, if one exists.
    pub fn load_config(&self) -> BridgeResult<BridgeConfig> {
        match &self.global_config_path {
            Some(path) if path.exists() => self.load_config_from_path(path),
            _ => Ok(BridgeConfig::default()),
        }
    }

    /// Load the file, then overlay the process environment.
    ///
    /// The result is not validated; callers apply their own overrides first.
    pub fn load_effective(&self, explicit: Option<&Path>) -> BridgeResult<BridgeConfig> {
        let mut config = match explicit {
            Some(path) => self.load_config_from_path(path)?,
            None => self.load_config()?,
        };

        apply_env(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn get_global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config").join("serial-bridge").join("config.toml"))
    }

    /// Load configuration from specific path
    pub fn load_config_from_path(&self, path: &Path) -> BridgeResult<BridgeConfig> {
        let content = fs::read_to_string(path).map_err(|e| BridgeError::Config {
            message: format!("Failed to read config file {}: {}", path.display(), e),
        })?;

        debug!(path = %path.display(), "Loaded configuration file");
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to specific path
    pub fn save_config_to_path(&self, path: &Path, config: &BridgeConfig) -> BridgeResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| BridgeError::Config {
            message: format!("Failed to serialize config: {}", e),
        })?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| BridgeError::Config {
                    message: format!("Failed to create config directory: {}", e),
                })?;
            }
        }

        fs::write(path, content).map_err(|e| BridgeError::Config {
            message: format!("Failed to write config file {}: {}", path.display(), e),
        })
    }

    /// Get the global config path
    pub fn get_global_config_path_ref(&self) -> Option<&PathBuf> {
        self.global_config_path.as_ref()
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Overlay environment settings read through `lookup`.
///
/// A port value that is not a number in 1..=65535 is a configuration error.
pub fn apply_env<F>(config: &mut BridgeConfig, lookup: F) -> BridgeResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    let first = |keys: &[&'static str]| {
        keys.iter()
            .find_map(|key| lookup(*key).filter(|v| !v.trim().is_empty()).map(|v| (*key, v)))
    };

    if let Some((_, port)) = first(&SERIAL_PORT_VARS) {
        config.serial.port = port.trim().to_string();
    }

    if let Some((key, value)) = first(&TCP_PORT_VARS) {
        config.tcp.port = parse_port(key, &value)?;
    }

    Ok(())
}

fn parse_port(key: &str, value: &str) -> BridgeResult<u16> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(BridgeError::Config {
            message: format!("{} must be a port number between 1 and 65535, got '{}'", key, value),
        }),
    }
}
