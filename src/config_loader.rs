// Configuration loader for the subtitle API
//
// Loads subtitle_api.conf (flat TOML) into the environment. Variables already set in
// the environment win over the file; anything absent from both falls back to the
// defaults in config.rs.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use toml::Value;

const CONFIG_FILE_PATH: &str = "subtitle_api.conf";
const ENV_CONFIG_FILE: &str = "SUBTITLE_API_CONFIG";

/// Flatten a TOML document into key/value strings. Arrays and tables are skipped.
pub fn parse_config(content: &str) -> Result<HashMap<String, String>, toml::de::Error> {
    let table: toml::Table = content.parse()?;
    let mut config_map = HashMap::new();
    for (key, value) in table {
        let value = match value {
            Value::String(s) => s,
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Boolean(b) => b.to_string(),
            _ => {
                warn!("Skipping unsupported TOML value type for key: {}", key);
                continue;
            }
        };
        config_map.insert(key, value);
    }
    Ok(config_map)
}

/// Loads the configuration file named by SUBTITLE_API_CONFIG, or subtitle_api.conf
///
/// Returns true if a config file was found and applied
pub fn load_config() -> bool {
    let path = env::var(ENV_CONFIG_FILE).unwrap_or_else(|_| CONFIG_FILE_PATH.to_string());
    load_config_from(Path::new(&path))
}

pub fn load_config_from(config_path: &Path) -> bool {
    if !config_path.exists() {
        debug!("Configuration file not found at: {}", config_path.display());
        return false;
    }

    let config_content = match fs::read_to_string(config_path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read configuration file: {}", e);
            return false;
        }
    };

    let config_map = match parse_config(&config_content) {
        Ok(map) => map,
        Err(e) => {
            warn!("Failed to parse configuration file: {}", e);
            return false;
        }
    };

    for (key, value) in config_map {
        if env::var(&key).is_err() {
            debug!("Setting env var from config file: {} = {}", key, value);
            env::set_var(key, value);
        } else {
            debug!("Env var already exists, skipping: {}", key);
        }
    }

    info!("Configuration loaded from {}", config_path.display());
    true
}
