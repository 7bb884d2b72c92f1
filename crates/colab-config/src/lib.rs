//! Configuration for the colab CLI: domains to talk to and where to keep
//! the history log.
//!
//! Settings are stored in a JSON file, default `~/.colab/config.json`,
//! overridable with `COLAB_CONFIG_PATH`. Individual fields can also be
//! overridden with environment variables, applied after the file load.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const DEFAULT_DOMAIN: &str = "colab.research.google.com";

/// The `Config` collaborator named in the runtime core's external interfaces:
/// supplies `colab_api_domain`, `colab_gapi_domain`, `history_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_domain")]
    pub colab_api_domain: String,
    #[serde(default = "default_domain")]
    pub colab_gapi_domain: String,
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_history_path() -> PathBuf {
    colab_home().join("history.jsonl")
}

fn colab_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".colab")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            colab_api_domain: default_domain(),
            colab_gapi_domain: default_domain(),
            history_path: default_history_path(),
        }
    }
}

/// Path to the config file, honoring `COLAB_CONFIG_PATH`.
fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("COLAB_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    colab_home().join("config.json")
}

impl Config {
    /// Load config from disk (if present), then apply environment overrides.
    ///
    /// Uses per-field fallback so a single invalid value doesn't wipe the
    /// rest of the file back to defaults.
    pub fn load() -> Config {
        let mut config = Self::load_from_file(&config_path());
        config.apply_env_overrides();
        config
    }

    fn load_from_file(path: &PathBuf) -> Config {
        if !path.exists() {
            return Config::default();
        }
        let contents = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("[colab-config] failed to read {}: {e}", path.display());
                return Config::default();
            }
        };

        if let Ok(config) = serde_json::from_str::<Config>(&contents) {
            return config;
        }

        let json: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[colab-config] {} is not valid JSON: {e}", path.display());
                return Config::default();
            }
        };
        let defaults = Config::default();
        Config {
            colab_api_domain: json
                .get("colab_api_domain")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or(defaults.colab_api_domain),
            colab_gapi_domain: json
                .get("colab_gapi_domain")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or(defaults.colab_gapi_domain),
            history_path: json
                .get("history_path")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or(defaults.history_path),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("COLAB_API_DOMAIN") {
            self.colab_api_domain = v;
        }
        if let Ok(v) = std::env::var("COLAB_GAPI_DOMAIN") {
            self.colab_gapi_domain = v;
        }
        if let Ok(v) = std::env::var("COLAB_HISTORY_PATH") {
            self.history_path = PathBuf::from(v);
        }
    }

    pub fn save(&self, path: Option<&PathBuf>) -> std::io::Result<()> {
        let path = path.cloned().unwrap_or_else(config_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, format!("{json}\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_file_missing() {
        let config = Config::load_from_file(&PathBuf::from("/nonexistent/path/config.json"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn per_field_fallback_preserves_valid_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"colab_api_domain": "custom.example.com", "colab_gapi_domain": 42}}"#
        )
        .unwrap();

        let config = Config::load_from_file(&path);
        assert_eq!(config.colab_api_domain, "custom.example.com");
        assert_eq!(config.colab_gapi_domain, default_domain());
    }

    #[test]
    fn full_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            colab_api_domain: "a.example.com".into(),
            colab_gapi_domain: "b.example.com".into(),
            history_path: PathBuf::from("/tmp/history.jsonl"),
        };
        config.save(Some(&path)).unwrap();
        let loaded = Config::load_from_file(&path);
        assert_eq!(loaded, config);
    }
}
