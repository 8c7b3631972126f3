//! Configuration loading.
//!
//! Options come from a TOML configuration file and from the command line,
//! with identical semantics; the command line wins. The file usually lives
//! at `$XDG_CONFIG_HOME/mediafirefs/config.toml` but `-c/--config` can point
//! anywhere.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

fn default_server() -> String {
    "www.mediafire.com".to_string()
}

fn default_app_id() -> u32 {
    42709
}

fn default_refresh_interval() -> u64 {
    1
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_app_id")]
    pub app_id: u32,
    pub api_key: Option<String>,
    /// Minimum number of seconds between two remote status checks triggered
    /// by filesystem traffic.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
    /// Overrides the default cache location under `$XDG_CACHE_HOME`.
    pub cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            server: default_server(),
            app_id: default_app_id(),
            api_key: None,
            refresh_interval_seconds: default_refresh_interval(),
            cache_dir: None,
        }
    }
}

impl Config {
    /// Load the configuration from `path`, falling back to the defaults if
    /// the file does not exist or cannot be parsed. A broken configuration
    /// file is not fatal: the command line may supply everything needed.
    pub fn load(path: &Path) -> Config {
        if !path.exists() {
            return Config::default();
        }

        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read configuration file, using defaults");
                return Config::default();
            }
        };

        match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot parse configuration file, using defaults");
                Config::default()
            }
        }
    }
}
