use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_cli() -> String {
    "ollama".to_string()
}

fn default_model() -> String {
    "deepseek-r1:1.5b".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_suffix() -> String {
    " 中文详细讲解".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub clipboard: ClipboardConfig,
    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OllamaConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Executable used for `list` and `run`.
    #[serde(default = "default_cli")]
    pub cli: String,
    /// Pulled on first start when no local model exists.
    #[serde(default = "default_model")]
    pub default_model: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClipboardConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Appended to every clipboard value copied into the input.
    #[serde(default = "default_suffix")]
    pub suffix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub always_on_top: bool,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        OllamaConfig {
            host: default_host(),
            cli: default_cli(),
            default_model: default_model(),
        }
    }
}

impl Default for ClipboardConfig {
    fn default() -> Self {
        ClipboardConfig {
            poll_interval_ms: default_poll_interval_ms(),
            suffix: default_suffix(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            width: 480,
            height: 520,
            always_on_top: true,
        }
    }
}

impl ClipboardConfig {
    pub fn poll_interval(&self) -> Duration {
        // A zero interval would spin the poller.
        Duration::from_millis(self.poll_interval_ms.max(50))
    }
}

impl OllamaConfig {
    /// `OLLAMA_HOST` wins over the file, matching the official client.
    pub fn resolved_host(&self) -> String {
        pick_host(std::env::var("OLLAMA_HOST").ok(), &self.host)
    }
}

fn pick_host(from_env: Option<String>, configured: &str) -> String {
    match from_env {
        Some(host) if !host.trim().is_empty() => normalize_host(&host),
        _ => normalize_host(configured),
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(&Self::get_config_path())
    }

    pub fn load_from(config_path: &Path) -> Self {
        if config_path.exists() {
            match fs::read_to_string(config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => tracing::warn!(
                        "Error parsing {}: {}. Using defaults.",
                        config_path.display(),
                        e
                    ),
                },
                Err(e) => tracing::warn!(
                    "Error reading {}: {}. Using defaults.",
                    config_path.display(),
                    e
                ),
            }
        } else if let Some(parent) = config_path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        Config::default()
    }

    pub fn get_config_path() -> PathBuf {
        Self::get_config_dir().join("config.toml")
    }

    pub fn get_config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/clipchat")
        } else {
            PathBuf::from(".")
        }
    }
}
