use serde::Deserialize;

/// Path of the optional on-disk configuration file.
const CONFIG_FILE: &str = "config/global.toml";

/// Daemon-wide configuration. Every field falls back to a built-in default
/// and can be overridden from `config/global.toml` or the environment
/// (`MCSM_SERVERS_DIR`, `MCSM_JAVA_PATH`, `MCSM_DEFAULT_MEMORY`).
#[derive(Deserialize, Debug, Clone)]
pub struct GlobalConfig {
    /// Directory scanned for server folders.
    #[serde(default = "default_servers_dir")]
    pub servers_dir: String,
    /// Java runtime used to launch server processes.
    #[serde(default = "default_java_path")]
    pub java_path: String,
    /// Heap size (`-Xmx`/`-Xms`) used when a server has no memory setting.
    #[serde(default = "default_memory")]
    pub default_memory: String,
    /// Maximum number of console lines retained per running server.
    #[serde(default = "default_console_buffer_size")]
    pub console_buffer_size: usize,
}

fn default_servers_dir() -> String {
    "./servers".to_string()
}

fn default_java_path() -> String {
    "java".to_string()
}

fn default_memory() -> String {
    "2G".to_string()
}

fn default_console_buffer_size() -> usize {
    1000
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            servers_dir: default_servers_dir(),
            java_path: default_java_path(),
            default_memory: default_memory(),
            console_buffer_size: default_console_buffer_size(),
        }
    }
}

impl GlobalConfig {
    /// Load configuration from `config/global.toml`, then apply environment
    /// overrides. A missing or invalid file falls back to the defaults.
    pub fn load() -> Self {
        let raw = std::fs::read_to_string(CONFIG_FILE).unwrap_or_default();
        let mut cfg = Self::from_toml(&raw);

        if let Ok(dir) = std::env::var("MCSM_SERVERS_DIR") {
            cfg.servers_dir = dir;
        }
        if let Ok(java) = std::env::var("MCSM_JAVA_PATH") {
            cfg.java_path = java;
        }
        if let Ok(memory) = std::env::var("MCSM_DEFAULT_MEMORY") {
            cfg.default_memory = memory;
        }

        cfg
    }

    /// Parse a TOML document, falling back to defaults on parse errors.
    pub fn from_toml(raw: &str) -> Self {
        match toml::from_str(raw) {
            Ok(cfg) => cfg,
            Err(e) => {
                if !raw.trim().is_empty() {
                    tracing::warn!("Invalid {}: {}, using defaults", CONFIG_FILE, e);
                }
                Self::default()
            }
        }
    }
}
