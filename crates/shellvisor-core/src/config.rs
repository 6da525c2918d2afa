//! Configuration resolution for shellvisor.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/shellvisor/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by each binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Target platform versions at or below this value run in compatibility mode.
pub const COMPAT_SDK_THRESHOLD: u32 = 28;

/// Complete shellvisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            client: ClientConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Daemon-side configuration: where jobs run and what they see.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Private storage directory, exported to jobs as `PREFIX`.
    pub base_dir: PathBuf,
    /// Native library directory, exported to jobs as `NATIVE_DIR`.
    pub native_lib_dir: PathBuf,
    /// Host application's target platform version. Drives `FDROID`.
    pub target_sdk_version: Option<u32>,
    /// Initialization script sourced before `alpine` commands, relative to
    /// `base_dir`.
    pub init_script: String,
    /// Shell used to run every command.
    pub shell: PathBuf,
    /// Socket the daemon listens on.
    pub socket_path: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let base_dir = default_base_dir();
        Self {
            native_lib_dir: base_dir.join("lib"),
            base_dir,
            target_sdk_version: None,
            init_script: "init-sandbox.sh".to_string(),
            shell: PathBuf::from("sh"),
            socket_path: None,
        }
    }
}

impl SupervisorConfig {
    /// Value exported as `FDROID`, if the target version is known.
    pub fn compat_mode(&self) -> Option<bool> {
        self.target_sdk_version
            .map(|version| version <= COMPAT_SDK_THRESHOLD)
    }

    /// Socket path, falling back to the per-user default.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(default_socket_path)
    }
}

/// Client-side configuration: how to reach the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Socket the client connects to.
    pub socket_path: Option<PathBuf>,
    /// Upper bound on a single bind attempt, in seconds.
    pub bind_timeout_secs: u64,
    /// Launch the daemon when nothing is listening on the socket.
    pub autostart: bool,
    /// Daemon binary used for autostart.
    pub daemon_bin: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            bind_timeout_secs: 5,
            autostart: false,
            daemon_bin: PathBuf::from("shellvisord"),
        }
    }
}

impl ClientConfig {
    /// Socket path, falling back to the per-user default.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(default_socket_path)
    }
}

/// Default private storage directory: `<data dir>/shellvisor`.
pub fn default_base_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("shellvisor")
}

/// Default socket path: `<runtime dir>/shellvisor.sock`, or the temp dir when
/// the platform has no runtime dir.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("shellvisor.sock")
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    // Load global config
    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    // Load explicitly requested config; a missing file here is an error
    if let Some(path) = explicit {
        let overlay = load_config_file(path)?;
        merge_config(&mut config, overlay);
    }

    // Apply environment overrides
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/shellvisor/settings.json"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("shellvisor").join("settings.json"))
    }
}

/// One config file as written. Absent keys stay `None` so a layer only
/// overrides what it actually sets.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigLayer {
    supervisor: SupervisorLayer,
    client: ClientLayer,
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SupervisorLayer {
    base_dir: Option<PathBuf>,
    native_lib_dir: Option<PathBuf>,
    target_sdk_version: Option<u32>,
    init_script: Option<String>,
    shell: Option<PathBuf>,
    socket_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClientLayer {
    socket_path: Option<PathBuf>,
    bind_timeout_secs: Option<u64>,
    autostart: Option<bool>,
    daemon_bin: Option<PathBuf>,
}

fn load_config_file(path: &Path) -> Result<ConfigLayer> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: ConfigLayer) {
    fn set<T>(slot: &mut T, value: Option<T>) {
        if let Some(value) = value {
            *slot = value;
        }
    }

    let sup = overlay.supervisor;
    set(&mut base.supervisor.base_dir, sup.base_dir);
    set(&mut base.supervisor.native_lib_dir, sup.native_lib_dir);
    if sup.target_sdk_version.is_some() {
        base.supervisor.target_sdk_version = sup.target_sdk_version;
    }
    set(&mut base.supervisor.init_script, sup.init_script);
    set(&mut base.supervisor.shell, sup.shell);
    if sup.socket_path.is_some() {
        base.supervisor.socket_path = sup.socket_path;
    }

    let client = overlay.client;
    if client.socket_path.is_some() {
        base.client.socket_path = client.socket_path;
    }
    set(&mut base.client.bind_timeout_secs, client.bind_timeout_secs);
    set(&mut base.client.autostart, client.autostart);
    set(&mut base.client.daemon_bin, client.daemon_bin);

    set(&mut base.log_level, overlay.log_level);
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("SHELLVISOR_SOCKET") {
        let path = PathBuf::from(val);
        config.supervisor.socket_path = Some(path.clone());
        config.client.socket_path = Some(path);
    }
    if let Some(val) = var("SHELLVISOR_BASE_DIR") {
        config.supervisor.base_dir = PathBuf::from(val);
    }
    if let Some(val) = var("SHELLVISOR_NATIVE_DIR") {
        config.supervisor.native_lib_dir = PathBuf::from(val);
    }
    if let Some(val) = var("SHELLVISOR_TARGET_SDK")
        && let Ok(n) = val.parse()
    {
        config.supervisor.target_sdk_version = Some(n);
    }
    if let Some(val) = var("SHELLVISOR_BIND_TIMEOUT_SECS")
        && let Ok(n) = val.parse()
    {
        config.client.bind_timeout_secs = n;
    }
    if let Some(val) = var("SHELLVISOR_LOG_LEVEL") {
        config.log_level = val;
    }
}
