use crate::error::FixError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub paths: Paths,
    pub target: Target,
    pub download: Download,
    pub sandbox: Sandbox,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub log_root: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Target {
    pub process_names: Vec<String>,
    pub cache_dirs: Vec<String>,
    pub log_dirs: Vec<String>,
    pub preferences_dir: String,
    pub preferences_glob: String,
    pub search_roots: Vec<String>,
    pub search_depth: usize,
    pub name_patterns: Vec<String>,
    pub admin_root: String,
    pub install_candidates: Vec<String>,
    pub user_install_candidates: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Download {
    pub installer_url: String,
    pub user_agent: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Sandbox {
    pub image: String,
    pub container_name: String,
    pub volume: String,
    pub container_user: String,
    pub vnc_port: u16,
    pub web_port: u16,
    pub engine_app: String,
    pub engine_cask: String,
    pub download_page: String,
    pub daemon_poll_attempts: u32,
    pub daemon_poll_interval_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            paths: Paths::default(),
            target: Target::default(),
            download: Download::default(),
            sandbox: Sandbox::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            log_root: "~/Library/Logs/zoomfix".to_string(),
        }
    }
}

impl Default for Target {
    fn default() -> Self {
        Self {
            process_names: vec!["zoom.us".to_string()],
            cache_dirs: vec!["~/Library/Application Support/zoom.us".to_string()],
            log_dirs: vec!["~/Library/Logs/zoom.us".to_string()],
            preferences_dir: "~/Library/Preferences".to_string(),
            preferences_glob: "us.zoom.*".to_string(),
            search_roots: vec![
                "/Applications".to_string(),
                "~/Applications".to_string(),
                "~/Library/Application Support".to_string(),
            ],
            search_depth: 4,
            name_patterns: vec!["zoom*.app".to_string()],
            admin_root: "/Applications".to_string(),
            install_candidates: vec![
                "/Applications/zoom.us.app".to_string(),
                "/Applications/Zoom.app".to_string(),
                "/Applications/Zoom Workplace.app".to_string(),
            ],
            user_install_candidates: vec![
                "~/Applications/zoom.us.app".to_string(),
                "~/Applications/Zoom.app".to_string(),
            ],
        }
    }
}

impl Default for Download {
    fn default() -> Self {
        Self {
            installer_url: "https://zoom.us/client/latest/Zoom.pkg".to_string(),
            user_agent: "zoomfix-cli".to_string(),
        }
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self {
            image: "zoomfixer-sandbox".to_string(),
            container_name: "zoomfixer-sandbox".to_string(),
            volume: "zoomfixer_home".to_string(),
            container_user: "zoomuser".to_string(),
            vnc_port: 5901,
            web_port: 6080,
            engine_app: "Docker".to_string(),
            engine_cask: "docker".to_string(),
            download_page: "https://www.docker.com/products/docker-desktop/".to_string(),
            daemon_poll_attempts: 12,
            daemon_poll_interval_sec: 5,
        }
    }
}

impl Sandbox {
    pub fn viewer_url(&self) -> String {
        format!("http://localhost:{}/vnc.html", self.web_port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.daemon_poll_interval_sec)
    }
}

impl Target {
    pub fn admin_root_path(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.admin_root))
    }
}

impl Paths {
    /// `None` when the event log file is disabled.
    pub fn events_path(&self) -> Option<PathBuf> {
        let root = self.log_root.trim();
        if root.is_empty() {
            return None;
        }
        Some(PathBuf::from(expand_path(root)).join("events.jsonl"))
    }
}

pub fn read_config_from_str(content: &str) -> Result<Config, FixError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, FixError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// Built-in defaults apply when no config file exists.
pub fn load_config(path: &Path) -> Result<Config, FixError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    read_config(path).map_err(|err| {
        FixError::Config(format!(
            "config is invalid. Please edit {} and try again. ({})",
            path.display(),
            err
        ))
    })
}

pub fn validate_config(cfg: &Config) -> Result<(), FixError> {
    if cfg.version != 1 {
        return Err(FixError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }

    let target = &cfg.target;
    if target.name_patterns.iter().all(|p| p.trim().is_empty()) {
        return Err(FixError::Config(
            "target.name_patterns must contain at least one pattern".to_string(),
        ));
    }
    if target.search_depth == 0 {
        return Err(FixError::Config(
            "target.search_depth must be at least 1".to_string(),
        ));
    }
    if !target.admin_root.starts_with('/') {
        return Err(FixError::Config(format!(
            "target.admin_root must be an absolute path, got {:?}",
            target.admin_root
        )));
    }
    if target.process_names.iter().any(|name| name.trim().is_empty()) {
        return Err(FixError::Config(
            "target.process_names must not contain empty names".to_string(),
        ));
    }
    if target.preferences_glob.contains('/') {
        return Err(FixError::Config(
            "target.preferences_glob must be a file name pattern".to_string(),
        ));
    }

    let url = cfg.download.installer_url.trim();
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(FixError::Config(format!(
            "download.installer_url must be an http(s) URL, got {:?}",
            cfg.download.installer_url
        )));
    }

    let sandbox = &cfg.sandbox;
    if sandbox.vnc_port == 0 || sandbox.web_port == 0 {
        return Err(FixError::Config(
            "sandbox ports must be non-zero".to_string(),
        ));
    }
    if sandbox.vnc_port == sandbox.web_port {
        return Err(FixError::Config(format!(
            "sandbox.vnc_port and sandbox.web_port must differ (both {})",
            sandbox.vnc_port
        )));
    }
    if sandbox.daemon_poll_attempts == 0 {
        return Err(FixError::Config(
            "sandbox.daemon_poll_attempts must be at least 1".to_string(),
        ));
    }
    let required = [
        &sandbox.image,
        &sandbox.container_name,
        &sandbox.volume,
        &sandbox.container_user,
    ];
    if required.iter().any(|value| value.trim().is_empty()) {
        return Err(FixError::Config(
            "sandbox.image, container_name, volume and container_user are required".to_string(),
        ));
    }
    Ok(())
}

pub fn expand_path(input: &str) -> String {
    if input == "~" {
        if let Some(home) = home_dir() {
            return home.to_string_lossy().to_string();
        }
    }
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}
