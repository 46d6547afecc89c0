//! Shared configuration for portlet.
//!
//! TOML groups and services, layered with `PORTLET_` environment
//! overrides, and translated into `portlet_core` types: a
//! [`LifecycleConfig`], the prober's tunnel targets, and the group /
//! service registrations a [`LifecycleManager`] starts from.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{Host, Url};

use portlet_core::{
    BackoffConfig, CoreError, DEFAULT_EVENT_BUFFER, LifecycleConfig, LifecycleManager, ProbeTarget,
    Prober, ServiceId,
};

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "PORTLET_CONFIG";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config file already exists at {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("cannot register configured services: {0}")]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Lifecycle tuning.
    #[serde(default)]
    pub defaults: Defaults,

    /// Tunnel groups, each forwarding one or more services.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Defaults {
    /// Probe timeout in seconds.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,

    /// Seconds between re-probes of a connected service. 0 disables.
    #[serde(default)]
    pub health_interval: u64,

    /// Change events buffered per subscriber.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            probe_timeout: default_probe_timeout(),
            health_interval: 0,
            event_buffer: default_event_buffer(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_jitter: default_backoff_jitter(),
        }
    }
}

fn default_probe_timeout() -> u64 {
    5
}
fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}
fn default_backoff_initial_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_backoff_jitter() -> f64 {
    0.25
}

/// One tunnel / connection context.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GroupConfig {
    pub id: String,

    /// Display name. Falls back to the id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl GroupConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// One forwarded service.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub id: String,

    /// Display label. Falls back to the id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Local tunnel endpoint: `host:port` or `scheme://host[:port]`.
    pub target: String,

    /// Enable as soon as a session starts.
    #[serde(default)]
    pub auto_connect: bool,
}

impl ServiceConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl Config {
    /// Find a service and the group it belongs to.
    pub fn find_service(&self, id: &str) -> Option<(&GroupConfig, &ServiceConfig)> {
        self.groups
            .iter()
            .find_map(|g| g.services.iter().find(|s| s.id == id).map(|s| (g, s)))
    }

    pub fn find_group(&self, id: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn service_count(&self) -> usize {
        self.groups.iter().map(|g| g.services.len()).sum()
    }

    /// Check ids, targets and tuning values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.defaults.probe_timeout == 0 {
            return Err(invalid("defaults.probe_timeout", "must be at least 1 second"));
        }
        if self.defaults.event_buffer == 0 {
            return Err(invalid("defaults.event_buffer", "must be at least 1"));
        }
        if self.defaults.backoff_max_ms < self.defaults.backoff_initial_ms {
            return Err(invalid(
                "defaults.backoff_max_ms",
                format!(
                    "{} is below backoff_initial_ms ({})",
                    self.defaults.backoff_max_ms, self.defaults.backoff_initial_ms
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.defaults.backoff_jitter) {
            return Err(invalid("defaults.backoff_jitter", "must be between 0 and 1"));
        }

        let mut group_ids = HashSet::new();
        let mut service_ids = HashSet::new();
        for group in &self.groups {
            if group.id.trim().is_empty() {
                return Err(invalid("groups.id", "must not be empty"));
            }
            if !group_ids.insert(group.id.as_str()) {
                return Err(invalid("groups.id", format!("duplicate group '{}'", group.id)));
            }
            for service in &group.services {
                if service.id.trim().is_empty() {
                    return Err(invalid(
                        format!("groups.{}.services.id", group.id),
                        "must not be empty",
                    ));
                }
                if !service_ids.insert(service.id.as_str()) {
                    return Err(invalid(
                        "services.id",
                        format!("duplicate service '{}'", service.id),
                    ));
                }
                parse_target(&service.target).map_err(|e| match e {
                    ConfigError::Validation { reason, .. } => ConfigError::Validation {
                        field: format!("services.{}.target", service.id),
                        reason,
                    },
                    other => other,
                })?;
            }
        }
        Ok(())
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path: `PORTLET_CONFIG`, else XDG / platform
/// conventions.
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    ProjectDirs::from("dev", "portlet", "portlet").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("portlet");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load and validate the Config from the canonical path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load and validate the Config from `path` + environment.
///
/// A missing file yields the defaults. Environment keys nest with a
/// double underscore: `PORTLET_DEFAULTS__PROBE_TIMEOUT=10`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("PORTLET_").ignore(&["config"]).split("__"));

    let config: Config = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Load config, returning a default if it is missing or invalid.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

/// Starter configuration written by [`init_config`].
pub fn sample_config() -> Config {
    Config {
        defaults: Defaults::default(),
        groups: vec![GroupConfig {
            id: "local".into(),
            name: Some("Local tunnel".into()),
            services: vec![ServiceConfig {
                id: "web".into(),
                name: Some("Web dashboard".into()),
                target: "http://127.0.0.1:8080".into(),
                auto_connect: false,
            }],
        }],
    }
}

/// Write [`sample_config`] to `path` unless a file is already there
/// (or `force` is set). Returns the path written.
pub fn init_config(path: &Path, force: bool) -> Result<PathBuf, ConfigError> {
    if path.exists() && !force {
        return Err(ConfigError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    save_config_to(&sample_config(), path)?;
    Ok(path.to_path_buf())
}

// ── Translation into core types ─────────────────────────────────────

/// Build the lifecycle tuning from `[defaults]`.
pub fn to_lifecycle_config(cfg: &Config) -> LifecycleConfig {
    let d = &cfg.defaults;
    LifecycleConfig {
        probe_timeout: Duration::from_secs(d.probe_timeout),
        health_interval: (d.health_interval > 0).then(|| Duration::from_secs(d.health_interval)),
        event_buffer: d.event_buffer,
        backoff: BackoffConfig {
            initial: Duration::from_millis(d.backoff_initial_ms),
            max: Duration::from_millis(d.backoff_max_ms),
            multiplier: d.backoff_multiplier,
            jitter: d.backoff_jitter,
        },
    }
}

/// Parse a service target.
///
/// `host:port` probes plainly; `scheme://host[:port]` keeps the scheme for
/// the resolved endpoint and falls back to the scheme's well-known port.
pub fn parse_target(raw: &str) -> Result<ProbeTarget, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(invalid("target", "must not be empty"));
    }

    let (url, scheme) = if raw.contains("://") {
        let url = Url::parse(raw).map_err(|e| invalid("target", format!("'{raw}': {e}")))?;
        let scheme = url.scheme().to_owned();
        (url, Some(scheme))
    } else {
        let url = Url::parse(&format!("tcp://{raw}"))
            .map_err(|e| invalid("target", format!("'{raw}': {e}")))?;
        (url, None)
    };

    let host = match url.host() {
        Some(Host::Ipv6(addr)) => addr.to_string(),
        Some(host) => host.to_string(),
        None => return Err(invalid("target", format!("'{raw}' has no host"))),
    };
    let port = url
        .port_or_known_default()
        .filter(|p| *p != 0)
        .ok_or_else(|| invalid("target", format!("'{raw}' has no port")))?;

    let target = ProbeTarget::new(host, port);
    Ok(match scheme {
        Some(scheme) => target.with_scheme(scheme),
        None => target,
    })
}

/// Tunnel targets for every configured service, in file order.
pub fn to_probe_targets(cfg: &Config) -> Result<Vec<(ServiceId, ProbeTarget)>, ConfigError> {
    cfg.groups
        .iter()
        .flat_map(|g| &g.services)
        .map(|s| Ok((ServiceId::from(s.id.as_str()), parse_target(&s.target)?)))
        .collect()
}

/// Register every configured group and service with `manager`.
///
/// Returns the ids of services marked `auto_connect`.
pub fn register_all<P: Prober>(
    cfg: &Config,
    manager: &LifecycleManager<P>,
) -> Result<Vec<ServiceId>, ConfigError> {
    let mut auto_connect = Vec::new();
    for group in &cfg.groups {
        manager.add_group(group.id.as_str().into(), group.display_name())?;
        for service in &group.services {
            let id = ServiceId::from(service.id.as_str());
            manager.add_service(group.id.as_str().into(), id.clone(), service.display_name())?;
            if service.auto_connect {
                auto_connect.push(id);
            }
        }
    }
    Ok(auto_connect)
}
