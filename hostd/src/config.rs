//! renderhost daemon configuration loading and parsing

use anyhow::{Context, Result};
use renderhost_badmsg::TerminationPolicy;
use serde::Deserialize;
use std::fs;
use std::path::Path;

const DEFAULT_CONFIG_PATH: &str = "/etc/renderhost/config.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct HostdConfig {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub bad_message: BadMessageConfig,
    #[serde(default)]
    pub renderers: Vec<RendererConfig>,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Debug, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BadMessageConfig {
    /// Log and count bad messages but leave the renderer running
    #[serde(default)]
    pub disable_kill: bool,
    #[serde(default = "default_dump_dir")]
    pub dump_dir: String,
    #[serde(default = "default_unknown_message_reason")]
    pub unknown_message_reason: u32,
}

impl Default for BadMessageConfig {
    fn default() -> Self {
        Self {
            disable_kill: false,
            dump_dir: default_dump_dir(),
            unknown_message_reason: default_unknown_message_reason(),
        }
    }
}

impl BadMessageConfig {
    pub fn termination_policy(&self) -> TerminationPolicy {
        TerminationPolicy {
            kill_enabled: !self.disable_kill,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RendererConfig {
    pub name: String,
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct IpcConfig {
    #[serde(default = "default_allowed_messages")]
    pub allowed_messages: Vec<String>,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            allowed_messages: default_allowed_messages(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_reap_interval")]
    pub reap_interval_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            reap_interval_ms: default_reap_interval(),
        }
    }
}

// Default value functions
fn default_name() -> String { "renderhost".into() }
fn default_log_level() -> String { "info".into() }
fn default_dump_dir() -> String { "/var/lib/renderhost/dumps".into() }
fn default_unknown_message_reason() -> u32 { 1 }
fn default_allowed_messages() -> Vec<String> { vec!["ping".into(), "frame".into(), "log".into()] }
fn default_reap_interval() -> u64 { 500 }

/// Load configuration from $RENDERHOST_CONFIG or /etc/renderhost/config.toml.
///
/// Returns the path the configuration came from, or `None` when the file
/// was missing and defaults are in use. Logging is not up yet when this
/// runs, so the caller reports which one happened.
pub fn load_config() -> Result<(HostdConfig, Option<String>)> {
    let config_path = std::env::var("RENDERHOST_CONFIG")
        .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    if Path::new(&config_path).exists() {
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config from {config_path}"))?;
        let config: HostdConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {config_path}"))?;
        Ok((config, Some(config_path)))
    } else {
        Ok((HostdConfig::default(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HostdConfig::default();
        assert_eq!(config.host.name, "renderhost");
        assert_eq!(config.host.log_level, "info");
        assert!(!config.bad_message.disable_kill);
        assert!(config.bad_message.termination_policy().kill_enabled);
        assert!(config.renderers.is_empty());
        assert_eq!(config.ipc.allowed_messages, vec!["ping", "frame", "log"]);
        assert_eq!(config.control.reap_interval_ms, 500);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_str = r#"
[host]
log_level = "debug"

[bad_message]
disable_kill = true
"#;
        let config: HostdConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host.name, "renderhost");
        assert_eq!(config.host.log_level, "debug");
        assert!(!config.bad_message.termination_policy().kill_enabled);
        assert_eq!(config.bad_message.unknown_message_reason, 1);
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[host]
name = "edge-host"
log_level = "warn"

[bad_message]
disable_kill = false
dump_dir = "/tmp/renderhost-dumps"
unknown_message_reason = 27

[ipc]
allowed_messages = ["ping", "paint"]

[control]
reap_interval_ms = 250

[[renderers]]
name = "tab-1"
binary = "/usr/lib/renderhost/renderer"
args = ["--type=renderer", "--lang=en"]

[[renderers]]
name = "tab-2"
binary = "/usr/lib/renderhost/renderer"
"#;
        let config: HostdConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host.name, "edge-host");
        assert_eq!(config.bad_message.dump_dir, "/tmp/renderhost-dumps");
        assert_eq!(config.bad_message.unknown_message_reason, 27);
        assert_eq!(config.ipc.allowed_messages, vec!["ping", "paint"]);
        assert_eq!(config.control.reap_interval_ms, 250);
        assert_eq!(config.renderers.len(), 2);
        assert_eq!(config.renderers[0].args.len(), 2);
        assert!(config.renderers[1].args.is_empty());
    }
}
