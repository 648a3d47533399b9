//! Configuration resolution for Tandem.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/tandem/settings.json`)
//! 3. Project config (`.tandem/settings.json`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binaries)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default port of the bridge server.
pub const DEFAULT_BRIDGE_PORT: u16 = 4322;

/// Default model used when a session is created without one.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4";

/// Complete Tandem configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

/// Bridge server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub port: u16,
    /// Per-connection wait for the close handshake on shutdown (milliseconds).
    pub close_timeout_ms: u64,
    /// Outbound frames buffered per client before it is considered dead.
    pub client_buffer: usize,
    pub log_level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_BRIDGE_PORT,
            close_timeout_ms: 1000,
            client_buffer: 256,
            log_level: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Agent backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub default_model: String,
    /// Explicit path to the `claude` executable. Skips candidate search.
    pub claude_bin: Option<PathBuf>,
    /// Ordered install locations probed before falling back to `PATH`.
    pub claude_candidates: Vec<String>,
    /// Auto-approve every tool permission request.
    pub skip_permissions: bool,
    /// Tools pre-approved when `skip_permissions` is off.
    pub allowed_tools: Vec<String>,
    /// Seconds to wait for graceful subprocess shutdown before SIGKILL.
    pub terminate_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            claude_bin: None,
            claude_candidates: default_claude_candidates(),
            skip_permissions: true,
            allowed_tools: Vec::new(),
            terminate_timeout_secs: 5,
        }
    }
}

/// Dev-tunnel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Ordered install locations of the tunnel executable.
    pub executable_candidates: Vec<String>,
    /// Bare executable name probed with `--version` when no candidate exists.
    pub executable_name: String,
    /// Arguments for hosting; `{port}` is replaced with the bridge port.
    pub host_args: Vec<String>,
    pub discovery_timeout_secs: u64,
    /// Opaque token handed to remote clients as `X-Tunnel-Authorization`.
    pub access_token: Option<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            executable_candidates: default_tunnel_candidates(),
            executable_name: "devtunnel".to_string(),
            host_args: ["host", "-p", "{port}", "--allow-anonymous"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            discovery_timeout_secs: 30,
            access_token: None,
        }
    }
}

impl TunnelConfig {
    pub const fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    /// Host arguments with the port placeholder filled in.
    pub fn host_args_for(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.host_args
            .iter()
            .map(|arg| arg.replace("{port}", &port))
            .collect()
    }
}

fn default_claude_candidates() -> Vec<String> {
    if cfg!(windows) {
        vec![
            "$LOCALAPPDATA/Programs/claude/claude.exe".to_string(),
            "~/.claude/local/claude.exe".to_string(),
        ]
    } else {
        vec![
            "~/.claude/local/claude".to_string(),
            "~/.local/bin/claude".to_string(),
            "/opt/homebrew/bin/claude".to_string(),
            "/usr/local/bin/claude".to_string(),
        ]
    }
}

fn default_tunnel_candidates() -> Vec<String> {
    if cfg!(windows) {
        vec![
            "$LOCALAPPDATA/Microsoft/DevTunnels/devtunnel.exe".to_string(),
            "~/.devtunnels/bin/devtunnel.exe".to_string(),
        ]
    } else {
        vec![
            "~/bin/devtunnel".to_string(),
            "~/.local/bin/devtunnel".to_string(),
            "/usr/local/bin/devtunnel".to_string(),
            "/opt/homebrew/bin/devtunnel".to_string(),
        ]
    }
}

/// Expand a configured candidate path.
///
/// `~/` resolves against the home directory and `$LOCALAPPDATA/` against the
/// local data directory. Returns `None` when the base directory is unknown.
pub fn expand_path(raw: &str) -> Option<PathBuf> {
    if let Some(rest) = raw.strip_prefix("~/") {
        return dirs::home_dir().map(|h| h.join(rest));
    }
    if let Some(rest) = raw.strip_prefix("$LOCALAPPDATA/") {
        return dirs::data_local_dir().map(|d| d.join(rest));
    }
    Some(PathBuf::from(raw))
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::with_capacity(2);
    layers.extend(global_config_path());
    layers.extend(project_dir.map(project_config_path));

    let mut config = load_layers(&layers)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Merge the existing files among `paths`, lowest priority first, over the
/// defaults. Only keys present in a file override the layers below it.
fn load_layers(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for path in paths.iter().filter(|p| p.exists()) {
        merge_values(&mut merged, read_layer(path)?);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid merged configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tandem").join("settings.json"))
}

/// Project config file path inside `dir`.
pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".tandem").join("settings.json")
}

/// Load a single settings file over the defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let layer = read_layer(path)?;
    serde_json::from_value(layer).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn read_layer(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`. Objects merge key by key, `null` keeps
/// the lower value, anything else replaces it.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None if !value.is_null() => {
                        base.insert(key, value);
                    }
                    None => {}
                }
            }
        }
        (_, Value::Null) => {}
        (slot, value) => *slot = value,
    }
}

/// Apply `TANDEM_*` overrides read through `lookup`.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = lookup("TANDEM_PORT").and_then(|v| v.parse().ok()) {
        config.bridge.port = n;
    }
    if let Some(val) = lookup("TANDEM_LOG_LEVEL") {
        config.bridge.log_level = val;
    }
    if let Some(val) = lookup("TANDEM_DEFAULT_MODEL") {
        config.agent.default_model = val;
    }
    if let Some(val) = lookup("TANDEM_CLAUDE_BIN") {
        config.agent.claude_bin = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("TANDEM_TUNNEL_TOKEN") {
        config.tunnel.access_token = Some(val);
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_bridge_conventions() {
        let config = Config::default();
        assert_eq!(config.bridge.port, 4322);
        assert_eq!(config.bridge.close_timeout(), Duration::from_secs(1));
        assert_eq!(config.agent.default_model, "claude-sonnet-4");
        assert_eq!(config.tunnel.discovery_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn host_args_fill_port_placeholder() {
        let config = TunnelConfig::default();
        assert_eq!(
            config.host_args_for(4322),
            vec!["host", "-p", "4322", "--allow-anonymous"]
        );
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = project_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"bridge":{"port":5000},"tunnel":{"discovery_timeout_secs":5}}"#)
            .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.bridge.port, 5000);
        assert_eq!(config.bridge.client_buffer, 256);
        assert_eq!(config.tunnel.discovery_timeout_secs, 5);
        assert_eq!(config.tunnel.executable_name, "devtunnel");
    }

    #[test]
    fn invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_win_over_files() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| match key {
            "TANDEM_PORT" => Some("6001".to_string()),
            "TANDEM_DEFAULT_MODEL" => Some("claude-opus-4".to_string()),
            "TANDEM_TUNNEL_TOKEN" => Some("tok".to_string()),
            _ => None,
        });
        assert_eq!(config.bridge.port, 6001);
        assert_eq!(config.agent.default_model, "claude-opus-4");
        assert_eq!(config.tunnel.access_token.as_deref(), Some("tok"));
    }

    #[test]
    fn unparsable_port_override_is_ignored() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| {
            (key == "TANDEM_PORT").then(|| "not-a-port".to_string())
        });
        assert_eq!(config.bridge.port, DEFAULT_BRIDGE_PORT);
    }

    fn write_layer(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn project_layer_keeps_untouched_global_sections() {
        let dir = tempfile::tempdir().unwrap();
        let global = write_layer(dir.path(), "global.json", r#"{"bridge":{"port":5000}}"#);
        let project = write_layer(
            dir.path(),
            "project.json",
            r#"{"agent":{"default_model":"claude-opus-4"}}"#,
        );

        let config = load_layers(&[global, project]).unwrap();
        assert_eq!(config.bridge.port, 5000);
        assert_eq!(config.bridge.client_buffer, 256);
        assert_eq!(config.agent.default_model, "claude-opus-4");
        assert!(config.agent.skip_permissions);
    }

    #[test]
    fn project_layer_overrides_single_keys() {
        let dir = tempfile::tempdir().unwrap();
        let global = serde_json::json!({
            "tunnel": {"access_token": "global", "discovery_timeout_secs": 60},
            "bridge": {"log_level": "debug"}
        });
        let project = serde_json::json!({
            "tunnel": {"discovery_timeout_secs": 10, "access_token": null},
            "bridge": {"port": 4400}
        });
        let global = write_layer(dir.path(), "global.json", &global.to_string());
        let project = write_layer(dir.path(), "project.json", &project.to_string());
        let missing = dir.path().join("absent.json");

        let config = load_layers(&[global, missing, project]).unwrap();
        assert_eq!(config.tunnel.access_token.as_deref(), Some("global"));
        assert_eq!(config.tunnel.discovery_timeout_secs, 10);
        assert_eq!(config.tunnel.executable_name, "devtunnel");
        assert_eq!(config.bridge.log_level, "debug");
        assert_eq!(config.bridge.port, 4400);
    }

    #[test]
    fn lists_are_replaced_not_appended() {
        let mut base = serde_json::to_value(Config::default()).unwrap();
        merge_values(
            &mut base,
            serde_json::json!({"agent": {"allowed_tools": ["Read"], "claude_bin": "/opt/claude"}}),
        );
        merge_values(
            &mut base,
            serde_json::json!({"agent": {"allowed_tools": ["Edit", "Bash"]}}),
        );
        let config: Config = serde_json::from_value(base).unwrap();
        assert_eq!(config.agent.allowed_tools, vec!["Edit", "Bash"]);
        assert_eq!(config.agent.claude_bin, Some(PathBuf::from("/opt/claude")));
    }

    #[test]
    fn wrongly_typed_layer_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let layer = write_layer(dir.path(), "bad.json", r#"{"bridge":{"port":"high"}}"#);
        assert!(matches!(load_layers(&[layer]), Err(Error::Config(_))));
    }

    #[test]
    fn absolute_candidates_expand_unchanged() {
        assert_eq!(
            expand_path("/usr/local/bin/devtunnel"),
            Some(PathBuf::from("/usr/local/bin/devtunnel"))
        );
    }
}
