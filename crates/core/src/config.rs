use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_url")]
    pub url: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_outbound_queue_cap")]
    pub outbound_queue_cap: usize,
    #[serde(default = "default_handshake_retries")]
    pub handshake_retries: u32,
    #[serde(default = "default_handshake_retry_delay_ms")]
    pub handshake_retry_delay_ms: u64,
}

fn default_bridge_url() -> String {
    "ws://127.0.0.1:8765".to_string()
}

fn default_heartbeat_secs() -> u64 {
    // Deliberately under the 30s idle-kill of service-worker style hosts.
    20
}

fn default_reconnect_base_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_outbound_queue_cap() -> usize {
    256
}

fn default_handshake_retries() -> u32 {
    3
}

fn default_handshake_retry_delay_ms() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
            heartbeat_secs: default_heartbeat_secs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            outbound_queue_cap: default_outbound_queue_cap(),
            handshake_retries: default_handshake_retries(),
            handshake_retry_delay_ms: default_handshake_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChromeConfig {
    #[serde(default = "default_debug_host")]
    pub debug_host: String,
    #[serde(default = "default_debug_port")]
    pub debug_port: u16,
    /// Launch a local browser when no DevTools endpoint answers.
    #[serde(default)]
    pub launch_if_missing: bool,
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default = "default_window_width")]
    pub window_width: u32,
    #[serde(default = "default_window_height")]
    pub window_height: u32,
    /// Extra flags appended to the browser command line at launch.
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_tab_load_timeout_secs")]
    pub tab_load_timeout_secs: u64,
}

fn default_debug_host() -> String {
    "127.0.0.1".to_string()
}

fn default_debug_port() -> u16 {
    9222
}

fn default_window_width() -> u32 {
    1280
}

fn default_window_height() -> u32 {
    720
}

fn default_tab_load_timeout_secs() -> u64 {
    10
}

impl Default for ChromeConfig {
    fn default() -> Self {
        Self {
            debug_host: default_debug_host(),
            debug_port: default_debug_port(),
            launch_if_missing: false,
            binary: None,
            headless: true,
            window_width: default_window_width(),
            window_height: default_window_height(),
            extra_args: Vec::new(),
            tab_load_timeout_secs: default_tab_load_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_screenshot_quality")]
    pub screenshot_quality: u32,
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
    #[serde(default = "default_history_suffix")]
    pub history_suffix: usize,
    #[serde(default = "default_post_click_delay_ms")]
    pub post_click_delay_ms: u64,
}

fn default_max_steps() -> u32 {
    15
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4-20250514".to_string()
}

fn default_screenshot_quality() -> u32 {
    30
}

fn default_max_elements() -> usize {
    15
}

fn default_history_suffix() -> usize {
    5
}

fn default_post_click_delay_ms() -> u64 {
    500
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            model: default_model(),
            screenshot_quality: default_screenshot_quality(),
            max_elements: default_max_elements(),
            history_suffix: default_history_suffix(),
            post_click_delay_ms: default_post_click_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Wait after a debugger disconnect before re-attaching, letting the
    /// browser actually release the previous attachment.
    #[serde(default = "default_cleanup_wait_ms")]
    pub cleanup_wait_ms: u64,
    #[serde(default = "default_exit_wait_ms")]
    pub exit_wait_ms: u64,
    #[serde(default = "default_cleanup_poll_ms")]
    pub cleanup_poll_ms: u64,
}

fn default_cleanup_wait_ms() -> u64 {
    500
}

fn default_exit_wait_ms() -> u64 {
    300
}

fn default_cleanup_poll_ms() -> u64 {
    200
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cleanup_wait_ms: default_cleanup_wait_ms(),
            exit_wait_ms: default_exit_wait_ms(),
            cleanup_poll_ms: default_cleanup_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub chrome: ChromeConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        let mut config = if config_path.exists() {
            Self::load(&config_path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TABPILOT_BRIDGE_URL") {
            if !url.is_empty() {
                self.bridge.url = url;
            }
        }
        if let Ok(port) = std::env::var("TABPILOT_DEBUG_PORT") {
            if let Ok(port) = port.parse() {
                self.chrome.debug_port = port;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.agent.max_steps, 15);
        assert_eq!(config.agent.screenshot_quality, 30);
        assert_eq!(config.bridge.heartbeat_secs, 20);
        assert_eq!(config.bridge.max_reconnect_attempts, 5);
        assert_eq!(config.session.cleanup_wait_ms, 500);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"agent": {"maxSteps": 25}}"#).unwrap();
        assert_eq!(config.agent.max_steps, 25);
        assert_eq!(config.agent.max_elements, 15);
        assert_eq!(config.bridge.url, "ws://127.0.0.1:8765");
    }
}
