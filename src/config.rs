use std::{path::PathBuf, time::Duration};

use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "agent-gateway")]
#[command(about = "Routes traffic between coding agents, apps and TUIs, with a remote relay fallback")]
pub struct Config {
    #[arg(long, env = "GATEWAY_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "GATEWAY_PORT", default_value_t = 12345)]
    pub port: u16,

    /// Relay URL (http(s) or ws(s)); the tunnel is disabled when unset.
    #[arg(long, env = "GATEWAY_REMOTE_URL")]
    pub remote_url: Option<String>,

    #[arg(long, env = "GATEWAY_SERVER_ID")]
    pub server_id: Option<String>,

    #[arg(long, env = "GATEWAY_APP_TOKEN")]
    pub app_token: Option<String>,

    #[arg(long, env = "GATEWAY_MAX_RECONNECT_ATTEMPTS", default_value_t = 10)]
    pub max_reconnect_attempts: u32,

    #[arg(long, env = "GATEWAY_RECONNECT_DELAY_MS", default_value_t = 5000)]
    pub reconnect_delay_ms: u64,

    #[arg(long, env = "GATEWAY_AGENTS_DIR")]
    pub agents_dir: Option<PathBuf>,

    #[arg(long, env = "GATEWAY_REGISTRY_URL", default_value = "https://api.codebolt.ai")]
    pub registry_url: String,

    /// Interpreter used to launch an agent's entry point.
    #[arg(long, env = "GATEWAY_AGENT_RUNTIME", default_value = "node")]
    pub agent_runtime: String,

    /// Agent started for an initial prompt when none is selected or connected.
    #[arg(long, env = "GATEWAY_DEFAULT_AGENT")]
    pub default_agent: Option<String>,

    #[arg(long, env = "GATEWAY_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    #[arg(long, env = "GATEWAY_AGENT_READY_TIMEOUT_MS", default_value_t = 30_000)]
    pub agent_ready_timeout_ms: u64,

    #[arg(long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "GATEWAY_JSON_EVENTS", default_value_t = false)]
    pub json_events: bool,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn agent_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_ready_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.agents_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".agent-gateway")
                .join("agents")
        })
    }

    pub fn remote_url(&self) -> Option<&str> {
        self.remote_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use clap::Parser;

    #[test]
    fn defaults() {
        let cfg = Config::parse_from(["agent-gateway"]);
        assert_eq!(cfg.port, 12345);
        assert_eq!(cfg.max_reconnect_attempts, 10);
        assert_eq!(cfg.reconnect_delay_ms, 5000);
        assert_eq!(cfg.request_timeout_ms, 30_000);
        assert_eq!(cfg.agent_ready_timeout_ms, 30_000);
        assert_eq!(cfg.agent_runtime, "node");
        assert!(cfg.agents_dir().ends_with(".agent-gateway/agents"));
    }

    #[test]
    fn blank_remote_url_disables_tunnel() {
        let cfg = Config::parse_from(["agent-gateway", "--remote-url", "  "]);
        assert_eq!(cfg.remote_url(), None);
        let cfg = Config::parse_from(["agent-gateway", "--remote-url", "https://relay.dev"]);
        assert_eq!(cfg.remote_url(), Some("https://relay.dev"));
    }
}
