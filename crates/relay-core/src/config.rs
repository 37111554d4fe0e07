use clap::Args;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 8000;
pub const DEFAULT_MODEL: &str = "default";
pub const DEFAULT_AGENT_BINARY: &str = "agent";
pub const DEFAULT_SIDECHANNEL_BINARY: &str = "relay-sidechannel";
pub const DEFAULT_CONTAINER_IMAGE: &str = "relay-agent-sandbox:latest";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Process-wide configuration, resolved once at startup from compiled-in
/// defaults overridden by `RELAY_*` environment variables overridden by
/// CLI flags. No runtime reconfiguration and nothing is persisted,
/// matching the engine's in-memory-only design.
#[derive(Debug, Clone, Args)]
pub struct EngineConfig {
    /// Interface the HTTP server binds to.
    #[arg(long, env = "RELAY_BACKEND_HOST", default_value = DEFAULT_ENGINE_HOST)]
    pub backend_host: String,

    /// TCP port the HTTP server listens on.
    #[arg(long, env = "RELAY_BACKEND_PORT", default_value_t = DEFAULT_ENGINE_PORT)]
    pub backend_port: u16,

    /// Comma-separated websocket origin allowlist.
    #[arg(long, env = "RELAY_ALLOWED_ORIGINS", value_delimiter = ',', default_value = "http://localhost:5173")]
    pub allowed_origins: Vec<String>,

    /// Directory under which per-task working directories are created.
    #[arg(long, env = "RELAY_PROJECTS_DIR", default_value = "./projects")]
    pub projects_dir: String,

    /// Image tag used when the sandbox mode is `container-wrap`.
    #[arg(long, env = "RELAY_CONTAINER_IMAGE", default_value = DEFAULT_CONTAINER_IMAGE)]
    pub container_image: String,

    /// Opt-in to `host-override` sandbox mode on an unconfined host.
    #[arg(long, env = "RELAY_ALLOW_HOST", default_value_t = false)]
    pub allow_host: bool,

    /// Model tag passed to agents that don't specify one.
    #[arg(long, env = "RELAY_DEFAULT_MODEL", default_value = DEFAULT_MODEL)]
    pub default_model: String,

    /// Executable name/path the Subprocess Runner invokes for agents.
    #[arg(long, env = "RELAY_AGENT_BINARY", default_value = DEFAULT_AGENT_BINARY)]
    pub agent_binary: String,

    /// Executable name/path of the Sidechannel Bridge binary.
    #[arg(long, env = "RELAY_SIDECHANNEL_BINARY", default_value = DEFAULT_SIDECHANNEL_BINARY)]
    pub sidechannel_binary: String,

    /// `tracing-subscriber` `EnvFilter` directive string.
    #[arg(long, env = "RELAY_LOG_FILTER", default_value = DEFAULT_LOG_FILTER)]
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend_host: DEFAULT_ENGINE_HOST.to_string(),
            backend_port: DEFAULT_ENGINE_PORT,
            allowed_origins: vec!["http://localhost:5173".to_string()],
            projects_dir: "./projects".to_string(),
            container_image: DEFAULT_CONTAINER_IMAGE.to_string(),
            allow_host: false,
            default_model: DEFAULT_MODEL.to_string(),
            agent_binary: DEFAULT_AGENT_BINARY.to_string(),
            sidechannel_binary: DEFAULT_SIDECHANNEL_BINARY.to_string(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.backend_host, self.backend_port)
    }

    /// The internal API base URL agent sidechannels call back into.
    pub fn bind_addr_url(&self) -> String {
        format!("http://{}", self.bind_addr())
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|allowed| allowed == origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_expected_address() {
        let config = EngineConfig::default();
        assert_eq!(config.bind_addr(), "127.0.0.1:8000");
    }

    #[test]
    fn origin_allowlist_is_exact_match() {
        let config = EngineConfig::default();
        assert!(config.origin_allowed("http://localhost:5173"));
        assert!(!config.origin_allowed("http://evil.example"));
    }
}
