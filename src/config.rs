use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Static listen-port to target-port maps. Fixed for the process
    /// lifetime; these decide which listen ports an added backend becomes
    /// routable on.
    #[serde(default)]
    pub listen: Vec<PortMap>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the internal API (control actions and introspection)
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Authentication token for the API (required for write operations)
    /// If not set, a random token is generated at startup and logged
    pub api_token: Option<String>,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Backend lease TTL in seconds (default: 30). A backend that is not
    /// re-added within this window stops being routable.
    #[serde(default = "default_route_ttl")]
    pub route_ttl_secs: u64,
}

impl ServerConfig {
    pub fn route_ttl(&self) -> Duration {
        Duration::from_secs(self.route_ttl_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            api_port: default_api_port(),
            api_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            route_ttl_secs: default_route_ttl(),
        }
    }
}

/// One externally exposed listen port and the backend-side port it forwards
/// to.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PortMap {
    /// Externally exposed TCP port the proxy accepts requests on
    #[serde(rename = "port")]
    pub listen: u16,
    /// Backend-side port this listen port forwards to
    pub target: u16,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8022
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_route_ttl() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.listen.is_empty() {
            anyhow::bail!("at least one [[listen]] port map is required");
        }
        for (i, pm) in self.listen.iter().enumerate() {
            if pm.listen == 0 || pm.target == 0 {
                anyhow::bail!("listen and target ports must be non-zero");
            }
            if self.listen[..i].iter().any(|other| other.listen == pm.listen) {
                anyhow::bail!("duplicate listen port: {}", pm.listen);
            }
        }
        if self.server.route_ttl_secs == 0 {
            anyhow::bail!("route_ttl_secs must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config = Config::from_toml(
            r#"
            [[listen]]
            port = 80
            target = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.api_port, 8022);
        assert_eq!(config.server.route_ttl_secs, 30);
        assert_eq!(config.listen.len(), 1);
        assert_eq!(config.listen[0].listen, 80);
        assert_eq!(config.listen[0].target, 5000);
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_toml(
            r#"
            [server]
            bind = "127.0.0.1"
            api_port = 9022
            api_token = "secret"
            pool_max_idle_per_host = 4
            pool_idle_timeout_secs = 30
            route_ttl_secs = 60

            [[listen]]
            port = 80
            target = 5000

            [[listen]]
            port = 8080
            target = 5000

            [[listen]]
            port = 9000
            target = 6000
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.api_token.as_deref(), Some("secret"));
        assert_eq!(config.server.route_ttl(), Duration::from_secs(60));
        assert_eq!(config.server.pool_idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.listen.len(), 3);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[[listen]]\nport = 80\ntarget = 5000\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.listen.len(), 1);

        assert!(Config::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_missing_listen_rejected() {
        assert!(Config::from_toml("[server]\nbind = \"127.0.0.1\"").is_err());
    }

    #[test]
    fn test_duplicate_listen_port_rejected() {
        let result = Config::from_toml(
            r#"
            [[listen]]
            port = 80
            target = 5000

            [[listen]]
            port = 80
            target = 6000
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_port_rejected() {
        let result = Config::from_toml(
            r#"
            [[listen]]
            port = 0
            target = 5000
            "#,
        );
        assert!(result.is_err());
    }
}
