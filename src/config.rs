use std::path::Path;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Public-edge HTTP reverse tunnel broker.
///
/// Accepts outbound connections from NAT'd clients, assigns each one a
/// public identifier and a dedicated inbound TCP listener, and multiplexes
/// external HTTP/WebSocket requests for that identifier back through the
/// client's pre-established sockets.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address the public tunnel-routing listener binds to.
    #[arg(long, env = "TUNNELBROKER_PUBLIC_ADDR", default_value = "0.0.0.0:8080")]
    pub public_addr: String,

    /// Address the admin API listener binds to.
    #[arg(long, env = "TUNNELBROKER_ADMIN_ADDR", default_value = "127.0.0.1:8081")]
    pub admin_addr: String,

    /// Maximum concurrently admitted tunnel sockets per client.
    #[arg(long, env = "TUNNELBROKER_MAX_TCP_SOCKETS", default_value_t = 10)]
    pub max_tcp_sockets: u32,

    /// How long a client with zero connected sockets stays registered
    /// before being torn down, in milliseconds.
    #[arg(long, env = "TUNNELBROKER_GRACE_PERIOD_MS", default_value_t = 1000)]
    pub grace_period_ms: u64,

    /// Optional fixed port range for per-client tunnel listeners
    /// ("low-high"), e.g. "20000-21000". Leave unset to let the OS choose
    /// an ephemeral port per client.
    #[arg(long, env = "TUNNELBROKER_TUNNEL_PORT_RANGE")]
    pub tunnel_port_range: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "TUNNELBROKER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON.
    #[arg(long, env = "TUNNELBROKER_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.public_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid public_addr {:?}: {e}", self.public_addr))?;
        self.admin_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid admin_addr {:?}: {e}", self.admin_addr))?;
        if self.max_tcp_sockets == 0 {
            anyhow::bail!("max_tcp_sockets must be at least 1");
        }
        if let Some(range) = self.parsed_tunnel_port_range()? {
            if range.0 > range.1 {
                anyhow::bail!("tunnel_port_range low must not exceed high");
            }
        }
        Ok(())
    }

    pub fn parsed_tunnel_port_range(&self) -> anyhow::Result<Option<(u16, u16)>> {
        let Some(raw) = &self.tunnel_port_range else {
            return Ok(None);
        };
        let (lo, hi) = raw
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("tunnel_port_range must look like \"low-high\""))?;
        Ok(Some((lo.trim().parse()?, hi.trim().parse()?)))
    }
}

// ---------------------------------------------------------------------------
// TOML config file support
// ---------------------------------------------------------------------------

/// Serializable config for TOML file persistence. All fields are optional —
/// only populated values are injected as environment overrides before CLI
/// parsing, preserving the precedence: CLI > env > config file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tcp_sockets: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_port_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_json: Option<bool>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Inject values as environment variables so clap picks them up. Only
    /// sets variables that are not already present in the environment.
    pub fn inject_env(&self) {
        macro_rules! set {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    if std::env::var($env).is_err() {
                        std::env::set_var($env, v.to_string());
                    }
                }
            };
        }
        set!("TUNNELBROKER_PUBLIC_ADDR", self.public_addr);
        set!("TUNNELBROKER_ADMIN_ADDR", self.admin_addr);
        set!("TUNNELBROKER_MAX_TCP_SOCKETS", self.max_tcp_sockets);
        set!("TUNNELBROKER_GRACE_PERIOD_MS", self.grace_period_ms);
        set!("TUNNELBROKER_TUNNEL_PORT_RANGE", self.tunnel_port_range);
        set!("TUNNELBROKER_LOG_LEVEL", self.log_level);
        set!("TUNNELBROKER_LOG_JSON", self.log_json);
    }
}
