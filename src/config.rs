use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser};

use crate::cluster::router::BalancerKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    Static,
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsSink {
    Prometheus,
    Memory,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "respgate", version, about = "Multi-tenant RESP proxy")]
pub struct ProxyConfig {
    /// RESP listener port.
    #[arg(long = "port", default_value_t = 6378)]
    pub port: u16,

    /// Admin HTTP listener port.
    #[arg(long = "service-port", default_value_t = 7080)]
    pub service_port: u16,

    /// Run a multi-threaded runtime.
    #[arg(long = "multi-core", default_value_t = true, action = ArgAction::Set)]
    pub multi_core: bool,

    /// Worker threads; 0 picks one per core.
    #[arg(long = "core-num", default_value_t = 0)]
    pub core_num: usize,

    #[command(flatten)]
    pub router: RouterConfig,

    #[command(flatten)]
    pub backend_pool: BackendPoolConfig,

    #[command(flatten)]
    pub metrics: MetricsConfig,

    #[command(flatten)]
    pub node: NodeConfig,
}

#[derive(Debug, Clone, Args)]
pub struct RouterConfig {
    /// Backend router mode: static or sync.
    #[arg(long = "router.type")]
    pub router_type: String,

    /// Backend address for static mode (host:port).
    #[arg(long = "router.static-be")]
    pub static_backend: Option<String>,

    /// Control-plane address for sync mode (host:port).
    #[arg(long = "router.cp-addr")]
    pub cp_addr: Option<String>,

    /// Balancer across a tenant's instances: random, round-robin,
    /// least-conn.
    #[arg(long = "router.balancer", default_value = "random")]
    pub balancer: String,
}

#[derive(Debug, Clone, Args)]
pub struct BackendPoolConfig {
    /// Connections per backend pool.
    #[arg(long = "backend-pool.max-size", default_value_t = 30)]
    pub max_size: usize,

    /// Idle connections kept per backend pool.
    #[arg(long = "backend-pool.max-idle", default_value_t = 10)]
    pub max_idle: usize,

    /// Dial the full population up front and keep it full.
    #[arg(long = "backend-pool.fixed", default_value_t = true, action = ArgAction::Set)]
    pub fixed: bool,
}

#[derive(Debug, Clone, Args)]
pub struct MetricsConfig {
    /// Expose metrics on the admin listener.
    #[arg(long = "metrics.enable", default_value_t = false, action = ArgAction::Set)]
    pub enable: bool,

    /// Exposition format: prometheus or memory.
    #[arg(long = "metrics.sink", default_value = "prometheus")]
    pub sink: String,

    /// HTTP path of the metrics endpoint.
    #[arg(long = "metrics.path", default_value = "/metrics")]
    pub path: String,
}

#[derive(Debug, Clone, Args)]
pub struct NodeConfig {
    /// Node identity label.
    #[arg(long = "node.id", default_value = "local_proxy")]
    pub id: String,

    /// Node namespace label.
    #[arg(long = "node.namespace", default_value = "default")]
    pub namespace: String,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("invalid proxy port: 0");
        }
        if self.service_port == 0 {
            bail!("invalid service port: 0");
        }
        self.router.validate()?;
        self.metrics.validate()?;
        Ok(())
    }
}

impl RouterConfig {
    pub fn mode(&self) -> Result<RouterMode> {
        match self.router_type.to_ascii_lowercase().as_str() {
            "static" => Ok(RouterMode::Static),
            "sync" => Ok(RouterMode::Sync),
            other => bail!("invalid router type: {other} (must be 'static' or 'sync')"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.mode()? {
            RouterMode::Static => {
                if self.static_backend.is_none() {
                    bail!("static backend address (--router.static-be) is required for router type: static");
                }
                if self.cp_addr.is_some() {
                    bail!("control plane address (--router.cp-addr) must not be set for router type: static");
                }
                self.static_endpoint()?;
            }
            RouterMode::Sync => {
                if self.cp_addr.is_none() {
                    bail!("control plane address (--router.cp-addr) is required for router type: sync");
                }
                if self.static_backend.is_some() {
                    bail!("static backend address (--router.static-be) must not be set for router type: sync");
                }
            }
        }
        self.balancer_kind()?;
        Ok(())
    }

    pub fn static_endpoint(&self) -> Result<(String, u16)> {
        let addr = self
            .static_backend
            .as_deref()
            .context("static backend address is not set")?;
        let (host, port_str) = addr
            .rsplit_once(':')
            .with_context(|| format!("invalid static backend address: {addr}"))?;
        if host.is_empty() {
            bail!("invalid static backend address: {addr}");
        }
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid static backend port: {port_str}"))?;
        Ok((host.to_string(), port))
    }

    pub fn balancer_kind(&self) -> Result<BalancerKind> {
        BalancerKind::parse(&self.balancer)
            .with_context(|| format!("invalid balancer type: {}", self.balancer))
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<()> {
        self.sink_kind()?;
        if !self.path.starts_with('/') {
            bail!("metrics path must start with '/': {}", self.path);
        }
        Ok(())
    }

    pub fn sink_kind(&self) -> Result<MetricsSink> {
        match self.sink.to_ascii_lowercase().as_str() {
            "prometheus" => Ok(MetricsSink::Prometheus),
            "memory" => Ok(MetricsSink::Memory),
            other => bail!("invalid metrics sink: {other} (must be 'prometheus' or 'memory')"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ProxyConfig {
        let mut full = vec!["respgate"];
        full.extend_from_slice(args);
        ProxyConfig::try_parse_from(full).expect("arguments must parse")
    }

    #[test]
    fn static_mode_round_trip() {
        let config = parse(&[
            "--router.type",
            "static",
            "--router.static-be",
            "127.0.0.1:6379",
        ]);
        config.validate().unwrap();
        assert_eq!(config.port, 6378);
        assert_eq!(config.service_port, 7080);
        assert_eq!(config.router.mode().unwrap(), RouterMode::Static);
        assert_eq!(
            config.router.static_endpoint().unwrap(),
            ("127.0.0.1".to_string(), 6379)
        );
        assert_eq!(config.backend_pool.max_size, 30);
        assert_eq!(config.backend_pool.max_idle, 10);
        assert!(config.backend_pool.fixed);
    }

    #[test]
    fn static_mode_requires_backend_address() {
        let config = parse(&["--router.type", "static"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn static_mode_forbids_cp_addr() {
        let config = parse(&[
            "--router.type",
            "static",
            "--router.static-be",
            "127.0.0.1:6379",
            "--router.cp-addr",
            "127.0.0.1:9000",
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn sync_mode_requires_cp_addr() {
        let config = parse(&["--router.type", "sync"]);
        assert!(config.validate().is_err());

        let config = parse(&["--router.type", "sync", "--router.cp-addr", "cp:9000"]);
        config.validate().unwrap();
        assert_eq!(config.router.mode().unwrap(), RouterMode::Sync);
    }

    #[test]
    fn rejects_unknown_router_and_balancer() {
        let config = parse(&["--router.type", "magic"]);
        assert!(config.validate().is_err());

        let config = parse(&[
            "--router.type",
            "static",
            "--router.static-be",
            "127.0.0.1:6379",
            "--router.balancer",
            "weighted",
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn metrics_flags_parse() {
        let config = parse(&[
            "--router.type",
            "static",
            "--router.static-be",
            "b:1",
            "--metrics.enable",
            "true",
            "--metrics.sink",
            "memory",
        ]);
        config.validate().unwrap();
        assert!(config.metrics.enable);
        assert_eq!(config.metrics.sink_kind().unwrap(), MetricsSink::Memory);
    }

    #[test]
    fn bad_static_endpoint_shapes_fail() {
        for bad in ["nocolon", ":6379", "host:notaport"] {
            let config = parse(&["--router.type", "static", "--router.static-be", bad]);
            assert!(config.validate().is_err(), "{bad} must fail validation");
        }
    }
}
