//! Server configuration from flags and environment.

use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use pathview_engine::EngineConfig;
use pathview_session::{DEFAULT_STEP_EXPR, ManagerConfig, RegistryConfig};

#[derive(Debug, Clone, Parser)]
#[command(name = "pathview-server")]
#[command(about = "Session-scoped code execution kernel", long_about = None)]
pub struct Config {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Allow any origin
    #[arg(long, env = "PATHVIEW_PRODUCTION")]
    pub production: bool,

    /// Seconds a session may sit idle before it is destroyed
    #[arg(long, env = "PATHVIEW_SESSION_IDLE_SECS", default_value_t = 3600)]
    pub session_idle_secs: u64,

    /// Seconds between idle-session sweeps
    #[arg(long, env = "PATHVIEW_REAP_INTERVAL_SECS", default_value_t = 60)]
    pub reap_interval_secs: u64,

    /// Default budget for run/evaluate calls
    #[arg(long, env = "PATHVIEW_EXEC_TIMEOUT_MS")]
    pub exec_timeout_ms: Option<u64>,

    /// Default budget for each step of a stream
    #[arg(long, env = "PATHVIEW_STEP_TIMEOUT_MS")]
    pub step_timeout_ms: Option<u64>,

    /// Step expression for streams opened without one
    #[arg(long, env = "PATHVIEW_STEP_EXPR", default_value = DEFAULT_STEP_EXPR)]
    pub step_expr: String,

    /// Treat diagnostic output as ordinary output instead of a failure
    #[arg(long, env = "PATHVIEW_WARNINGS_ARE_OUTPUT")]
    pub warnings_are_output: bool,
}

impl Config {
    /// Socket address from `host` and `port`.
    ///
    /// # Errors
    /// Returns error if `host` is not an IP address.
    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        let ip = self.host.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }

    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            registry: RegistryConfig {
                idle_timeout: Duration::from_secs(self.session_idle_secs),
            },
            engine: EngineConfig {
                diagnostics_fail: !self.warnings_are_output,
            },
            exec_budget: self.exec_timeout_ms.map(Duration::from_millis),
            step_budget: self.step_timeout_ms.map(Duration::from_millis),
            step_expr: self.step_expr.clone(),
        }
    }
}
