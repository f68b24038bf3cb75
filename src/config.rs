//! Controller configuration
//!
//! Parsed from command-line flags with environment variable fallbacks.

use std::time::Duration;

use clap::Args;

/// Runtime configuration for the Cluster controller
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Maximum number of Clusters reconciled in parallel
    #[arg(long, env = "CLUSTER_CONCURRENCY", default_value_t = 10)]
    pub concurrency: u16,

    /// Include MachinePools in descendant discovery and deletion
    #[arg(long = "machine-pool", env = "EXP_MACHINE_POOL")]
    pub machine_pool: bool,

    /// Only watch Clusters in this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Seconds to wait before re-checking a provider object or CA secret
    #[arg(long, env = "EXTERNAL_READY_WAIT_SECS", default_value_t = 30)]
    pub external_ready_wait_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            machine_pool: false,
            watch_namespace: None,
            external_ready_wait_secs: 30,
            log_json: false,
        }
    }
}

impl ControllerConfig {
    /// Delay before re-checking a provider object that is missing or not ready
    pub fn external_ready_wait(&self) -> Duration {
        Duration::from_secs(self.external_ready_wait_secs)
    }

    /// Enable or disable MachinePool participation
    pub fn with_machine_pool(mut self, enabled: bool) -> Self {
        self.machine_pool = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: ControllerConfig,
    }

    #[test]
    fn test_defaults_match_flag_defaults() {
        let cli = TestCli::parse_from(["test"]);
        assert_eq!(cli.config.concurrency, ControllerConfig::default().concurrency);
        assert_eq!(
            cli.config.external_ready_wait(),
            Duration::from_secs(30)
        );
        assert!(!cli.config.machine_pool);
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = TestCli::parse_from([
            "test",
            "--machine-pool",
            "--concurrency",
            "3",
            "--watch-namespace",
            "capi-system",
        ]);
        assert!(cli.config.machine_pool);
        assert_eq!(cli.config.concurrency, 3);
        assert_eq!(cli.config.watch_namespace.as_deref(), Some("capi-system"));
    }

    #[test]
    fn test_machine_pool_builder() {
        let config = ControllerConfig::default().with_machine_pool(true);
        assert!(config.machine_pool);
    }
}
