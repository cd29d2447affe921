use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use txguard_consensus::{ConsensusSettings, NodeProfile, NodeTopology, MAX_OMISSION_RETRIES};
use txguard_transaction::CoordinatorSettings;
use txguard_types::TxGuardError;

/// Optional config file read by [`AppConfig::load`].
pub const DEFAULT_CONFIG_PATH: &str = "config/txguard.toml";

/// Prefix for environment overrides, e.g. `TXGUARD__DEADLOCK__TIMEOUT_MS`.
pub const ENV_PREFIX: &str = "TXGUARD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub deadlock: DeadlockConfig,
    pub transaction: TransactionConfig,
    pub consensus: ConsensusConfig,
    /// Defaults to the five-node reference deployment.
    pub topology: Vec<NodeProfile>,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            deadlock: DeadlockConfig::default(),
            transaction: TransactionConfig::default(),
            consensus: ConsensusConfig::default(),
            topology: NodeTopology::reference().profiles().cloned().collect(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlockConfig {
    pub timeout_ms: u64,
    pub scan_interval_ms: u64,
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            scan_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub timeout_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Tolerated faulty participants (f).
    pub fault_tolerance: usize,
    pub byzantine_timeout_ms: u64,
    pub crash_timeout_ms: u64,
    pub omission_timeout_ms: u64,
    pub omission_max_retries: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            fault_tolerance: 1,
            byzantine_timeout_ms: 30_000,
            crash_timeout_ms: 10_000,
            omission_timeout_ms: 15_000,
            omission_max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl AppConfig {
    /// Defaults, then `config/txguard.toml` if present, then environment.
    pub fn load() -> Result<Self, TxGuardError> {
        Self::load_from(Some(Path::new(DEFAULT_CONFIG_PATH)))
    }

    /// Defaults, then `path` if given and present, then environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self, TxGuardError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TxGuardError::ConfigError(format!("Failed to load config: {}", e)))?;

        settings
            .try_deserialize::<AppConfig>()
            .map_err(|e| TxGuardError::ConfigError(format!("Invalid config: {}", e)))
    }

    pub fn validate(&self) -> Result<(), TxGuardError> {
        if self.consensus.fault_tolerance == 0 {
            return Err(TxGuardError::ConfigError(
                "consensus.fault_tolerance must be at least 1".to_string(),
            ));
        }

        let timeouts = [
            ("deadlock.timeout_ms", self.deadlock.timeout_ms),
            ("deadlock.scan_interval_ms", self.deadlock.scan_interval_ms),
            ("transaction.timeout_ms", self.transaction.timeout_ms),
            ("consensus.byzantine_timeout_ms", self.consensus.byzantine_timeout_ms),
            ("consensus.crash_timeout_ms", self.consensus.crash_timeout_ms),
            ("consensus.omission_timeout_ms", self.consensus.omission_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(TxGuardError::ConfigError(format!("{} cannot be 0", name)));
            }
        }

        if self.topology.is_empty() {
            return Err(TxGuardError::ConfigError(
                "topology cannot be empty".to_string(),
            ));
        }

        if self.consensus.omission_max_retries > MAX_OMISSION_RETRIES {
            return Err(TxGuardError::ConfigError(format!(
                "consensus.omission_max_retries cannot exceed {}",
                MAX_OMISSION_RETRIES
            )));
        }

        let mut seen = BTreeSet::new();
        for profile in &self.topology {
            if !seen.insert(&profile.node_id) {
                return Err(TxGuardError::ConfigError(format!(
                    "duplicate node in topology: {}",
                    profile.node_id
                )));
            }
        }

        // f must leave a 2f+1 majority reachable within the topology.
        let majority = self
            .consensus
            .fault_tolerance
            .checked_mul(2)
            .and_then(|n| n.checked_add(1));
        if !matches!(majority, Some(n) if n <= self.topology.len()) {
            return Err(TxGuardError::ConfigError(format!(
                "consensus.fault_tolerance {} needs at least 2f+1 nodes, topology has {}",
                self.consensus.fault_tolerance,
                self.topology.len()
            )));
        }

        Ok(())
    }

    pub fn deadlock_timeout(&self) -> Duration {
        Duration::from_millis(self.deadlock.timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.deadlock.scan_interval_ms)
    }

    pub fn consensus_settings(&self) -> ConsensusSettings {
        ConsensusSettings {
            fault_tolerance: self.consensus.fault_tolerance,
            byzantine_timeout: Duration::from_millis(self.consensus.byzantine_timeout_ms),
            crash_timeout: Duration::from_millis(self.consensus.crash_timeout_ms),
            omission_timeout: Duration::from_millis(self.consensus.omission_timeout_ms),
            omission_max_retries: self.consensus.omission_max_retries,
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            transaction_timeout: Duration::from_millis(self.transaction.timeout_ms),
        }
    }

    pub fn node_topology(&self) -> Result<NodeTopology, TxGuardError> {
        NodeTopology::new(self.topology.iter().cloned())
    }
}
