//! TxGuard: distributed transaction coordination core
//!
//! Ties together the wait-for graph deadlock detector, the failure-aware
//! consensus mechanism and the transaction coordinator, configured from a
//! TOML file and `TXGUARD__*` environment variables.
//!
//! # Example
//!
//! ```no_run
//! use txguard::{AppConfig, TransactionSystem};
//! use txguard_types::NodeId;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AppConfig::load()?;
//! txguard::init_tracing(&config.logging.level, config.logging.format);
//!
//! let system = TransactionSystem::from_config(config)?;
//! let _monitor = system.spawn_monitor();
//!
//! let coordinator = system.coordinator();
//! let tx = coordinator.begin_transaction();
//! let participants = ["Edge1", "Edge2", "Core1", "Core2"].map(NodeId::from);
//! coordinator.prepare(&tx, &participants).await?;
//! coordinator.commit(&tx).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod system;
pub mod telemetry;

pub use config::{AppConfig, LogFormat};
pub use system::TransactionSystem;
pub use telemetry::init_tracing;
