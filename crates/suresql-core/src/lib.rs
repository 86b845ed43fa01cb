//! # suresql-core
//!
//! Runtime of a single SureSQL gateway node: a network-facing middleware
//! that fronts one or more backing SQL engines and leases each
//! authenticated session its own database connection.
//!
//! ## Components
//!
//! - **TTL maps** ([`ttl_map`]): ordered expiring stores behind the token
//!   and connection lifecycles
//! - **Driver contract** ([`driver`]): the capability object every backing
//!   engine implements; backends for the replicated embedded store
//!   ([`rqlite`]), PostgreSQL ([`postgres`], feature `postgres`), and an
//!   in-memory double ([`memory`])
//! - **Configuration** ([`config`]): defaults → persisted config row →
//!   settings rows → environment, resolved in that order
//! - **Session plumbing** ([`token`], [`pool`]): dual-keyed token store and
//!   the bounded token→connection pool
//! - **Node state** ([`node`]): the per-process assembly, passed to
//!   handlers as an explicit `Arc`
//! - **Observability** ([`metrics`], [`alert`], [`cleanup`]): counters and
//!   health scoring, the cooldown-suppressed alert engine, and the expired
//!   connection reclaimer
//!
//! ## Feature flags
//!
//! - `postgres`: PostgreSQL backend via tokio-postgres

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod alert;
pub mod cleanup;
pub mod config;
pub mod driver;
pub mod error;
pub mod factory;
pub mod memory;
pub mod metrics;
pub mod node;
pub mod pool;
pub mod rqlite;
pub mod schema;
pub mod token;
pub mod ttl_map;
pub mod validate;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::alert::{Alert, AlertEngine, AlertLevel, AlertObservation, AlertStats};
    pub use crate::cleanup::CleanupSupervisor;
    pub use crate::config::{ConfigRow, DbmsConfig, ResolvedConfig, SettingRow, Settings};
    pub use crate::driver::{
        Driver, ExecResult, Filter, NodeStatus, ParameterizedSql, Record, TableSchema,
    };
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::factory::{open_database, DriverKind};
    pub use crate::memory::MemoryDriver;
    pub use crate::metrics::{GaugeInputs, HealthReport, HealthStatus, MetricsSnapshot, NodeMetrics};
    pub use crate::node::{ping, Node, APP_NAME, APP_VERSION};
    pub use crate::pool::ConnectionPool;
    pub use crate::token::{TokenRecord, TokenStore};
    pub use crate::ttl_map::TtlMap;
}

pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _filter = Filter::leaf("id", "=", 1);
        let _record = Record::new("orders");
        let _config = ConfigRow::default();
        assert!(ping().contains(APP_NAME));
    }
}
