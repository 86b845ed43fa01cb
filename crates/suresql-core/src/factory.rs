//! Driver selection and construction
//!
//! Picks the backing engine from configuration. The kind is normalised
//! case-insensitively with surrounding whitespace trimmed; an empty kind
//! selects the replicated embedded store. Unknown kinds fail with the list
//! of supported engines.

use std::sync::Arc;
use tracing::info;

use crate::config::DbmsConfig;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::rqlite::RqliteDriver;

/// Supported engine kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// Raft-replicated embedded SQL store, the default
    Rqlite,
    /// Classical relational server
    Postgres,
}

impl DriverKind {
    /// Normalise a configured kind string.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "" | "RQLITE" => Ok(Self::Rqlite),
            "POSTGRESQL" | "POSTGRES" => Ok(Self::Postgres),
            other => Err(Error::config(format!(
                "unsupported DBMS type: {other} (supported: RQLITE, POSTGRESQL)"
            ))),
        }
    }

    /// The schema-introspection target for this engine.
    pub fn schema_table(&self) -> &'static str {
        match self {
            Self::Rqlite => "sqlite_master",
            Self::Postgres => "information_schema.tables",
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rqlite => write!(f, "RQLITE"),
            Self::Postgres => write!(f, "POSTGRESQL"),
        }
    }
}

/// Construct a driver for the configured engine.
///
/// Every session gets its own driver instance through this call; the
/// instance tags the node status with its driver id.
pub async fn open_database(config: &DbmsConfig) -> Result<Arc<dyn Driver>> {
    let kind = DriverKind::parse(&config.dbms)?;
    info!(%kind, "opening database connection");
    match kind {
        DriverKind::Rqlite => Ok(Arc::new(RqliteDriver::connect(config).await?)),
        #[cfg(feature = "postgres")]
        DriverKind::Postgres => Ok(Arc::new(
            crate::postgres::PostgresDriver::connect(config).await?,
        )),
        #[cfg(not(feature = "postgres"))]
        DriverKind::Postgres => Err(Error::config(
            "PostgreSQL support is not compiled in (enable the `postgres` feature)",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_normalisation() {
        assert_eq!(DriverKind::parse("").unwrap(), DriverKind::Rqlite);
        assert_eq!(DriverKind::parse("  rqlite ").unwrap(), DriverKind::Rqlite);
        assert_eq!(DriverKind::parse("RQLITE").unwrap(), DriverKind::Rqlite);
        assert_eq!(
            DriverKind::parse("postgresql").unwrap(),
            DriverKind::Postgres
        );
        assert_eq!(DriverKind::parse("Postgres").unwrap(), DriverKind::Postgres);
    }

    #[test]
    fn test_unknown_kind_lists_supported() {
        let err = DriverKind::parse("oracle").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("ORACLE"));
        assert!(message.contains("RQLITE"));
        assert!(message.contains("POSTGRESQL"));
    }

    #[test]
    fn test_schema_targets() {
        assert_eq!(DriverKind::Rqlite.schema_table(), "sqlite_master");
        assert_eq!(
            DriverKind::Postgres.schema_table(),
            "information_schema.tables"
        );
    }
}
