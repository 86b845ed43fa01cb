//! # suresql-server
//!
//! The gateway node's serving layer: session protocol (authenticate,
//! refresh, expire), the SQL request dispatcher, and the HTTP surface.
//!
//! The node runtime lives in `suresql-core`; this crate wires it behind
//! axum routes:
//!
//! - `/db/connect`, `/db/refresh`, `/db/pingpong`: API-key guarded
//! - `/db/api/status|sql|query|querysql|insert`: bearer guarded, each
//!   request served over the session's own pooled connection
//! - `/health`, `/ready`: open probes
//! - `/monitoring/*`: metrics, alerts and detailed health, basic auth
//! - `/suresql/*`: internal user administration, basic auth
//!
//! ```rust,ignore
//! use suresql_core::node::Node;
//! use suresql_server::Gateway;
//!
//! let node = Node::connect().await?;
//! let gateway = Gateway::start(node);
//! axum::serve(listener, gateway.router()).await?;
//! gateway.shutdown().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod admin;
pub mod auth;
pub mod dispatch;
pub mod monitoring;
pub mod routes;
pub mod wire;

pub use routes::{router, Gateway, ServerState};
