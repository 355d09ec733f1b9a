//! Multi-tenant object storage gateway.
//!
//! See `SPEC_FULL.md` at the repository root for the full design. The crate
//! is organized around the four subsystems that make up the engineering
//! core: tenant resolution (`tenant`, `db::broker`), the storage state
//! machine (`orchestrator`, `db::metadata`, `blob`), the durable job queue
//! (`queue`), and the orphan scanner (`scanner`).

pub mod auth;
pub mod blob;
pub mod bootstrap;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod http;
pub mod keyed_mutex;
pub mod orchestrator;
pub mod pubsub;
pub mod queue;
pub mod scanner;
pub mod tenant;

pub use error::{GatewayError, Result};
