//! Shared application state for the object surface and the admin surface
//! (spec.md §6, §9 "Process-wide state").

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Settings;
use crate::db::broker::ConnectionBroker;
use crate::orchestrator::Orchestrator;
use crate::scanner::OrphanScanner;
use crate::tenant::registry::TenantRegistry;

/// Process-global handle set, cloned cheaply (every field is an `Arc`) into
/// every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub broker: Arc<ConnectionBroker>,
    pub registry: Arc<TenantRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub scanner: Arc<OrphanScanner>,
    pub registry_pool: PgPool,
    pub http_client: reqwest::Client,
}
