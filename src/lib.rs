pub mod config;
pub mod db;
pub mod error;
pub mod gateway;

use std::sync::Arc;

use config::Config;
use db::store::SessionStore;
use gateway::realip::RealIpResolver;
use gateway::registry::ConnectionRegistry;

/// Shared application state available to all connection handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn SessionStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub realip: Arc<RealIpResolver>,
}
