pub mod config;
pub mod diff;
pub mod docker;
pub mod engine;
pub mod error;
pub mod github;
pub mod handlers;
pub mod health;
pub mod models;
pub mod poller;
pub mod ports;
pub mod release_db;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use engine::DeploymentEngine;
use health::HealthService;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DeploymentEngine>,
    pub health: Arc<HealthService>,
}
