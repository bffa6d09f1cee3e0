pub mod config;
pub mod errors;
pub mod forwarder;
pub mod relay;
pub mod rewrite;
pub mod routing;
pub mod service;
pub mod warmup;

use crate::config::Config;
use crate::errors::GatewayError;
use crate::service::{GatewayService, GatewayState};
use std::sync::Arc;

/// Builds the immutable state from config, starts the warm-up task when
/// enabled, and serves until the listener fails.
pub async fn run(config: Config) -> Result<(), GatewayError> {
    let listener = config.listener.clone();
    let state = Arc::new(GatewayState::new(&config));

    if config.warmup.enabled {
        warmup::spawn(Arc::new(state.registry.clone()), config.warmup.clone());
    }

    let service = GatewayService::new(state);
    shared::http::run_http_service(&listener.host, listener.port, service).await
}
