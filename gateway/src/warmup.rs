//! Best-effort background warm-up.
//!
//! Periodically issues one lightweight GET against each configured backend
//! to reduce the chance that real traffic hits a cold start. Probe results
//! are never recorded and the request path never consults them; a 4xx here
//! says nothing about application health. Every failure is swallowed.

use crate::config::WarmupConfig;
use crate::routing::BackendRegistry;
use http::Method;
use http_body_util::Full;
use hyper::Request;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use url::Url;

type ProbeClient = Client<HttpConnector, Full<Bytes>>;

pub fn spawn(registry: Arc<BackendRegistry>, config: WarmupConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client: ProbeClient = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = config.interval_secs,
            probe_path = %config.probe_path,
            backends = registry.len(),
            "warm-up task starting"
        );

        loop {
            // First tick fires immediately, warming backends at startup
            ticker.tick().await;
            for (name, base) in registry.iter() {
                probe(&client, name, base, &config).await;
            }
        }
    })
}

/// One probe, one attempt, short timeout. No retries here: the next tick
/// probes again anyway.
async fn probe(client: &ProbeClient, name: &str, base: &Url, config: &WarmupConfig) {
    let mut url = base.clone();
    url.set_path(&config.probe_path);

    let request = match Request::builder()
        .method(Method::GET)
        .uri(url.as_str())
        .body(Full::new(Bytes::new()))
    {
        Ok(request) => request,
        Err(err) => {
            tracing::debug!(backend = name, error = %err, "warm-up probe not built");
            return;
        }
    };

    let probe_timeout = Duration::from_secs(config.probe_timeout_secs);
    match timeout(probe_timeout, client.request(request)).await {
        Ok(Ok(response)) => {
            tracing::trace!(backend = name, status = %response.status(), "warm-up probe completed");
        }
        Ok(Err(err)) => {
            tracing::debug!(backend = name, error = %err, "warm-up probe failed");
        }
        Err(_) => {
            tracing::debug!(backend = name, "warm-up probe timed out");
        }
    }
}
