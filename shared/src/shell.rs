//! Native host services for the core's storage and download effects.
//!
//! A shell owns one [`HostServices`] and routes `Effect::KeyValue` and
//! `Effect::TileFetch` requests through it. Map drawing and geolocation
//! stay with the platform UI.

use std::sync::Arc;
use std::time::Duration;

use crux_kv::{KeyValueOperation, KeyValueResult};
use tracing::{debug, warn};

use crate::capabilities::{resolve_operation, KeyValueStore, TileFetchOperation};
use crate::config::{open_store, ConfigError, CoreConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::download::{DownloadPipeline, PipelineError};
use crate::event::Event;

#[derive(Clone)]
pub struct HostServices {
    store: Arc<dyn KeyValueStore>,
    connectivity: ConnectivityMonitor,
    pipeline: Arc<dyn DownloadPipeline>,
    step_timeout: Duration,
}

impl HostServices {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        connectivity: ConnectivityMonitor,
        pipeline: Arc<dyn DownloadPipeline>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            store,
            connectivity,
            pipeline,
            step_timeout,
        }
    }

    /// Installs logging, opens the configured store and the simulated
    /// tile pipeline.
    pub fn from_config(
        config: &CoreConfig,
        connectivity: ConnectivityMonitor,
    ) -> Result<Self, ConfigError> {
        crate::telemetry::init_tracing();
        config.validate()?;
        Ok(Self::new(
            open_store(config)?,
            connectivity,
            Arc::new(config.pipeline()),
            config.step_timeout(),
        ))
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// First event for a fresh core, carrying the initial connectivity sample.
    pub fn start_event(&self) -> Event {
        Event::AppStarted {
            online: self.connectivity.is_online(),
        }
    }

    /// Core event for a runtime online/offline signal; `None` when the
    /// signal repeats the current state.
    pub fn network_event(&self, online: bool) -> Option<Event> {
        self.connectivity
            .set_online(online)
            .then_some(Event::NetworkStatusChanged { online })
    }

    pub fn handle_key_value(&self, operation: &KeyValueOperation) -> KeyValueResult {
        resolve_operation(self.store.as_ref(), operation)
    }

    /// Runs one download step, bounded by the per-step timeout.
    pub async fn fetch_step(&self, operation: &TileFetchOperation) -> Result<(), PipelineError> {
        let TileFetchOperation::FetchStep(request) = operation;
        if !self.connectivity.is_online() {
            return Err(PipelineError("network unavailable".to_string()));
        }

        let fetch = self.pipeline.fetch_step(&request.plan, request.step);
        match tokio::time::timeout(self.step_timeout, fetch).await {
            Ok(result) => {
                debug!(step = request.step, ok = result.is_ok(), "download step finished");
                result
            }
            Err(_) => {
                warn!(step = request.step, timeout = ?self.step_timeout, "download step timed out");
                Err(PipelineError(format!(
                    "step {} timed out after {}ms",
                    request.step,
                    self.step_timeout.as_millis()
                )))
            }
        }
    }
}
