use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::model::LatLon;

/// Accuracy, timeout and cache-age knobs passed through to the OS sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeolocationRequest {
    pub high_accuracy: bool,
    pub timeout: Duration,
    pub maximum_age: Duration,
}

impl Default for GeolocationRequest {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_millis(crate::DEFAULT_GEO_TIMEOUT_MS),
            maximum_age: Duration::from_millis(crate::DEFAULT_GEO_MAX_AGE_MS),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeolocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("position unavailable: {reason}")]
    PositionUnavailable { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum GeolocationOperation {
    CurrentPosition(GeolocationRequest),
}

impl Operation for GeolocationOperation {
    type Output = Result<LatLon, GeolocationError>;
}

/// One-shot position fix from the device sensor.
#[derive(Clone)]
pub struct Geolocation<Ev> {
    context: CapabilityContext<GeolocationOperation, Ev>,
}

impl<Ev> Capability<Ev> for Geolocation<Ev> {
    type Operation = GeolocationOperation;
    type MappedSelf<MappedEv> = Geolocation<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Geolocation::new(self.context.map_event(f))
    }
}

impl<Ev> Geolocation<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<GeolocationOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn current_position<F>(&self, request: GeolocationRequest, make_event: F)
    where
        F: FnOnce(Result<LatLon, GeolocationError>) -> Ev + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let output = context
                .request_from_shell(GeolocationOperation::CurrentPosition(request))
                .await;
            context.update_app(make_event(output));
        });
    }
}
