use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{LatLon, Zoom};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOptions {
    pub zoom_control: bool,
    pub street_view_control: bool,
    pub full_screen_control: bool,
    pub map_type: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            zoom_control: true,
            street_view_control: false,
            full_screen_control: false,
            map_type: "roadmap".to_string(),
        }
    }
}

/// One attempt to (re)draw the map widget. Outcomes for older attempts
/// are discarded by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub attempt: u64,
    pub center: LatLon,
    pub zoom: Zoom,
    pub options: RenderOptions,
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderError {
    #[error("map widget unavailable: {0}")]
    Unavailable(String),

    #[error("map failed to load: {0}")]
    LoadFailed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MapRenderOperation {
    Render(RenderRequest),
}

impl Operation for MapRenderOperation {
    type Output = Result<(), RenderError>;
}

/// Drives the shell's map widget. Distinct from Crux `Render`, which only
/// asks the shell to redraw the view model.
#[derive(Clone)]
pub struct MapRender<Ev> {
    context: CapabilityContext<MapRenderOperation, Ev>,
}

impl<Ev> Capability<Ev> for MapRender<Ev> {
    type Operation = MapRenderOperation;
    type MappedSelf<MappedEv> = MapRender<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        MapRender::new(self.context.map_event(f))
    }
}

impl<Ev> MapRender<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<MapRenderOperation, Ev>) -> Self {
        Self { context }
    }

    /// Resolves once the widget reports ready or failed for this attempt.
    pub fn render<F>(&self, request: RenderRequest, make_event: F)
    where
        F: FnOnce(u64, Result<(), RenderError>) -> Ev + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let attempt = request.attempt;
            let output = context
                .request_from_shell(MapRenderOperation::Render(request))
                .await;
            context.update_app(make_event(attempt, output));
        });
    }
}
