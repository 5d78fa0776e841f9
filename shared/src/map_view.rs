use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capabilities::{RenderError, RenderOptions, RenderRequest};
use crate::model::{ActiveMapView, LatLon, MapLoadState, MapSnapshot, Zoom};

/// Owns the active center/zoom and the load state of the external map.
///
/// Every redraw is numbered; the returned [`RenderRequest`] goes to the
/// shell and its outcome comes back tagged with the same attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapViewController {
    default_view: ActiveMapView,
    view: ActiveMapView,
    options: RenderOptions,
    load_state: MapLoadState,
    attempt: u64,
}

impl Default for MapViewController {
    fn default() -> Self {
        Self::new(ActiveMapView::default())
    }
}

impl MapViewController {
    pub fn new(default_view: ActiveMapView) -> Self {
        Self {
            default_view,
            view: default_view,
            options: RenderOptions::default(),
            load_state: MapLoadState::Loading,
            attempt: 0,
        }
    }

    pub fn active_view(&self) -> ActiveMapView {
        self.view
    }

    pub fn load_state(&self) -> &MapLoadState {
        &self.load_state
    }

    /// Id of the latest render request.
    pub fn current_attempt(&self) -> u64 {
        self.attempt
    }

    /// Updates the view and builds the redraw request. Also the retry path
    /// after an `Error` load state.
    pub fn set_view(&mut self, center: LatLon, zoom: Zoom) -> RenderRequest {
        self.view = ActiveMapView::new(center, zoom);
        self.attempt += 1;
        self.load_state = MapLoadState::Loading;

        debug!(attempt = self.attempt, %center, %zoom, "map render requested");
        RenderRequest {
            attempt: self.attempt,
            center,
            zoom,
            options: self.options.clone(),
        }
    }

    pub fn on_snapshot_selected(&mut self, snapshot: &MapSnapshot) -> RenderRequest {
        self.set_view(snapshot.center, snapshot.zoom)
    }

    pub fn reset_to_default(&mut self) -> RenderRequest {
        let ActiveMapView { center, zoom } = self.default_view;
        self.set_view(center, zoom)
    }

    /// Records a user pan/zoom reported by the map itself; no redraw.
    pub fn record_camera(&mut self, center: LatLon, zoom: Zoom) {
        self.view = ActiveMapView::new(center, zoom);
    }

    /// Applies a ready/error signal, dropping signals from superseded
    /// attempts. Returns whether the signal was applied.
    pub fn report_load_state_for(&mut self, attempt: u64, state: MapLoadState) -> bool {
        if attempt != self.attempt {
            debug!(attempt, current = self.attempt, "stale map load signal ignored");
            return false;
        }
        if let MapLoadState::Error(message) = &state {
            warn!(attempt, %message, "map failed to load");
        }
        self.load_state = state;
        true
    }
}

/// Load state for the shell's answer to a render request.
pub fn load_state_from(outcome: &Result<(), RenderError>) -> MapLoadState {
    match outcome {
        Ok(()) => MapLoadState::Ready,
        Err(e) => MapLoadState::Error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::model::{SnapshotId, SnapshotStatus};

    fn at(lat: f64, lng: f64) -> LatLon {
        LatLon::new(lat, lng).unwrap()
    }

    #[test]
    fn test_set_view_builds_render_request() {
        let mut view = MapViewController::default();

        let request = view.set_view(at(10.0, 20.0), Zoom::new(7).unwrap());

        assert_eq!(request.attempt, 1);
        assert_eq!(request.zoom.value(), 7);
        assert_eq!(request.options, RenderOptions::default());
        assert_eq!(view.active_view().center, at(10.0, 20.0));
        assert_eq!(view.load_state(), &MapLoadState::Loading);
    }

    #[test]
    fn test_snapshot_selection_moves_view() {
        let mut view = MapViewController::default();
        let mut snap = MapSnapshot::pending(
            SnapshotId(1),
            at(-33.86, 151.2),
            Zoom::new(14).unwrap(),
            Utc::now(),
            None,
        )
        .unwrap();
        snap.status = SnapshotStatus::Downloaded;

        view.on_snapshot_selected(&snap);

        assert_eq!(view.active_view(), ActiveMapView::new(snap.center, snap.zoom));
    }

    #[test]
    fn test_error_then_set_view_retries() {
        let mut view = MapViewController::default();
        let first = view.set_view(at(1.0, 1.0), Zoom::new(5).unwrap());

        view.report_load_state_for(first.attempt, MapLoadState::Error("tiles 404".into()));
        assert_eq!(view.load_state().error_message(), Some("tiles 404"));

        let retry = view.set_view(at(1.0, 1.0), Zoom::new(5).unwrap());
        assert_eq!(view.load_state(), &MapLoadState::Loading);
        assert!(view.report_load_state_for(retry.attempt, MapLoadState::Ready));
        assert_eq!(view.load_state(), &MapLoadState::Ready);
    }

    #[test]
    fn test_stale_signal_is_ignored() {
        let mut view = MapViewController::default();
        let first = view.set_view(at(1.0, 1.0), Zoom::new(5).unwrap());
        view.set_view(at(2.0, 2.0), Zoom::new(6).unwrap());

        assert!(!view.report_load_state_for(first.attempt, MapLoadState::Error("late".into())));
        assert_eq!(view.load_state(), &MapLoadState::Loading);
    }

    #[test]
    fn test_render_failure_maps_to_error_state() {
        let state = load_state_from(&Err(RenderError::Unavailable("api key missing".into())));
        assert_eq!(
            state.error_message(),
            Some("map widget unavailable: api key missing")
        );
        assert_eq!(load_state_from(&Ok(())), MapLoadState::Ready);
    }

    #[test]
    fn test_reset_returns_to_default_view() {
        let mut view = MapViewController::default();
        view.set_view(at(3.0, 3.0), Zoom::new(3).unwrap());

        let request = view.reset_to_default();

        assert_eq!(view.active_view(), ActiveMapView::default());
        assert_eq!(request.attempt, 2);
    }

    #[test]
    fn test_camera_moves_do_not_redraw() {
        let mut view = MapViewController::default();
        view.record_camera(at(5.0, 5.0), Zoom::new(9).unwrap());

        assert_eq!(view.active_view().zoom.value(), 9);
        assert_eq!(view.current_attempt(), 0);
    }
}
