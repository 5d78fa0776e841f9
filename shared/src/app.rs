//! The Crux app: catalog, connectivity flag and map view in one [`Model`].
//!
//! Every mutation of the catalog issues its `KeyValue::set` in the same
//! update, every visible change ends with a `Render`, and every failure
//! ends up as a dismissible toast.

use crux_kv::error::KeyValueError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capabilities::{
    decode_json, encode_json, Capabilities, GeolocationError, GeolocationRequest, KeyNamespace,
    KvKey, RenderRequest,
};
use crate::catalog::{catalog_key, OfflineCatalog};
use crate::config::{ConfigError, CoreConfig};
use crate::download::{DownloadError, DownloadStep, StepRequest};
use crate::event::{Event, KvReadResult};
use crate::map_view::{load_state_from, MapViewController};
use crate::model::{LatLon, MapLoadState, MapSnapshot, SnapshotId, SnapshotStatus};
use crate::{get_current_time_ms, AppError, ErrorKind, ToastKind, ToastMessage, LAST_LOCATION_KEY};

pub fn last_location_key() -> KvKey {
    KvKey::new_unchecked(KeyNamespace::UserData, LAST_LOCATION_KEY)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRow {
    pub id: SnapshotId,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub zoom: u8,
    pub size: String,
    pub downloaded_at: String,
    pub status: SnapshotStatus,
    pub is_selected: bool,
}

impl SnapshotRow {
    fn from_snapshot(snapshot: &MapSnapshot, is_selected: bool) -> Self {
        Self {
            id: snapshot.id,
            name: snapshot.name.clone(),
            latitude: snapshot.center.latitude,
            longitude: snapshot.center.longitude,
            zoom: snapshot.zoom.value(),
            size: snapshot.size.as_str().to_string(),
            downloaded_at: snapshot.downloaded_at.format("%Y-%m-%d %H:%M").to_string(),
            status: snapshot.status,
            is_selected,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToastView {
    pub message: String,
    pub kind: ToastKind,
    pub duration_ms: u64,
}

impl From<&ToastMessage> for ToastView {
    fn from(t: &ToastMessage) -> Self {
        Self {
            message: t.message.clone(),
            kind: t.kind,
            duration_ms: t.duration_ms,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ViewModel {
    pub snapshots: Vec<SnapshotRow>,
    pub selected_id: Option<SnapshotId>,
    pub online: bool,
    pub is_downloading: bool,
    pub download_progress: u8,
    pub can_download: bool,
    pub total_storage_used: String,
    pub map_center_lat: f64,
    pub map_center_lng: f64,
    pub map_zoom: u8,
    pub map_load_state: MapLoadState,
    pub toast: Option<ToastView>,
    pub last_failed: Option<SnapshotRow>,
}

#[derive(Debug, Clone, Default)]
pub struct Model {
    pub catalog: OfflineCatalog,
    pub map_view: MapViewController,
    pub online: bool,
    pub last_location: Option<LatLon>,
    pub toast: Option<ToastMessage>,
    pub geolocation_request: GeolocationRequest,
    pub now_ms: u64,
}

impl Model {
    /// Model with the configured default view, timeouts and sensor knobs.
    pub fn from_config(config: &CoreConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            catalog: OfflineCatalog::new(config.catalog_settings()),
            map_view: MapViewController::new(config.default_view()?),
            geolocation_request: config.geolocation_request(),
            ..Self::default()
        })
    }

    fn show_error(&mut self, error: AppError) {
        warn!(code = error.code(), error = %error, "surfacing error");
        self.toast = Some(error.to_toast(self.now_ms));
    }

    fn show_toast(&mut self, message: impl Into<String>, kind: ToastKind) {
        self.toast = Some(ToastMessage::new(message, kind, self.now_ms));
    }
}

#[derive(Default)]
pub struct App;

impl App {
    fn persist_catalog(model: &mut Model, caps: &Capabilities) {
        match model.catalog.encode() {
            Ok(bytes) => caps
                .key_value
                .set(catalog_key().raw(), bytes, |result| Event::CatalogPersisted {
                    result: Box::new(write_outcome(result)),
                }),
            Err(e) => model.show_error(AppError::from(e)),
        }
    }

    fn persist_location(position: LatLon, caps: &Capabilities) {
        let key = last_location_key();
        match encode_json(&key, &position) {
            Ok(bytes) => caps.key_value.set(key.raw(), bytes, |result| Event::LocationPersisted {
                result: Box::new(write_outcome(result)),
            }),
            Err(e) => warn!(error = %e, "last known location not encoded"),
        }
    }

    fn request_map(request: RenderRequest, caps: &Capabilities) {
        caps.map_render.render(request, |attempt, outcome| {
            Event::MapLoadStateReported {
                attempt,
                state: load_state_from(&outcome),
            }
        });
    }

    fn fetch_step(request: StepRequest, caps: &Capabilities) {
        let snapshot_id = request.plan.snapshot_id;
        caps.tile_fetch.fetch_step(request, move |result| Event::DownloadStepCompleted {
            snapshot_id,
            result: Box::new(result),
        });
    }

    fn on_committed(model: &mut Model, snapshot: &MapSnapshot, caps: &Capabilities) {
        info!(snapshot_id = %snapshot.id, "offline map ready");
        model.show_toast(
            format!("\"{}\" is available offline", snapshot.name),
            ToastKind::Success,
        );
        Self::persist_catalog(model, caps);
    }

    fn apply_location(
        model: &mut Model,
        result: Result<LatLon, GeolocationError>,
        caps: &Capabilities,
    ) {
        let zoom = model.map_view.active_view().zoom;
        let follow = model.catalog.selected_id().is_none();

        match result {
            Ok(position) => {
                model.last_location = Some(position);
                Self::persist_location(position, caps);
                if follow {
                    Self::request_map(model.map_view.set_view(position, zoom), caps);
                }
            }
            Err(err) => {
                warn!(error = %err, "location unavailable");
                model.show_error(AppError::from(err));
                if let (true, Some(last)) = (follow, model.last_location) {
                    debug!(%last, "falling back to last known location");
                    Self::request_map(model.map_view.set_view(last, zoom), caps);
                }
            }
        }
    }
}

impl crux_core::App for App {
    type Event = Event;
    type Model = Model;
    type ViewModel = ViewModel;
    type Capabilities = Capabilities;

    fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
        model.now_ms = get_current_time_ms();
        debug!(
            event = event.name(),
            user_initiated = event.is_user_initiated(),
            "handling event"
        );

        match event {
            Event::AppStarted { online } => {
                model.online = online;
                caps.key_value.get(catalog_key().raw(), |result| Event::CatalogLoaded {
                    result: Box::new(read_outcome(result)),
                });
                caps.key_value
                    .get(last_location_key().raw(), |result| Event::LastLocationLoaded {
                        result: Box::new(read_outcome(result)),
                    });
                Self::request_map(model.map_view.reset_to_default(), caps);
            }

            Event::CatalogLoaded { result } => {
                let stored: Vec<serde_json::Value> =
                    decode_json(&catalog_key(), *result).unwrap_or_default();
                let report = model.catalog.initialize(stored);
                if let Some(err) = report.superseded {
                    model.show_error(AppError::from(err));
                } else if report.skipped > 0 {
                    model.show_toast(
                        format!("{} saved map(s) could not be restored", report.skipped),
                        ToastKind::Warning,
                    );
                }
            }

            Event::LastLocationLoaded { result } => {
                model.last_location = decode_json(&last_location_key(), *result);
                return;
            }

            Event::CatalogPersisted { result } => {
                let Err(message) = *result else {
                    return;
                };
                // In-memory state stays as mutated.
                model.show_error(
                    AppError::new(ErrorKind::Storage, "Storage unavailable").with_internal(message),
                );
            }

            Event::LocationPersisted { result } => {
                if let Err(message) = *result {
                    warn!(%message, "last known location not persisted");
                }
                return;
            }

            Event::NetworkStatusChanged { online } => {
                if model.online == online {
                    return;
                }
                model.online = online;
                info!(online, "connectivity changed");
                if !online {
                    if let Some(err) = model.catalog.handle_connectivity_lost() {
                        model.show_error(AppError::from(err));
                    }
                }
            }

            Event::DownloadRequested { center, zoom, name } => {
                let active = model.map_view.active_view();
                let started = model.catalog.begin_download(
                    model.online,
                    model.now_ms,
                    center.unwrap_or(active.center),
                    zoom.unwrap_or(active.zoom),
                    name.as_deref(),
                );
                match started {
                    Ok(first) => Self::fetch_step(first, caps),
                    Err(err) => model.show_error(AppError::from(err)),
                }
            }

            Event::DownloadStepCompleted {
                snapshot_id,
                result,
            } => match *result {
                Ok(()) => {
                    match model
                        .catalog
                        .advance_download(snapshot_id, model.online, model.now_ms)
                    {
                        Ok(DownloadStep::Continue(next)) => Self::fetch_step(next, caps),
                        Ok(DownloadStep::Committed(snapshot)) => {
                            Self::on_committed(model, &snapshot, caps);
                        }
                        Err(DownloadError::NotInProgress) => return,
                        Err(err) => model.show_error(AppError::from(err)),
                    }
                }
                Err(error) => match model.catalog.fail_download(snapshot_id, &error) {
                    Some(err) => model.show_error(AppError::from(err)),
                    None => return,
                },
            },

            Event::DownloadCancelled => {
                let Some(err) = model.catalog.cancel_download() else {
                    return;
                };
                model.show_toast(err.to_string(), ToastKind::Info);
            }

            Event::DownloadRetried => {
                if model.catalog.last_failed().is_none() {
                    debug!("nothing to retry");
                    return;
                }
                match model.catalog.retry_download(model.online, model.now_ms) {
                    Ok(first) => Self::fetch_step(first, caps),
                    Err(err) => model.show_error(AppError::from(err)),
                }
            }

            Event::SnapshotSelected { id } => {
                let Some(snapshot) = model.catalog.select_snapshot(id).cloned() else {
                    return;
                };
                Self::request_map(model.map_view.on_snapshot_selected(&snapshot), caps);
            }

            Event::SelectionCleared => model.catalog.clear_selection(),

            Event::SnapshotDeleted { id } => {
                let Some(removed) = model.catalog.delete_snapshot(id) else {
                    return;
                };
                model.show_toast(format!("Deleted \"{}\"", removed.name), ToastKind::Info);
                Self::persist_catalog(model, caps);
            }

            Event::MapMoved { center, zoom } => model.map_view.record_camera(center, zoom),

            Event::MapLoadStateReported { attempt, state } => {
                let failure = state.error_message().map(str::to_string);
                if !model.map_view.report_load_state_for(attempt, state) {
                    return;
                }
                if let Some(message) = failure {
                    model.show_error(AppError::new(ErrorKind::MapRender, message));
                }
            }

            Event::LocateRequested => {
                caps.geolocation
                    .current_position(model.geolocation_request, |result| {
                        Event::LocationReceived(Box::new(result))
                    });
                return;
            }

            Event::LocationReceived(result) => Self::apply_location(model, *result, caps),

            Event::ToastDismissed => model.toast = None,
        }

        caps.render.render();
    }

    fn view(&self, model: &Model) -> ViewModel {
        let selected_id = model.catalog.selected_id();
        let active = model.map_view.active_view();

        ViewModel {
            snapshots: model
                .catalog
                .snapshots()
                .iter()
                .map(|s| SnapshotRow::from_snapshot(s, Some(s.id) == selected_id))
                .collect(),
            selected_id,
            online: model.online,
            is_downloading: model.catalog.is_downloading(),
            download_progress: model.catalog.download_progress(),
            can_download: model.online && !model.catalog.is_downloading(),
            total_storage_used: format!("{:.2} MB", model.catalog.total_storage_used()),
            map_center_lat: active.center.latitude,
            map_center_lng: active.center.longitude,
            map_zoom: active.zoom.value(),
            map_load_state: model.map_view.load_state().clone(),
            toast: model
                .toast
                .as_ref()
                .filter(|t| !t.is_expired(model.now_ms))
                .map(ToastView::from),
            last_failed: model
                .catalog
                .last_failed()
                .map(|s| SnapshotRow::from_snapshot(s, false)),
        }
    }
}

fn read_outcome(result: Result<Option<Vec<u8>>, KeyValueError>) -> KvReadResult {
    result.map_err(|e| format!("{e:?}"))
}

fn write_outcome(result: Result<Option<Vec<u8>>, KeyValueError>) -> Result<(), String> {
    result.map(|_| ()).map_err(|e| format!("{e:?}"))
}
