use serde::{Deserialize, Serialize};

use crate::capabilities::GeolocationError;
use crate::download::PipelineError;
use crate::model::{LatLon, MapLoadState, SnapshotId, Zoom};

/// Result of a key-value effect, with the store error already stringified.
pub type KvReadResult = Result<Option<Vec<u8>>, String>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Event {
    // Lifecycle
    AppStarted {
        online: bool,
    },

    // Connectivity (runtime "online"/"offline" signals)
    NetworkStatusChanged {
        online: bool,
    },

    // Downloads; `center: None` downloads the region currently in view.
    DownloadRequested {
        center: Option<LatLon>,
        zoom: Option<Zoom>,
        name: Option<String>,
    },
    DownloadCancelled,
    DownloadRetried,

    // Catalog
    SnapshotSelected {
        id: SnapshotId,
    },
    SelectionCleared,
    SnapshotDeleted {
        id: SnapshotId,
    },

    // Map widget
    MapMoved {
        center: LatLon,
        zoom: Zoom,
    },
    MapLoadStateReported {
        attempt: u64,
        state: MapLoadState,
    },

    // Location
    LocateRequested,

    ToastDismissed,

    // Capability responses (boxed to keep enum size small)
    CatalogLoaded {
        result: Box<KvReadResult>,
    },
    LastLocationLoaded {
        result: Box<KvReadResult>,
    },
    CatalogPersisted {
        result: Box<Result<(), String>>,
    },
    LocationPersisted {
        result: Box<Result<(), String>>,
    },
    DownloadStepCompleted {
        snapshot_id: SnapshotId,
        result: Box<Result<(), PipelineError>>,
    },
    LocationReceived(Box<Result<LatLon, GeolocationError>>),
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AppStarted { .. } => "app_started",
            Self::NetworkStatusChanged { .. } => "network_status_changed",
            Self::DownloadRequested { .. } => "download_requested",
            Self::DownloadCancelled => "download_cancelled",
            Self::DownloadRetried => "download_retried",
            Self::SnapshotSelected { .. } => "snapshot_selected",
            Self::SelectionCleared => "selection_cleared",
            Self::SnapshotDeleted { .. } => "snapshot_deleted",
            Self::MapMoved { .. } => "map_moved",
            Self::MapLoadStateReported { .. } => "map_load_state_reported",
            Self::LocateRequested => "locate_requested",
            Self::ToastDismissed => "toast_dismissed",
            Self::CatalogLoaded { .. } => "catalog_loaded",
            Self::LastLocationLoaded { .. } => "last_location_loaded",
            Self::CatalogPersisted { .. } => "catalog_persisted",
            Self::LocationPersisted { .. } => "location_persisted",
            Self::DownloadStepCompleted { .. } => "download_step_completed",
            Self::LocationReceived(_) => "location_received",
        }
    }

    #[must_use]
    pub const fn is_user_initiated(&self) -> bool {
        matches!(
            self,
            Self::DownloadRequested { .. }
                | Self::DownloadCancelled
                | Self::DownloadRetried
                | Self::SnapshotSelected { .. }
                | Self::SelectionCleared
                | Self::SnapshotDeleted { .. }
                | Self::LocateRequested
                | Self::ToastDismissed
        )
    }
}
