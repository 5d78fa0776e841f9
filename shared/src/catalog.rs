//! Offline catalog: the ordered list of downloaded map snapshots.
//!
//! The catalog is plain state. Whoever mutates it encodes it with
//! [`OfflineCatalog::encode`] and writes the whole array back under
//! [`catalog_key`] in the same update. Several cores over one store (e.g.
//! two tabs) are not coordinated; the last writer wins.

use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capabilities::{encode_json, KeyNamespace, KvError, KvKey};
use crate::download::{ActiveDownload, DownloadError, DownloadStep, PipelineError, StepRequest};
use crate::model::{LatLon, MapSnapshot, SnapshotId, SnapshotStatus, Zoom};
use crate::{utc_from_ms, CATALOG_KEY, DEFAULT_DOWNLOAD_TIMEOUT_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogSettings {
    /// Upper bound on a whole download, measured from `begin_download`.
    pub download_timeout: Duration,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            download_timeout: Duration::from_millis(DEFAULT_DOWNLOAD_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
    /// Download that was in flight when the catalog was reloaded.
    pub superseded: Option<DownloadError>,
}

pub fn catalog_key() -> KvKey {
    KvKey::new_unchecked(KeyNamespace::UserData, CATALOG_KEY)
}

#[derive(Debug, Clone, Default)]
pub struct OfflineCatalog {
    snapshots: Vec<MapSnapshot>,
    selected: Option<SnapshotId>,
    settings: CatalogSettings,
    active: Option<ActiveDownload>,
    last_failed: Option<MapSnapshot>,
    last_id: u64,
}

impl OfflineCatalog {
    pub fn new(settings: CatalogSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Replaces in-memory state with the persisted entries.
    ///
    /// Entries are parsed one by one; anything malformed, not `downloaded`,
    /// or carrying a duplicate id is skipped so one bad record cannot hide
    /// the rest. A download still in flight is aborted and kept as the
    /// last failure.
    pub fn initialize(&mut self, stored: Vec<serde_json::Value>) -> LoadReport {
        let mut report = LoadReport {
            superseded: self.abort_if_active(|progress| DownloadError::Superseded { progress }),
            ..LoadReport::default()
        };
        let mut snapshots: Vec<MapSnapshot> = Vec::with_capacity(stored.len());

        for (index, value) in stored.into_iter().enumerate() {
            match Self::parse_entry(value) {
                Ok(snapshot) if snapshots.iter().any(|s| s.id == snapshot.id) => {
                    warn!(index, snapshot_id = %snapshot.id, "skipping duplicate catalog entry");
                    report.skipped += 1;
                }
                Ok(snapshot) => snapshots.push(snapshot),
                Err(reason) => {
                    warn!(index, %reason, "skipping unreadable catalog entry");
                    report.skipped += 1;
                }
            }
        }

        report.loaded = snapshots.len();
        self.last_id = snapshots
            .iter()
            .map(|s| s.id.as_u64())
            .max()
            .unwrap_or(0)
            .max(self.last_id);
        self.snapshots = snapshots;
        self.selected = None;

        info!(loaded = report.loaded, skipped = report.skipped, "offline catalog loaded");
        report
    }

    fn parse_entry(value: serde_json::Value) -> Result<MapSnapshot, String> {
        let snapshot: MapSnapshot = serde_json::from_value(value).map_err(|e| e.to_string())?;
        snapshot.center.validate().map_err(|e| e.to_string())?;
        if snapshot.status != SnapshotStatus::Downloaded {
            return Err(format!("status is {}", snapshot.status.as_str()));
        }
        Ok(snapshot)
    }

    /// The whole catalog as the JSON array stored under [`catalog_key`].
    pub fn encode(&self) -> Result<Vec<u8>, KvError> {
        encode_json(&catalog_key(), &self.snapshots)
    }

    pub fn snapshots(&self) -> &[MapSnapshot] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn get(&self, id: SnapshotId) -> Option<&MapSnapshot> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    // --- selection ---

    pub fn selected_snapshot(&self) -> Option<&MapSnapshot> {
        self.selected.and_then(|id| self.get(id))
    }

    pub fn selected_id(&self) -> Option<SnapshotId> {
        self.selected
    }

    /// Unknown ids leave the selection as it was.
    pub fn select_snapshot(&mut self, id: SnapshotId) -> Option<&MapSnapshot> {
        if self.get(id).is_none() {
            debug!(snapshot_id = %id, "select ignored, snapshot not in catalog");
            return None;
        }
        self.selected = Some(id);
        debug!(snapshot_id = %id, "snapshot selected");
        self.get(id)
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    // --- deletion ---

    /// Removes `id` if present. Absent ids are a no-op, not an error.
    pub fn delete_snapshot(&mut self, id: SnapshotId) -> Option<MapSnapshot> {
        let index = self.snapshots.iter().position(|s| s.id == id)?;
        let removed = self.snapshots.remove(index);

        if self.selected == Some(id) {
            self.selected = None;
        }

        info!(snapshot_id = %id, remaining = self.snapshots.len(), "snapshot deleted");
        Some(removed)
    }

    // --- storage ---

    /// Megabytes across the catalog; unparsable sizes count as zero.
    pub fn total_storage_used(&self) -> f64 {
        // `Sum for f64` starts from -0.0.
        self.snapshots
            .iter()
            .fold(0.0, |acc, s| acc + s.size_megabytes())
    }

    // --- downloads ---

    pub fn is_downloading(&self) -> bool {
        self.active.is_some()
    }

    /// 0 while idle.
    pub fn download_progress(&self) -> u8 {
        self.active.as_ref().map_or(0, ActiveDownload::progress)
    }

    pub fn pending_snapshot(&self) -> Option<&MapSnapshot> {
        self.active.as_ref().map(|a| &a.snapshot)
    }

    /// Most recent aborted download, kept with `status = failed`.
    pub fn last_failed(&self) -> Option<&MapSnapshot> {
        self.last_failed.as_ref()
    }

    fn next_id(&mut self, now_ms: u64) -> SnapshotId {
        let id = now_ms.max(self.last_id + 1);
        self.last_id = id;
        SnapshotId(id)
    }

    /// Moves the machine from idle to downloading and returns the first
    /// step for the shell.
    ///
    /// Rejected without any state change while offline or while another
    /// download is active.
    pub fn begin_download(
        &mut self,
        online: bool,
        now_ms: u64,
        center: LatLon,
        zoom: Zoom,
        name: Option<&str>,
    ) -> Result<StepRequest, DownloadError> {
        if !online {
            debug!("download rejected while offline");
            return Err(DownloadError::ConnectivityRequired);
        }
        if self.active.is_some() {
            debug!("download rejected, another one is in flight");
            return Err(DownloadError::AlreadyInProgress);
        }

        let center = center
            .validate()
            .map_err(|e| DownloadError::Invalid(e.to_string()))?;
        let created_at = utc_from_ms(now_ms);
        let id = self.next_id(now_ms);
        let snapshot = MapSnapshot::pending(id, center, zoom, created_at, name)
            .map_err(|e| DownloadError::Invalid(e.to_string()))?;

        let active = ActiveDownload::new(snapshot, now_ms);
        let first = active.next_step();
        self.active = Some(active);
        info!(snapshot_id = %id, %center, %zoom, "download started");

        Ok(first)
    }

    /// Records one finished step for `snapshot_id`. The last step commits:
    /// the snapshot becomes `downloaded` and is appended.
    ///
    /// Results for any other download are stale and rejected. Losing
    /// connectivity or running past the timeout aborts the download.
    pub fn advance_download(
        &mut self,
        snapshot_id: SnapshotId,
        online: bool,
        now_ms: u64,
    ) -> Result<DownloadStep, DownloadError> {
        let Some(active) = self.active.as_ref() else {
            return Err(DownloadError::NotInProgress);
        };
        if active.snapshot.id != snapshot_id {
            debug!(%snapshot_id, "ignoring step for a download that is no longer active");
            return Err(DownloadError::NotInProgress);
        }
        if !online {
            return Err(self.abort(|progress| DownloadError::ConnectivityLost { progress }));
        }

        let elapsed_ms = active.elapsed_ms(now_ms);
        let budget_ms = u64::try_from(self.settings.download_timeout.as_millis()).unwrap_or(u64::MAX);
        if elapsed_ms > budget_ms {
            return Err(self.abort(|progress| DownloadError::Timeout {
                elapsed_ms,
                progress,
            }));
        }

        let next = match self.active.as_mut() {
            Some(active) => {
                if !active.advance() {
                    active.next_step()
                } else {
                    return Ok(DownloadStep::Committed(self.commit()?));
                }
            }
            None => return Err(DownloadError::NotInProgress),
        };
        debug!(progress = self.download_progress(), "download progress");
        Ok(DownloadStep::Continue(next))
    }

    fn commit(&mut self) -> Result<MapSnapshot, DownloadError> {
        let active = self.active.take().ok_or(DownloadError::NotInProgress)?;
        let mut snapshot = active.snapshot;
        snapshot.status = SnapshotStatus::Downloaded;
        self.snapshots.push(snapshot.clone());
        self.last_failed = None;

        info!(
            snapshot_id = %snapshot.id,
            size = %snapshot.size,
            total = self.snapshots.len(),
            "download committed"
        );
        Ok(snapshot)
    }

    /// The shell could not fetch a step. `None` for stale results.
    pub fn fail_download(
        &mut self,
        snapshot_id: SnapshotId,
        error: &PipelineError,
    ) -> Option<DownloadError> {
        if self.active.as_ref()?.snapshot.id != snapshot_id {
            return None;
        }
        let message = error.to_string();
        Some(self.abort(|progress| DownloadError::Pipeline { message, progress }))
    }

    /// User-initiated cancel. `None` when nothing was in flight.
    pub fn cancel_download(&mut self) -> Option<DownloadError> {
        self.abort_if_active(|progress| DownloadError::Cancelled { progress })
    }

    /// Cancels an in-flight download because the network dropped.
    pub fn handle_connectivity_lost(&mut self) -> Option<DownloadError> {
        self.abort_if_active(|progress| DownloadError::ConnectivityLost { progress })
    }

    fn abort_if_active(
        &mut self,
        make_error: impl FnOnce(u8) -> DownloadError,
    ) -> Option<DownloadError> {
        self.active.as_ref()?;
        Some(self.abort(make_error))
    }

    fn abort(&mut self, make_error: impl FnOnce(u8) -> DownloadError) -> DownloadError {
        let progress = self.download_progress();
        let error = make_error(progress);
        if let Some(active) = self.active.take() {
            let mut failed = active.snapshot;
            failed.status = SnapshotStatus::Failed;
            warn!(snapshot_id = %failed.id, error = %error, "download aborted");
            self.last_failed = Some(failed);
        }
        error
    }

    /// Restarts the last failed download with the same region and name.
    pub fn retry_download(&mut self, online: bool, now_ms: u64) -> Result<StepRequest, DownloadError> {
        let failed = self.last_failed.clone().ok_or(DownloadError::NotInProgress)?;
        let first = self.begin_download(online, now_ms, failed.center, failed.zoom, Some(&failed.name))?;
        self.last_failed = None;
        Ok(first)
    }

    // --- export ---

    pub fn to_geojson(&self) -> FeatureCollection {
        let features = self
            .snapshots
            .iter()
            .map(|snapshot| {
                let mut properties = JsonObject::new();
                properties.insert("id".into(), snapshot.id.as_u64().into());
                properties.insert("name".into(), snapshot.name.clone().into());
                properties.insert("zoom".into(), snapshot.zoom.value().into());
                properties.insert("size".into(), snapshot.size.as_str().into());
                properties.insert(
                    "downloadedAt".into(),
                    snapshot.downloaded_at.to_rfc3339().into(),
                );
                properties.insert(
                    "selected".into(),
                    (self.selected == Some(snapshot.id)).into(),
                );

                Feature {
                    bbox: None,
                    geometry: Some(Geometry::new(Value::Point(vec![
                        snapshot.center.longitude,
                        snapshot.center.latitude,
                    ]))),
                    id: None,
                    properties: Some(properties),
                    foreign_members: None,
                }
            })
            .collect();

        FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        }
    }
}
