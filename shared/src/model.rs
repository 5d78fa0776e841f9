use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    AVG_TILE_BYTES, DEFAULT_CENTER, DEFAULT_MAP_ZOOM, MAX_SNAPSHOT_NAME_LEN, MAX_ZOOM, MIN_ZOOM,
    PREFETCH_LEVELS, VIEWPORT_TILE_SPAN,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("invalid coordinate: lat={0}, lng={1}")]
    InvalidCoordinate(f64, f64),
    #[error("invalid zoom: {0} (expected {min}..={max})", min = MIN_ZOOM, max = MAX_ZOOM)]
    InvalidZoom(i64),
    #[error("value too long ({len} > {max})")]
    TooLong { len: usize, max: usize },
}

/// Validated lat/lng, NaN-safe.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLon {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ValidationError> {
        if !latitude.is_finite()
            || !longitude.is_finite()
            || !(-90.0..=90.0).contains(&latitude)
            || !(-180.0..=180.0).contains(&longitude)
        {
            return Err(ValidationError::InvalidCoordinate(latitude, longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Re-checks a value that arrived through deserialization.
    pub fn validate(self) -> Result<Self, ValidationError> {
        Self::new(self.latitude, self.longitude)
    }
}

impl Default for LatLon {
    fn default() -> Self {
        DEFAULT_CENTER
    }
}

impl fmt::Display for LatLon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}, {:.4}", self.latitude, self.longitude)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Zoom(u8);

impl Zoom {
    pub fn new(value: i64) -> Result<Self, ValidationError> {
        if !(i64::from(MIN_ZOOM)..=i64::from(MAX_ZOOM)).contains(&value) {
            return Err(ValidationError::InvalidZoom(value));
        }
        // Range checked above.
        Ok(Self(value as u8))
    }

    /// For constants known to be inside `MIN_ZOOM..=MAX_ZOOM`.
    pub(crate) const fn new_unchecked(value: u8) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl Default for Zoom {
    fn default() -> Self {
        DEFAULT_MAP_ZOOM
    }
}

impl TryFrom<i64> for Zoom {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Zoom> for u8 {
    fn from(zoom: Zoom) -> Self {
        zoom.0
    }
}

impl fmt::Display for Zoom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creation-time based, strictly increasing within one catalog.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Pending,
    Downloaded,
    Failed,
}

impl SnapshotStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloaded => "downloaded",
            Self::Failed => "failed",
        }
    }
}

/// Display size such as `"3.32 MB"`.
///
/// Stored as text so catalogs written by older shells (which kept only the
/// display string) still load; a value that does not parse counts as zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotSize(String);

impl SnapshotSize {
    pub fn new(display: impl Into<String>) -> Self {
        Self(display.into())
    }

    #[must_use]
    pub fn from_bytes(bytes: u64) -> Self {
        Self(format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric size in megabytes, if the text parses.
    #[must_use]
    pub fn megabytes(&self) -> Option<f64> {
        let trimmed = self.0.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);
        let value: f64 = number.parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let scale = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "MB" | "M" => 1.0,
            "KB" | "K" => 1.0 / 1024.0,
            "GB" | "G" => 1024.0,
            "B" => 1.0 / (1024.0 * 1024.0),
            _ => return None,
        };
        Some(value * scale)
    }
}

impl fmt::Display for SnapshotSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Synthetic footprint: a 3x3 viewport of tiles at `zoom` plus the
/// deeper prefetch levels, each level quadrupling the tile count.
#[must_use]
pub fn estimate_snapshot_bytes(zoom: Zoom) -> u64 {
    let base = zoom.value();
    let deepest = base.saturating_add(PREFETCH_LEVELS).min(MAX_ZOOM);
    let tiles: u64 = (base..=deepest)
        .map(|level| {
            let span = VIEWPORT_TILE_SPAN << (level - base);
            span * span
        })
        .sum();
    tiles * AVG_TILE_BYTES
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapSnapshot {
    pub id: SnapshotId,
    pub name: String,
    pub center: LatLon,
    pub zoom: Zoom,
    pub downloaded_at: DateTime<Utc>,
    pub size: SnapshotSize,
    pub status: SnapshotStatus,
}

impl MapSnapshot {
    /// A fresh `pending` snapshot; `name` falls back to the creation date.
    pub fn pending(
        id: SnapshotId,
        center: LatLon,
        zoom: Zoom,
        created_at: DateTime<Utc>,
        name: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(custom) => {
                let len = custom.chars().count();
                if len > MAX_SNAPSHOT_NAME_LEN {
                    return Err(ValidationError::TooLong {
                        len,
                        max: MAX_SNAPSHOT_NAME_LEN,
                    });
                }
                custom.to_string()
            }
            None => default_snapshot_name(created_at),
        };

        Ok(Self {
            id,
            name,
            center,
            zoom,
            downloaded_at: created_at,
            size: SnapshotSize::from_bytes(estimate_snapshot_bytes(zoom)),
            status: SnapshotStatus::Pending,
        })
    }

    #[must_use]
    pub fn size_megabytes(&self) -> f64 {
        self.size.megabytes().unwrap_or(0.0)
    }
}

#[must_use]
pub fn default_snapshot_name(created_at: DateTime<Utc>) -> String {
    format!("Offline map {}", created_at.format("%Y-%m-%d %H:%M"))
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveMapView {
    pub center: LatLon,
    pub zoom: Zoom,
}

impl ActiveMapView {
    #[must_use]
    pub const fn new(center: LatLon, zoom: Zoom) -> Self {
        Self { center, zoom }
    }
}

impl Default for ActiveMapView {
    fn default() -> Self {
        Self::new(DEFAULT_CENTER, DEFAULT_MAP_ZOOM)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum MapLoadState {
    #[default]
    Loading,
    Ready,
    Error(String),
}

impl MapLoadState {
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(message) => Some(message),
            _ => None,
        }
    }
}
