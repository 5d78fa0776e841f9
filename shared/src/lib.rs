//! Offline map snapshot core.
//!
//! A Crux core that keeps a catalog of downloaded map regions, drives the
//! single-flight download machine, tracks connectivity and owns the active
//! map view. Storage, map drawing, tile fetching and geolocation are shell
//! effects requested through [`Capabilities`]; [`shell::HostServices`]
//! answers the storage and download effects on native hosts.

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::must_use_candidate)]

pub mod app;
pub mod capabilities;
pub mod catalog;
pub mod config;
pub mod connectivity;
pub mod download;
pub mod event;
pub mod map_view;
pub mod model;
pub mod offline_store;
pub mod shell;
pub mod telemetry;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::capabilities::{GeolocationError, KvError};
use crate::download::DownloadError;
use crate::model::{LatLon, Zoom};

pub use app::{App, Model, SnapshotRow, ToastView, ViewModel};
pub use capabilities::{Capabilities, Effect};
pub use catalog::OfflineCatalog;
pub use config::CoreConfig;
pub use connectivity::ConnectivityMonitor;
pub use crux_core::App as CruxApp;
pub use event::Event;
pub use shell::HostServices;

pub const DEFAULT_CENTER: LatLon = LatLon {
    latitude: 22.5726,
    longitude: 88.3639,
};
pub const DEFAULT_MAP_ZOOM: Zoom = Zoom::new_unchecked(12);
pub const MIN_ZOOM: u8 = 1;
pub const MAX_ZOOM: u8 = 20;

pub const DOWNLOAD_STEPS: u8 = 10;
pub const DOWNLOAD_STEP_PERCENT: u8 = 10;
pub const DEFAULT_STEP_DELAY_MS: u64 = 300;
pub const DEFAULT_DOWNLOAD_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;

pub const CATALOG_KEY: &str = "offline-maps";
pub const LAST_LOCATION_KEY: &str = "last-known-location";
pub const MAX_SNAPSHOT_NAME_LEN: usize = 80;

pub const AVG_TILE_BYTES: u64 = 18 * 1024;
pub const PREFETCH_LEVELS: u8 = 2;
pub const VIEWPORT_TILE_SPAN: u64 = 3;

pub const DEFAULT_GEO_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_GEO_MAX_AGE_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Connectivity,
    Timeout,
    Validation,
    NotFound,
    Storage,
    Download,
    Location,
    LocationPermissionDenied,
    MapRender,
    InvalidState,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Connectivity => "CONNECTIVITY_REQUIRED",
            Self::Timeout => "TIMEOUT",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Storage => "STORAGE_ERROR",
            Self::Download => "DOWNLOAD_ERROR",
            Self::Location => "LOCATION_ERROR",
            Self::LocationPermissionDenied => "LOCATION_PERMISSION_DENIED",
            Self::MapRender => "MAP_RENDER_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Connectivity
            | Self::Timeout
            | Self::Storage
            | Self::Download
            | Self::Location
            | Self::MapRender => ErrorSeverity::Transient,

            Self::Internal => ErrorSeverity::Fatal,

            Self::Validation
            | Self::NotFound
            | Self::LocationPermissionDenied
            | Self::InvalidState => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Connectivity
                | Self::Timeout
                | Self::Storage
                | Self::Download
                | Self::Location
                | Self::MapRender
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Connectivity => {
                "You are offline. Connect to the internet to download maps.".into()
            }
            ErrorKind::Timeout => "The download took too long. Please try again.".into(),
            ErrorKind::Validation | ErrorKind::Download => self.message.clone(),
            ErrorKind::NotFound => "That offline map no longer exists.".into(),
            ErrorKind::Storage => {
                "Unable to save offline maps on this device. Changes last until you close the app."
                    .into()
            }
            ErrorKind::Location => "Unable to determine your location.".into(),
            ErrorKind::LocationPermissionDenied => {
                "Location access is required to center the map on you.".into()
            }
            ErrorKind::MapRender => "The map could not be displayed. Please retry.".into(),
            ErrorKind::InvalidState => "Another download is already running.".into(),
            ErrorKind::Internal => "An unexpected error occurred. Please try again.".into(),
        }
    }

    /// Toast shown for this error; transient failures are warnings.
    #[must_use]
    pub fn to_toast(&self, now_ms: u64) -> ToastMessage {
        let kind = match self.severity {
            ErrorSeverity::Transient => ToastKind::Warning,
            ErrorSeverity::Permanent | ErrorSeverity::Fatal => ToastKind::Error,
        };
        ToastMessage::new(self.user_facing_message(), kind, now_ms)
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

impl From<DownloadError> for AppError {
    fn from(e: DownloadError) -> Self {
        let kind = match &e {
            DownloadError::ConnectivityRequired | DownloadError::ConnectivityLost { .. } => {
                ErrorKind::Connectivity
            }
            DownloadError::AlreadyInProgress | DownloadError::NotInProgress => {
                ErrorKind::InvalidState
            }
            DownloadError::Timeout { .. } => ErrorKind::Timeout,
            DownloadError::Invalid(_) => ErrorKind::Validation,
            DownloadError::Pipeline { .. }
            | DownloadError::Cancelled { .. }
            | DownloadError::Superseded { .. } => ErrorKind::Download,
        };
        let message = match &e {
            DownloadError::Cancelled { .. } => "Download cancelled.".to_string(),
            DownloadError::Pipeline { .. } => "Download failed. Please try again.".to_string(),
            other => other.to_string(),
        };
        Self::new(kind, message).with_internal(e.to_string())
    }
}

impl From<KvError> for AppError {
    fn from(e: KvError) -> Self {
        match &e {
            KvError::InvalidKey { .. } | KvError::ValueTooLarge { .. } => {
                Self::new(ErrorKind::Internal, "Invalid storage request").with_internal(e.to_string())
            }
            KvError::Storage { code, .. } => Self::new(ErrorKind::Storage, "Storage unavailable")
                .with_internal(e.to_string())
                .with_context("storage_code", format!("{code:?}")),
            KvError::Serialization { key, .. } => {
                let error = Self::new(ErrorKind::Storage, "Stored data could not be encoded")
                    .with_internal(e.to_string());
                match key {
                    Some(key) => error.with_context("key", key.clone()),
                    None => error,
                }
            }
        }
    }
}

impl From<GeolocationError> for AppError {
    fn from(e: GeolocationError) -> Self {
        let kind = match &e {
            GeolocationError::PermissionDenied => ErrorKind::LocationPermissionDenied,
            GeolocationError::Timeout { .. } | GeolocationError::PositionUnavailable { .. } => {
                ErrorKind::Location
            }
        };
        Self::new(kind, e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToastMessage {
    pub message: String,
    pub kind: ToastKind,
    pub created_at_ms: u64,
    pub duration_ms: u64,
}

impl ToastMessage {
    #[must_use]
    pub fn new(message: impl Into<String>, kind: ToastKind, now_ms: u64) -> Self {
        Self {
            message: message.into(),
            kind,
            created_at_ms: now_ms,
            duration_ms: kind.default_duration_ms(),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > self.duration_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToastKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl ToastKind {
    #[must_use]
    pub const fn default_duration_ms(self) -> u64 {
        match self {
            Self::Info => 3000,
            Self::Success => 2000,
            Self::Warning => 4000,
            Self::Error => 5000,
        }
    }
}

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Millisecond timestamp as UTC; out-of-range values fall back to the epoch.
#[must_use]
pub fn utc_from_ms(ms: u64) -> chrono::DateTime<chrono::Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .unwrap_or_default()
}
