use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::{env, io};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::capabilities::{GeolocationRequest, KeyValueStore, KvError, MemoryKvStore};
use crate::catalog::CatalogSettings;
use crate::download::SimulatedPipeline;
use crate::model::{ActiveMapView, LatLon, Zoom};
use crate::offline_store::FileKvStore;
use crate::{
    DEFAULT_CENTER, DEFAULT_DOWNLOAD_TIMEOUT_MS, DEFAULT_GEO_MAX_AGE_MS, DEFAULT_GEO_TIMEOUT_MS,
    DEFAULT_MAP_ZOOM, DEFAULT_STEP_DELAY_MS, DEFAULT_STEP_TIMEOUT_MS,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid default map view: {0}")]
    InvalidDefaultView(String),

    #[error("unknown store backend '{0}' (expected file, sqlite or memory)")]
    UnknownBackend(String),

    #[error("store backend '{0}' is not available on this target")]
    BackendUnavailable(&'static str),

    #[error(transparent)]
    Store(#[from] KvError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    File,
    Sqlite,
    Memory,
}

impl StoreBackend {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "file" | "json" => Ok(Self::File),
            "sqlite" | "db" => Ok(Self::Sqlite),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    pub store_backend: StoreBackend,
    pub store_file_name: String,
    pub database_file_name: String,
    pub download_step_delay_ms: u64,
    pub download_step_timeout_ms: u64,
    pub download_timeout_ms: u64,
    pub default_center_lat: f64,
    pub default_center_lng: f64,
    pub default_zoom: i64,
    pub geo_high_accuracy: bool,
    pub geo_timeout_ms: u64,
    pub geo_max_age_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("offline-maps-data"),
            store_backend: StoreBackend::File,
            store_file_name: "offline-maps.json".to_string(),
            database_file_name: "offline-maps.db".to_string(),
            download_step_delay_ms: DEFAULT_STEP_DELAY_MS,
            download_step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            download_timeout_ms: DEFAULT_DOWNLOAD_TIMEOUT_MS,
            default_center_lat: DEFAULT_CENTER.latitude,
            default_center_lng: DEFAULT_CENTER.longitude,
            default_zoom: i64::from(DEFAULT_MAP_ZOOM.value()),
            geo_high_accuracy: true,
            geo_timeout_ms: DEFAULT_GEO_TIMEOUT_MS,
            geo_max_age_ms: DEFAULT_GEO_MAX_AGE_MS,
        }
    }
}

impl CoreConfig {
    /// Reads overrides from the process environment (and `.env` in dev).
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from `lookup`; unset or malformed values keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let store_backend = lookup("OFFLINE_MAPS_STORE_BACKEND")
            .and_then(|raw| match StoreBackend::parse(&raw) {
                Ok(backend) => Some(backend),
                Err(err) => {
                    debug!(%err, "ignoring store backend override");
                    None
                }
            })
            .unwrap_or(defaults.store_backend);

        Self {
            data_dir: lookup("OFFLINE_MAPS_DATA_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            store_backend,
            store_file_name: parse_string(&lookup, "OFFLINE_MAPS_STORE_FILE", defaults.store_file_name),
            database_file_name: parse_string(&lookup, "OFFLINE_MAPS_DB_FILE", defaults.database_file_name),
            download_step_delay_ms: parse_u64(&lookup, "DOWNLOAD_STEP_DELAY_MS", defaults.download_step_delay_ms),
            download_step_timeout_ms: parse_u64(&lookup, "DOWNLOAD_STEP_TIMEOUT_MS", defaults.download_step_timeout_ms)
                .max(1),
            download_timeout_ms: parse_u64(&lookup, "DOWNLOAD_TIMEOUT_MS", defaults.download_timeout_ms)
                .max(1),
            default_center_lat: parse_f64(&lookup, "DEFAULT_CENTER_LAT", defaults.default_center_lat),
            default_center_lng: parse_f64(&lookup, "DEFAULT_CENTER_LNG", defaults.default_center_lng),
            default_zoom: parse_i64(&lookup, "DEFAULT_MAP_ZOOM", defaults.default_zoom),
            geo_high_accuracy: parse_bool(&lookup, "GEO_HIGH_ACCURACY", defaults.geo_high_accuracy),
            geo_timeout_ms: parse_u64(&lookup, "GEO_TIMEOUT_MS", defaults.geo_timeout_ms),
            geo_max_age_ms: parse_u64(&lookup, "GEO_MAX_AGE_MS", defaults.geo_max_age_ms),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_view().map(|_| ())
    }

    pub fn default_view(&self) -> Result<ActiveMapView, ConfigError> {
        let center = LatLon::new(self.default_center_lat, self.default_center_lng)
            .map_err(|e| ConfigError::InvalidDefaultView(e.to_string()))?;
        let zoom = Zoom::new(self.default_zoom)
            .map_err(|e| ConfigError::InvalidDefaultView(e.to_string()))?;
        Ok(ActiveMapView::new(center, zoom))
    }

    pub fn catalog_settings(&self) -> CatalogSettings {
        CatalogSettings {
            download_timeout: Duration::from_millis(self.download_timeout_ms),
        }
    }

    pub fn pipeline(&self) -> SimulatedPipeline {
        SimulatedPipeline::new(Duration::from_millis(self.download_step_delay_ms))
    }

    /// Shell-side cap on a single tile-fetch step.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.download_step_timeout_ms)
    }

    pub fn geolocation_request(&self) -> GeolocationRequest {
        GeolocationRequest {
            high_accuracy: self.geo_high_accuracy,
            timeout: Duration::from_millis(self.geo_timeout_ms),
            maximum_age: Duration::from_millis(self.geo_max_age_ms),
        }
    }
}

/// Builds the configured durable store.
pub fn open_store(config: &CoreConfig) -> Result<Arc<dyn KeyValueStore>, ConfigError> {
    match config.store_backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryKvStore::new())),
        StoreBackend::File => Ok(Arc::new(FileKvStore::open(
            config.data_dir.join(&config.store_file_name),
        ))),
        #[cfg(not(target_arch = "wasm32"))]
        StoreBackend::Sqlite => Ok(Arc::new(crate::offline_store::SqliteKvStore::open(
            config.data_dir.join(&config.database_file_name),
        )?)),
        #[cfg(target_arch = "wasm32")]
        StoreBackend::Sqlite => Err(ConfigError::BackendUnavailable("sqlite")),
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool(&|key| env::var(key).ok(), "ALLOW_DOTENV", false)
}

fn parse_bool(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_string(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: String) -> String {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

fn parse_u64(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_i64(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: i64) -> i64 {
    lookup(key)
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

fn parse_f64(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: f64) -> f64 {
    lookup(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}
