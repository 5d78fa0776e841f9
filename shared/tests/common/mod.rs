//! Drives a core the way a native shell would: every effect is answered
//! through [`HostServices`] or a canned platform response, and resulting
//! events are fed back until the core goes quiet.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crux_core::testing::Update;
use offline_maps_core::capabilities::testing::{tester, Tester};
use offline_maps_core::capabilities::{GeolocationError, KeyValueStore, MemoryKvStore};
use offline_maps_core::catalog::catalog_key;
use offline_maps_core::download::SimulatedPipeline;
use offline_maps_core::model::{LatLon, MapSnapshot, SnapshotId, SnapshotStatus};
use offline_maps_core::{ConnectivityMonitor, Effect, Event, HostServices, Model, ViewModel};

pub struct Shell {
    pub app: Tester,
    pub model: Model,
    pub host: HostServices,
    pub location: Result<LatLon, GeolocationError>,
    runtime: tokio::runtime::Runtime,
}

impl Shell {
    /// Starts a fresh core over `store` and settles the startup reads.
    pub fn start(store: Arc<dyn KeyValueStore>, online: bool) -> Self {
        let host = HostServices::new(
            store,
            ConnectivityMonitor::new(online),
            Arc::new(SimulatedPipeline::new(Duration::ZERO)),
            Duration::from_secs(5),
        );
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let mut shell = Self {
            app: tester(),
            model: Model::default(),
            location: Err(GeolocationError::PermissionDenied),
            host,
            runtime,
        };
        let started = shell.host.start_event();
        shell.send(started);
        shell
    }

    pub fn send(&mut self, event: Event) {
        let mut events = VecDeque::from([event]);
        let mut effects = VecDeque::new();

        loop {
            if let Some(effect) = effects.pop_front() {
                if let Some(update) = self.answer(effect) {
                    events.extend(update.events);
                    effects.extend(update.effects);
                }
            } else if let Some(event) = events.pop_front() {
                let update = self.app.update(event, &mut self.model);
                events.extend(update.events);
                effects.extend(update.effects);
            } else {
                break;
            }
        }
    }

    /// Runtime online/offline signal; repeats are dropped like a real shell.
    pub fn set_online(&mut self, online: bool) {
        if let Some(event) = self.host.network_event(online) {
            self.send(event);
        }
    }

    pub fn view(&self) -> ViewModel {
        self.app.view(&self.model)
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        self.host.store()
    }

    /// Resolves one request; `None` for effects with no response.
    fn answer(&mut self, effect: Effect) -> Option<Update<Effect, Event>> {
        let update = match effect {
            Effect::Render(_) => return None,
            Effect::KeyValue(mut request) => {
                let output = self.host.handle_key_value(&request.operation);
                self.app.resolve(&mut request, output).unwrap()
            }
            Effect::TileFetch(mut request) => {
                let output = self.runtime.block_on(self.host.fetch_step(&request.operation));
                self.app.resolve(&mut request, output).unwrap()
            }
            Effect::MapRender(mut request) => self.app.resolve(&mut request, Ok(())).unwrap(),
            Effect::Geolocation(mut request) => {
                let output = self.location.clone();
                self.app.resolve(&mut request, output).unwrap()
            }
        };
        Some(update)
    }
}

/// The catalog as written to durable storage.
pub fn persisted(store: &Arc<dyn KeyValueStore>) -> Vec<MapSnapshot> {
    store
        .read(&catalog_key())
        .unwrap()
        .map(|raw| serde_json::from_str(&raw).unwrap())
        .unwrap_or_default()
}

pub fn memory_store() -> Arc<dyn KeyValueStore> {
    Arc::new(MemoryKvStore::new())
}

pub fn seeded_store(snapshots: &[MapSnapshot]) -> Arc<dyn KeyValueStore> {
    let store = MemoryKvStore::new();
    let raw = serde_json::to_string(snapshots).unwrap();
    store.insert_raw(&catalog_key(), raw).unwrap();
    Arc::new(store)
}

pub fn downloaded(id: u64, lat: f64, lng: f64) -> MapSnapshot {
    let mut snapshot = MapSnapshot::pending(
        SnapshotId(id),
        LatLon::new(lat, lng).unwrap(),
        Default::default(),
        chrono::Utc::now(),
        Some(&format!("Region {id}")),
    )
    .unwrap();
    snapshot.status = SnapshotStatus::Downloaded;
    snapshot
}
