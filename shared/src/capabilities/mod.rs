//! Effects the core asks the shell to perform.
//!
//! Redraws go through Crux `Render` and persistence through `crux_kv`;
//! the map widget, the location sensor and tile fetching are custom
//! capabilities answered by the host.
mod geolocation;
mod kv;
mod map_render;
mod tiles;

pub use crux_core::render::Render;
pub use crux_kv::KeyValue;

pub use self::geolocation::{
    Geolocation, GeolocationError, GeolocationOperation, GeolocationRequest,
};
pub use self::kv::{
    check_value_size, decode_json, encode_json, resolve_operation, KeyNamespace, KeyValueStore,
    KvError, KvKey, MemoryKvStore, StorageErrorCode, MAX_KEY_LENGTH, MAX_VALUE_SIZE,
};
pub use self::map_render::{
    MapRender, MapRenderOperation, RenderError, RenderOptions, RenderRequest,
};
pub use self::tiles::{TileFetch, TileFetchOperation};

use crate::app::App;
use crate::event::Event;

#[derive(crux_core::macros::Effect)]
pub struct Capabilities {
    pub render: Render<Event>,
    pub key_value: KeyValue<Event>,
    pub map_render: MapRender<Event>,
    pub geolocation: Geolocation<Event>,
    pub tile_fetch: TileFetch<Event>,
}

pub mod testing {
    use crux_core::testing::AppTester;

    use super::{App, Effect};

    pub type Tester = AppTester<App, Effect>;

    /// Core under test with every capability captured as an effect.
    pub fn tester() -> Tester {
        AppTester::default()
    }
}
