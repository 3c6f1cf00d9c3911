pub mod markers;
pub mod schema;

pub use markers::EndMarkerSpec;
pub use schema::{
    CacheConfig, Config, ProviderCatalog, ResolverConfig, StabilizeConfig, MAX_HISTORY_LEN, MIN_STABLE_SAMPLES,
};
