pub mod error;
pub mod models;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use models::{Asset, AssetState, AssetView};
pub use store::{AssetStore, SqliteAssetStore, SqliteAssetStoreBuilder};
