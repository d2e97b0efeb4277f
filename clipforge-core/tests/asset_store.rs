use clipforge_core::{Asset, AssetState, AssetStore, SqliteAssetStore, StoreError};
use tempfile::TempDir;

fn setup_store() -> (TempDir, SqliteAssetStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteAssetStore::builder()
        .path(dir.path().join("data/assets.sqlite"))
        .create_if_missing(true)
        .build()
        .unwrap();
    store.initialize().unwrap();
    (dir, store)
}

#[test]
fn test_asset_crud_round_trip() {
    let (_dir, store) = setup_store();
    let asset = Asset::new("a1", "holiday", "mp4", "/videos/a1.mp4");
    store.put(&asset).unwrap();

    let fetched = store.get("a1").unwrap();
    assert_eq!(fetched.logical_name, "holiday");
    assert_eq!(fetched.state(), AssetState::Idle);
    assert_eq!(fetched.storage_path.to_str(), Some("/videos/a1.mp4"));

    let mut updated = fetched.clone();
    updated.format = "gif".into();
    updated.storage_path = "/videos/a1.gif".into();
    updated.processing_success = Some(true);
    store.put(&updated).unwrap();
    let fetched = store.get("a1").unwrap();
    assert_eq!(fetched.format, "gif");
    assert_eq!(fetched.state(), AssetState::Succeeded);
    assert_eq!(fetched.created_at, asset.created_at);

    assert_eq!(store.list(10).unwrap().len(), 1);
    store.remove(&fetched).unwrap();
    assert!(matches!(store.get("a1"), Err(StoreError::NotFound { .. })));
    assert!(matches!(
        store.remove(&fetched),
        Err(StoreError::NotFound { .. })
    ));
}

#[test]
fn test_begin_processing_is_exclusive() {
    let (_dir, store) = setup_store();
    let mut asset = Asset::new("a1", "holiday", "mp4", "/videos/a1.mp4");
    asset.processing_success = Some(false);
    store.put(&asset).unwrap();

    let started = store.begin_processing("a1", "resize").unwrap();
    assert!(started.processing);
    assert_eq!(started.processing_success, None);
    assert_eq!(started.last_operation.as_deref(), Some("resize"));

    assert!(matches!(
        store.begin_processing("a1", "to_gif"),
        Err(StoreError::Conflict { .. })
    ));
    assert!(matches!(
        store.begin_processing("missing", "to_gif"),
        Err(StoreError::NotFound { .. })
    ));
    assert_eq!(
        store.get("a1").unwrap().last_operation.as_deref(),
        Some("resize")
    );
}

#[test]
fn test_recover_stale_fails_in_flight_records() {
    let (_dir, store) = setup_store();
    store
        .put(&Asset::new("busy", "one", "mp4", "/videos/busy.mp4"))
        .unwrap();
    store
        .put(&Asset::new("idle", "two", "mp4", "/videos/idle.mp4"))
        .unwrap();
    store.begin_processing("busy", "to_segmented").unwrap();

    assert_eq!(store.recover_stale().unwrap(), 1);
    assert_eq!(store.get("busy").unwrap().state(), AssetState::Failed);
    assert_eq!(store.get("idle").unwrap().state(), AssetState::Idle);
    assert_eq!(store.recover_stale().unwrap(), 0);
}

#[test]
fn test_existing_database_required_without_create() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteAssetStore::builder()
        .path(dir.path().join("assets.sqlite"))
        .create_if_missing(false)
        .build()
        .unwrap();
    assert!(matches!(
        store.initialize(),
        Err(StoreError::OpenDatabase { .. })
    ));
    assert!(!dir.path().join("assets.sqlite").exists());
}
