use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde_json::json;

use sensorlink_lib::config::{
    BoardConfig, BoardIdentity, BoardStatus, ConfigError, ConfigReconciler, ConfigUpdate,
    LocalConfigStore, ReconcileState,
};
use sensorlink_lib::device::{IdentityResolver, StaticTopology};
use sensorlink_lib::remote::MemoryStore;

const BUS_ID: &str = "/sys/devices/platform/soc/3f980000.usb/usb1/1-1/1-1.2/1-1.2:1.0";

fn ts(text: &str) -> Option<DateTime<Utc>> {
    Some(DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc))
}

fn document(value: serde_json::Value) -> BoardConfig {
    serde_json::from_value(value).unwrap()
}

fn unclaimed() -> BoardConfig {
    document(json!({
        "last_modified": "",
        "settings": {"operator_poll_secs": 30},
        "sensors": [{"name": "pH", "units": "N/A", "path": "/dev/ttyUSB0"}]
    }))
}

fn claimed(id: &str, at: &str) -> BoardConfig {
    document(json!({
        "id": id,
        "status": "Running",
        "last_modified": at,
        "sensors": [{"name": "pH", "units": "N/A", "path": BUS_ID}]
    }))
}

struct Fixture {
    _dir: tempfile::TempDir,
    local: LocalConfigStore,
    memory: MemoryStore,
    reconciler: ConfigReconciler,
}

async fn fixture(initial: &BoardConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let local = LocalConfigStore::new(dir.path().join("config.json"));
    local.save(initial).await.unwrap();
    let memory = MemoryStore::new();
    let reconciler = ConfigReconciler::new(local.clone(), Arc::new(memory.clone()));
    Fixture { _dir: dir, local, memory, reconciler }
}

fn identity() -> IdentityResolver {
    IdentityResolver::new(Box::new(StaticTopology::new(&[("/dev/ttyUSB0", BUS_ID)])))
}

#[tokio::test]
async fn test_unclaimed_local_is_pushed_as_seed() {
    let f = fixture(&unclaimed()).await;
    let mut config = f.local.load().await.unwrap();

    let state = f.reconciler.reconcile(&mut config).await.unwrap();
    assert_eq!(state, ReconcileState::Uninitialized);

    let id = config.id.clone().expect("an id is minted on first push");
    let seeded = f.memory.config(&id).expect("seed record");
    assert_eq!(seeded.status, BoardStatus::Uninitialized);
    assert!(!seeded.is_claimed());

    let saved = f.local.load().await.unwrap();
    assert_eq!(saved.id.as_deref(), Some(id.as_str()));
    assert_eq!(saved.status, BoardStatus::Uninitialized);
    assert!(!saved.is_claimed());

    // Still waiting: never pulled while nobody has claimed it
    assert_eq!(f.reconciler.reconcile(&mut config).await.unwrap(), ReconcileState::Pushed);
    assert_eq!(f.memory.config_ids().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_initialize_waits_for_operator_edit() {
    let f = fixture(&unclaimed()).await;
    let memory = f.memory.clone();

    let operator = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(45)).await;
        let id = memory.config_ids().pop().unwrap();
        let mut edited = memory.config(&id).unwrap();
        edited.last_modified = ts("2024-05-01T10:00:00Z");
        edited.sensors[0].name = "pH,ORP".to_string();
        edited.sensors[0].units = "N/A,mV".to_string();
        memory.put_config(&id, edited);
    });

    let board = BoardIdentity {
        hostname: "greenhouse-3".to_string(),
        ip: "10.0.0.7".to_string(),
        version: "0.1.0".to_string(),
    };
    let config = f.reconciler.initialize(&identity(), board).await.unwrap();
    operator.await.unwrap();

    assert_eq!(config.last_modified, ts("2024-05-01T10:00:00Z"));
    assert_eq!(config.sensors[0].name, "pH,ORP");
    assert_eq!(config.board.hostname, "greenhouse-3");
    // Volatile path normalized on both sides
    assert_eq!(config.sensors[0].path, BUS_ID);
    let id = config.id.clone().unwrap();
    assert_eq!(f.memory.config(&id).unwrap().sensors[0].path, BUS_ID);
    assert_eq!(f.local.load().await.unwrap().sensors[0].path, BUS_ID);
}

#[tokio::test]
async fn test_newer_remote_is_adopted_wholesale() {
    let local = claimed("board-1", "2024-05-01T10:00:00Z");
    let f = fixture(&local).await;

    let mut remote = claimed("board-1", "2024-05-02T08:30:00Z");
    remote.sensors[0].name = "EC".to_string();
    remote.sensors[0].units = "mS/cm".to_string();
    f.memory.put_config("board-1", remote.clone());

    match f.reconciler.check_for_update(&local).await.unwrap() {
        ConfigUpdate::Changed(newer) => {
            assert_eq!(newer.sensors, remote.sensors);
            assert_eq!(newer.last_modified, remote.last_modified);
        }
        other => panic!("expected a change, got {:?}", other),
    }
    assert_eq!(f.local.load().await.unwrap().sensors[0].name, "EC");
}

#[tokio::test]
async fn test_equal_or_older_remote_is_unchanged() {
    let local = claimed("board-1", "2024-05-01T10:00:00Z");
    let f = fixture(&local).await;

    f.memory.put_config("board-1", claimed("board-1", "2024-05-01T10:00:00Z"));
    assert_eq!(f.reconciler.check_for_update(&local).await.unwrap(), ConfigUpdate::Unchanged);

    f.memory.put_config("board-1", claimed("board-1", "2024-04-01T10:00:00Z"));
    assert_eq!(f.reconciler.check_for_update(&local).await.unwrap(), ConfigUpdate::Unchanged);
}

#[tokio::test]
async fn test_deleted_record_is_fatal_for_claimed_board() {
    let local = claimed("board-1", "2024-05-01T10:00:00Z");
    let f = fixture(&local).await;

    assert_eq!(f.reconciler.check_for_update(&local).await.unwrap(), ConfigUpdate::Deleted);

    let err = f
        .reconciler
        .initialize(&identity(), BoardIdentity::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigError::RemoteRecordDeleted(ref id) if id == "board-1"));
}

#[tokio::test]
async fn test_unclaimed_board_with_missing_record_is_reseeded() {
    let mut local = unclaimed();
    local.id = Some("board-9".to_string());
    let f = fixture(&local).await;

    let mut config = f.local.load().await.unwrap();
    let state = f.reconciler.reconcile(&mut config).await.unwrap();
    assert_eq!(state, ReconcileState::Uninitialized);
    assert!(f.memory.config("board-9").is_some());
}

#[tokio::test]
async fn test_status_updates_keep_operator_edits() {
    let local = claimed("board-1", "2024-05-01T10:00:00Z");
    let f = fixture(&local).await;

    // Edited remotely after we last looked
    let mut remote = claimed("board-1", "2024-05-03T00:00:00Z");
    remote.sensors[0].name = "EC".to_string();
    f.memory.put_config("board-1", remote);

    let mut config = local.clone();
    f.reconciler
        .publish_status(&mut config, BoardStatus::Exception)
        .await
        .unwrap();

    let stored = f.memory.config("board-1").unwrap();
    assert_eq!(stored.status, BoardStatus::Exception);
    assert_eq!(stored.sensors[0].name, "EC");
    assert_eq!(stored.last_modified, ts("2024-05-03T00:00:00Z"));
    assert_eq!(f.local.load().await.unwrap().status, BoardStatus::Exception);
}

#[tokio::test]
async fn test_claimed_document_without_id_is_pushed() {
    let mut local = claimed("unused", "2024-05-01T10:00:00Z");
    local.id = None;
    let f = fixture(&local).await;

    let mut config = f
        .reconciler
        .initialize(&identity(), BoardIdentity::default())
        .await
        .unwrap();
    let id = config.id.clone().expect("an id is minted on first push");
    assert_eq!(f.memory.config_ids(), vec![id.clone()]);

    let record = f.memory.config(&id).unwrap();
    assert_eq!(record.last_modified, ts("2024-05-01T10:00:00Z"));
    assert_eq!(record.sensors, local.sensors);
    assert_eq!(f.local.load().await.unwrap().id.as_deref(), Some(id.as_str()));

    assert_eq!(f.reconciler.reconcile(&mut config).await.unwrap(), ReconcileState::Converged);
}

#[tokio::test]
async fn test_unusable_interval_edit_is_rejected() {
    let local = claimed("board-1", "2024-05-01T10:00:00Z");
    let f = fixture(&local).await;

    let mut remote = claimed("board-1", "2024-05-02T08:30:00Z");
    remote.settings.reading_interval_secs = 1e20;
    f.memory.put_config("board-1", remote);

    let err = f.reconciler.check_for_update(&local).await.unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
    assert_eq!(f.local.load().await.unwrap().last_modified, local.last_modified);
}
