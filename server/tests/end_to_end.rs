//! Two clients replicating through a real server on a local port.

use backend::dbs;
use backend::sync::{SyncClient, SyncOptions, SyncOutcome};
use backend::{Storage, StorageConfig, StorageOptions};
use server::AppState;
use shared::models::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const KEY: &str = "e2e-key";

struct Device {
    _dir: TempDir,
    storage: Arc<dyn Storage>,
    sync: SyncClient,
}

async fn start_server() -> (TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let storage = dbs::open(
        &StorageConfig::Sqlite {
            path: dir.path().join("server.sqlite3"),
        },
        StorageOptions::default(),
    )
    .await
    .unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(server::serve(listener, AppState::new(storage, KEY)));
    (dir, url)
}

async fn device(server_url: &str, client_id: &str, api_key: &str) -> Device {
    let dir = tempfile::tempdir().unwrap();
    let storage = dbs::open(
        &StorageConfig::Local {
            path: dir.path().join("parlor.json"),
        },
        StorageOptions::default(),
    )
    .await
    .unwrap();
    let mut config = storage.get_config().await.unwrap();
    config.sync = SyncSettings {
        server_url: Some(server_url.to_string()),
        client_id: Some(client_id.to_string()),
        api_key: Some(api_key.to_string()),
    };
    storage.save_config(&config).await.unwrap();
    let sync = SyncClient::new(
        storage.clone(),
        SyncOptions {
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    )
    .unwrap();
    Device {
        _dir: dir,
        storage,
        sync,
    }
}

async fn pass(device: &Device) -> usize {
    match device.sync.sync().await.unwrap() {
        SyncOutcome::Completed(report) => {
            assert!(report.rejected.is_empty(), "rejected: {:?}", report.rejected);
            report.written()
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn devices_converge_through_the_server() {
    let (_server_dir, url) = start_server().await;
    let laptop = device(&url, "laptop", KEY).await;
    let phone = device(&url, "phone", KEY).await;
    assert!(laptop.sync.health_check().await);

    let ada = laptop
        .storage
        .persist_characters(vec![NewCharacter::new(
            CharacterPayload {
                name: "Ada".into(),
                first_messages: vec!["Hello there.".into()],
                ..Default::default()
            },
            None,
        )])
        .await
        .unwrap()
        .created
        .remove(0);
    let chat_id = laptop
        .storage
        .save_new_chat(NewChat {
            character_id: ada.uuid,
            initial_history: Vec::new(),
        })
        .await
        .unwrap();

    // the server already holds everything the laptop pushed
    assert_eq!(pass(&laptop).await, 0);
    assert_eq!(pass(&phone).await, 2);
    assert!(phone.storage.get_chat(chat_id).await.unwrap().is_some());

    let mut edit = phone.storage.get_character(ada.uuid).await.unwrap().unwrap();
    edit.personality = "Edited on the phone".into();
    phone.storage.update_character(edit).await.unwrap();
    pass(&phone).await;
    assert_eq!(pass(&laptop).await, 1);
    let on_laptop = laptop.storage.get_character(ada.uuid).await.unwrap().unwrap();
    assert_eq!(on_laptop.personality, "Edited on the phone");

    // nothing changed, so nothing is written anywhere
    assert_eq!(pass(&laptop).await, 0);
    assert_eq!(pass(&phone).await, 0);
    assert_eq!(
        laptop.storage.sync_snapshot().await.unwrap(),
        phone.storage.sync_snapshot().await.unwrap()
    );

    laptop.storage.delete_character(ada.uuid).await.unwrap();
    pass(&laptop).await;
    pass(&phone).await;
    assert!(phone.storage.get_character(ada.uuid).await.unwrap().is_none());
    assert!(phone.storage.list_characters().await.unwrap().is_empty());
}

#[tokio::test]
async fn wrong_key_fails_health_check() {
    let (_server_dir, url) = start_server().await;
    let intruder = device(&url, "intruder", "not-the-key").await;
    assert!(!intruder.sync.health_check().await);
    assert!(intruder.sync.sync().await.is_err());
}
