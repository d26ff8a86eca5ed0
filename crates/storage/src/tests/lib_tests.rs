use super::*;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Doc {
    name: String,
    count: u32,
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let store = LocalStore::open("sqlite::memory:").await.expect("db");
    store.health_check().await.expect("health check");
}

#[tokio::test]
async fn missing_document_loads_as_none() {
    let store = LocalStore::open("sqlite::memory:").await.expect("db");
    let loaded: Option<Doc> = store.load("session").await.expect("load");
    assert!(loaded.is_none());
}

#[tokio::test]
async fn put_overwrites_the_whole_document() {
    let store = LocalStore::open("sqlite::memory:").await.expect("db");

    store
        .store(
            "session",
            &Doc {
                name: "first".into(),
                count: 1,
            },
        )
        .await
        .expect("store");
    store
        .store(
            "session",
            &Doc {
                name: "second".into(),
                count: 2,
            },
        )
        .await
        .expect("store");

    let loaded: Doc = store
        .load("session")
        .await
        .expect("load")
        .expect("document");
    assert_eq!(
        loaded,
        Doc {
            name: "second".into(),
            count: 2,
        }
    );
}

#[tokio::test]
async fn delete_removes_the_document() {
    let store = LocalStore::open("sqlite::memory:").await.expect("db");
    store.put_document("messages", "[]").await.expect("put");
    store.delete_document("messages").await.expect("delete");
    assert!(store
        .get_document("messages")
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn malformed_document_surfaces_as_error() {
    let store = LocalStore::open("sqlite::memory:").await.expect("db");
    store
        .put_document("session", "not-json")
        .await
        .expect("put");
    let result: Result<Option<Doc>> = store.load("session").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn reopened_store_returns_the_last_written_document() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("nested").join("client.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    {
        let store = LocalStore::open(&database_url).await.expect("db");
        store
            .store(
                "messages",
                &Doc {
                    name: "persisted".into(),
                    count: 7,
                },
            )
            .await
            .expect("store");
    }

    assert!(db_path.exists(), "database file should have been created");

    let store = LocalStore::open(&database_url).await.expect("reopen");
    let loaded: Doc = store
        .load("messages")
        .await
        .expect("load")
        .expect("document");
    assert_eq!(loaded.count, 7);
}
