//! Callback dispatcher behavior against a mock HTTP endpoint.

mod common;

use common::{wait_for_status, MockEngineFactory, TestService};
use std::sync::Arc;
use std::time::Duration;
use whisperd::config::{CallbackConfig, StoreConfig};
use whisperd::core::task::{NewTask, TaskPriority, TaskStatus, TaskType};
use whisperd::services::callback::CallbackDispatcher;
use whisperd::store::{SqliteTaskStore, TaskStore};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn memory_store() -> Arc<dyn TaskStore> {
    let config = StoreConfig {
        database_path: ":memory:".into(),
        ..StoreConfig::default()
    };
    Arc::new(SqliteTaskStore::connect(&config).await.unwrap())
}

fn dispatcher() -> CallbackDispatcher {
    CallbackDispatcher::new(CallbackConfig {
        retry_delay_seconds: 0,
        ..CallbackConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_callback_retries_until_success_and_records_final_outcome() {
    let server = MockServer::start().await;
    // Two failures, then success; the recorded outcome must be the 200.
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500).set_body_string("try again"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_string("received"))
        .mount(&server)
        .await;

    let store = memory_store().await;
    let id = store
        .create(NewTask {
            callback_url: Some(format!("{}/hook", server.uri())),
            ..NewTask::default()
        })
        .await
        .unwrap();

    dispatcher().notify(store.as_ref(), id).await.unwrap();

    let task = store.get(id).await.unwrap().unwrap();
    assert_eq!(task.callback_status_code, Some(200));
    assert_eq!(task.callback_message.as_deref(), Some("received"));
    assert!(task.callback_time.is_some());
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_callback_posts_task_payload_as_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = memory_store().await;
    let id = store
        .create(NewTask {
            priority: TaskPriority::High,
            task_type: TaskType::Translate,
            callback_url: Some(format!("{}/hook", server.uri())),
            platform: Some("douyin".to_string()),
            ..NewTask::default()
        })
        .await
        .unwrap();

    dispatcher().notify(store.as_ref(), id).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["id"], serde_json::json!(id));
    assert_eq!(body["priority"], serde_json::json!("high"));
    assert_eq!(body["task_type"], serde_json::json!("translate"));
    assert_eq!(body["platform"], serde_json::json!("douyin"));
    assert_eq!(body["status"], serde_json::json!("queued"));
}

#[tokio::test]
async fn test_callback_truncates_long_response_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(2000)))
        .mount(&server)
        .await;

    let store = memory_store().await;
    let id = store
        .create(NewTask {
            callback_url: Some(server.uri()),
            ..NewTask::default()
        })
        .await
        .unwrap();

    dispatcher().notify(store.as_ref(), id).await.unwrap();

    let task = store.get(id).await.unwrap().unwrap();
    assert_eq!(task.callback_message.unwrap().len(), 512);
}

#[tokio::test]
async fn test_callback_skipped_without_url() {
    let store = memory_store().await;
    let id = store.create(NewTask::default()).await.unwrap();

    dispatcher().notify(store.as_ref(), id).await.unwrap();

    let task = store.get(id).await.unwrap().unwrap();
    assert!(task.callback_status_code.is_none());
    assert!(task.callback_time.is_none());
}

#[tokio::test]
async fn test_callback_transport_failure_is_recorded() {
    let store = memory_store().await;
    // Nothing listens on this port; every attempt fails at transport level.
    let id = store
        .create(NewTask {
            callback_url: Some("http://127.0.0.1:9/hook".to_string()),
            ..NewTask::default()
        })
        .await
        .unwrap();

    dispatcher().notify(store.as_ref(), id).await.unwrap();

    let task = store.get(id).await.unwrap().unwrap();
    assert_eq!(task.callback_status_code, None);
    assert!(!task.callback_message.unwrap().is_empty());
    assert!(task.callback_time.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminal_task_round_trips_through_callback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut service = TestService::start(MockEngineFactory::new(), 1, 1).await;
    let path = service.wav_fixture("hooked.wav");
    let id = service
        .store
        .create(NewTask {
            priority: TaskPriority::Normal,
            file_path: Some(path),
            file_name: Some("hooked.wav".to_string()),
            callback_url: Some(server.uri()),
            ..NewTask::default()
        })
        .await
        .unwrap();

    wait_for_status(&service.store, id, TaskStatus::Completed, Duration::from_secs(10)).await;

    // Callback record lands within bounded time after termination.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let recorded = loop {
        let task = service.store.get(id).await.unwrap().unwrap();
        if task.callback_time.is_some() {
            break task;
        }
        assert!(tokio::time::Instant::now() < deadline, "callback not recorded");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(recorded.callback_status_code, Some(200));

    // Round-trip: the callback body matches what a query returns for the
    // fields that were terminal at delivery time.
    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["id"], serde_json::json!(id));
    assert_eq!(body["status"], serde_json::json!("completed"));
    assert_eq!(
        body["result"]["text"],
        serde_json::json!(recorded.result.unwrap().text)
    );
    assert_eq!(body["language"], serde_json::json!(recorded.language));
    service.shutdown();
}
