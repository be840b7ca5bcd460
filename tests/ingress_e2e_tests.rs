//! Full-path test: submission through the ingress adapter, processed by the
//! background processor, observed through the query interface and the
//! callback.

mod common;

use common::{wait_for_status, wav_bytes, MockEngineFactory, TestService};
use std::sync::Arc;
use std::time::Duration;
use whisperd::core::task::{TaskPriority, TaskStatus};
use whisperd::ingress::{http_status_for, TaskIngress, TaskSubmission, UploadedFile};
use whisperd::store::TaskFilter;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test(flavor = "multi_thread")]
async fn test_submission_flows_to_completed_task() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ack"))
        .mount(&server)
        .await;

    let mut service = TestService::start(MockEngineFactory::new(), 2, 2).await;
    let ingress = TaskIngress::new(
        Arc::clone(&service.store),
        Arc::clone(&service.temp),
        "http://127.0.0.1:8000".to_string(),
    );

    let submission = TaskSubmission {
        priority: TaskPriority::High,
        language: Some("en".to_string()),
        callback_url: Some(server.uri()),
        platform: Some("upload".to_string()),
        ..TaskSubmission::default()
    };
    let accepted = ingress
        .submit(
            submission,
            Some(UploadedFile {
                file_name: "meeting.wav".to_string(),
                bytes: wav_bytes(2.1),
            }),
        )
        .await
        .unwrap();

    assert_eq!(accepted.status, TaskStatus::Queued);
    assert_eq!(http_status_for(accepted.status), 202);
    assert!(accepted.file_duration.unwrap() > 2.0);

    let done = wait_for_status(
        &service.store,
        accepted.id,
        TaskStatus::Completed,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(http_status_for(done.status), 200);
    assert_eq!(done.language.as_deref(), Some("en"));
    assert!(done.result.is_some());

    // The query surface finds the task by its properties.
    let page = service
        .store
        .query(&TaskFilter {
            status: Some(TaskStatus::Completed),
            language: Some("en".to_string()),
            has_result: Some(true),
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(page.tasks[0].id, accepted.id);
    assert!(!page.has_more);

    // The callback is recorded within bounded time of termination.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let task = service.store.get(accepted.id).await.unwrap().unwrap();
        if task.callback_time.is_some() {
            assert_eq!(task.callback_status_code, Some(200));
            assert_eq!(task.callback_message.as_deref(), Some("ack"));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "callback not recorded");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The uploaded media was swept from the temp root after processing.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = std::fs::read_dir(service.temp.root())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_type().unwrap().is_file())
            .count();
        if remaining == 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "media not swept");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    service.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deleted_task_is_skipped_by_late_updates() {
    let factory = MockEngineFactory::new().with_delay(Duration::from_millis(400));
    let mut service = TestService::start(factory, 1, 1).await;
    let ingress = TaskIngress::new(
        Arc::clone(&service.store),
        Arc::clone(&service.temp),
        "http://127.0.0.1:8000".to_string(),
    );

    let accepted = ingress
        .submit(
            TaskSubmission::default(),
            Some(UploadedFile {
                file_name: "gone.wav".to_string(),
                bytes: wav_bytes(0.3),
            }),
        )
        .await
        .unwrap();

    // Delete the row while the engine call is still running; the worker
    // finishing the task finds nothing to update and carries on.
    wait_for_status(
        &service.store,
        accepted.id,
        TaskStatus::Processing,
        Duration::from_secs(10),
    )
    .await;
    assert!(service.store.delete(accepted.id).await.unwrap());

    service.shutdown();
    assert!(service.store.get(accepted.id).await.unwrap().is_none());
}
