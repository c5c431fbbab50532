//! Push delivery against a mocked vendor endpoint.

use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wayfarer_common::{PushSettings, PushToken, UserId};
use wayfarer_storage::{MemoryPushTokenStore, PushTokenStore};
use wayfarer_workers::{PushClient, PushNotification, PushNotifier, WorkerPool};

async fn token_store_with(tokens: &[(&str, &str)]) -> Arc<MemoryPushTokenStore> {
    let store = Arc::new(MemoryPushTokenStore::new());
    for (user, token) in tokens {
        store
            .register(PushToken {
                user_id: UserId::from(*user),
                token: token.to_string(),
                active: true,
                last_used_at: None,
            })
            .await;
    }
    store
}

#[tokio::test]
async fn unregistered_device_tickets_invalidate_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/push/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                { "status": "ok", "id": "ticket-1" },
                { "status": "error", "message": "gone",
                  "details": { "error": "DeviceNotRegistered" } }
            ]
        })))
        .mount(&server)
        .await;

    let settings = PushSettings {
        endpoint: format!("{}/push/send", server.uri()),
        batch_size: 100,
        request_timeout_secs: 5,
    };
    let store = token_store_with(&[("u1", "tok-alive"), ("u2", "tok-gone")]).await;
    let pool = Arc::new(WorkerPool::with_sizes(1, 8));
    pool.start().await;

    let notifier = PushNotifier::new(
        Arc::new(PushClient::new(&settings).unwrap()),
        store.clone(),
        pool.clone(),
    );
    let accepted = notifier
        .enqueue(
            vec![UserId::from("u1"), UserId::from("u2")],
            PushNotification {
                title: "New message".to_string(),
                body: "hi".to_string(),
                data: None,
            },
        )
        .await;
    assert!(accepted);

    // The dead token drops out of the active set once the job has run.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let active = store
            .list_active_tokens(&[UserId::from("u1"), UserId::from("u2")])
            .await
            .unwrap();
        if active.len() == 1 {
            assert_eq!(active[0].token, "tok-alive");
            assert!(active[0].last_used_at.is_some());
            break;
        }
        assert!(std::time::Instant::now() < deadline, "token was not invalidated");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    pool.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn recipients_without_tokens_are_a_noop() {
    let server = MockServer::start().await;
    // No expectations mounted: any request would 404 and be logged, but
    // none should be made.
    let settings = PushSettings {
        endpoint: format!("{}/push/send", server.uri()),
        batch_size: 100,
        request_timeout_secs: 5,
    };
    let store = token_store_with(&[]).await;
    let pool = Arc::new(WorkerPool::with_sizes(1, 8));
    pool.start().await;

    let notifier = PushNotifier::new(
        Arc::new(PushClient::new(&settings).unwrap()),
        store,
        pool.clone(),
    );
    assert!(
        notifier
            .enqueue(
                vec![UserId::from("nobody")],
                PushNotification {
                    title: "t".to_string(),
                    body: "b".to_string(),
                    data: None,
                },
            )
            .await
    );

    pool.shutdown(Duration::from_secs(2)).await.unwrap();
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}
