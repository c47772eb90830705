//! InMemoryStore as the worker binary sees it: no fault switches, only the
//! `ResourceStore` surface.

use domain_delivery::{
    DeliveryState, InMemoryStore, ResourceStore, SendRequest, SendRequestSpec, SendRequestStatus,
    StoreError,
};

fn spec() -> SendRequestSpec {
    SendRequestSpec::new("transactional", "ada@example.com", "Welcome", "Hello Ada")
}

#[tokio::test]
async fn test_sent_status_cannot_be_overwritten() {
    let store = InMemoryStore::new();
    let created = store
        .create_send_request(SendRequest::new("acme", "welcome", spec()))
        .await
        .unwrap();
    let key = created.key();

    let sent = SendRequestStatus {
        delivery_state: DeliveryState::Sent,
        message_id: Some("msg-1".into()),
        attempt_count: 1,
        observed_generation: 1,
        ..Default::default()
    };
    let written = store
        .update_send_request_status(&key, created.metadata.resource_version, sent.clone())
        .await
        .unwrap();

    let stale = store
        .update_send_request_status(
            &key,
            created.metadata.resource_version,
            SendRequestStatus::default(),
        )
        .await;
    assert!(matches!(stale, Err(StoreError::Conflict { .. })));

    let regression = store
        .update_send_request_status(
            &key,
            written.metadata.resource_version,
            SendRequestStatus {
                delivery_state: DeliveryState::Failed,
                ..sent.clone()
            },
        )
        .await;
    assert!(matches!(regression, Err(StoreError::TerminalState(_))));

    let stored = store.get_send_request(&key).await.unwrap().unwrap();
    assert_eq!(stored.status, sent);
    assert_eq!(
        stored.metadata.resource_version,
        written.metadata.resource_version
    );
}
