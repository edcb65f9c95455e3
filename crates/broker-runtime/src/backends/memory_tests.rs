use super::*;
use crate::adapter::BrokerAdapter;

fn message(id: &str) -> StandardMessage {
    let mut headers = HashMap::new();
    headers.insert("CorrelationID".to_string(), format!("corr-{id}"));
    StandardMessage::new(id, Utc::now(), headers, format!("body of {id}"))
}

fn backend_with(queue: &str, ids: &[&str]) -> MemoryBackend {
    let backend = MemoryBackend::new();
    for id in ids {
        backend.publish(queue, message(id));
    }
    backend
}

fn ids(targets: &[&str]) -> Vec<String> {
    targets.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_get_all_messages_is_non_destructive() {
    let backend = backend_with("q", &["m1", "m2", "m3"]);

    let first = backend.get_all_messages("q").await.unwrap();
    let second = backend.get_all_messages("q").await.unwrap();

    assert_eq!(first.len(), 3);
    assert_eq!(second.len(), 3);
    assert_eq!(backend.len("q"), Some(3));
}

#[tokio::test]
async fn test_get_all_messages_unknown_queue_is_empty() {
    let backend = MemoryBackend::new();
    let messages = backend.get_all_messages("nowhere").await.unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn test_get_all_queues_reports_sizes() {
    let backend = backend_with("alpha", &["m1", "m2"]);
    backend.publish("beta", message("m3"));

    let queues = backend.get_all_queues().await.unwrap();
    assert_eq!(queues.len(), 2);
    assert_eq!(queues[0].name, "alpha");
    assert_eq!(queues[0].size(), Some(2));
    assert_eq!(queues[1].name, "beta");
    assert_eq!(queues[1].size(), Some(1));
}

#[tokio::test]
async fn test_purge_empties_the_queue() {
    let backend = backend_with("q", &["m1", "m2", "m3", "m4", "m5"]);

    backend.purge("q").await.unwrap();

    let after = backend.get_all_messages("q").await.unwrap();
    assert!(after.is_empty());
}

#[tokio::test]
async fn test_delete_one_removes_only_the_target() {
    let backend = backend_with("q", &["m1", "m2", "m3"]);

    backend.delete_one("q", "m2").await.unwrap();

    let remaining: Vec<String> = backend
        .get_all_messages("q")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.message_id)
        .collect();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.contains(&"m1".to_string()));
    assert!(remaining.contains(&"m3".to_string()));
}

#[tokio::test]
async fn test_delete_one_absent_id_reports_not_found_and_leaves_queue_intact() {
    let backend = backend_with("q", &["m1", "m2"]);

    let error = backend.delete_one("q", "m9").await.unwrap_err();
    assert!(matches!(error, BrokerError::NotFound { .. }));
    assert_eq!(backend.len("q"), Some(2));
}

#[tokio::test]
async fn test_delete_many_partial_match_yields_one_error() {
    let backend = backend_with("q", &["m1", "m2"]);

    let errors = backend.delete_many("q", &ids(&["m1", "m4"])).await;

    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], BrokerError::NotFound { message_id, .. } if message_id == "m4"));
    let remaining = backend.get_all_messages("q").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].message_id, "m2");
}

#[tokio::test]
async fn test_move_one_relocates_message_with_body_and_headers() {
    let backend = backend_with("q", &["m1", "m2", "m3"]);

    backend.move_one("q", "q2", "m2").await.unwrap();

    let moved = backend.get_all_messages("q2").await.unwrap();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].message_id, "m2");
    assert_eq!(moved[0].body, "body of m2");
    assert_eq!(
        moved[0].headers.get("CorrelationID"),
        Some(&"corr-m2".to_string())
    );

    let source_ids: Vec<String> = backend
        .get_all_messages("q")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.message_id)
        .collect();
    assert_eq!(source_ids.len(), 2);
    assert!(!source_ids.contains(&"m2".to_string()));
}

#[tokio::test]
async fn test_move_one_absent_id_changes_neither_queue() {
    let backend = backend_with("q", &["m1"]);

    let error = backend.move_one("q", "q2", "m9").await.unwrap_err();
    assert!(matches!(error, BrokerError::NotFound { .. }));
    assert_eq!(backend.len("q"), Some(1));
    assert!(backend.is_empty("q2"));
}

#[tokio::test]
async fn test_move_many_moves_every_observed_target() {
    let backend = backend_with("q", &["m1", "m2", "m3"]);

    let errors = backend.move_many("q", "q2", &ids(&["m1", "m3"])).await;

    assert!(errors.is_empty());
    assert_eq!(backend.len("q2"), Some(2));
    let remaining = backend.get_all_messages("q").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].message_id, "m2");
}

#[tokio::test]
async fn test_seeded_backend_exposes_sample_queues() {
    let backend = MemoryBackend::seeded();
    let queues = backend.get_all_queues().await.unwrap();
    assert_eq!(queues.len(), 2);
    assert_eq!(queues[0].size(), Some(2));
}
