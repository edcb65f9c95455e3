use super::*;
use chrono::Utc;
use std::collections::VecDeque;

// ============================================================================
// Scripted drain source
// ============================================================================

#[derive(Debug, Clone)]
struct FakeHeld {
    id: Option<String>,
    body: String,
}

impl FakeHeld {
    fn with_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            body: format!("body of {id}"),
        }
    }

    fn anonymous(body: &str) -> Self {
        Self {
            id: None,
            body: body.to_string(),
        }
    }
}

impl HeldMessage for FakeHeld {
    fn native_id(&self) -> Option<String> {
        self.id.clone()
    }

    fn to_standard(&self) -> StandardMessage {
        StandardMessage::new(
            self.id.clone().unwrap_or_default(),
            Utc::now(),
            HashMap::new(),
            self.body.clone(),
        )
    }
}

/// Replays a fixed receive script and records terminal actions.
struct ScriptedSource {
    script: VecDeque<Result<Option<FakeHeld>, BrokerError>>,
    finalized: Vec<String>,
    released: Vec<String>,
    fail_finalize: bool,
}

impl ScriptedSource {
    fn new(script: Vec<Result<Option<FakeHeld>, BrokerError>>) -> Self {
        Self {
            script: script.into(),
            finalized: Vec::new(),
            released: Vec::new(),
            fail_finalize: false,
        }
    }

    fn with_messages(ids: &[&str]) -> Self {
        Self::new(ids.iter().map(|id| Ok(Some(FakeHeld::with_id(id)))).collect())
    }
}

#[async_trait]
impl DrainSource for ScriptedSource {
    type Held = FakeHeld;

    async fn receive(&mut self) -> Result<Option<FakeHeld>, BrokerError> {
        // Past the end of the script the queue looks empty.
        self.script.pop_front().unwrap_or(Ok(None))
    }

    async fn finalize(&mut self, held: FakeHeld) -> Result<(), BrokerError> {
        if self.fail_finalize {
            return Err(BrokerError::transport("finalize refused"));
        }
        self.finalized.push(held.id.unwrap_or_default());
        Ok(())
    }

    async fn release(&mut self, held: FakeHeld) -> Result<(), BrokerError> {
        self.released
            .push(held.id.unwrap_or_else(|| held.body.clone()));
        Ok(())
    }
}

/// Records redirected IDs, optionally refusing some of them.
struct FakeSink {
    redirected: Vec<String>,
    refuse: Vec<String>,
}

impl FakeSink {
    fn new() -> Self {
        Self {
            redirected: Vec::new(),
            refuse: Vec::new(),
        }
    }

    fn refusing(ids: &[&str]) -> Self {
        Self {
            redirected: Vec::new(),
            refuse: ids.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl RedirectSink<FakeHeld> for FakeSink {
    async fn redirect(&mut self, held: &FakeHeld) -> Result<(), BrokerError> {
        let id = held.id.clone().unwrap_or_default();
        if self.refuse.contains(&id) {
            return Err(BrokerError::publish_failed("dest", format!("refused {id}")));
        }
        self.redirected.push(id);
        Ok(())
    }
}

fn ids(targets: &[&str]) -> Vec<String> {
    targets.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// Enumeration (peek) drain
// ============================================================================

#[tokio::test]
async fn test_peek_returns_everything_and_releases_everything() {
    let mut source = ScriptedSource::with_messages(&["m1", "m2", "m3"]);
    let messages = drain_peek(&mut source, "q", None).await.unwrap();

    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].message_id, "m1");
    assert!(source.finalized.is_empty());
    assert_eq!(source.released, vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn test_peek_stops_at_receive_timeout() {
    let mut source = ScriptedSource::new(vec![
        Ok(Some(FakeHeld::with_id("m1"))),
        Ok(None),
        Ok(Some(FakeHeld::with_id("never-reached"))),
    ]);
    let messages = drain_peek(&mut source, "q", None).await.unwrap();

    assert_eq!(messages.len(), 1);
    assert_eq!(source.released, vec!["m1"]);
}

#[tokio::test]
async fn test_peek_respects_bound() {
    let mut source = ScriptedSource::with_messages(&["m1", "m2", "m3"]);
    let messages = drain_peek(&mut source, "q", Some(2)).await.unwrap();

    assert_eq!(messages.len(), 2);
    assert_eq!(source.released, vec!["m1", "m2"]);
}

#[tokio::test]
async fn test_peek_skips_receive_errors_below_threshold() {
    let mut source = ScriptedSource::new(vec![
        Err(BrokerError::transport("blip")),
        Ok(Some(FakeHeld::with_id("m1"))),
        Err(BrokerError::transport("blip")),
        Ok(Some(FakeHeld::with_id("m2"))),
        Ok(None),
    ]);
    let messages = drain_peek(&mut source, "q", None).await.unwrap();

    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn test_peek_aborts_after_consecutive_error_threshold() {
    let mut script: Vec<Result<Option<FakeHeld>, BrokerError>> =
        vec![Ok(Some(FakeHeld::with_id("m1")))];
    for _ in 0..=MAX_CONSECUTIVE_RECEIVE_ERRORS {
        script.push(Err(BrokerError::transport("down")));
    }
    let mut source = ScriptedSource::new(script);

    let error = drain_peek(&mut source, "q", None).await.unwrap_err();
    assert!(matches!(error, BrokerError::DrainFailed { .. }));
    // The message drained before the abort still goes back to the queue.
    assert_eq!(source.released, vec!["m1"]);
}

// ============================================================================
// Purge drain
// ============================================================================

#[tokio::test]
async fn test_purge_finalizes_every_drained_message() {
    let mut source = ScriptedSource::with_messages(&["m1", "m2", "m3", "m4", "m5"]);
    let removed = drain_purge(&mut source, "q", 5).await.unwrap();

    assert_eq!(removed, 5);
    assert_eq!(source.finalized, vec!["m1", "m2", "m3", "m4", "m5"]);
    assert!(source.released.is_empty());
}

#[tokio::test]
async fn test_purge_stops_early_when_queue_empties() {
    let mut source = ScriptedSource::with_messages(&["m1"]);
    let removed = drain_purge(&mut source, "q", 10).await.unwrap();

    assert_eq!(removed, 1);
}

#[tokio::test]
async fn test_purge_surfaces_finalize_failure() {
    let mut source = ScriptedSource::with_messages(&["m1"]);
    source.fail_finalize = true;

    let error = drain_purge(&mut source, "q", 1).await.unwrap_err();
    assert!(matches!(error, BrokerError::Transport { .. }));
}

// ============================================================================
// Selection: delete (no sink)
// ============================================================================

#[tokio::test]
async fn test_delete_finalizes_matched_and_releases_rest() {
    let mut source = ScriptedSource::with_messages(&["m1", "m2", "m3"]);
    let errors = select_and_act(&mut source, "q", 3, &ids(&["m2"]), None).await;

    assert!(errors.is_empty());
    assert_eq!(source.finalized, vec!["m2"]);
    let mut released = source.released.clone();
    released.sort();
    assert_eq!(released, vec!["m1", "m3"]);
}

#[tokio::test]
async fn test_delete_reports_not_found_for_unobserved_target() {
    let mut source = ScriptedSource::with_messages(&["m1"]);
    let errors = select_and_act(&mut source, "q", 1, &ids(&["m1", "m4"]), None).await;

    assert_eq!(errors.len(), 1);
    match &errors[0] {
        BrokerError::NotFound { message_id, .. } => assert_eq!(message_id, "m4"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(source.finalized, vec!["m1"]);
}

#[tokio::test]
async fn test_delete_duplicate_targets_are_harmless() {
    let mut source = ScriptedSource::with_messages(&["m1", "m2"]);
    let errors = select_and_act(&mut source, "q", 2, &ids(&["m1", "m1"]), None).await;

    assert!(errors.is_empty());
    assert_eq!(source.finalized, vec!["m1"]);
    assert_eq!(source.released, vec!["m2"]);
}

#[tokio::test]
async fn test_message_without_identifier_is_only_released() {
    let mut source = ScriptedSource::new(vec![
        Ok(Some(FakeHeld::anonymous("mystery"))),
        Ok(Some(FakeHeld::with_id("m1"))),
    ]);
    let errors = select_and_act(&mut source, "q", 2, &ids(&["m1"]), None).await;

    assert!(errors.is_empty());
    assert_eq!(source.finalized, vec!["m1"]);
    assert_eq!(source.released, vec!["mystery"]);
}

#[tokio::test]
async fn test_selection_abort_releases_all_held_messages() {
    let mut script: Vec<Result<Option<FakeHeld>, BrokerError>> = vec![
        Ok(Some(FakeHeld::with_id("m1"))),
        Ok(Some(FakeHeld::with_id("m2"))),
    ];
    for _ in 0..=MAX_CONSECUTIVE_RECEIVE_ERRORS {
        script.push(Err(BrokerError::transport("down")));
    }
    let mut source = ScriptedSource::new(script);

    let errors = select_and_act(&mut source, "q", 100, &ids(&["m1"]), None).await;

    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], BrokerError::DrainFailed { .. }));
    assert!(source.finalized.is_empty());
    let mut released = source.released.clone();
    released.sort();
    assert_eq!(released, vec!["m1", "m2"]);
}

// ============================================================================
// Selection: move (with sink)
// ============================================================================

#[tokio::test]
async fn test_move_redirects_then_finalizes_matched() {
    let mut source = ScriptedSource::with_messages(&["m1", "m2", "m3"]);
    let mut sink = FakeSink::new();
    let errors =
        select_and_act(&mut source, "q", 3, &ids(&["m2"]), Some(&mut sink)).await;

    assert!(errors.is_empty());
    assert_eq!(sink.redirected, vec!["m2"]);
    assert_eq!(source.finalized, vec!["m2"]);
    let mut released = source.released.clone();
    released.sort();
    assert_eq!(released, vec!["m1", "m3"]);
}

#[tokio::test]
async fn test_failed_redirect_returns_original_to_source() {
    let mut source = ScriptedSource::with_messages(&["m1", "m2"]);
    let mut sink = FakeSink::refusing(&["m1"]);
    let errors =
        select_and_act(&mut source, "q", 2, &ids(&["m1", "m2"]), Some(&mut sink)).await;

    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], BrokerError::PublishFailed { .. }));
    // m1 failed to publish so it stays in the source; m2 moved.
    assert!(source.released.contains(&"m1".to_string()));
    assert_eq!(source.finalized, vec!["m2"]);
    assert_eq!(sink.redirected, vec!["m2"]);
}

// ============================================================================
// Selection: scan (single message in flight)
// ============================================================================

#[tokio::test]
async fn test_scan_finalizes_matched_and_releases_rest() {
    let mut source = ScriptedSource::with_messages(&["m1", "m2", "m3"]);
    let errors = scan_and_act(&mut source, "q", 3, &ids(&["m2", "m3"]), None).await;

    assert!(errors.is_empty());
    assert_eq!(source.finalized, vec!["m2", "m3"]);
    assert_eq!(source.released, vec!["m1"]);
}

#[tokio::test]
async fn test_scan_stops_once_every_target_is_handled() {
    let mut source = ScriptedSource::with_messages(&["m1", "m2", "m3", "m4"]);
    let errors = scan_and_act(&mut source, "q", 4, &ids(&["m1"]), None).await;

    assert!(errors.is_empty());
    assert_eq!(source.finalized, vec!["m1"]);
    // Nothing past the matched target was ever popped off the queue.
    assert!(source.released.is_empty());
    assert_eq!(source.script.len(), 3);
}

#[tokio::test]
async fn test_scan_reports_not_found_when_bound_exhausted() {
    let mut source = ScriptedSource::with_messages(&["m1", "m2"]);
    let errors = scan_and_act(&mut source, "q", 2, &ids(&["m9"]), None).await;

    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], BrokerError::NotFound { message_id, .. } if message_id == "m9"));
    assert!(source.finalized.is_empty());
    assert_eq!(source.released, vec!["m1", "m2"]);
}

#[tokio::test]
async fn test_scan_failed_redirect_returns_original_to_source() {
    let mut source = ScriptedSource::with_messages(&["m1", "m2"]);
    let mut sink = FakeSink::refusing(&["m1"]);
    let errors = scan_and_act(&mut source, "q", 2, &ids(&["m1", "m2"]), Some(&mut sink)).await;

    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], BrokerError::PublishFailed { .. }));
    assert_eq!(source.released, vec!["m1"]);
    assert_eq!(source.finalized, vec!["m2"]);
    assert_eq!(sink.redirected, vec!["m2"]);
}

#[tokio::test]
async fn test_scan_duplicate_targets_are_harmless() {
    let mut source = ScriptedSource::with_messages(&["m1", "m2"]);
    let errors = scan_and_act(&mut source, "q", 2, &ids(&["m1", "m1"]), None).await;

    assert!(errors.is_empty());
    assert_eq!(source.finalized, vec!["m1"]);
}

#[tokio::test]
async fn test_scan_aborts_after_consecutive_error_threshold() {
    let mut script: Vec<Result<Option<FakeHeld>, BrokerError>> =
        vec![Ok(Some(FakeHeld::with_id("m1")))];
    for _ in 0..=MAX_CONSECUTIVE_RECEIVE_ERRORS {
        script.push(Err(BrokerError::transport("down")));
    }
    let mut source = ScriptedSource::new(script);

    let errors = scan_and_act(&mut source, "q", 100, &ids(&["m9"]), None).await;

    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], BrokerError::DrainFailed { .. }));
    // The non-target popped before the abort went straight back.
    assert_eq!(source.released, vec!["m1"]);
}

#[tokio::test]
async fn test_move_errors_come_back_in_order_attempted() {
    let mut source = ScriptedSource::with_messages(&["m2"]);
    let mut sink = FakeSink::refusing(&["m2"]);
    let errors = select_and_act(
        &mut source,
        "q",
        1,
        &ids(&["m9", "m2", "m8"]),
        Some(&mut sink),
    )
    .await;

    assert_eq!(errors.len(), 3);
    assert!(matches!(&errors[0], BrokerError::NotFound { message_id, .. } if message_id == "m9"));
    assert!(matches!(errors[1], BrokerError::PublishFailed { .. }));
    assert!(matches!(&errors[2], BrokerError::NotFound { message_id, .. } if message_id == "m8"));
}
