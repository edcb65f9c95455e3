use super::*;
use fe2o3_amqp::types::messaging::{Accepted, AmqpValue, Header, Properties, Rejected, Released};

fn text_message(body: &str) -> AmqpMessage {
    Message::builder()
        .body(Body::Value(AmqpValue(Value::String(body.to_string()))))
        .build()
}

// ============================================================================
// Link credit and publish outcomes
// ============================================================================

#[test]
fn test_link_credit_covers_the_census_bound() {
    assert_eq!(link_credit(0), 0);
    assert_eq!(link_credit(1), 1);
    assert_eq!(link_credit(50_000), 50_000);
    assert_eq!(link_credit(usize::MAX), u32::MAX);
}

#[test]
fn test_only_accepted_outcome_confirms_a_redirect() {
    assert!(confirm_outcome("dest", Outcome::Accepted(Accepted {})).is_ok());

    let rejected = confirm_outcome("dest", Outcome::Rejected(Rejected { error: None }));
    assert!(matches!(
        rejected,
        Err(BrokerError::PublishFailed { destination, .. }) if destination == "dest"
    ));

    let released = confirm_outcome("dest", Outcome::Released(Released {}));
    assert!(matches!(released, Err(BrokerError::PublishFailed { .. })));
}

// ============================================================================
// Console XML parsing
// ============================================================================

const QUEUES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<queues>
  <queue name="orders">
    <stats size="7" consumerCount="1" enqueueCount="12" dequeueCount="5"/>
    <feed>
      <atom>queueBrowse/orders?view=rss&amp;feedType=atom_1.0</atom>
      <rss>queueBrowse/orders?view=rss&amp;feedType=rss_2.0</rss>
    </feed>
  </queue>
  <queue name="billing">
    <stats size="0" consumerCount="0" enqueueCount="0" dequeueCount="0"/>
  </queue>
</queues>"#;

#[test]
fn test_parse_queues_xml_extracts_names_and_sizes() {
    let queues = parse_queues_xml(QUEUES_XML).unwrap();

    assert_eq!(queues.len(), 2);
    assert_eq!(queues[0].name, "orders");
    assert_eq!(queues[0].size(), Some(7));
    assert_eq!(queues[1].name, "billing");
    assert_eq!(queues[1].size(), Some(0));
}

#[test]
fn test_parse_queues_xml_without_stats_leaves_info_empty() {
    let xml = r#"<queues><queue name="bare"></queue></queues>"#;
    let queues = parse_queues_xml(xml).unwrap();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0].size(), None);
}

#[test]
fn test_parse_queues_xml_rejects_malformed_document() {
    let error = parse_queues_xml("<queues><queue").unwrap_err();
    assert!(matches!(error, BrokerError::Management { .. }));
}

#[test]
fn test_parse_feed_counts_rss_items() {
    let xml = r#"<rss version="2.0"><channel>
        <title>orders</title>
        <item><title>ID:m1</title><guid>1</guid></item>
        <item><title>ID:m2</title><guid>2</guid></item>
        <item><title>ID:m3</title><guid>3</guid></item>
    </channel></rss>"#;
    assert_eq!(parse_feed_item_count(xml).unwrap(), 3);
}

#[test]
fn test_parse_feed_counts_atom_entries() {
    let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom">
        <title>orders</title>
        <entry><title>ID:m1</title></entry>
        <entry><title>ID:m2</title></entry>
    </feed>"#;
    assert_eq!(parse_feed_item_count(xml).unwrap(), 2);
}

#[test]
fn test_parse_feed_empty_queue_is_zero() {
    let xml = r#"<rss version="2.0"><channel><title>orders</title></channel></rss>"#;
    assert_eq!(parse_feed_item_count(xml).unwrap(), 0);
}

// ============================================================================
// Message projection
// ============================================================================

#[test]
fn test_native_id_requires_string_message_id() {
    let mut message = text_message("x");
    message.properties = Some(Properties {
        message_id: Some(MessageId::String("m1".to_string())),
        ..Default::default()
    });
    assert_eq!(native_message_id(&message), Some("m1".to_string()));

    message.properties = Some(Properties {
        message_id: Some(MessageId::Ulong(42)),
        ..Default::default()
    });
    assert_eq!(native_message_id(&message), None);

    message.properties = None;
    assert_eq!(native_message_id(&message), None);
}

#[test]
fn test_projection_carries_id_body_and_correlation() {
    let mut message = text_message("the payload");
    message.properties = Some(Properties {
        message_id: Some(MessageId::String("m1".to_string())),
        correlation_id: Some(MessageId::String("corr-9".to_string())),
        subject: Some("greeting".to_string()),
        ..Default::default()
    });

    let standard = project_message(&message);

    assert_eq!(standard.message_id, "m1");
    assert_eq!(standard.body, "the payload");
    assert_eq!(
        standard.headers.get("Correlation ID"),
        Some(&"corr-9".to_string())
    );
    assert_eq!(standard.headers.get("Subject"), Some(&"greeting".to_string()));
}

#[test]
fn test_projection_stringifies_non_string_message_id() {
    let mut message = text_message("x");
    message.properties = Some(Properties {
        message_id: Some(MessageId::Ulong(42)),
        ..Default::default()
    });

    let standard = project_message(&message);
    assert_eq!(standard.message_id, "42");
}

#[test]
fn test_projection_includes_transport_header_fields() {
    let mut message = text_message("x");
    message.header = Some(Header {
        durable: true,
        ..Default::default()
    });

    let standard = project_message(&message);
    assert_eq!(standard.headers.get("Durable"), Some(&"true".to_string()));
    assert!(standard.headers.contains_key("Delivery Count"));
}

#[test]
fn test_projection_without_properties_has_empty_id() {
    let standard = project_message(&text_message("anonymous"));
    assert_eq!(standard.message_id, "");
    assert_eq!(standard.body, "anonymous");
}

#[test]
fn test_body_string_handles_empty_body() {
    let message = Message::builder().body(Body::<Value>::Empty).build();
    assert_eq!(body_string(&message.body), "");
}
