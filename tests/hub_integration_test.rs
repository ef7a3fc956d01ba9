//! Integration tests for step channels fed by the stream aggregator

use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stepflow::hub::{
    EventHub, EventKind, EventStream, ForwardStream, HubEvent, HubOptions, DONE_MARKER,
};
use stepflow::provider::ChunkStream;
use stepflow::stream::StreamAggregator;

async fn drain(stream: EventStream) -> Vec<HubEvent> {
    stream
        .filter(|e| futures_util::future::ready(e.kind != EventKind::Ping))
        .collect()
        .await
}

fn chunk(text: &str) -> String {
    json!({"choices": [{"delta": {"content": text}}]}).to_string()
}

#[tokio::test]
async fn test_every_subscriber_sees_every_event() {
    let hub = EventHub::default();
    let subscribers: Vec<EventStream> = (0..3).map(|_| hub.subscribe("s1")).collect();

    hub.emit("s1", EventKind::Started, json!({"stepId": "s1", "loop": 0}));
    hub.emit("s1", EventKind::Status, json!({"stepId": "s1", "phase": "CLIENT_WAIT"}));
    hub.complete("s1");

    for sub in subscribers {
        let kinds: Vec<EventKind> = drain(sub).await.into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Started, EventKind::Status]);
    }
    assert!(!hub.contains("s1"));
}

#[tokio::test]
async fn test_late_subscriber_only_sees_later_events() {
    let hub = EventHub::default();
    let early = hub.subscribe("s1");
    hub.emit("s1", EventKind::Started, json!({}));
    let late = hub.subscribe("s1");
    hub.emit("s1", EventKind::Finished, json!({}));
    hub.complete("s1");

    assert_eq!(drain(early).await.len(), 2);
    let late: Vec<EventKind> = drain(late).await.into_iter().map(|e| e.kind).collect();
    assert_eq!(late, vec![EventKind::Finished]);
}

#[tokio::test]
async fn test_channels_are_isolated() {
    let hub = EventHub::default();
    let a = hub.subscribe("a");
    let b = hub.subscribe("b");
    hub.emit("a", EventKind::Decision, json!({"toolCalls": []}));
    hub.complete("a");
    hub.complete("b");

    assert_eq!(drain(a).await.len(), 1);
    assert!(drain(b).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_janitor_evicts_idle_channels() {
    let hub = Arc::new(EventHub::new(HubOptions {
        heartbeat_every: Duration::from_secs(5),
        step_ttl: Duration::from_secs(30),
        janitor_every: Duration::from_secs(10),
        buffer_capacity: 64,
    }));
    let janitor = hub.spawn_janitor();

    hub.emit("idle", EventKind::Started, json!({}));
    let sub = hub.subscribe("idle");

    let events: Vec<HubEvent> =
        tokio::time::timeout(Duration::from_secs(300), sub.collect::<Vec<_>>())
            .await
            .expect("idle channel should be evicted");

    assert_eq!(events[0].kind, EventKind::Started);
    // only heartbeats until eviction; they never count as activity
    assert!(events.len() > 2);
    assert!(events[1..].iter().all(|e| e.kind == EventKind::Ping));
    assert!(!hub.contains("idle"));

    hub.shutdown();
    janitor.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_active_channels_survive_the_janitor() {
    let hub = Arc::new(EventHub::new(HubOptions {
        heartbeat_every: Duration::from_secs(60),
        step_ttl: Duration::from_secs(30),
        janitor_every: Duration::from_secs(10),
        buffer_capacity: 64,
    }));
    let _janitor = hub.spawn_janitor();

    for _ in 0..6 {
        hub.emit("busy", EventKind::Status, json!({"phase": "RUNNING"}));
        tokio::time::sleep(Duration::from_secs(20)).await;
    }
    assert!(hub.contains("busy"));
    hub.shutdown();
    assert!(hub.is_empty());
}

#[tokio::test]
async fn test_aggregated_stream_is_forwarded_token_by_token() {
    let hub = EventHub::default();
    let aggregator = StreamAggregator::default();
    let sub = hub.subscribe("s1");

    let chunks = vec![chunk("Hello"), chunk(" world")];
    let upstream = chunks.clone();
    let tokens = aggregator.start_with("s1", async move {
        let stream: ChunkStream = Box::pin(futures_util::stream::iter(
            upstream.into_iter().map(Ok).collect::<Vec<_>>(),
        ));
        Ok(stream)
    });
    let forward: ForwardStream = tokens;
    hub.forward("s1", forward)
        .expect("no forward in progress")
        .finished()
        .await;

    let text = aggregator
        .await_final_text("s1", Duration::from_secs(5))
        .await;
    assert_eq!(text, "Hello world");
    aggregator.clear("s1");
    hub.complete("s1");

    let events = drain(sub).await;
    let payloads: Vec<String> = events.iter().map(|e| e.data()).collect();
    assert_eq!(payloads, vec![chunks[0].clone(), chunks[1].clone(), DONE_MARKER.to_string()]);
    assert!(events.iter().all(|e| e.kind == EventKind::Message));
}

#[tokio::test]
async fn test_upstream_failure_becomes_error_event() {
    let hub = EventHub::default();
    let aggregator = StreamAggregator::default();
    let sub = hub.subscribe("s1");

    let tokens = aggregator.start_with("s1", async {
        let stream: ChunkStream = Box::pin(futures_util::stream::iter(vec![
            Ok(chunk("partial")),
            Err(anyhow::anyhow!("connection reset")),
        ]));
        Ok(stream)
    });
    hub.forward("s1", tokens).unwrap().finished().await;

    let aggregated = aggregator
        .await_aggregated("s1", Duration::from_secs(5))
        .await;
    assert_eq!(aggregated.content, "partial");
    assert!(aggregated.error.is_some());
    hub.complete("s1");

    let events = drain(sub).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].kind, EventKind::Error);
    assert_eq!(events[1].payload["message"], json!("connection reset"));
    assert!(!events.iter().any(|e| e.is_done_marker()));
}

#[test]
fn test_sse_frames() {
    let frame = HubEvent::new(EventKind::ClientCalls, json!({"stepId": "s1"})).to_sse_frame();
    assert_eq!(frame, "event: clientCalls\ndata: {\"stepId\":\"s1\"}\n\n");
    assert_eq!(
        HubEvent::token("a\nb").to_sse_frame(),
        "event: message\ndata: a\ndata: b\n\n"
    );
}
