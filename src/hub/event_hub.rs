//! Per-step multicast channels with heartbeat and idle eviction.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::{EventKind, HubEvent};

/// Events delivered to one subscriber, ending when the step is completed.
pub type EventStream = Pin<Box<dyn Stream<Item = HubEvent> + Send>>;

/// Token items accepted by [`EventHub::forward`].
pub type ForwardStream = Pin<Box<dyn Stream<Item = Result<String, String>> + Send>>;

/// Timing and buffer settings.
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Interval between `ping` events on each channel
    pub heartbeat_every: Duration,
    /// Idle time after which the janitor evicts a channel
    pub step_ttl: Duration,
    /// Interval between janitor sweeps
    pub janitor_every: Duration,
    /// Broadcast capacity per channel
    pub buffer_capacity: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            heartbeat_every: Duration::from_secs(20),
            step_ttl: Duration::from_secs(600),
            janitor_every: Duration::from_secs(60),
            buffer_capacity: 1024,
        }
    }
}

#[cfg(feature = "config")]
impl From<&crate::config::HubConfig> for HubOptions {
    fn from(config: &crate::config::HubConfig) -> Self {
        Self {
            heartbeat_every: Duration::from_secs(config.heartbeat_every_secs),
            step_ttl: Duration::from_secs(config.step_ttl_secs),
            janitor_every: Duration::from_secs(config.janitor_every_secs),
            buffer_capacity: config.buffer_capacity,
        }
    }
}

#[derive(Debug, Clone)]
enum Frame {
    Event(HubEvent),
    Close,
}

#[derive(Debug)]
struct StepChannel {
    tx: broadcast::Sender<Frame>,
    /// Receiver created with the channel; handed to the first subscriber so
    /// events emitted before anyone connected are not lost.
    warm: Mutex<Option<broadcast::Receiver<Frame>>>,
    last_active: Mutex<Instant>,
    forwarding: AtomicBool,
    cancel: CancellationToken,
}

impl StepChannel {
    fn touch(&self) {
        if let Ok(mut at) = self.last_active.lock() {
            *at = Instant::now();
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        self.last_active
            .lock()
            .map(|at| now.saturating_duration_since(*at))
            .unwrap_or_default()
    }

    fn publish(&self, event: HubEvent) {
        // No receivers only means nobody is watching.
        let _ = self.tx.send(Frame::Event(event));
    }

    fn receiver(&self) -> broadcast::Receiver<Frame> {
        let warm = self.warm.lock().ok().and_then(|mut w| w.take());
        warm.unwrap_or_else(|| self.tx.subscribe())
    }
}

/// Completion handle of one forwarding attachment.
#[derive(Debug)]
pub struct ForwardHandle {
    task: JoinHandle<()>,
}

impl ForwardHandle {
    /// Wait until the forwarded stream has drained into the channel.
    pub async fn finished(self) {
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "forward task failed");
            }
        }
    }
}

#[derive(Serialize)]
struct Ping {
    ts: i64,
}

/// Gives every step one logical outbound channel.
#[derive(Debug)]
pub struct EventHub {
    channels: DashMap<String, Arc<StepChannel>>,
    options: HubOptions,
    shutdown: CancellationToken,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(HubOptions::default())
    }
}

impl EventHub {
    /// Empty hub with the given timings.
    pub fn new(options: HubOptions) -> Self {
        Self {
            channels: DashMap::new(),
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// Timings this hub was built with.
    pub fn options(&self) -> &HubOptions {
        &self.options
    }

    /// Get or create the channel for a step; a new channel starts its heartbeat.
    fn ensure(&self, step_id: &str) -> Arc<StepChannel> {
        match self.channels.entry(step_id.to_string()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let (tx, warm) = broadcast::channel(self.options.buffer_capacity.max(1));
                let channel = Arc::new(StepChannel {
                    tx,
                    warm: Mutex::new(Some(warm)),
                    last_active: Mutex::new(Instant::now()),
                    forwarding: AtomicBool::new(false),
                    cancel: self.shutdown.child_token(),
                });
                slot.insert(channel.clone());
                self.spawn_heartbeat(step_id, &channel);
                debug!(step_id, "hub channel created");
                channel
            }
        }
    }

    fn spawn_heartbeat(&self, step_id: &str, channel: &Arc<StepChannel>) {
        let every = self.options.heartbeat_every;
        let weak = Arc::downgrade(channel);
        let cancel = channel.cancel.clone();
        let id = step_id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(channel) = weak.upgrade() else { break };
                // Heartbeats keep proxies alive but do not count as activity.
                match serde_json::to_value(Ping {
                    ts: chrono::Utc::now().timestamp_millis(),
                }) {
                    Ok(payload) => channel.publish(HubEvent::new(EventKind::Ping, payload)),
                    Err(e) => {
                        warn!(step_id = %id, error = %e, "heartbeat failed");
                        channel.publish(HubEvent::error(format!("heartbeat failed: {}", e)));
                    }
                }
            }
        });
    }

    /// Subscribe to a step's events. The step need not exist yet.
    pub fn subscribe(&self, step_id: &str) -> EventStream {
        let channel = self.ensure(step_id);
        channel.touch();
        let rx = channel.receiver();
        let id = step_id.to_string();
        Box::pin(futures_util::stream::unfold(Some(rx), move |state| {
            let id = id.clone();
            async move {
                let mut rx = state?;
                loop {
                    match rx.recv().await {
                        Ok(Frame::Event(event)) => return Some((event, Some(rx))),
                        Ok(Frame::Close) => return None,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(step_id = %id, skipped, "subscriber lagged, dropped oldest");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        }))
    }

    /// Publish a single control event.
    pub fn emit(&self, step_id: &str, kind: EventKind, payload: Value) {
        self.emit_event(step_id, HubEvent::new(kind, payload));
    }

    pub fn emit_event(&self, step_id: &str, event: HubEvent) {
        let channel = self.ensure(step_id);
        channel.touch();
        channel.publish(event);
    }

    /// Attach a token stream to the step channel.
    ///
    /// Returns `None` when another stream is still being forwarded. Chunks
    /// become `message` events, an upstream error an `error` event, and a
    /// clean end appends the `[DONE]` marker. The channel stays open.
    pub fn forward(&self, step_id: &str, mut tokens: ForwardStream) -> Option<ForwardHandle> {
        let channel = self.ensure(step_id);
        if channel
            .forwarding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(step_id, "forward rejected, already forwarding");
            return None;
        }
        let id = step_id.to_string();
        let task = tokio::spawn(async move {
            let cancel = channel.cancel.clone();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = tokens.next() => next,
                };
                match next {
                    Some(Ok(chunk)) => {
                        channel.touch();
                        channel.publish(HubEvent::token(chunk));
                    }
                    Some(Err(message)) => {
                        warn!(step_id = %id, error = %message, "forwarded stream failed");
                        channel.touch();
                        channel.publish(HubEvent::error(message));
                        break;
                    }
                    None => {
                        channel.touch();
                        channel.publish(HubEvent::done_marker());
                        break;
                    }
                }
            }
            channel.forwarding.store(false, Ordering::Release);
        });
        Some(ForwardHandle { task })
    }

    /// Terminate a step channel for good.
    pub fn complete(&self, step_id: &str) {
        if let Some((_, channel)) = self.channels.remove(step_id) {
            channel.cancel.cancel();
            let _ = channel.tx.send(Frame::Close);
            debug!(step_id, "hub channel completed");
        }
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.channels.contains_key(step_id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Force-complete every channel idle for longer than the TTL.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .channels
            .iter()
            .filter(|entry| entry.value().idle_for(now) > self.options.step_ttl)
            .map(|entry| entry.key().clone())
            .collect();
        for step_id in &expired {
            info!(step_id = %step_id, "evicting idle hub channel");
            self.complete(step_id);
        }
        expired.len()
    }

    /// Run [`sweep`](Self::sweep) every `janitor_every` until [`shutdown`](Self::shutdown).
    pub fn spawn_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::downgrade(self);
        let every = self.options.janitor_every;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match hub.upgrade() {
                    Some(hub) => {
                        hub.sweep();
                    }
                    None => break,
                }
            }
        })
    }

    /// Complete every channel and stop background tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.complete(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn drain(stream: EventStream) -> Vec<HubEvent> {
        stream
            .filter(|e| futures_util::future::ready(e.kind != EventKind::Ping))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_first_subscriber_sees_earlier_events() {
        let hub = EventHub::default();
        hub.emit("s1", EventKind::Started, json!({"stepId": "s1"}));
        let sub = hub.subscribe("s1");
        hub.emit("s1", EventKind::Finished, json!({}));
        hub.complete("s1");

        let kinds: Vec<_> = drain(sub).await.into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Started, EventKind::Finished]);
    }

    #[tokio::test]
    async fn test_second_forward_is_rejected() {
        let hub = EventHub::default();
        let pending: ForwardStream = Box::pin(futures_util::stream::pending());
        assert!(hub.forward("s1", pending).is_some());
        let other: ForwardStream = Box::pin(futures_util::stream::empty());
        assert!(hub.forward("s1", other).is_none());
        hub.complete("s1");
    }

    #[tokio::test]
    async fn test_forward_appends_done_and_keeps_channel_open() {
        let hub = EventHub::default();
        let sub = hub.subscribe("s1");
        let tokens: ForwardStream =
            Box::pin(futures_util::stream::iter(vec![Ok("a".to_string()), Ok("b".to_string())]));
        hub.forward("s1", tokens).unwrap().finished().await;
        assert!(hub.contains("s1"));

        let again: ForwardStream =
            Box::pin(futures_util::stream::iter(vec![Err("bad".to_string())]));
        hub.forward("s1", again).unwrap().finished().await;
        hub.emit("s1", EventKind::Finished, json!({}));
        hub.complete("s1");

        let events = drain(sub).await;
        let data: Vec<_> = events.iter().map(|e| (e.kind, e.data())).collect();
        assert_eq!(
            data,
            vec![
                (EventKind::Message, "a".to_string()),
                (EventKind::Message, "b".to_string()),
                (EventKind::Message, "[DONE]".to_string()),
                (EventKind::Error, "{\"message\":\"bad\"}".to_string()),
                (EventKind::Finished, "{}".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings() {
        let hub = EventHub::new(HubOptions {
            heartbeat_every: Duration::from_secs(5),
            ..HubOptions::default()
        });
        let mut sub = hub.subscribe("s1");
        let first = sub.next().await.unwrap();
        assert_eq!(first.kind, EventKind::Ping);
        assert!(first.payload.get("ts").is_some());
        hub.complete("s1");
        assert!(sub.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_channels_only() {
        let hub = EventHub::new(HubOptions {
            step_ttl: Duration::from_secs(10),
            ..HubOptions::default()
        });
        hub.emit("old", EventKind::Started, json!({}));
        tokio::time::advance(Duration::from_secs(8)).await;
        hub.emit("fresh", EventKind::Started, json!({}));
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(hub.sweep(), 1);
        assert!(!hub.contains("old"));
        assert!(hub.contains("fresh"));
        hub.shutdown();
        assert!(hub.is_empty());
    }
}
