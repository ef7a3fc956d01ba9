//! Stream aggregator: one consumer task per stream id.
//!
//! The consumer owns the upstream subscription. Each chunk is broadcast raw
//! to subscribers and folded into a snapshot published through a `watch`
//! channel, so readers never contend with the fold itself.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::accumulator::{fold, Accumulator, Aggregated};
use crate::provider::{ChatProvider, ChatRequest, ChunkStream};

/// Token stream handed to the event hub: `Ok(chunk)` items, one terminal
/// `Err(message)` on upstream failure, and end-of-stream on completion.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, String>> + Send>>;

#[derive(Debug, Clone)]
enum Signal {
    Chunk(String),
    Error(String),
    Done,
}

#[derive(Debug)]
struct StreamHandle {
    signals: broadcast::Sender<Signal>,
    snapshot: watch::Receiver<Accumulator>,
    cancel: CancellationToken,
}

impl StreamHandle {
    fn subscribe(&self) -> TokenStream {
        let rx = self.signals.subscribe();
        if self.snapshot.borrow().finished {
            return Box::pin(futures_util::stream::empty());
        }
        signal_stream(rx)
    }
}

fn signal_stream(rx: broadcast::Receiver<Signal>) -> TokenStream {
    Box::pin(futures_util::stream::unfold(
        Some(rx),
        |state| async move {
            let mut rx = state?;
            loop {
                match rx.recv().await {
                    Ok(Signal::Chunk(chunk)) => return Some((Ok(chunk), Some(rx))),
                    Ok(Signal::Error(message)) => return Some((Err(message), None)),
                    Ok(Signal::Done) => return None,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "aggregator subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    ))
}

/// Registry of live provider streams keyed by stream id.
#[derive(Debug)]
pub struct StreamAggregator {
    streams: DashMap<String, Arc<StreamHandle>>,
    buffer: usize,
}

impl Default for StreamAggregator {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl StreamAggregator {
    /// `buffer` bounds the broadcast ring for slow subscribers.
    pub fn new(buffer: usize) -> Self {
        Self {
            streams: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Start streaming `request` from `provider` under `stream_id`.
    pub fn start(
        &self,
        stream_id: &str,
        provider: Arc<dyn ChatProvider>,
        request: ChatRequest,
    ) -> TokenStream {
        self.start_with(stream_id, async move { provider.stream(&request).await })
    }

    /// Start consuming the stream produced by `open` under `stream_id`.
    ///
    /// Idempotent: when the id is already started `open` is dropped unpolled.
    /// The returned subscription is created before the consumer runs, so the
    /// first caller sees every chunk; later callers see chunks from now on.
    pub fn start_with<F>(&self, stream_id: &str, open: F) -> TokenStream
    where
        F: Future<Output = anyhow::Result<ChunkStream>> + Send + 'static,
    {
        let entry = self.streams.entry(stream_id.to_string());
        let (signals, subscription, snapshot_tx, cancel) = match entry {
            Entry::Occupied(existing) => {
                debug!(stream_id, "stream already started");
                return existing.get().subscribe();
            }
            Entry::Vacant(slot) => {
                let (signals, subscription) = broadcast::channel(self.buffer);
                let (snapshot_tx, snapshot) = watch::channel(Accumulator::default());
                let cancel = CancellationToken::new();
                slot.insert(Arc::new(StreamHandle {
                    signals: signals.clone(),
                    snapshot,
                    cancel: cancel.clone(),
                }));
                (signals, subscription, snapshot_tx, cancel)
            }
        };

        let id = stream_id.to_string();
        tokio::spawn(async move {
            debug!(stream_id = %id, "stream start");
            let upstream = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = open => opened,
            };
            let mut upstream = match upstream {
                Ok(s) => s,
                Err(e) => {
                    finish(&snapshot_tx, &signals, Some(e.to_string()));
                    return;
                }
            };
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(stream_id = %id, "stream cancelled");
                        return;
                    }
                    next = upstream.next() => next,
                };
                match next {
                    Some(Ok(chunk)) => {
                        snapshot_tx.send_modify(|acc| {
                            *acc = fold(std::mem::take(acc), &chunk);
                        });
                        let _ = signals.send(Signal::Chunk(chunk));
                    }
                    Some(Err(e)) => {
                        warn!(stream_id = %id, error = %e, "stream error");
                        finish(&snapshot_tx, &signals, Some(e.to_string()));
                        return;
                    }
                    None => {
                        debug!(stream_id = %id, "stream complete");
                        finish(&snapshot_tx, &signals, None);
                        return;
                    }
                }
            }
        });

        signal_stream(subscription)
    }

    /// Subscribe to raw chunks of a started stream.
    pub fn subscribe(&self, stream_id: &str) -> Option<TokenStream> {
        self.streams.get(stream_id).map(|h| h.subscribe())
    }

    /// Whether a stream is registered under `stream_id`.
    pub fn is_started(&self, stream_id: &str) -> bool {
        self.streams.contains_key(stream_id)
    }

    /// Current snapshot without waiting.
    pub fn snapshot(&self, stream_id: &str) -> Aggregated {
        self.streams
            .get(stream_id)
            .map(|h| Aggregated::from(&*h.snapshot.borrow()))
            .unwrap_or_default()
    }

    /// Wait until no chunk arrives for `idle`, or the stream ends.
    ///
    /// Never fails: an idle stream, an upstream error and an unknown id all
    /// resolve to whatever was accumulated.
    pub async fn await_aggregated(&self, stream_id: &str, idle: Duration) -> Aggregated {
        let mut rx = match self.streams.get(stream_id) {
            Some(h) => h.snapshot.clone(),
            None => return Aggregated::default(),
        };
        loop {
            if rx.borrow_and_update().finished {
                break;
            }
            match tokio::time::timeout(idle, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => break,
                Err(_) => {
                    debug!(stream_id, "stream idle, treating as complete");
                    break;
                }
            }
        }
        let acc = rx.borrow();
        Aggregated::from(&*acc)
    }

    /// Final text of a stream: content, else reasoning.
    pub async fn await_final_text(&self, stream_id: &str, idle: Duration) -> String {
        self.await_aggregated(stream_id, idle)
            .await
            .final_text()
            .to_string()
    }

    /// Release a stream and cancel its upstream. Safe to call repeatedly.
    pub fn clear(&self, stream_id: &str) {
        if let Some((_, handle)) = self.streams.remove(stream_id) {
            handle.cancel.cancel();
        }
    }

    /// Number of live streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// True when no stream is live.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

fn finish(
    snapshot: &watch::Sender<Accumulator>,
    signals: &broadcast::Sender<Signal>,
    error: Option<String>,
) {
    snapshot.send_modify(|acc| {
        acc.finished = true;
        acc.error = error.clone();
    });
    let _ = signals.send(match error {
        Some(message) => Signal::Error(message),
        None => Signal::Done,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    fn chunk(text: &str) -> anyhow::Result<String> {
        Ok(json!({"content": text}).to_string())
    }

    /// Upstream that stays open until the sender is dropped.
    fn channel_upstream() -> (mpsc::UnboundedSender<anyhow::Result<String>>, ChunkStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let s = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|i| (i, rx)) });
        (tx, Box::pin(s))
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_converges() {
        let aggregator = StreamAggregator::default();
        let (tx, upstream) = channel_upstream();
        let _sub = aggregator.start_with("s1", async move { Ok(upstream) });

        tx.send(chunk("Hel")).unwrap();
        tx.send(chunk("lo")).unwrap();

        // Upstream never ends; only the idle timeout completes the wait.
        let agg = aggregator
            .await_aggregated("s1", Duration::from_millis(200))
            .await;
        assert_eq!(agg.content, "Hello");
        assert!(agg.error.is_none());
        drop(tx);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let aggregator = StreamAggregator::default();
        let first = aggregator.start_with("s1", async {
            Ok(Box::pin(stream::iter(vec![chunk("a")])) as ChunkStream)
        });
        let opened_again = Arc::new(AtomicBool::new(false));
        let flag = opened_again.clone();
        let _second = aggregator.start_with("s1", async move {
            flag.store(true, Ordering::SeqCst);
            Ok(Box::pin(stream::iter(Vec::<anyhow::Result<String>>::new())) as ChunkStream)
        });

        let chunks: Vec<_> = first.collect().await;
        assert_eq!(chunks.len(), 1);
        let agg = aggregator
            .await_aggregated("s1", Duration::from_secs(5))
            .await;
        assert_eq!(agg.content, "a");
        assert!(!opened_again.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_broadcast_and_error_signal() {
        let aggregator = StreamAggregator::default();
        let items = vec![chunk("x"), Err(anyhow::anyhow!("upstream broke"))];
        let sub = aggregator.start_with("s1", async move {
            Ok(Box::pin(stream::iter(items)) as ChunkStream)
        });

        let received: Vec<_> = sub.collect().await;
        assert_eq!(received.len(), 2);
        assert!(received[0].is_ok());
        assert_eq!(received[1], Err("upstream broke".to_string()));

        let agg = aggregator
            .await_aggregated("s1", Duration::from_secs(5))
            .await;
        assert_eq!(agg.content, "x");
        assert_eq!(agg.error.as_deref(), Some("upstream broke"));
    }

    #[tokio::test]
    async fn test_open_failure_resolves_empty() {
        let aggregator = StreamAggregator::default();
        let sub = aggregator.start_with("s1", async { Err(anyhow::anyhow!("refused")) });
        let received: Vec<_> = sub.collect().await;
        assert_eq!(received, vec![Err("refused".to_string())]);
        let agg = aggregator
            .await_aggregated("s1", Duration::from_secs(1))
            .await;
        assert_eq!(agg.content, "");
    }

    #[tokio::test]
    async fn test_unknown_stream_and_repeated_clear() {
        let aggregator = StreamAggregator::default();
        let agg = aggregator
            .await_aggregated("missing", Duration::from_millis(10))
            .await;
        assert_eq!(agg, Aggregated::default());

        let (_tx, upstream) = channel_upstream();
        let _sub = aggregator.start_with("s1", async move { Ok(upstream) });
        assert!(aggregator.is_started("s1"));
        aggregator.clear("s1");
        aggregator.clear("s1");
        assert!(!aggregator.is_started("s1"));
    }

    #[tokio::test]
    async fn test_reasoning_fallback_final_text() {
        let aggregator = StreamAggregator::default();
        let delta = json!({"choices": [{"delta": {"reasoning_content": "only thoughts"}}]});
        let items = vec![Ok(delta.to_string())];
        let _sub = aggregator.start_with("s1", async move {
            Ok(Box::pin(stream::iter(items)) as ChunkStream)
        });
        let text = aggregator
            .await_final_text("s1", Duration::from_secs(5))
            .await;
        assert_eq!(text, "only thoughts");
    }
}
