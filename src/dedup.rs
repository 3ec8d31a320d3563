use crate::error::{AppError, AppResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One unit of broadcast output. Streaming responses produce a run of `Sse`
/// chunks ended by `Done` or `Error`; buffered responses produce a single
/// `Response` or `Error`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Sse {
        event: Option<String>,
        data: String,
    },
    Response {
        status: u16,
        body: Value,
    },
    Error(AppError),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    Open,
    ClosedOk,
    ClosedError,
}

struct BroadcastInner {
    chunks: Vec<StreamEvent>,
    state: BroadcastState,
    subscribers: Vec<mpsc::UnboundedSender<StreamEvent>>,
}

/// Fan-out of one upstream response to any number of waiting clients.
///
/// Chunks are replayed to late subscribers: the subscribe lock spans both the
/// buffered prefix and sender registration, so a subscriber sees every chunk
/// exactly once, in publication order. Once closed the broadcaster is
/// immutable.
pub struct Broadcaster {
    inner: Mutex<BroadcastInner>,
}

impl Broadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BroadcastInner {
                chunks: Vec::new(),
                state: BroadcastState::Open,
                subscribers: Vec::new(),
            }),
        })
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("broadcaster lock");
        for chunk in &inner.chunks {
            let _ = tx.send(chunk.clone());
        }
        if inner.state == BroadcastState::Open {
            inner.subscribers.push(tx);
        }
        rx
    }

    /// Publish a live chunk. Returns the number of subscribers still
    /// listening; a leader can use a zero here to notice that every client
    /// has gone away. No-op once closed.
    pub fn publish(&self, chunk: StreamEvent) -> usize {
        let mut inner = self.inner.lock().expect("broadcaster lock");
        if inner.state != BroadcastState::Open {
            return 0;
        }
        inner.chunks.push(chunk.clone());
        inner.subscribers.retain(|tx| tx.send(chunk.clone()).is_ok());
        inner.subscribers.len()
    }

    pub fn close_ok(&self, terminal: StreamEvent) {
        self.close(terminal, BroadcastState::ClosedOk);
    }

    pub fn close_error(&self, err: AppError) {
        self.close(StreamEvent::Error(err), BroadcastState::ClosedError);
    }

    fn close(&self, terminal: StreamEvent, state: BroadcastState) {
        let mut inner = self.inner.lock().expect("broadcaster lock");
        if inner.state != BroadcastState::Open {
            return;
        }
        inner.chunks.push(terminal.clone());
        inner.state = state;
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(terminal.clone());
        }
    }

    pub fn state(&self) -> BroadcastState {
        self.inner.lock().expect("broadcaster lock").state
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock().expect("broadcaster lock");
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }

    /// Whether any streamed bytes have been committed to subscribers.
    pub fn has_published(&self) -> bool {
        !self.inner.lock().expect("broadcaster lock").chunks.is_empty()
    }
}

struct InFlightEntry {
    broadcaster: Arc<Broadcaster>,
    created_at: i64,
    waiters: u32,
}

pub enum JoinOutcome {
    /// No in-flight twin existed: the caller owns the broadcaster and must
    /// drive the upstream call.
    Leader(Arc<Broadcaster>),
    /// Attached to an existing broadcaster.
    Joined(mpsc::UnboundedReceiver<StreamEvent>),
}

/// Process-wide map of request fingerprints to in-flight broadcasters.
/// Entries live exactly as long as their broadcaster, except after a
/// mid-stream SSE error where removal is delayed so auto-retrying clients
/// land on the same error instead of stampeding upstream.
#[derive(Clone, Default)]
pub struct DedupTable {
    inner: Arc<Mutex<HashMap<String, InFlightEntry>>>,
}

impl DedupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join_or_lead(&self, fingerprint: &str, now: i64) -> JoinOutcome {
        let broadcaster = {
            let mut guard = self.inner.lock().expect("dedup table lock");
            match guard.get_mut(fingerprint) {
                Some(entry) => {
                    entry.waiters = entry.waiters.saturating_add(1);
                    entry.broadcaster.clone()
                }
                None => {
                    let broadcaster = Broadcaster::new();
                    guard.insert(
                        fingerprint.to_string(),
                        InFlightEntry {
                            broadcaster: broadcaster.clone(),
                            created_at: now,
                            waiters: 0,
                        },
                    );
                    return JoinOutcome::Leader(broadcaster);
                }
            }
        };
        // Subscribe outside the table lock. If the entry was retired in the
        // gap, the closed broadcaster still replays its full buffer, so the
        // subscriber observes the complete outcome.
        JoinOutcome::Joined(broadcaster.subscribe())
    }

    pub fn retire(&self, fingerprint: &str) {
        self.inner
            .lock()
            .expect("dedup table lock")
            .remove(fingerprint);
    }

    /// Delayed removal for the SSE-error retention window.
    pub fn retire_after(&self, fingerprint: &str, delay_secs: u64) {
        let table = self.clone();
        let fingerprint = fingerprint.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            table.retire(&fingerprint);
        });
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.inner
            .lock()
            .expect("dedup table lock")
            .contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("dedup table lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry_age(&self, fingerprint: &str, now: i64) -> Option<i64> {
        self.inner
            .lock()
            .expect("dedup table lock")
            .get(fingerprint)
            .map(|entry| now - entry.created_at)
    }
}

/// Drain a subscription down to its buffered non-stream outcome, bounded by
/// the deduplication timeout.
pub async fn await_response(
    mut rx: mpsc::UnboundedReceiver<StreamEvent>,
    timeout: Duration,
) -> AppResult<(u16, Value)> {
    loop {
        let next = tokio::time::timeout(timeout, rx.recv())
            .await
            .map_err(|_| AppError::deduplication_timeout())?;
        match next {
            Some(StreamEvent::Response { status, body }) => return Ok((status, body)),
            Some(StreamEvent::Error(err)) => return Err(err),
            Some(StreamEvent::Sse { .. }) => continue,
            Some(StreamEvent::Done) | None => {
                return Err(AppError::new(
                    axum::http::StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    "in-flight request ended without a response",
                ));
            }
        }
    }
}
