use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::sink::{Sink, SinkError};

/// Join records into one payload. Every record, the last one included, is
/// followed by `\n`.
pub fn encode(records: &[String]) -> Bytes {
    let len = records.iter().map(|r| r.len() + 1).sum();
    let mut payload = String::with_capacity(len);
    for record in records {
        payload.push_str(record);
        payload.push('\n');
    }
    Bytes::from(payload)
}

/// Internal state behind the single mutex. Records, counters and the
/// in-flight flush live together so there is no lock ordering to get wrong.
#[derive(Default)]
struct BufferState {
    records: VecDeque<String>,
    records_sent: u64,
    records_dropped: u64,
    flush_task: Option<JoinHandle<()>>,
}

impl BufferState {
    /// Snapshot and clear. Records are counted as sent here, before any
    /// delivery attempt.
    fn take(&mut self) -> Vec<String> {
        let snapshot: Vec<String> = self.records.drain(..).collect();
        self.records_sent += snapshot.len() as u64;
        snapshot
    }
}

/// Bounded FIFO of pending metric records, shared between producers and the
/// flush path.
///
/// Uses `std::sync::Mutex` (not tokio) because the lock is never held across
/// `.await`; delivery always happens on a snapshot taken out of the lock.
#[derive(Clone)]
pub struct MetricBuffer {
    state: Arc<Mutex<BufferState>>,
    capacity: usize,
}

impl MetricBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BufferState::default())),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record. Returns `false` if the oldest record had to be evicted
    /// to make room.
    pub fn add(&self, record: impl Into<String>) -> bool {
        let mut guard = self.lock();
        guard.records.push_back(record.into());
        if guard.records.len() > self.capacity {
            guard.records.pop_front();
            guard.records_dropped += 1;
            warn!(
                capacity = self.capacity,
                dropped_total = guard.records_dropped,
                "buffer overflow, dropped oldest record"
            );
            return false;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records handed to a sink so far, whether or not delivery succeeded.
    pub fn records_sent(&self) -> u64 {
        self.lock().records_sent
    }

    pub fn records_dropped(&self) -> u64 {
        self.lock().records_dropped
    }

    /// Drain the buffer and deliver its contents as one payload.
    ///
    /// Returns `Ok(0)` without touching the sink when there is nothing to send.
    /// A failed delivery is returned to the caller; the records are not put back.
    pub async fn flush<S: Sink>(&self, sink: &S) -> Result<usize, SinkError> {
        let snapshot = self.lock().take();
        if snapshot.is_empty() {
            return Ok(0);
        }
        sink.write(encode(&snapshot)).await
    }

    /// Spawn a background flush. Returns `true` if a flush was spawned, `false`
    /// if skipped (already in-flight or buffer empty).
    pub fn spawn_flush<S: Sink>(&self, sink: &Arc<S>) -> bool {
        let mut guard = self.lock();

        if let Some(handle) = guard.flush_task.as_ref()
            && !handle.is_finished()
        {
            debug!("flush already in flight, skipping");
            return false;
        }

        // Join the finished task to surface panics before overwriting.
        if let Some(mut handle) = guard.flush_task.take() {
            let waker = Waker::noop();
            let mut cx = Context::from_waker(waker);
            if let Poll::Ready(Err(e)) = Pin::new(&mut handle).poll(&mut cx) {
                error!(error = %e, "background flush task panicked");
            }
        }

        let snapshot = guard.take();
        if snapshot.is_empty() {
            return false;
        }

        let sink = Arc::clone(sink);
        guard.flush_task = Some(tokio::spawn(async move {
            let records = snapshot.len();
            match sink.write(encode(&snapshot)).await {
                Ok(bytes) => debug!(records, bytes, "flushed metric records"),
                Err(e) => error!(error = %e, records, "flush failed, dropping records"),
            }
        }));

        true
    }

    /// Join any in-flight background flush to completion.
    pub async fn join_flush_task(&self) {
        let handle = self.lock().flush_task.take();
        if let Some(h) = handle
            && let Err(e) = h.await
        {
            error!(error = %e, "background flush task panicked");
        }
    }
}
