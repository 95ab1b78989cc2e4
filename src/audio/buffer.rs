use crate::config::OverflowPolicy;
use crate::error::RelayError;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Result of a non-blocking drain attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Drain {
    /// The oldest queued chunk.
    Chunk(Vec<u8>),
    /// Nothing queued yet but the session is still active; wait and retry.
    Pending,
    /// The buffer is closed and fully drained; the consumer must terminate.
    Ended,
}

/// Outcome of a successful push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Bytes evicted from the front to make room (drop-oldest policy only)
    pub dropped_bytes: usize,
}

#[derive(Default)]
struct Inner {
    chunks: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    closed: bool,
}

/// Per-session FIFO of raw audio chunks between the gateway (producer) and
/// the stream adapter (single consumer).
///
/// Capacity is counted in bytes. Once closed, pushes are refused but chunks
/// already queued are still handed to the consumer before it sees
/// [`Drain::Ended`].
pub struct ChunkBuffer {
    session_id: String,
    inner: Mutex<Inner>,
    notify: Notify,
    capacity_bytes: usize,
    policy: OverflowPolicy,
}

impl ChunkBuffer {
    pub fn new(session_id: impl Into<String>, capacity_bytes: usize, policy: OverflowPolicy) -> Self {
        Self {
            session_id: session_id.into(),
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity_bytes,
            policy,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned queue still holds valid bytes; keep serving it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a chunk. Never blocks.
    pub fn push(&self, chunk: Vec<u8>) -> Result<PushOutcome, RelayError> {
        if chunk.is_empty() {
            return Ok(PushOutcome::default());
        }

        let mut outcome = PushOutcome::default();
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(RelayError::SessionStopping(self.session_id.clone()));
            }

            // No amount of eviction makes room for a chunk larger than the buffer.
            if chunk.len() > self.capacity_bytes {
                return Err(RelayError::BufferFull {
                    session_id: self.session_id.clone(),
                    queued_bytes: inner.queued_bytes,
                });
            }

            if inner.queued_bytes + chunk.len() > self.capacity_bytes {
                match self.policy {
                    OverflowPolicy::Reject => {
                        return Err(RelayError::BufferFull {
                            session_id: self.session_id.clone(),
                            queued_bytes: inner.queued_bytes,
                        });
                    }
                    OverflowPolicy::DropOldest => {
                        while inner.queued_bytes + chunk.len() > self.capacity_bytes {
                            match inner.chunks.pop_front() {
                                Some(old) => {
                                    inner.queued_bytes -= old.len();
                                    outcome.dropped_bytes += old.len();
                                }
                                None => break,
                            }
                        }
                    }
                }
            }

            inner.queued_bytes += chunk.len();
            inner.chunks.push_back(chunk);
        }

        if outcome.dropped_bytes > 0 {
            warn!(
                session_id = %self.session_id,
                dropped_bytes = outcome.dropped_bytes,
                "consumer stalled, dropped oldest audio"
            );
        }

        self.notify.notify_one();
        Ok(outcome)
    }

    /// Pop the oldest chunk without waiting.
    pub fn try_drain(&self) -> Drain {
        let mut inner = self.lock();
        match inner.chunks.pop_front() {
            Some(chunk) => {
                inner.queued_bytes -= chunk.len();
                Drain::Chunk(chunk)
            }
            None if inner.closed => Drain::Ended,
            None => Drain::Pending,
        }
    }

    /// Wait for the next chunk. Returns `None` once the buffer is closed and empty.
    pub async fn next(&self) -> Option<Vec<u8>> {
        loop {
            match self.try_drain() {
                Drain::Chunk(chunk) => return Some(chunk),
                Drain::Ended => return None,
                // notify_one stores a permit when no one is waiting, so a push
                // landing between try_drain and here is not lost.
                Drain::Pending => self.notify.notified().await,
            }
        }
    }

    /// Refuse further pushes and let the consumer finish what is queued.
    pub fn close(&self) {
        let was_open = {
            let mut inner = self.lock();
            !std::mem::replace(&mut inner.closed, true)
        };
        if was_open {
            debug!(session_id = %self.session_id, "chunk buffer closed");
        }
        self.notify.notify_one();
    }

    /// Close and discard everything queued. Returns the discarded byte count.
    pub fn discard(&self) -> usize {
        let discarded = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.chunks.clear();
            std::mem::take(&mut inner.queued_bytes)
        };
        self.notify.notify_one();
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_empty(&self) -> bool {
        self.lock().chunks.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.lock().queued_bytes
    }

    pub fn len(&self) -> usize {
        self.lock().chunks.len()
    }
}
