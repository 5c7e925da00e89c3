//! Live tunnel rendezvous between an SSH producer and an HTTP consumer.
//!
//! A tunnel is minted when an SSH session asks for `tunnel=true`: the
//! session's stdin is bridged into a [`TunnelData`] and parked in the
//! process-local [`TunnelRegistry`] under a fresh key. The next HTTP request
//! for that key drains the stream into its response body, then fires the
//! tunnel's one-shot `done` signal so the blocked SSH session can finish.
//! Tunnels that never meet a consumer are reaped by a periodic sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Maximum age of a tunnel before the reaper forcibly completes it.
pub const TUNNEL_TTL: Duration = Duration::from_secs(17 * 60);

/// How often the reaper sweeps the registry.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Hard bound on the bytes a consumer may pull through one tunnel.
pub const MAX_STREAM_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("stream size exceeded")]
    StreamSizeExceeded,
}

struct TunnelStream {
    rx: mpsc::Receiver<Bytes>,
    bytes_read: usize,
    exceeded: bool,
}

/// One live tunnel: the producer's byte stream plus its lifecycle state.
///
/// `recv` is meant for a single consumer; the registry contract (one browser
/// per key) keeps it that way, and the interior mutex keeps even a violation
/// memory-safe. `done` can be fired from the consumer, the reaper, or a
/// shutdown drain — all paths are idempotent.
pub struct TunnelData {
    stream: Mutex<TunnelStream>,
    created_at: Instant,
    done: CancellationToken,
}

impl TunnelData {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            stream: Mutex::new(TunnelStream {
                rx,
                bytes_read: 0,
                exceeded: false,
            }),
            created_at: Instant::now(),
            done: CancellationToken::new(),
        }
    }

    /// Pull the next chunk from the producer.
    ///
    /// Returns `Ok(None)` on end of stream. Once the cumulative total would
    /// cross [`MAX_STREAM_SIZE`] the crossing chunk is dropped and this and
    /// every later call return [`TunnelError::StreamSizeExceeded`].
    pub async fn recv(&self) -> Result<Option<Bytes>, TunnelError> {
        let mut stream = self.stream.lock().await;
        if stream.exceeded {
            return Err(TunnelError::StreamSizeExceeded);
        }
        match stream.rx.recv().await {
            None => Ok(None),
            Some(chunk) => {
                stream.bytes_read += chunk.len();
                if stream.bytes_read > MAX_STREAM_SIZE {
                    stream.exceeded = true;
                    return Err(TunnelError::StreamSizeExceeded);
                }
                Ok(Some(chunk))
            }
        }
    }

    /// Block until the consumer (or the reaper) signals completion.
    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    /// Signal completion. Safe to call any number of times from any task.
    pub fn done(&self) {
        self.done.cancel();
    }

    /// Guard that fires [`TunnelData::done`] when dropped. The consumer holds
    /// one for the lifetime of its response so the producer is released on
    /// every exit path.
    pub fn done_guard(&self) -> DropGuard {
        self.done.clone().drop_guard()
    }

    fn older_than(&self, max_age: Duration) -> bool {
        self.created_at.elapsed() > max_age
    }
}

/// Process-local map from key to live tunnel.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, Arc<TunnelData>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel. Keys come from the minter, so overwrites do not
    /// happen in normal operation; last-writer-wins if they do.
    pub fn add(&self, key: String, tunnel: Arc<TunnelData>) {
        self.tunnels.write().insert(key, tunnel);
    }

    pub fn get(&self, key: &str) -> Option<Arc<TunnelData>> {
        self.tunnels.read().get(key).cloned()
    }

    /// Remove a tunnel. Idempotent; the producer and the reaper may race
    /// here and both succeed.
    pub fn remove(&self, key: &str) {
        self.tunnels.write().remove(key);
    }

    /// Reap tunnels older than [`TUNNEL_TTL`], firing `done` on each so the
    /// producer side unblocks. Returns the number reaped.
    pub fn clean_up(&self) -> usize {
        self.clean_up_older_than(TUNNEL_TTL)
    }

    fn clean_up_older_than(&self, max_age: Duration) -> usize {
        let mut tunnels = self.tunnels.write();
        let before = tunnels.len();
        tunnels.retain(|_, tunnel| {
            if tunnel.older_than(max_age) {
                tunnel.done();
                false
            } else {
                true
            }
        });
        before - tunnels.len()
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.read().len()
    }

    /// Drain the registry, releasing every blocked producer. Used on
    /// process shutdown.
    pub fn shutdown(&self) {
        let mut tunnels = self.tunnels.write();
        for tunnel in tunnels.values() {
            tunnel.done();
        }
        tunnels.clear();
    }
}
