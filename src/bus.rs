// =============================================================================
// EventBus — ordered, resumable streams over Redis or in-process memory
// =============================================================================
//
// Contract shared by both backends:
//   * strict FIFO per stream,
//   * at-least-once delivery against a caller-held cursor (`last_id`),
//   * `consume` blocks up to `block_ms` and then surfaces `Timeout`, which
//     callers treat as "try again", never as an operator-facing error,
//   * transport failures are transient; retrying with the same cursor is
//     always safe because cursors live on the client.
//
// The `$` sentinel means "only messages appended after this call".
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::RedisConfig;
use crate::events::Event;

/// Default blocking window for `consume`, matching the service loop tick.
pub const DEFAULT_BLOCK_MS: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// No message arrived within `block_ms`. Retry with the same cursor.
    #[error("consume timed out")]
    Timeout,
    /// Transient transport failure; retry with the same cursor.
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("event codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Transport(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

enum Backend {
    Redis {
        conn: tokio::sync::Mutex<redis::aio::Connection>,
    },
    Memory(MemoryStreams),
}

/// In-process backend: an append-only log per stream with sequential message
/// ids, so cursor semantics (resume, replay, monotonicity) match the durable
/// backend. Used by tests and single-binary runs.
struct MemoryStreams {
    streams: parking_lot::Mutex<HashMap<String, Vec<(u64, Event)>>>,
    notify: Notify,
}

impl MemoryStreams {
    fn new() -> Self {
        Self {
            streams: parking_lot::Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    fn append(&self, stream: &str, event: Event) -> u64 {
        let mut streams = self.streams.lock();
        let log = streams.entry(stream.to_string()).or_default();
        let id = log.last().map(|(id, _)| id + 1).unwrap_or(1);
        log.push((id, event));
        self.notify.notify_waiters();
        id
    }

    /// First entry strictly after `cursor`, if any.
    fn read_after(&self, stream: &str, cursor: u64) -> Option<(Event, u64)> {
        let streams = self.streams.lock();
        let log = streams.get(stream)?;
        log.iter()
            .find(|(id, _)| *id > cursor)
            .map(|(id, event)| (event.clone(), *id))
    }

    fn tail_id(&self, stream: &str) -> u64 {
        let streams = self.streams.lock();
        streams
            .get(stream)
            .and_then(|log| log.last().map(|(id, _)| *id))
            .unwrap_or(0)
    }
}

/// Parse a caller-held cursor into the memory backend's numeric space.
/// Accepts plain integers and Redis-style `seq-part` ids; anything else
/// (including the conventional `0-0` start cursor) resolves to 0.
fn parse_memory_cursor(last_id: &str) -> u64 {
    let head = last_id.split('-').next().unwrap_or("0");
    head.parse().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Handle onto one bus backend. Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct EventBus {
    backend: Arc<Backend>,
}

impl EventBus {
    /// Connect per configuration: Redis Streams when `redis.enabled`,
    /// otherwise the in-process backend.
    pub async fn connect(cfg: &RedisConfig) -> Result<Self, BusError> {
        if !cfg.enabled {
            warn!("event bus running in-memory; streams are not durable");
            return Ok(Self::in_memory());
        }

        let client = redis::Client::open(cfg.url.as_str())?;
        let mut conn = client.get_async_connection().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        if let Err(e) = redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(&cfg.client_name)
            .query_async::<_, ()>(&mut conn)
            .await
        {
            debug!(error = %e, "CLIENT SETNAME not applied");
        }
        info!(url = %cfg.url, client_name = %cfg.client_name, "event bus connected (redis)");

        Ok(Self {
            backend: Arc::new(Backend::Redis {
                conn: tokio::sync::Mutex::new(conn),
            }),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(Backend::Memory(MemoryStreams::new())),
        }
    }

    /// Append `event` to `stream`, returning the assigned message id.
    pub async fn publish(&self, stream: &str, event: &Event) -> Result<String, BusError> {
        let payload = event.dumps()?;
        match self.backend.as_ref() {
            Backend::Redis { conn } => {
                let mut conn = conn.lock().await;
                let id: String = conn
                    .xadd(stream, "*", &[("payload", payload.as_slice())])
                    .await?;
                Ok(id)
            }
            Backend::Memory(mem) => Ok(mem.append(stream, event.clone()).to_string()),
        }
    }

    /// Blocking fan-read: the first message after `last_id`, waiting up to
    /// `block_ms` for one to arrive.
    pub async fn consume(
        &self,
        stream: &str,
        last_id: &str,
        block_ms: u64,
    ) -> Result<(Event, String), BusError> {
        match self.backend.as_ref() {
            Backend::Redis { conn } => {
                let opts = StreamReadOptions::default()
                    .count(1)
                    .block(block_ms as usize);
                let mut conn = conn.lock().await;
                let reply: StreamReadReply =
                    conn.xread_options(&[stream], &[last_id], &opts).await?;
                drop(conn);

                let entry = reply
                    .keys
                    .into_iter()
                    .next()
                    .and_then(|key| key.ids.into_iter().next())
                    .ok_or(BusError::Timeout)?;
                let raw = entry
                    .map
                    .get("payload")
                    .ok_or_else(|| BusError::Transport("stream entry missing payload".into()))?;
                let bytes: Vec<u8> = redis::from_redis_value(raw)?;
                Ok((Event::from_bytes(&bytes)?, entry.id))
            }
            Backend::Memory(mem) => {
                let cursor = if last_id == "$" {
                    mem.tail_id(stream)
                } else {
                    parse_memory_cursor(last_id)
                };
                let deadline =
                    tokio::time::Instant::now() + std::time::Duration::from_millis(block_ms);
                loop {
                    let notified = mem.notify.notified();
                    if let Some((event, id)) = mem.read_after(stream, cursor) {
                        return Ok((event, id.to_string()));
                    }
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => return Err(BusError::Timeout),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.backend.as_ref() {
            Backend::Redis { .. } => "redis",
            Backend::Memory(_) => "memory",
        };
        f.debug_struct("EventBus").field("backend", &backend).finish()
    }
}
