//! Redis Streams broker (durable, at-least-once delivery).
//!
//! - **Stream key**: recorded events are appended to `custos:events`, or split across
//!   `custos:events:{n}` partitions by a hash of their event stream.
//! - **Consumer group**: the subscriber's workers share one group. Worker `n` is the only
//!   consumer of partition `n`, so every event stream is projected in order. Entries stay
//!   pending until `XACK`.
//! - **Redelivery**: entries pending longer than the pending timeout are claimed by
//!   whichever worker reads next. Entries handed out more than `max_redeliveries`
//!   times are parked without another attempt.
//! - **Parking**: `{stream}:parked` holds failed events with the failure reason.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use custos_core::StreamId;
use custos_events::{
    Delivery, EventPublisher, NackAction, ParkedEvent, PersistentSubscription, RecordedEvent, SubscriptionError,
    SubscriptionSource,
};

const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_BUFFER_SIZE: usize = 32;
const DEFAULT_MAX_REDELIVERIES: u32 = 5;

const FIELD_EVENT: &str = "event";
const FIELD_EVENT_TYPE: &str = "event_type";
const FIELD_TENANT: &str = "tenant";
const FIELD_REASON: &str = "reason";
const FIELD_PARKED_AT: &str = "parked_at";
const FIELD_ORIGINAL_ID: &str = "original_id";

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),
}

impl RedisStreamsError {
    fn command(op: &str, err: redis::RedisError) -> Self {
        Self::Command(format!("{op} failed: {err}"))
    }
}

/// Parked-set key for a stream.
pub fn parked_key(stream_key: &str) -> String {
    format!("{stream_key}:parked")
}

/// Redis key of `partition`. A single partition uses the bare stream key.
pub fn partition_key(stream_key: &str, partition: usize, partitions: usize) -> String {
    if partitions <= 1 {
        stream_key.to_string()
    } else {
        format!("{stream_key}:{partition}")
    }
}

/// Partition of an event stream: 64-bit FNV-1a of its id, stable across processes.
pub fn partition_of(stream_id: &StreamId, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    let hash = stream_id
        .as_str()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
        });
    (hash % partitions as u64) as usize
}

/// Consumer name of worker `worker` in `group`.
pub fn consumer_name(group: &str, worker: usize) -> String {
    format!("{group}-{worker}")
}

/// Stream entry fields for a recorded event. `event_type` and `tenant` are duplicated
/// outside the JSON body so entries can be inspected with `XRANGE`.
pub fn encode_fields(event: &RecordedEvent) -> Result<Vec<(&'static str, String)>, RedisStreamsError> {
    let body = serde_json::to_string(event).map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
    Ok(vec![
        (FIELD_EVENT_TYPE, event.event_type.clone()),
        (FIELD_TENANT, event.metadata.tenant.to_string()),
        (FIELD_EVENT, body),
    ])
}

pub fn decode_event(fields: &HashMap<String, String>) -> Result<RecordedEvent, RedisStreamsError> {
    let body = fields
        .get(FIELD_EVENT)
        .ok_or_else(|| RedisStreamsError::Deserialization("missing event field".to_string()))?;
    serde_json::from_str(body).map_err(|e| RedisStreamsError::Deserialization(format!("invalid event body: {e}")))
}

fn bulk_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// One stream entry: `[id, [field, value, ...]]`. `Ok(None)` for entries deleted from
/// the stream while pending, which Redis reports as nil.
pub fn parse_entry(entry: &redis::Value) -> Result<Option<(String, HashMap<String, String>)>, RedisStreamsError> {
    let parts = match entry {
        redis::Value::Nil => return Ok(None),
        redis::Value::Bulk(parts) if parts.len() == 2 => parts,
        _ => return Err(RedisStreamsError::Deserialization("invalid entry format".to_string())),
    };

    let id = bulk_string(&parts[0])
        .ok_or_else(|| RedisStreamsError::Deserialization("invalid entry id".to_string()))?;
    let raw = match &parts[1] {
        redis::Value::Nil => return Ok(None),
        redis::Value::Bulk(raw) => raw,
        _ => return Err(RedisStreamsError::Deserialization("invalid entry fields".to_string())),
    };

    let mut fields = HashMap::new();
    for pair in raw.chunks(2) {
        if let [key, value] = pair {
            if let (Some(key), Some(value)) = (bulk_string(key), bulk_string(value)) {
                fields.insert(key, value);
            }
        }
    }
    Ok(Some((id, fields)))
}

/// Entries of an `XREADGROUP` reply for a single stream. A blocked read that timed out
/// replies nil.
pub fn parse_read_reply(reply: &redis::Value) -> Result<Vec<(String, HashMap<String, String>)>, RedisStreamsError> {
    let streams = match reply {
        redis::Value::Nil => return Ok(Vec::new()),
        redis::Value::Bulk(streams) => streams,
        _ => return Err(RedisStreamsError::Deserialization("invalid XREADGROUP reply".to_string())),
    };

    let mut out = Vec::new();
    for stream in streams {
        let redis::Value::Bulk(pair) = stream else {
            continue;
        };
        if let Some(redis::Value::Bulk(entries)) = pair.get(1) {
            for entry in entries {
                if let Some(parsed) = parse_entry(entry)? {
                    out.push(parsed);
                }
            }
        }
    }
    Ok(out)
}

/// `XPENDING .. IDLE` rows as `(entry id, delivery count)`.
fn parse_pending(reply: &redis::Value) -> Vec<(String, u32)> {
    let redis::Value::Bulk(rows) = reply else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| match row {
            redis::Value::Bulk(cols) if cols.len() == 4 => {
                let id = bulk_string(&cols[0])?;
                let count = match &cols[3] {
                    redis::Value::Int(n) => u32::try_from(*n).ok()?,
                    other => bulk_string(other)?.parse().ok()?,
                };
                Some((id, count))
            }
            _ => None,
        })
        .collect()
}

/// Any failure while reading ends the subscription; the pool stops rather than
/// reconnecting a single worker.
fn receive_error(op: &str, err: redis::RedisError) -> SubscriptionError {
    if err.is_io_error() || err.is_connection_dropped() {
        SubscriptionError::Dropped(format!("connection lost during {op}: {err}"))
    } else {
        SubscriptionError::Dropped(format!("{op} failed: {err}"))
    }
}

/// Redis Streams publisher and consumer-group source.
#[derive(Debug, Clone)]
pub struct RedisStreams {
    client: redis::Client,
    stream_key: String,
    parked_key: String,
    partitions: usize,
    pending_timeout: Duration,
    buffer_size: usize,
    max_redeliveries: u32,
}

impl RedisStreams {
    /// Opens a client for `redis_url`. No connection is made until first use.
    pub fn new(redis_url: impl AsRef<str>, stream_key: impl Into<String>) -> Result<Self, RedisStreamsError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        let stream_key = stream_key.into();

        Ok(Self {
            client,
            parked_key: parked_key(&stream_key),
            stream_key,
            partitions: 1,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
        })
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    /// Number of partitions; must match the subscriber's pool size.
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn with_max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = max;
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Creates `group` at the start of the partition stream `key`. Idempotent.
    pub fn ensure_consumer_group(
        &self,
        conn: &mut redis::Connection,
        key: &str,
        group: &str,
    ) -> Result<(), RedisStreamsError> {
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::ConsumerGroup(e.to_string())),
        }
    }

    /// Oldest `count` parked events, for triage.
    pub fn parked(&self, count: usize) -> Result<Vec<ParkedEvent>, RedisStreamsError> {
        let mut conn = self.connection()?;
        let reply: redis::Value = redis::cmd("XRANGE")
            .arg(&self.parked_key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::command("XRANGE", e))?;

        let redis::Value::Bulk(entries) = reply else {
            return Ok(Vec::new());
        };
        let mut parked = Vec::new();
        for entry in &entries {
            let Some((_, fields)) = parse_entry(entry)? else {
                continue;
            };
            let parked_at = fields
                .get(FIELD_PARKED_AT)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            parked.push(ParkedEvent {
                event: decode_event(&fields)?,
                reason: fields.get(FIELD_REASON).cloned().unwrap_or_default(),
                parked_at,
            });
        }
        Ok(parked)
    }
}

impl EventPublisher for RedisStreams {
    type Error = RedisStreamsError;

    #[instrument(
        skip(self, event),
        fields(stream_key = %self.stream_key, event_id = %event.event_id, event_type = %event.event_type),
        err
    )]
    fn publish(&self, event: &RecordedEvent) -> Result<(), Self::Error> {
        let fields = encode_fields(event)?;
        let key = partition_key(
            &self.stream_key,
            partition_of(&event.stream_id, self.partitions),
            self.partitions,
        );
        let mut conn = self.connection()?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&key).arg("*");
        for (key, value) in &fields {
            cmd.arg(*key).arg(value);
        }
        let _: String = cmd.query(&mut conn).map_err(|e| RedisStreamsError::command("XADD", e))?;
        Ok(())
    }
}

impl SubscriptionSource for RedisStreams {
    fn connect(&self, group: &str, worker: usize) -> Result<Box<dyn PersistentSubscription>, SubscriptionError> {
        // A second consumer on a partition would break per-stream ordering.
        if worker >= self.partitions {
            return Err(SubscriptionError::Connect(format!(
                "worker {worker} has no partition; {} configured",
                self.partitions
            )));
        }
        let key = partition_key(&self.stream_key, worker, self.partitions);
        let mut conn = self.connection().map_err(|e| SubscriptionError::Connect(e.to_string()))?;
        self.ensure_consumer_group(&mut conn, &key, group)
            .map_err(|e| SubscriptionError::Connect(e.to_string()))?;

        debug!(stream_key = %key, group, worker, "joined consumer group");
        Ok(Box::new(RedisStreamsSubscription {
            streams: self.clone(),
            key,
            group: group.to_string(),
            consumer: consumer_name(group, worker),
            conn: Mutex::new(conn),
            buffer: Mutex::new(VecDeque::new()),
        }))
    }
}

/// One worker's membership in a Redis consumer group, on its own partition.
///
/// Holds its own connection; a blocking `XREADGROUP` would otherwise stall the other
/// workers.
pub struct RedisStreamsSubscription {
    streams: RedisStreams,
    key: String,
    group: String,
    consumer: String,
    conn: Mutex<redis::Connection>,
    buffer: Mutex<VecDeque<Delivery>>,
}

impl RedisStreamsSubscription {
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> Result<T, SubscriptionError>,
    ) -> Result<T, SubscriptionError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| SubscriptionError::Dropped("connection lock poisoned".to_string()))?;
        f(&mut conn)
    }

    /// Claims entries left pending past the timeout, typically by this consumer before a restart.
    fn claim_stale(&self, conn: &mut redis::Connection) -> Result<Vec<Delivery>, SubscriptionError> {
        let idle_ms = self.streams.pending_timeout.as_millis() as u64;
        let pending: redis::Value = redis::cmd("XPENDING")
            .arg(&self.key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(self.streams.buffer_size)
            .query(conn)
            .map_err(|e| receive_error("XPENDING", e))?;

        let stale = parse_pending(&pending);
        if stale.is_empty() {
            return Ok(Vec::new());
        }
        let counts: HashMap<String, u32> = stale.iter().cloned().collect();
        let ids: Vec<&str> = stale.iter().map(|(id, _)| id.as_str()).collect();

        let claimed: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(idle_ms)
            .arg(&ids[..])
            .query(conn)
            .map_err(|e| receive_error("XCLAIM", e))?;

        let redis::Value::Bulk(entries) = claimed else {
            return Ok(Vec::new());
        };
        let mut deliveries = Vec::new();
        for entry in &entries {
            let parsed = parse_entry(entry).map_err(|e| SubscriptionError::Dropped(e.to_string()))?;
            let Some((id, fields)) = parsed else {
                continue;
            };
            let retry_count = counts.get(&id).copied().unwrap_or(1);
            match decode_event(&fields) {
                Ok(event) if retry_count > self.streams.max_redeliveries => {
                    let delivery = Delivery {
                        delivery_id: id,
                        event,
                        retry_count,
                    };
                    warn!(
                        delivery_id = %delivery.delivery_id,
                        retry_count,
                        "redelivery limit reached, parking event"
                    );
                    self.park(conn, &delivery, "redelivery limit reached")?;
                }
                Ok(event) => deliveries.push(Delivery {
                    delivery_id: id,
                    event,
                    retry_count,
                }),
                Err(err) => self.discard(conn, &id, &err)?,
            }
        }
        Ok(deliveries)
    }

    fn read_new(&self, conn: &mut redis::Connection, timeout: Duration) -> Result<Vec<Delivery>, SubscriptionError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.streams.buffer_size)
            .arg("BLOCK")
            .arg(timeout.as_millis().max(1) as u64)
            .arg("STREAMS")
            .arg(&self.key)
            .arg(">")
            .query(conn)
            .map_err(|e| receive_error("XREADGROUP", e))?;

        let entries = parse_read_reply(&reply).map_err(|e| SubscriptionError::Dropped(e.to_string()))?;
        let mut deliveries = Vec::with_capacity(entries.len());
        for (id, fields) in entries {
            match decode_event(&fields) {
                Ok(event) => deliveries.push(Delivery {
                    delivery_id: id,
                    event,
                    retry_count: 0,
                }),
                Err(err) => self.discard(conn, &id, &err)?,
            }
        }
        Ok(deliveries)
    }

    /// Entries that cannot be decoded never will be; acknowledge them so they stop
    /// coming back.
    fn discard(&self, conn: &mut redis::Connection, id: &str, err: &RedisStreamsError) -> Result<(), SubscriptionError> {
        warn!(delivery_id = %id, error = %err, "discarding undecodable stream entry");
        self.xack(conn, id)
    }

    fn xack(&self, conn: &mut redis::Connection, id: &str) -> Result<(), SubscriptionError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.key)
            .arg(&self.group)
            .arg(id)
            .query(conn)
            .map_err(|e| SubscriptionError::Settle {
                delivery_id: id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn park(&self, conn: &mut redis::Connection, delivery: &Delivery, reason: &str) -> Result<(), SubscriptionError> {
        let settle_err = |reason: String| SubscriptionError::Settle {
            delivery_id: delivery.delivery_id.clone(),
            reason,
        };
        let body = serde_json::to_string(&delivery.event).map_err(|e| settle_err(e.to_string()))?;

        let _: String = redis::cmd("XADD")
            .arg(&self.streams.parked_key)
            .arg("*")
            .arg(FIELD_ORIGINAL_ID)
            .arg(&delivery.delivery_id)
            .arg(FIELD_REASON)
            .arg(reason)
            .arg(FIELD_PARKED_AT)
            .arg(Utc::now().to_rfc3339())
            .arg(FIELD_EVENT)
            .arg(body)
            .query(conn)
            .map_err(|e| settle_err(format!("XADD failed: {e}")))?;

        self.xack(conn, &delivery.delivery_id)
    }
}

impl PersistentSubscription for RedisStreamsSubscription {
    fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, SubscriptionError> {
        {
            let mut buffer = self
                .buffer
                .lock()
                .map_err(|_| SubscriptionError::Dropped("buffer lock poisoned".to_string()))?;
            if let Some(delivery) = buffer.pop_front() {
                return Ok(Some(delivery));
            }
        }

        let fetched = self.with_conn(|conn| {
            let claimed = self.claim_stale(conn)?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }
            self.read_new(conn, timeout)
        })?;

        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| SubscriptionError::Dropped("buffer lock poisoned".to_string()))?;
        buffer.extend(fetched);
        Ok(buffer.pop_front())
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), SubscriptionError> {
        self.with_conn(|conn| self.xack(conn, &delivery.delivery_id))
    }

    fn nack(&self, delivery: &Delivery, reason: &str, action: NackAction) -> Result<(), SubscriptionError> {
        match action {
            // Left pending; claimed again once idle past the pending timeout.
            NackAction::Retry => Ok(()),
            NackAction::Park => self.with_conn(|conn| self.park(conn, delivery, reason)),
        }
    }
}
