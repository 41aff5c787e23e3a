//! Shared-store task monitor backed by Redis
//!
//! Task records live in hashes under a namespace; the content-hash
//! idempotency map uses plain keys with the dedup TTL; non-terminal task ids
//! sit in an `active` set for the sweeper. Every read-then-write mutation is a
//! single Lua script, so `start_task` and the terminal transitions are atomic
//! across processes. Events are PUBLISHed only after the script commits; a
//! per-process listener task bridges the pub/sub channel into the local
//! broadcast channel that `subscribe` hands out.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use podcast_tts_config::{EngineConfig, StoreConfig};
use podcast_tts_core::{
    epoch_ms, ErrorKind, Strategy, TaskEvent, TaskRecord, TaskStatus,
};

use crate::{MonitorError, MonitorStats, StartOutcome, TaskMonitor};

const EVENT_CHANNEL_CAPACITY: usize = 256;

const START_TASK_SCRIPT: &str = r#"
local idem_key = KEYS[1]
local task_key = KEYS[2]
local active_key = KEYS[3]
local text_id = ARGV[1]
local content_hash = ARGV[2]
local now_ms = ARGV[3]
local idem_ttl = tonumber(ARGV[4])
local task_prefix = ARGV[5]

local existing = redis.call('GET', idem_key)
if existing then
    local existing_status = redis.call('HGET', task_prefix .. existing, 'status')
    if existing_status == 'queued' or existing_status == 'processing' then
        if existing == text_id then
            return {'already_running', existing}
        end
        return {'duplicate', existing}
    end
end

local status = redis.call('HGET', task_key, 'status')
if status == 'queued' or status == 'processing' then
    return {'already_running', text_id}
end

redis.call('DEL', task_key)
redis.call('HSET', task_key,
    'text_id', text_id,
    'content_hash', content_hash,
    'status', 'queued',
    'start_time_ms', now_ms,
    'segment_count', '0',
    'segments_completed', '0')
redis.call('SET', idem_key, text_id, 'EX', idem_ttl)
redis.call('SADD', active_key, text_id)
return {'started', text_id}
"#;

const BEGIN_PROCESSING_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
    return -1
end
if status == 'queued' then
    redis.call('HSET', KEYS[1], 'status', 'processing')
    return 1
end
return 0
"#;

const RECORD_PROGRESS_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
    return {-1, -1}
end
if status == 'completed' or status == 'failed' or status == 'timeout' then
    return {0, 0}
end
local total = tonumber(redis.call('HGET', KEYS[1], 'segment_count') or '0')
local done = tonumber(ARGV[1])
if done > total then
    done = total
end
redis.call('HSET', KEYS[1], 'segments_completed', done)
return {done, total}
"#;

// Terminal transition. ARGV: text_id, now_ms, retention_secs, target_status,
// stats_counter, then field/value pairs for extra record fields.
const TERMINAL_SCRIPT: &str = r#"
local task_key = KEYS[1]
local status = redis.call('HGET', task_key, 'status')
if not status then
    return {'missing', ''}
end
if status == 'completed' or status == 'failed' or status == 'timeout' then
    return {'noop', status}
end

local now_ms = tonumber(ARGV[2])
local start_ms = tonumber(redis.call('HGET', task_key, 'start_time_ms') or ARGV[2])
local duration = now_ms - start_ms
if duration < 0 then
    duration = 0
end

redis.call('HSET', task_key, 'status', ARGV[4], 'end_time_ms', ARGV[2])
for i = 6, #ARGV, 2 do
    redis.call('HSET', task_key, ARGV[i], ARGV[i + 1])
end
if ARGV[4] == 'completed' then
    local total = redis.call('HGET', task_key, 'segment_count') or '0'
    redis.call('HSET', task_key, 'segments_completed', total)
end
redis.call('SREM', KEYS[2], ARGV[1])
redis.call('HINCRBY', KEYS[3], ARGV[5], 1)
redis.call('LPUSH', KEYS[4], duration)
redis.call('LTRIM', KEYS[4], 0, 999)
redis.call('EXPIRE', task_key, tonumber(ARGV[3]))
return {'ok', ARGV[4]}
"#;

/// Namespaced key layout.
#[derive(Clone)]
struct Keys {
    ns: String,
}

impl Keys {
    fn task(&self, text_id: &str) -> String {
        format!("{}:task:{}", self.ns, text_id)
    }

    fn task_prefix(&self) -> String {
        format!("{}:task:", self.ns)
    }

    fn idem(&self, content_hash: &str) -> String {
        format!("{}:idem:{}", self.ns, content_hash)
    }

    fn active(&self) -> String {
        format!("{}:active", self.ns)
    }

    fn stats(&self) -> String {
        format!("{}:stats", self.ns)
    }

    fn durations(&self) -> String {
        format!("{}:durations", self.ns)
    }

    fn events(&self) -> String {
        format!("{}:events", self.ns)
    }

    fn sweep_lock(&self) -> String {
        format!("{}:sweeper", self.ns)
    }
}

pub struct RedisTaskMonitor {
    conn: ConnectionManager,
    keys: Keys,
    events: broadcast::Sender<TaskEvent>,
    idempotency_ttl_secs: u64,
    terminal_retention_secs: u64,
    listener: JoinHandle<()>,
}

impl RedisTaskMonitor {
    /// Probe the shared store and construct the backend.
    ///
    /// Fails fast (within the configured probe timeout) so startup can fall
    /// back to the in-memory monitor.
    pub async fn connect(
        store: &StoreConfig,
        engine: &EngineConfig,
    ) -> Result<Self, MonitorError> {
        let client = redis::Client::open(store.redis_url.as_str())?;

        let mut conn = tokio::time::timeout(store.probe_timeout(), ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| MonitorError::Store("connectivity probe timed out".to_string()))??;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(MonitorError::Store(format!("unexpected probe reply: {pong}")));
        }

        let keys = Keys {
            ns: store.namespace.clone(),
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let listener = spawn_event_listener(client, keys.events(), events.clone());

        Ok(Self {
            conn,
            keys,
            events,
            idempotency_ttl_secs: engine.idempotency_ttl_seconds,
            terminal_retention_secs: engine.terminal_retention_seconds,
            listener,
        })
    }

    async fn publish(&self, event: &TaskEvent) -> Result<(), MonitorError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| MonitorError::InvalidRecord(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(self.keys.events())
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn run_terminal(
        &self,
        text_id: &str,
        target: TaskStatus,
        counter: &str,
        extra_fields: &[(&str, String)],
    ) -> Result<(String, String), MonitorError> {
        let mut conn = self.conn.clone();
        let script = Script::new(TERMINAL_SCRIPT);
        let mut invocation = script.key(self.keys.task(text_id));
        invocation
            .key(self.keys.active())
            .key(self.keys.stats())
            .key(self.keys.durations())
            .arg(text_id)
            .arg(epoch_ms())
            .arg(self.terminal_retention_secs)
            .arg(target.as_str())
            .arg(counter);
        for (field, value) in extra_fields {
            invocation.arg(*field).arg(value);
        }
        let (outcome, status): (String, String) = invocation.invoke_async(&mut conn).await?;
        Ok((outcome, status))
    }

    async fn fetch_record(&self, text_id: &str) -> Result<Option<TaskRecord>, MonitorError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.task(text_id))
            .query_async(&mut conn)
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        record_from_map(&map).map(Some)
    }
}

impl Drop for RedisTaskMonitor {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Bridge the store's pub/sub channel into the local broadcast channel,
/// reconnecting with a short backoff if the subscription drops.
fn spawn_event_listener(
    client: redis::Client,
    channel: String,
    tx: broadcast::Sender<TaskEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match client.get_async_connection().await {
                Ok(conn) => {
                    let mut pubsub = conn.into_pubsub();
                    if let Err(e) = pubsub.subscribe(&channel).await {
                        tracing::warn!(error = %e, "event channel subscribe failed");
                    } else {
                        let mut stream = pubsub.on_message();
                        while let Some(msg) = stream.next().await {
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(_) => continue,
                            };
                            match serde_json::from_str::<TaskEvent>(&payload) {
                                Ok(event) => {
                                    let _ = tx.send(event);
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "malformed task event dropped");
                                }
                            }
                        }
                        tracing::warn!("event channel subscription ended; reconnecting");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "event listener connection failed");
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
}

#[async_trait]
impl TaskMonitor for RedisTaskMonitor {
    async fn start_task(
        &self,
        text_id: &str,
        content_hash: &str,
    ) -> Result<StartOutcome, MonitorError> {
        let now = epoch_ms();
        let mut conn = self.conn.clone();
        let (outcome, existing): (String, String) = Script::new(START_TASK_SCRIPT)
            .key(self.keys.idem(content_hash))
            .key(self.keys.task(text_id))
            .key(self.keys.active())
            .arg(text_id)
            .arg(content_hash)
            .arg(now)
            .arg(self.idempotency_ttl_secs)
            .arg(self.keys.task_prefix())
            .invoke_async(&mut conn)
            .await?;

        match outcome.as_str() {
            "started" => {
                self.publish(&TaskEvent::queued(text_id, now)).await?;
                Ok(StartOutcome::Started)
            }
            "already_running" => Ok(StartOutcome::AlreadyRunning),
            "duplicate" => Ok(StartOutcome::DuplicateContent {
                existing_text_id: existing,
            }),
            other => Err(MonitorError::InvalidRecord(format!(
                "unexpected start outcome: {other}"
            ))),
        }
    }

    async fn begin_processing(&self, text_id: &str) -> Result<(), MonitorError> {
        let mut conn = self.conn.clone();
        let moved: i64 = Script::new(BEGIN_PROCESSING_SCRIPT)
            .key(self.keys.task(text_id))
            .invoke_async(&mut conn)
            .await?;
        match moved {
            -1 => Err(MonitorError::NotFound(text_id.to_string())),
            1 => {
                self.publish(&TaskEvent::started(text_id, epoch_ms())).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn record_strategy(
        &self,
        text_id: &str,
        strategy: Strategy,
        segment_count: u32,
    ) -> Result<(), MonitorError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(self.keys.task(text_id))
            .arg("strategy")
            .arg(strategy.as_str())
            .arg("segment_count")
            .arg(segment_count)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn record_progress(
        &self,
        text_id: &str,
        segments_completed: u32,
    ) -> Result<(), MonitorError> {
        let mut conn = self.conn.clone();
        let (done, total): (i64, i64) = Script::new(RECORD_PROGRESS_SCRIPT)
            .key(self.keys.task(text_id))
            .arg(segments_completed)
            .invoke_async(&mut conn)
            .await?;
        if done == -1 {
            return Err(MonitorError::NotFound(text_id.to_string()));
        }
        if total > 0 {
            self.publish(&TaskEvent::progress(
                text_id,
                done as u32,
                total as u32,
                epoch_ms(),
            ))
            .await?;
        }
        Ok(())
    }

    async fn complete_task(
        &self,
        text_id: &str,
        audio_key: &str,
        audio_filename: &str,
        audio_url: &str,
    ) -> Result<TaskStatus, MonitorError> {
        let extra = [
            ("audio_key", audio_key.to_string()),
            ("audio_filename", audio_filename.to_string()),
        ];
        let (outcome, status) = self
            .run_terminal(text_id, TaskStatus::Completed, "completed", &extra)
            .await?;
        match outcome.as_str() {
            "missing" => Err(MonitorError::NotFound(text_id.to_string())),
            "noop" => TaskStatus::parse(&status)
                .ok_or_else(|| MonitorError::InvalidRecord(status.clone())),
            _ => {
                self.publish(&TaskEvent::completed(text_id, audio_url, epoch_ms()))
                    .await?;
                Ok(TaskStatus::Completed)
            }
        }
    }

    async fn fail_task(
        &self,
        text_id: &str,
        kind: ErrorKind,
        message: &str,
    ) -> Result<TaskStatus, MonitorError> {
        let extra = [
            ("error_kind", kind.as_str().to_string()),
            ("error_message", message.to_string()),
        ];
        let (outcome, status) = self
            .run_terminal(text_id, TaskStatus::Failed, "failed", &extra)
            .await?;
        match outcome.as_str() {
            "missing" => Err(MonitorError::NotFound(text_id.to_string())),
            "noop" => TaskStatus::parse(&status)
                .ok_or_else(|| MonitorError::InvalidRecord(status.clone())),
            _ => {
                self.publish(&TaskEvent::failed(text_id, kind, message, epoch_ms()))
                    .await?;
                Ok(TaskStatus::Failed)
            }
        }
    }

    async fn timeout_task(&self, text_id: &str) -> Result<TaskStatus, MonitorError> {
        let extra = [
            ("error_kind", ErrorKind::Internal.as_str().to_string()),
            (
                "error_message",
                "task exceeded its processing budget".to_string(),
            ),
        ];
        let (outcome, status) = self
            .run_terminal(text_id, TaskStatus::Timeout, "timeout", &extra)
            .await?;
        match outcome.as_str() {
            "missing" => Err(MonitorError::NotFound(text_id.to_string())),
            "noop" => TaskStatus::parse(&status)
                .ok_or_else(|| MonitorError::InvalidRecord(status.clone())),
            _ => {
                self.publish(&TaskEvent::timed_out(text_id, epoch_ms())).await?;
                Ok(TaskStatus::Timeout)
            }
        }
    }

    async fn get_task(&self, text_id: &str) -> Result<Option<TaskRecord>, MonitorError> {
        self.fetch_record(text_id).await
    }

    async fn list_processing(&self) -> Result<Vec<TaskRecord>, MonitorError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.active())
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::new();
        for id in ids {
            if let Some(record) = self.fetch_record(&id).await? {
                if record.status == TaskStatus::Processing {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    async fn get_stats(&self) -> Result<MonitorStats, MonitorError> {
        let mut conn = self.conn.clone();
        let counters: HashMap<String, u64> = redis::cmd("HGETALL")
            .arg(self.keys.stats())
            .query_async(&mut conn)
            .await?;
        let mut durations: Vec<i64> = redis::cmd("LRANGE")
            .arg(self.keys.durations())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.active())
            .query_async(&mut conn)
            .await?;

        let mut active = 0u64;
        let mut queued = 0u64;
        for id in ids {
            if let Some(record) = self.fetch_record(&id).await? {
                match record.status {
                    TaskStatus::Processing => active += 1,
                    TaskStatus::Queued => queued += 1,
                    _ => {}
                }
            }
        }

        let completed = counters.get("completed").copied().unwrap_or(0);
        let failed = counters.get("failed").copied().unwrap_or(0);
        let timeout = counters.get("timeout").copied().unwrap_or(0);
        let finished = completed + failed + timeout;
        let success_rate = if finished > 0 {
            completed as f64 / finished as f64
        } else {
            0.0
        };

        Ok(MonitorStats {
            active,
            queued,
            completed,
            failed,
            timeout,
            success_rate,
            p50_duration_ms: crate::percentile_ms(&mut durations, 50.0),
            p95_duration_ms: crate::percentile_ms(&mut durations, 95.0),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    async fn try_lead_sweep(&self, holder: &str, ttl: Duration) -> Result<bool, MonitorError> {
        let mut conn = self.conn.clone();
        let key = self.keys.sweep_lock();
        let ttl_ms = ttl.as_millis() as u64;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        if acquired.is_some() {
            return Ok(true);
        }

        // Refresh our own lease, never someone else's.
        let current: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
        if current.as_deref() == Some(holder) {
            let _: bool = redis::cmd("PEXPIRE")
                .arg(&key)
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Decode a task hash into a record.
fn record_from_map(map: &HashMap<String, String>) -> Result<TaskRecord, MonitorError> {
    let get = |field: &str| map.get(field).cloned().unwrap_or_default();
    let opt = |field: &str| map.get(field).filter(|v| !v.is_empty()).cloned();

    let status_raw = get("status");
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| MonitorError::InvalidRecord(format!("bad status: {status_raw}")))?;

    Ok(TaskRecord {
        text_id: get("text_id"),
        content_hash: get("content_hash"),
        status,
        start_time_ms: get("start_time_ms").parse().unwrap_or(0),
        end_time_ms: opt("end_time_ms").and_then(|v| v.parse().ok()),
        audio_key: opt("audio_key"),
        audio_filename: opt("audio_filename"),
        error_kind: opt("error_kind").and_then(|v| ErrorKind::parse(&v)),
        error_message: opt("error_message"),
        strategy: opt("strategy").and_then(|v| Strategy::parse(&v)),
        segment_count: get("segment_count").parse().unwrap_or(0),
        segments_completed: get("segments_completed").parse().unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_map_full() {
        let mut map = HashMap::new();
        map.insert("text_id".to_string(), "t-1".to_string());
        map.insert("content_hash".to_string(), "abc".to_string());
        map.insert("status".to_string(), "completed".to_string());
        map.insert("start_time_ms".to_string(), "1000".to_string());
        map.insert("end_time_ms".to_string(), "5000".to_string());
        map.insert("audio_key".to_string(), "audio/2026/01/a.mp3".to_string());
        map.insert("audio_filename".to_string(), "a.mp3".to_string());
        map.insert("strategy".to_string(), "parallel".to_string());
        map.insert("segment_count".to_string(), "3".to_string());
        map.insert("segments_completed".to_string(), "3".to_string());

        let record = record_from_map(&map).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.strategy, Some(Strategy::Parallel));
        assert_eq!(record.duration_ms(), Some(4000));
        assert_eq!(record.segment_count, 3);
    }

    #[test]
    fn test_record_from_map_minimal() {
        let mut map = HashMap::new();
        map.insert("text_id".to_string(), "t-1".to_string());
        map.insert("content_hash".to_string(), "abc".to_string());
        map.insert("status".to_string(), "queued".to_string());
        map.insert("start_time_ms".to_string(), "1000".to_string());
        map.insert("segment_count".to_string(), "0".to_string());
        map.insert("segments_completed".to_string(), "0".to_string());

        let record = record_from_map(&map).unwrap();
        assert_eq!(record.status, TaskStatus::Queued);
        assert_eq!(record.end_time_ms, None);
        assert_eq!(record.strategy, None);
        assert_eq!(record.error_kind, None);
    }

    #[test]
    fn test_record_from_map_rejects_unknown_status() {
        let mut map = HashMap::new();
        map.insert("status".to_string(), "pending".to_string());
        assert!(record_from_map(&map).is_err());
    }

    #[test]
    fn test_key_layout_is_namespaced() {
        let keys = Keys {
            ns: "tts_tasks".to_string(),
        };
        assert_eq!(keys.task("t-1"), "tts_tasks:task:t-1");
        assert_eq!(keys.idem("abc"), "tts_tasks:idem:abc");
        assert_eq!(keys.active(), "tts_tasks:active");
        assert_eq!(keys.events(), "tts_tasks:events");
        assert!(keys.task("t-1").starts_with(&keys.task_prefix()));
    }
}
