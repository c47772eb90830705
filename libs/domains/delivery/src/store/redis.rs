//! Redis-backed store.
//!
//! Layout, with `P` the configured key prefix:
//! - `P:{kind}:{namespace}:{name}`: hash with `version` and `data` (JSON)
//! - `P:{kind}:index`: set of `namespace/name`
//! - `P:version`: global version counter
//! - `P:events`: change stream, fanned out to subscribers by the listener task
//!
//! Every write goes through one Lua script that checks the expected version,
//! assigns the next version, updates the index and appends the change event
//! atomically.

use super::{check_version, guard_terminal, ResourceStore, StoreError, StoreResult};
use crate::models::{
    ChangeType, ObjectKey, ObjectMeta, ResourceEvent, ResourceKind, Secret, SendRequest,
    SendRequestSpec, SendRequestStatus, SenderConfig, SenderConfigSpec, SenderConfigStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use core_config::redis::RedisConfig;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;
const EVENTS_MAX_LEN: u64 = 10_000;
const LISTEN_BLOCK_MS: u64 = 250;
const MAX_SPEC_WRITE_ATTEMPTS: usize = 5;

/// KEYS: record, version counter, index, events.
/// ARGV: expected version (`absent` | `any` | number), data, member, kind, change, maxlen.
/// Returns `{version, ""}` on success or `{code, current}` with a negative code.
const WRITE_LUA: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if ARGV[1] == 'absent' then
  if current then return {-1, current} end
elseif ARGV[1] ~= 'any' then
  if not current then return {-2, '0'} end
  if current ~= ARGV[1] then return {-3, current} end
end
local version = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 'version', version, 'data', ARGV[2])
redis.call('SADD', KEYS[3], ARGV[3])
redis.call('XADD', KEYS[4], 'MAXLEN', '~', ARGV[6], '*', 'kind', ARGV[4], 'change', ARGV[5], 'key', ARGV[3])
return {version, ''}
"#;

/// KEYS: record, index, events. ARGV: member, kind, maxlen.
const DELETE_LUA: &str = r#"
local removed = redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
if removed == 1 then
  redis.call('XADD', KEYS[3], 'MAXLEN', '~', ARGV[3], '*', 'kind', ARGV[2], 'change', 'deleted', 'key', ARGV[1])
end
return removed
"#;

static WRITE_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(WRITE_LUA));
static DELETE_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(DELETE_LUA));

/// Resources whose metadata the store stamps on read.
trait Versioned: Serialize + DeserializeOwned + Clone {
    const KIND: ResourceKind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

impl Versioned for SendRequest {
    const KIND: ResourceKind = ResourceKind::SendRequest;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Versioned for SenderConfig {
    const KIND: ResourceKind = ResourceKind::SenderConfig;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Versioned for Secret {
    const KIND: ResourceKind = ResourceKind::Secret;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

enum Expect {
    Absent,
    Any,
    Version(u64),
}

impl Expect {
    fn as_arg(&self) -> String {
        match self {
            Expect::Absent => "absent".to_string(),
            Expect::Any => "any".to_string(),
            Expect::Version(v) => v.to_string(),
        }
    }
}

fn member(key: &ObjectKey) -> String {
    format!("{}/{}", key.namespace, key.name)
}

fn parse_member(member: &str) -> Option<ObjectKey> {
    member
        .split_once('/')
        .map(|(namespace, name)| ObjectKey::new(namespace, name))
}

fn backend(err: RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn is_permission_error(err: &RedisError) -> bool {
    let msg = err.to_string();
    msg.contains("NOPERM") || msg.contains("NOAUTH") || msg.contains("WRONGPASS")
}

/// `ResourceStore` persisted in Redis.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    prefix: String,
    events: broadcast::Sender<ResourceEvent>,
}

impl RedisStore {
    /// Connect and verify the connection with `PING`.
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        info!(prefix = %config.key_prefix, "Connecting to Redis store");

        let client = Client::open(config.url.as_str()).map_err(backend)?;
        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| {
                StoreError::Backend(format!(
                    "timed out connecting to Redis after {:?}",
                    config.connect_timeout
                ))
            })?
            .map_err(backend)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            client,
            conn,
            prefix: config.key_prefix.clone(),
            events,
        };
        store.ping().await?;

        info!("Connected to Redis store");
        Ok(store)
    }

    fn record_key(&self, kind: ResourceKind, key: &ObjectKey) -> String {
        format!("{}:{}:{}:{}", self.prefix, kind, key.namespace, key.name)
    }

    fn index_key(&self, kind: ResourceKind) -> String {
        format!("{}:{}:index", self.prefix, kind)
    }

    fn version_key(&self) -> String {
        format!("{}:version", self.prefix)
    }

    fn events_key(&self) -> String {
        format!("{}:events", self.prefix)
    }

    async fn load<T: Versioned>(&self, key: &ObjectKey) -> StoreResult<Option<T>> {
        let mut conn = self.conn.clone();
        let (version, data): (Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(self.record_key(T::KIND, key))
            .arg("version")
            .arg("data")
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                if is_permission_error(&e) {
                    StoreError::AccessDenied {
                        key: key.clone(),
                        reason: e.to_string(),
                    }
                } else {
                    backend(e)
                }
            })?;

        match (version, data) {
            (Some(version), Some(data)) => Ok(Some(Self::decode(version, &data)?)),
            _ => Ok(None),
        }
    }

    fn decode<T: Versioned>(version: u64, data: &str) -> StoreResult<T> {
        let mut resource: T = serde_json::from_str(data)?;
        resource.meta_mut().resource_version = version;
        Ok(resource)
    }

    async fn load_all<T: Versioned>(&self) -> StoreResult<Vec<T>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.index_key(T::KIND))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let keys: Vec<ObjectKey> = members.iter().filter_map(|m| parse_member(m)).collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.cmd("HMGET")
                .arg(self.record_key(T::KIND, key))
                .arg("version")
                .arg("data");
        }
        let rows: Vec<(Option<u64>, Option<String>)> =
            pipe.query_async(&mut conn).await.map_err(backend)?;

        let mut resources = Vec::with_capacity(rows.len());
        for (key, row) in keys.iter().zip(rows) {
            match row {
                (Some(version), Some(data)) => resources.push(Self::decode(version, &data)?),
                // Index entry outlived the record
                _ => debug!(key = %key, kind = %T::KIND, "Skipping stale index entry"),
            }
        }
        Ok(resources)
    }

    /// Write `resource` if the stored version matches `expect`. Returns the
    /// resource stamped with its new version.
    async fn store<T: Versioned>(&self, mut resource: T, expect: Expect, change: ChangeType) -> StoreResult<T> {
        let key = resource.meta().key();
        let data = serde_json::to_string(&resource)?;

        let mut conn = self.conn.clone();
        let (code, current): (i64, String) = WRITE_SCRIPT
            .key(self.record_key(T::KIND, &key))
            .key(self.version_key())
            .key(self.index_key(T::KIND))
            .key(self.events_key())
            .arg(expect.as_arg())
            .arg(data)
            .arg(member(&key))
            .arg(T::KIND.to_string())
            .arg(change.to_string())
            .arg(EVENTS_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        match code {
            -1 => Err(StoreError::AlreadyExists(key)),
            -2 => Err(StoreError::NotFound(key)),
            -3 => Err(StoreError::Conflict {
                key,
                expected: match expect {
                    Expect::Version(v) => v,
                    _ => 0,
                },
                actual: current.parse().unwrap_or_default(),
            }),
            version if version > 0 => {
                resource.meta_mut().resource_version = version as u64;
                Ok(resource)
            }
            other => Err(StoreError::Backend(format!("unexpected write result {other}"))),
        }
    }

    /// Re-read, apply `mutate` and write back, retrying on version conflicts.
    async fn modify<T, M>(&self, key: &ObjectKey, change: ChangeType, mutate: M) -> StoreResult<T>
    where
        T: Versioned + Send,
        M: Fn(&mut T) + Send + Sync,
    {
        for _ in 0..MAX_SPEC_WRITE_ATTEMPTS {
            let mut resource: T = self
                .load(key)
                .await?
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let version = resource.meta().resource_version;
            mutate(&mut resource);

            match self.store(resource, Expect::Version(version), change).await {
                Err(StoreError::Conflict { .. }) => continue,
                other => return other,
            }
        }

        Err(StoreError::Backend(format!(
            "gave up writing {key} after {MAX_SPEC_WRITE_ATTEMPTS} conflicting attempts"
        )))
    }

    /// Forward entries of the events stream to local subscribers until
    /// `shutdown` flips.
    pub fn spawn_event_listener(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let client = self.client.clone();
        let stream = self.events_key();
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut conn = match ConnectionManager::new(client).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Event listener could not connect to Redis");
                    return;
                }
            };

            let mut last_id = match Self::latest_event_id(&mut conn, &stream).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(error = %e, "Failed to read event stream tail, starting from the beginning");
                    "0-0".to_string()
                }
            };
            info!(stream = %stream, from = %last_id, "Event listener started");

            let mut consecutive_errors: u32 = 0;
            loop {
                if *shutdown.borrow() {
                    break;
                }

                let read = tokio::select! {
                    _ = shutdown.changed() => break,
                    read = Self::read_events(&mut conn, &stream, &last_id) => read,
                };

                match read {
                    Ok(entries) => {
                        consecutive_errors = 0;
                        for (id, event) in entries {
                            last_id = id;
                            if let Some(event) = event {
                                let _ = events.send(event);
                            }
                        }
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        let backoff = Duration::from_millis(
                            (250u64 << consecutive_errors.min(5)).min(10_000),
                        );
                        warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Event stream read failed");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
            info!("Event listener stopped");
        })
    }

    async fn latest_event_id(conn: &mut ConnectionManager, stream: &str) -> redis::RedisResult<String> {
        let tail: Vec<(String, Vec<(String, String)>)> = redis::cmd("XREVRANGE")
            .arg(stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await?;
        Ok(tail
            .into_iter()
            .next()
            .map(|(id, _)| id)
            .unwrap_or_else(|| "0-0".to_string()))
    }

    async fn read_events(
        conn: &mut ConnectionManager,
        stream: &str,
        last_id: &str,
    ) -> redis::RedisResult<Vec<(String, Option<ResourceEvent>)>> {
        let reply: Option<Vec<(String, Vec<(String, Vec<(String, String)>)>)>> =
            redis::cmd("XREAD")
                .arg("BLOCK")
                .arg(LISTEN_BLOCK_MS)
                .arg("COUNT")
                .arg(100)
                .arg("STREAMS")
                .arg(stream)
                .arg(last_id)
                .query_async(conn)
                .await?;

        let mut out = Vec::new();
        for (_stream, entries) in reply.unwrap_or_default() {
            for (id, fields) in entries {
                let event = parse_event(&fields);
                if event.is_none() {
                    warn!(id = %id, "Skipping malformed change event");
                }
                out.push((id, event));
            }
        }
        Ok(out)
    }
}

fn parse_event(fields: &[(String, String)]) -> Option<ResourceEvent> {
    let field = |name: &str| {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    let kind = ResourceKind::from_str(field("kind")?).ok()?;
    let change = ChangeType::from_str(field("change")?).ok()?;
    let key = parse_member(field("key")?)?;
    Some(ResourceEvent::new(kind, change, key))
}

#[async_trait]
impl ResourceStore for RedisStore {
    async fn get_send_request(&self, key: &ObjectKey) -> StoreResult<Option<SendRequest>> {
        self.load(key).await
    }

    async fn list_send_requests(&self) -> StoreResult<Vec<SendRequest>> {
        self.load_all().await
    }

    async fn create_send_request(&self, mut request: SendRequest) -> StoreResult<SendRequest> {
        request.metadata.generation = 1;
        request.metadata.created_at = Utc::now();
        request.status = SendRequestStatus::default();
        self.store(request, Expect::Absent, ChangeType::Created).await
    }

    async fn update_send_request_spec(
        &self,
        key: &ObjectKey,
        spec: SendRequestSpec,
    ) -> StoreResult<SendRequest> {
        self.modify(key, ChangeType::Updated, |request: &mut SendRequest| {
            if request.spec != spec {
                request.spec = spec.clone();
                request.metadata.generation += 1;
            }
        })
        .await
    }

    async fn update_send_request_status(
        &self,
        key: &ObjectKey,
        expected_version: u64,
        status: SendRequestStatus,
    ) -> StoreResult<SendRequest> {
        let mut current: SendRequest = self
            .load(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        check_version(key, expected_version, current.metadata.resource_version)?;
        guard_terminal(key, &current.status, &status)?;

        current.status = status;
        self.store(current, Expect::Version(expected_version), ChangeType::Status)
            .await
    }

    async fn delete_send_request(&self, key: &ObjectKey) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = DELETE_SCRIPT
            .key(self.record_key(ResourceKind::SendRequest, key))
            .key(self.index_key(ResourceKind::SendRequest))
            .key(self.events_key())
            .arg(member(key))
            .arg(ResourceKind::SendRequest.to_string())
            .arg(EVENTS_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(removed == 1)
    }

    async fn get_sender_config(&self, key: &ObjectKey) -> StoreResult<Option<SenderConfig>> {
        self.load(key).await
    }

    async fn list_sender_configs(&self) -> StoreResult<Vec<SenderConfig>> {
        self.load_all().await
    }

    async fn apply_sender_config(
        &self,
        key: &ObjectKey,
        spec: SenderConfigSpec,
    ) -> StoreResult<SenderConfig> {
        let fresh = SenderConfig::new(key.namespace.clone(), key.name.clone(), spec.clone());
        match self.store(fresh, Expect::Absent, ChangeType::Created).await {
            Err(StoreError::AlreadyExists(_)) => {
                self.modify(key, ChangeType::Updated, |config: &mut SenderConfig| {
                    if config.spec != spec {
                        config.spec = spec.clone();
                        config.metadata.generation += 1;
                    }
                })
                .await
            }
            other => other,
        }
    }

    async fn update_sender_config_status(
        &self,
        key: &ObjectKey,
        expected_version: u64,
        status: SenderConfigStatus,
    ) -> StoreResult<SenderConfig> {
        let mut current: SenderConfig = self
            .load(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        check_version(key, expected_version, current.metadata.resource_version)?;

        current.status = status;
        self.store(current, Expect::Version(expected_version), ChangeType::Status)
            .await
    }

    async fn get_secret(&self, key: &ObjectKey) -> StoreResult<Option<Secret>> {
        self.load(key).await
    }

    async fn apply_secret(&self, secret: Secret) -> StoreResult<Secret> {
        self.store(secret, Expect::Any, ChangeType::Updated).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        if pong != "PONG" {
            return Err(StoreError::Backend(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_round_trip() {
        let key = ObjectKey::new("acme", "welcome-ada");
        assert_eq!(parse_member(&member(&key)), Some(key));
        assert_eq!(parse_member("no-separator"), None);
    }

    #[test]
    fn test_parse_event_fields() {
        let fields = vec![
            ("kind".to_string(), "sender-config".to_string()),
            ("change".to_string(), "status".to_string()),
            ("key".to_string(), "acme/transactional".to_string()),
        ];
        let event = parse_event(&fields).unwrap();

        assert_eq!(event.kind, ResourceKind::SenderConfig);
        assert_eq!(event.change, ChangeType::Status);
        assert_eq!(event.key, ObjectKey::new("acme", "transactional"));
    }

    #[test]
    fn test_parse_event_rejects_unknown_kind() {
        let fields = vec![
            ("kind".to_string(), "pigeon".to_string()),
            ("change".to_string(), "created".to_string()),
            ("key".to_string(), "acme/x".to_string()),
        ];
        assert!(parse_event(&fields).is_none());
    }
}
