//! Redis-backed bucket store shared by every instance.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::BucketStore;
use crate::error::BackendError;
use crate::ratelimit::BucketState;

/// Namespace for bucket keys in Redis.
const KEY_PREFIX: &str = "tollgate:bucket:";

/// Conditional write. `ARGV[1]` is the expected value (empty for "absent"),
/// `ARGV[2]` the replacement and `ARGV[3]` the idle TTL in milliseconds.
const COMPARE_AND_SWAP: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
  if current then
    return 0
  end
elseif current ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

/// Bucket store on a single Redis endpoint.
///
/// One multiplexed connection is opened on first use and shared by all
/// callers. A connection that fails is discarded and reopened by the next call.
pub struct RedisBucketStore {
    client: Client,
    /// Bound on connecting and on every command
    timeout: Duration,
    connection: Mutex<Option<MultiplexedConnection>>,
    cas: Script,
}

impl std::fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("addr", &self.client.get_connection_info().addr)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisBucketStore {
    /// Create a store for `host:port`. No connection is made until first use.
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, BackendError> {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(host.to_string(), port),
            redis: RedisConnectionInfo::default(),
        };
        let client = Client::open(info)?;

        info!(
            host = %host,
            port = port,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "Redis bucket store configured"
        );

        Ok(Self {
            client,
            timeout,
            connection: Mutex::new(None),
            cas: Script::new(COMPARE_AND_SWAP),
        })
    }

    fn redis_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    fn classify(&self, err: redis::RedisError) -> BackendError {
        match BackendError::from(err) {
            BackendError::Timeout(_) => BackendError::Timeout(self.timeout),
            other => other,
        }
    }

    /// The shared connection, opened on first use.
    async fn connection(&self) -> Result<MultiplexedConnection, BackendError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        debug!("Opening Redis connection");
        let conn = tokio::time::timeout(
            self.timeout,
            self.client
                .get_multiplexed_async_connection_with_timeouts(self.timeout, self.timeout),
        )
        .await
        .map_err(|_| BackendError::Timeout(self.timeout))?
        .map_err(|e| self.classify(e))?;

        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Run one command under the store timeout, discarding the connection if
    /// it looks broken.
    async fn bounded<T, F>(&self, command: F) -> Result<T, BackendError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let err = match tokio::time::timeout(self.timeout, command).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => self.classify(e),
            Err(_) => BackendError::Timeout(self.timeout),
        };

        if !matches!(err, BackendError::Protocol(_)) {
            self.connection.lock().await.take();
        }
        Err(err)
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.connection().await?;
        let reply: String = self.bounded(redis::cmd("PING").query_async(&mut conn)).await?;

        if reply != "PONG" {
            return Err(BackendError::Protocol(format!("unexpected PING reply {:?}", reply)));
        }
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<BucketState>, BackendError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = self.bounded(conn.get(Self::redis_key(key))).await?;

        raw.as_deref().map(BucketState::decode).transpose()
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        new: &BucketState,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let mut conn = self.connection().await?;
        let expected = expected.map(BucketState::encode).unwrap_or_default();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut invocation = self.cas.prepare_invoke();
        invocation
            .key(Self::redis_key(key))
            .arg(expected)
            .arg(new.encode())
            .arg(ttl_ms);

        let swapped: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        match swapped {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(BackendError::Protocol(format!(
                "unexpected compare-and-swap reply {}",
                other
            ))),
        }
    }

    async fn close(&self) {
        if self.connection.lock().await.take().is_some() {
            info!("Closed Redis connection");
        }
    }
}
