use crate::error::BrokerError;
use anyhow::Context;
use log::{info, warn};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const SESSION_PREFIX: &str = "session:";
pub const RECONNECT_PREFIX: &str = "reconnect:";
const OAUTH_STATE_PREFIX: &str = "oauth_state:";

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The authoritative cross-restart session record, stored under
/// `session:{external id}` with a TTL equal to the remaining lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub pod_name: String,
    pub pod_ip: String,
    pub fqdn: String,
    pub connection_id: String,
    #[serde(default)]
    pub tunnel_id: Option<String>,
    pub connection_params: HashMap<String, String>,
    #[serde(default)]
    pub share: bool,
    #[serde(default)]
    pub disconnection_count: u32,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub expire_at: u64,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub last_extended_at: Option<u64>,
}

impl SessionData {
    /// Time until the absolute expiration, zero once past it.
    pub fn remaining(&self) -> Duration {
        Duration::from_secs(self.expire_at.saturating_sub(now_secs()))
    }

    /// Fills in lifetime fields that records written by older builds (or the
    /// deploy path of another replica) may lack.
    pub fn backfill_lifetimes(&mut self, default_timeout: Duration) {
        let now = now_secs();
        if self.created_at == 0 {
            self.created_at = now;
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = default_timeout.as_secs();
        }
        if self.expire_at == 0 {
            self.expire_at = now + self.timeout_secs;
        }
    }
}

/// What the store reports about a key's time to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    NoExpiry,
    Remaining(Duration),
}

impl KeyTtl {
    pub fn from_secs(ttl: i64) -> Self {
        match ttl {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::NoExpiry,
            n => KeyTtl::Remaining(Duration::from_secs(n.max(0) as u64)),
        }
    }
}

/// Bounds and late-window gate for session extensions.
#[derive(Debug, Clone, Copy)]
pub struct ExtensionPolicy {
    pub window: Duration,
    pub min: Duration,
    pub max: Duration,
}

/// Typed adapter over the shared key/value store.
///
/// Every modify-write path that is not an extension must preserve the key's
/// TTL: read it from the store, fall back to the record's absolute
/// expiration, and only then to the configured lifetime. Extending past the
/// current TTL is the extension controller's privilege alone.
#[derive(Clone)]
pub struct SessionStore {
    redis: ConnectionManager,
    default_timeout: Duration,
    extension: ExtensionPolicy,
}

impl SessionStore {
    pub async fn connect(
        redis_url: &str,
        default_timeout: Duration,
        extension: ExtensionPolicy,
    ) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url).context("failed to create redis client")?;
        let redis = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;

        Ok(Self {
            redis,
            default_timeout,
            extension,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn get(&self, id: &str) -> Result<SessionData, BrokerError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(session_key(id)).await?;
        let json = value.ok_or(BrokerError::NotFound)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub async fn put(
        &self,
        id: &str,
        session: &SessionData,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(session)?;
        conn.set_ex::<_, _, ()>(session_key(id), json, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    /// Writes the record back without moving its deadline (the TTL fallback
    /// chain above). Returns the TTL that was applied.
    pub async fn put_preserving_ttl(
        &self,
        id: &str,
        session: &SessionData,
    ) -> Result<Duration, BrokerError> {
        let ttl = self.preserved_ttl(id, session).await?;
        self.put(id, session, ttl).await?;
        Ok(ttl)
    }

    pub async fn preserved_ttl(
        &self,
        id: &str,
        session: &SessionData,
    ) -> Result<Duration, BrokerError> {
        let ttl = self.session_ttl(id).await?;
        Ok(fallback_ttl(ttl, session, self.default_timeout))
    }

    pub async fn session_ttl(&self, id: &str) -> Result<KeyTtl, BrokerError> {
        let mut conn = self.redis.clone();
        let ttl: i64 = conn.ttl(session_key(id)).await?;
        Ok(KeyTtl::from_secs(ttl))
    }

    pub async fn session_exists(&self, id: &str) -> Result<bool, BrokerError> {
        let mut conn = self.redis.clone();
        Ok(conn.exists(session_key(id)).await?)
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(session_key(id)).await?;
        Ok(())
    }

    /// Cursor-scans the store for keys matching `pattern`.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await?;
            cursor = next_cursor;
            keys.extend(batch);
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    /// Reads a session snapshot stored under an arbitrary key (used by the
    /// reaper, which walks both `session:*` and `reconnect:*`). Missing or
    /// unparseable values come back as `None`.
    pub async fn fetch_snapshot(&self, key: &str) -> Result<Option<SessionData>, BrokerError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        match value {
            Some(json) => match serde_json::from_str(&json) {
                Ok(session) => Ok(Some(session)),
                Err(err) => {
                    warn!("skipping unparseable snapshot under {key}: {err}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn put_reconnect(
        &self,
        id: &str,
        session: &SessionData,
        grace: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(session)?;
        conn.set_ex::<_, _, ()>(reconnect_key(id), json, grace.as_secs().max(1))
            .await?;
        Ok(())
    }

    pub async fn reconnect_exists(&self, id: &str) -> Result<bool, BrokerError> {
        let mut conn = self.redis.clone();
        Ok(conn.exists(reconnect_key(id)).await?)
    }

    /// Removes the reconnect marker. Returns whether it was still present,
    /// which is how the connect path distinguishes a reconnection.
    pub async fn clear_reconnect(&self, id: &str) -> Result<bool, BrokerError> {
        let mut conn = self.redis.clone();
        let removed: u64 = conn.del(reconnect_key(id)).await?;
        Ok(removed > 0)
    }

    pub async fn time_left(&self, id: &str) -> Result<Duration, BrokerError> {
        match self.session_ttl(id).await? {
            KeyTtl::Missing | KeyTtl::NoExpiry => Err(BrokerError::NotFound),
            KeyTtl::Remaining(ttl) => Ok(ttl),
        }
    }

    /// Whether the session is inside the late extension window, alongside
    /// its current TTL.
    pub async fn can_extend(&self, id: &str) -> Result<(bool, Duration), BrokerError> {
        match self.session_ttl(id).await? {
            KeyTtl::Missing => Err(BrokerError::NotFound),
            KeyTtl::NoExpiry => Ok((false, Duration::ZERO)),
            KeyTtl::Remaining(ttl) => {
                let allowed = !ttl.is_zero() && ttl <= self.extension.window;
                Ok((allowed, ttl))
            }
        }
    }

    /// Pushes the session deadline out by `delta`. Only allowed near expiry
    /// and within the configured bounds; concurrent extends are best-effort
    /// (both compute from their pre-read TTL and may compound).
    pub async fn extend(&self, id: &str, delta: Duration) -> Result<Duration, BrokerError> {
        if delta < self.extension.min || delta > self.extension.max {
            return Err(BrokerError::Forbidden(format!(
                "extension must be between {} and {} minutes",
                self.extension.min.as_secs() / 60,
                self.extension.max.as_secs() / 60
            )));
        }

        let ttl = match self.session_ttl(id).await? {
            KeyTtl::Missing => return Err(BrokerError::NotFound),
            KeyTtl::NoExpiry => {
                return Err(BrokerError::Forbidden(
                    "session has no expiration".to_string(),
                ));
            }
            KeyTtl::Remaining(ttl) => ttl,
        };

        if ttl.is_zero() {
            return Err(BrokerError::Expired);
        }
        if ttl > self.extension.window {
            return Err(BrokerError::Forbidden(format!(
                "session can only be extended within the last {} minutes (time left: {}s)",
                self.extension.window.as_secs() / 60,
                ttl.as_secs()
            )));
        }

        let mut session = self.get(id).await?;
        let new_ttl = ttl + delta;
        let now = now_secs();
        session.last_extended_at = Some(now);
        session.expire_at = now + new_ttl.as_secs();
        self.put(id, &session, new_ttl).await?;

        info!(
            "extended session {id} by {}s, new time left {}s",
            delta.as_secs(),
            new_ttl.as_secs()
        );
        Ok(new_ttl)
    }

    #[allow(dead_code)]
    pub async fn put_oauth_state(
        &self,
        token: &str,
        provider: &str,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(oauth_state_key(token), provider, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    /// One-shot read of an oauth state token: returns the provider name and
    /// consumes the key.
    #[allow(dead_code)]
    pub async fn take_oauth_state(&self, token: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let key = oauth_state_key(token);
        let provider: Option<String> = conn.get(&key).await?;
        if provider.is_some() {
            conn.del::<_, ()>(&key).await?;
        }
        Ok(provider)
    }
}

pub fn session_key(id: &str) -> String {
    format!("{SESSION_PREFIX}{id}")
}

pub fn reconnect_key(id: &str) -> String {
    format!("{RECONNECT_PREFIX}{id}")
}

fn oauth_state_key(token: &str) -> String {
    format!("{OAUTH_STATE_PREFIX}{token}")
}

/// The TTL fallback chain for modify-writes: store TTL first, then the
/// record's absolute expiration, then the configured lifetime.
fn fallback_ttl(ttl: KeyTtl, session: &SessionData, default_timeout: Duration) -> Duration {
    match ttl {
        KeyTtl::Remaining(d) if !d.is_zero() => d,
        _ => {
            let remaining = session.remaining();
            if !remaining.is_zero() {
                remaining
            } else if session.timeout_secs > 0 {
                Duration::from_secs(session.timeout_secs)
            } else {
                default_timeout
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionData {
        SessionData {
            pod_name: "sandbox-abc".to_string(),
            pod_ip: "10.1.2.3".to_string(),
            fqdn: "sandbox-abc.sandbox-instances.svc".to_string(),
            connection_id: "ext-1".to_string(),
            tunnel_id: None,
            connection_params: HashMap::new(),
            share: false,
            disconnection_count: 0,
            created_at: now_secs(),
            expire_at: now_secs() + 600,
            timeout_secs: 600,
            last_extended_at: None,
        }
    }

    #[test]
    fn key_ttl_from_store_sentinels() {
        assert_eq!(KeyTtl::from_secs(-2), KeyTtl::Missing);
        assert_eq!(KeyTtl::from_secs(-1), KeyTtl::NoExpiry);
        assert_eq!(
            KeyTtl::from_secs(90),
            KeyTtl::Remaining(Duration::from_secs(90))
        );
    }

    #[test]
    fn fallback_prefers_store_ttl() {
        let ttl = fallback_ttl(
            KeyTtl::Remaining(Duration::from_secs(42)),
            &session(),
            Duration::from_secs(600),
        );
        assert_eq!(ttl, Duration::from_secs(42));
    }

    #[test]
    fn fallback_uses_expire_at_when_store_has_none() {
        let s = session();
        let ttl = fallback_ttl(KeyTtl::NoExpiry, &s, Duration::from_secs(600));
        // expire_at is 600s out, give or take the test's own runtime
        assert!(ttl >= Duration::from_secs(598) && ttl <= Duration::from_secs(600));
    }

    #[test]
    fn fallback_lands_on_timeout_duration_last() {
        let mut s = session();
        s.expire_at = 1; // long past
        s.timeout_secs = 300;
        let ttl = fallback_ttl(KeyTtl::Missing, &s, Duration::from_secs(600));
        assert_eq!(ttl, Duration::from_secs(300));

        s.timeout_secs = 0;
        let ttl = fallback_ttl(KeyTtl::Missing, &s, Duration::from_secs(600));
        assert_eq!(ttl, Duration::from_secs(600));
    }

    #[test]
    fn backfill_fills_only_missing_fields() {
        let mut s = session();
        let created = s.created_at;
        s.backfill_lifetimes(Duration::from_secs(600));
        assert_eq!(s.created_at, created);
        assert_eq!(s.timeout_secs, 600);

        let mut bare = session();
        bare.created_at = 0;
        bare.expire_at = 0;
        bare.timeout_secs = 0;
        bare.backfill_lifetimes(Duration::from_secs(480));
        assert!(bare.created_at > 0);
        assert_eq!(bare.timeout_secs, 480);
        assert_eq!(bare.expire_at, bare.created_at + 480);
        assert!(bare.expire_at >= bare.created_at);
    }

    #[test]
    fn session_json_tolerates_missing_optional_fields() {
        let json = r#"{
            "pod_name": "sandbox-1",
            "pod_ip": "10.0.0.9",
            "fqdn": "sandbox-1.svc",
            "connection_id": "abc",
            "connection_params": {"scheme": "rdp"}
        }"#;
        let s: SessionData = serde_json::from_str(json).unwrap();
        assert_eq!(s.disconnection_count, 0);
        assert!(!s.share);
        assert!(s.tunnel_id.is_none());
        assert_eq!(s.expire_at, 0);
    }

    #[test]
    fn key_builders() {
        assert_eq!(session_key("x"), "session:x");
        assert_eq!(reconnect_key("x"), "reconnect:x");
    }
}
