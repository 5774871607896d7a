//! Redis-backed storage adapter.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use redis::{Commands, Connection};
use tracing::debug;

use super::adapter::{BackendError, StorageAdapter};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::redis_adapter";
const SET_IF_ABSENT_ATTEMPTS: usize = 3;

/// [`StorageAdapter`] over a single Redis connection.
///
/// `set_if_absent` issues `SET NX` followed by `GET` and retries the pair
/// when a concurrent delete lands between them.
pub struct RedisAdapter {
    connection: Mutex<Connection>,
}

impl RedisAdapter {
    pub fn connect(url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection()?;
        debug!(url, "redis adapter connected");
        Ok(Self::from_connection(connection))
    }

    pub fn from_connection(connection: Connection) -> Self {
        Self {
            connection: Mutex::new(connection),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl StorageAdapter for RedisAdapter {
    fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        let mut conn = mutex_lock(&self.connection, SOURCE, "get");
        let value: Option<Vec<u8>> = conn.get(key)?;
        Ok(value.map(Bytes::from))
    }

    fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), BackendError> {
        let mut conn = mutex_lock(&self.connection, SOURCE, "set");
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref());
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query::<()>(&mut *conn)?;
        Ok(())
    }

    fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<Bytes, BackendError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref()).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }

        let mut conn = mutex_lock(&self.connection, SOURCE, "set_if_absent");
        settle_if_absent(
            &mut *conn,
            key,
            value,
            |conn| {
                let written: Option<String> = cmd.query(conn)?;
                Ok(written.is_some())
            },
            |conn| {
                let current: Option<Vec<u8>> = conn.get(key)?;
                Ok(current.map(Bytes::from))
            },
        )
    }

    fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = mutex_lock(&self.connection, SOURCE, "delete");
        let removed: i64 = conn.del(key)?;
        Ok(removed > 0)
    }

    fn add_to_set(&self, key: &str, member: &str) -> Result<(), BackendError> {
        let mut conn = mutex_lock(&self.connection, SOURCE, "add_to_set");
        let _: i64 = conn.sadd(key, member)?;
        Ok(())
    }

    fn read_set(&self, key: &str) -> Result<Option<BTreeSet<String>>, BackendError> {
        let mut conn = mutex_lock(&self.connection, SOURCE, "read_set");
        // SMEMBERS cannot tell an empty set from a missing key.
        let exists: bool = conn.exists(key)?;
        if !exists {
            return Ok(None);
        }
        let members: BTreeSet<String> = conn.smembers(key)?;
        Ok(Some(members))
    }
}

/// Runs `write` (a conditional set) and, when it loses, `read` for the
/// winner. A winner deleted before the read sends the loop round again.
fn settle_if_absent<C>(
    conn: &mut C,
    key: &str,
    value: Bytes,
    mut write: impl FnMut(&mut C) -> Result<bool, BackendError>,
    mut read: impl FnMut(&mut C) -> Result<Option<Bytes>, BackendError>,
) -> Result<Bytes, BackendError> {
    for attempt in 1..=SET_IF_ABSENT_ATTEMPTS {
        if write(conn)? {
            return Ok(value);
        }
        if let Some(current) = read(conn)? {
            return Ok(current);
        }
        debug!(key, attempt, "key vanished after SET NX; retrying");
    }
    Err(BackendError::unavailable(format!(
        "`{key}` kept vanishing after SET NX ({SET_IF_ABSENT_ATTEMPTS} attempts)"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_rounded_up_to_one_millisecond() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn set_if_absent_retries_when_winner_vanishes() {
        // (writes, reads)
        let mut calls = (0, 0);
        let stored = settle_if_absent(
            &mut calls,
            "k",
            Bytes::from_static(b"mine"),
            |calls| {
                calls.0 += 1;
                Ok(calls.0 == 2)
            },
            |calls| {
                calls.1 += 1;
                Ok(None)
            },
        )
        .expect("second write wins");

        assert_eq!(stored, Bytes::from_static(b"mine"));
        assert_eq!(calls, (2, 1));
    }

    #[test]
    fn set_if_absent_returns_winner_value() {
        let stored = settle_if_absent(
            &mut (),
            "k",
            Bytes::from_static(b"mine"),
            |_| Ok(false),
            |_| Ok(Some(Bytes::from_static(b"theirs"))),
        )
        .expect("winner");
        assert_eq!(stored, Bytes::from_static(b"theirs"));
    }

    #[test]
    fn set_if_absent_gives_up_after_bounded_attempts() {
        let mut writes = 0;
        let result = settle_if_absent(
            &mut writes,
            "k",
            Bytes::from_static(b"mine"),
            |writes| {
                *writes += 1;
                Ok(false)
            },
            |_| Ok(None),
        );

        assert!(matches!(result, Err(BackendError::Unavailable { .. })));
        assert_eq!(writes, SET_IF_ABSENT_ATTEMPTS);
    }

    #[test]
    fn invalid_url_is_a_backend_error() {
        let result = RedisAdapter::connect("not a url");
        assert!(matches!(result, Err(BackendError::Redis(_))));
    }
}
