// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared Redis connection pool backing C1 (rate-limit state), C3/C4's
//! profile/patrol-score caches, and C7 (distributed lock).

use deadpool_redis::{Config, Pool, Runtime};

use crate::error::AppError;

/// Thin wrapper around a `deadpool_redis::Pool`. Kept as its own type (rather
/// than passing the pool around bare) so call sites read `Kv::get`/`Kv::set`
/// instead of reaching for raw `redis::cmd` everywhere.
#[derive(Clone)]
pub struct Kv {
    pool: Pool,
}

impl Kv {
    pub fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, AppError> {
        self.pool.get().await.map_err(|e| AppError::Internal(format!("redis pool: {e}")))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(|e| AppError::Internal(format!("redis GET {key}: {e}")))
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), AppError> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(key, value, ttl_secs)
            .await
            .map_err(|e| AppError::Internal(format!("redis SETEX {key}: {e}")))?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<(), AppError> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let _: () =
            conn.del(key).await.map_err(|e| AppError::Internal(format!("redis DEL {key}: {e}")))?;
        Ok(())
    }

    /// `SET key value EX ttl NX` — succeeds only if `key` was absent.
    pub async fn set_if_absent_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, AppError> {
        let mut conn = self.conn().await?;
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::Internal(format!("redis SET NX {key}: {e}")))?;
        Ok(result.is_some())
    }

    /// Run a Lua script against this pool's connection.
    pub async fn eval<T: redis::FromRedisValue>(
        &self,
        script: &redis::Script,
        keys: &[&str],
        args: &[&str],
    ) -> Result<T, AppError> {
        let mut conn = self.conn().await?;
        let mut invocation = script.prepare_invoke();
        for k in keys {
            invocation.key(*k);
        }
        for a in args {
            invocation.arg(*a);
        }
        invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AppError::Internal(format!("redis EVAL: {e}")))
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), AppError> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let _: () = conn
            .publish(channel, payload)
            .await
            .map_err(|e| AppError::Internal(format!("redis PUBLISH {channel}: {e}")))?;
        Ok(())
    }
}
