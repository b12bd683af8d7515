//! Traffic metering.
//!
//! `count` is called from the relay hot path and must neither suspend nor
//! touch I/O: deltas accumulate in per-hash atomic shards and a background
//! task moves them to the database at a bounded interval. A failed flush
//! merges the in-flight delta back, so no bytes are lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

pub trait TrafficMeter: Send + Sync {
    /// Records bytes for a user. Callable from any context; never blocks.
    fn count(&self, hash: &str, sent: u64, recv: u64);
}

/// Discards all counts.
pub struct NullMeter;

impl TrafficMeter for NullMeter {
    fn count(&self, _hash: &str, _sent: u64, _recv: u64) {}
}

#[derive(Default)]
struct Shard {
    sent: AtomicU64,
    recv: AtomicU64,
}

/// Meter that persists totals to the external `users` table.
pub struct SqlMeter {
    shards: DashMap<String, Arc<Shard>>,
    pool: sqlx::MySqlPool,
}

impl SqlMeter {
    /// Wraps the pool and spawns the flush/quota daemon.
    pub fn start(pool: sqlx::MySqlPool, cancel: CancellationToken) -> Arc<Self> {
        let meter = Arc::new(Self {
            shards: DashMap::new(),
            pool,
        });
        let daemon = Arc::clone(&meter);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = daemon.flush_now().await {
                            tracing::warn!(error = %e, "traffic flush failed");
                        }
                    }
                }
            }
            // final drain on shutdown
            if let Err(e) = daemon.flush_now().await {
                tracing::warn!(error = %e, "final traffic flush failed");
            }
        });
        meter
    }

    /// Takes every nonzero delta out of the shards. The swapped-out values
    /// are the in-flight amounts owed to the store.
    fn drain(&self) -> Vec<(String, u64, u64)> {
        let mut out = Vec::new();
        for entry in self.shards.iter() {
            let sent = entry.value().sent.swap(0, Ordering::AcqRel);
            let recv = entry.value().recv.swap(0, Ordering::AcqRel);
            if sent > 0 || recv > 0 {
                out.push((entry.key().clone(), sent, recv));
            }
        }
        out
    }

    /// Puts an in-flight delta back after a failed flush.
    fn restore(&self, hash: &str, sent: u64, recv: u64) {
        let shard = self
            .shards
            .entry(hash.to_string())
            .or_default()
            .value()
            .clone();
        shard.sent.fetch_add(sent, Ordering::AcqRel);
        shard.recv.fetch_add(recv, Ordering::AcqRel);
    }

    /// Flushes all pending deltas and disables users over quota. Called by
    /// the daemon and once more on graceful shutdown.
    pub async fn flush_now(&self) -> Result<()> {
        let pending = self.drain();
        let mut first_err = None;
        for (hash, sent, recv) in pending {
            let res = sqlx::query(
                "UPDATE users SET upload = upload + ?, download = download + ? \
                 WHERE password_hash = ?",
            )
            .bind(sent)
            .bind(recv)
            .bind(&hash)
            .execute(&self.pool)
            .await;
            if let Err(e) = res {
                self.restore(&hash, sent, recv);
                if first_err.is_none() {
                    first_err = Some(Error::database_with_source("traffic update failed", e));
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        sqlx::query(
            "UPDATE users SET enabled = 0 \
             WHERE quota >= 0 AND upload + download > quota AND enabled = 1",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::database_with_source("quota check failed", e))?;
        Ok(())
    }
}

impl TrafficMeter for SqlMeter {
    fn count(&self, hash: &str, sent: u64, recv: u64) {
        if sent == 0 && recv == 0 {
            return;
        }
        let shard = self
            .shards
            .entry(hash.to_string())
            .or_default()
            .value()
            .clone();
        shard.sent.fetch_add(sent, Ordering::AcqRel);
        shard.recv.fetch_add(recv, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_meter() -> SqlMeter {
        SqlMeter {
            shards: DashMap::new(),
            pool: sqlx::mysql::MySqlPoolOptions::new().connect_lazy("mysql://u:p@localhost/x").unwrap(),
        }
    }

    #[tokio::test]
    async fn drain_moves_deltas_out_exactly_once() {
        let meter = detached_meter();
        meter.count("aaa", 100, 0);
        meter.count("aaa", 20, 5);
        meter.count("bbb", 0, 7);
        meter.count("ccc", 0, 0);

        let mut drained = meter.drain();
        drained.sort();
        assert_eq!(
            drained,
            vec![("aaa".to_string(), 120, 5), ("bbb".to_string(), 0, 7)]
        );
        assert!(meter.drain().is_empty(), "second drain finds nothing");
    }

    #[tokio::test]
    async fn restore_merges_inflight_back() {
        let meter = detached_meter();
        meter.count("aaa", 10, 20);
        let drained = meter.drain();
        assert_eq!(drained, vec![("aaa".to_string(), 10, 20)]);

        // counts arriving while the flush is in flight are not clobbered
        meter.count("aaa", 1, 2);
        meter.restore("aaa", 10, 20);
        let drained = meter.drain();
        assert_eq!(drained, vec![("aaa".to_string(), 11, 22)]);
    }

    #[tokio::test]
    async fn sum_of_drains_equals_sum_of_counts() {
        let meter = detached_meter();
        let mut expect_sent = 0u64;
        let mut expect_recv = 0u64;
        for i in 0..100u64 {
            meter.count("h", i, 2 * i);
            expect_sent += i;
            expect_recv += 2 * i;
            if i % 7 == 0 {
                for (_, s, r) in meter.drain() {
                    expect_sent -= s;
                    expect_recv -= r;
                }
            }
        }
        let drained = meter.drain();
        assert_eq!(drained, vec![("h".to_string(), expect_sent, expect_recv)]);
    }
}
