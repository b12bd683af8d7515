//! Credential stores backing the authenticate-or-fallback decision.
//!
//! `authenticate` runs on every accepted connection before anything is
//! written back, so it must never suspend: the static store is an immutable
//! map, and the SQL-backed store swaps in a complete snapshot from a
//! background poll while lookups read whichever snapshot is current.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use veilgate_protocol::hash_password;

use crate::config::MysqlConfig;
use crate::error::{Error, Result};

/// Per-user accounting record, shared by every session of that user. The
/// store outlives all sessions holding a reference.
#[derive(Debug)]
pub struct UserStat {
    hash: String,
    sent: AtomicU64,
    recv: AtomicU64,
    /// Byte quota; negative means unlimited.
    quota: AtomicI64,
    enabled: AtomicBool,
}

impl UserStat {
    pub fn new(hash: String) -> Self {
        Self {
            hash,
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
            quota: AtomicI64::new(-1),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_recv(&self, n: u64) {
        self.recv.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn recv(&self) -> u64 {
        self.recv.load(Ordering::Relaxed)
    }

    pub fn quota(&self) -> i64 {
        self.quota.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Applies one polled `users` row. A user over quota is treated as
    /// disabled so the next authenticate lands in the fallback path;
    /// sessions already running are left alone.
    pub fn apply_row(&self, quota: i64, download: u64, upload: u64, enabled: bool) {
        self.quota.store(quota, Ordering::Relaxed);
        let over = quota >= 0 && upload.saturating_add(download) > quota as u64;
        self.enabled.store(enabled && !over, Ordering::Relaxed);
    }
}

/// Answers "is this hash one of ours" without blocking.
pub trait CredentialStore: Send + Sync {
    /// Returns the user record for a known, enabled, in-quota hash.
    fn authenticate(&self, hash: &str) -> Option<Arc<UserStat>>;

    /// All known users; clients pick their own hash from here.
    fn list_users(&self) -> Vec<Arc<UserStat>>;
}

type Snapshot = Arc<HashMap<String, Arc<UserStat>>>;

fn lookup(snapshot: &Snapshot, hash: &str) -> Option<Arc<UserStat>> {
    let stat = snapshot.get(hash)?;
    if !stat.is_enabled() {
        return None;
    }
    Some(Arc::clone(stat))
}

/// Immutable store built from the configured password list.
pub struct StaticStore {
    users: Snapshot,
}

impl StaticStore {
    pub fn new(passwords: &[String]) -> Self {
        let users = passwords
            .iter()
            .map(|password| {
                let hash = hash_password(password);
                let stat = Arc::new(UserStat::new(hash.clone()));
                (hash, stat)
            })
            .collect();
        Self {
            users: Arc::new(users),
        }
    }
}

impl CredentialStore for StaticStore {
    fn authenticate(&self, hash: &str) -> Option<Arc<UserStat>> {
        lookup(&self.users, hash)
    }

    fn list_users(&self) -> Vec<Arc<UserStat>> {
        self.users.values().cloned().collect()
    }
}

/// Store backed by the external `users` table, refreshed by a periodic
/// poll. Known `UserStat` handles survive refreshes so accounting attached
/// to live sessions is never dropped.
pub struct SqlStore {
    snapshot: RwLock<Snapshot>,
    pool: sqlx::MySqlPool,
}

impl SqlStore {
    /// Connects and spawns the poll task. The first poll runs before this
    /// returns so the server never starts with an empty view.
    pub async fn connect(
        cfg: &MysqlConfig,
        extra_passwords: &[String],
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .max_connections(4)
            .connect(&cfg.url())
            .await
            .map_err(|e| Error::database_with_source("cannot connect to database", e))?;

        let seed: Snapshot = Arc::new(
            extra_passwords
                .iter()
                .map(|password| {
                    let hash = hash_password(password);
                    (hash.clone(), Arc::new(UserStat::new(hash)))
                })
                .collect(),
        );
        let store = Arc::new(Self {
            snapshot: RwLock::new(seed),
            pool,
        });

        store.refresh().await?;

        let poll = Arc::clone(&store);
        let period = Duration::from_secs(cfg.check_rate.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = poll.refresh().await {
                            tracing::warn!(error = %e, "user table poll failed");
                        }
                    }
                }
            }
        });
        Ok(store)
    }

    async fn refresh(&self) -> Result<()> {
        let rows: Vec<(String, i64, u64, u64, bool)> = sqlx::query_as(
            "SELECT password_hash, quota, download, upload, enabled FROM users",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::database_with_source("user table query failed", e))?;

        let current = self.snapshot.read().expect("store lock").clone();
        let mut next = HashMap::with_capacity(rows.len() + current.len());

        // config-listed users stay valid alongside the table
        for (hash, stat) in current.iter() {
            if stat.quota() < 0 && stat.is_enabled() && !rows.iter().any(|r| &r.0 == hash) {
                next.insert(hash.clone(), Arc::clone(stat));
            }
        }
        for (hash, quota, download, upload, enabled) in rows {
            let stat = current
                .get(&hash)
                .cloned()
                .unwrap_or_else(|| Arc::new(UserStat::new(hash.clone())));
            stat.apply_row(quota, download, upload, enabled);
            next.insert(hash, stat);
        }

        *self.snapshot.write().expect("store lock") = Arc::new(next);
        Ok(())
    }

    pub fn pool(&self) -> &sqlx::MySqlPool {
        &self.pool
    }
}

impl CredentialStore for SqlStore {
    fn authenticate(&self, hash: &str) -> Option<Arc<UserStat>> {
        let snapshot = self.snapshot.read().expect("store lock").clone();
        lookup(&snapshot, hash)
    }

    fn list_users(&self) -> Vec<Arc<UserStat>> {
        let snapshot = self.snapshot.read().expect("store lock").clone();
        snapshot.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_store_authenticates_known_hash() {
        let store = StaticStore::new(&["swordfish".to_string()]);
        let hash = hash_password("swordfish");
        let stat = store.authenticate(&hash).unwrap();
        assert_eq!(stat.hash(), hash);
        assert!(store.authenticate(&hash_password("wrong")).is_none());
        assert_eq!(store.list_users().len(), 1);
    }

    #[test]
    fn disabled_user_is_rejected() {
        let store = StaticStore::new(&["p".to_string()]);
        let hash = hash_password("p");
        store.authenticate(&hash).unwrap().set_enabled(false);
        assert!(store.authenticate(&hash).is_none());
    }

    #[test]
    fn quota_exceeded_row_disables_user() {
        let stat = UserStat::new("h".into());
        stat.apply_row(1000, 700, 500, true);
        assert!(!stat.is_enabled(), "1200 bytes against a 1000 quota");

        stat.apply_row(1000, 400, 500, true);
        assert!(stat.is_enabled(), "900 bytes is within quota");

        stat.apply_row(-1, u64::MAX / 2, u64::MAX / 2, true);
        assert!(stat.is_enabled(), "negative quota is unlimited");

        stat.apply_row(1000, 0, 0, false);
        assert!(!stat.is_enabled(), "table disable wins");
    }

    #[test]
    fn counters_are_monotonic() {
        let stat = UserStat::new("h".into());
        stat.add_sent(18);
        stat.add_recv(1200);
        stat.add_sent(7);
        assert_eq!(stat.sent(), 25);
        assert_eq!(stat.recv(), 1200);
    }
}
