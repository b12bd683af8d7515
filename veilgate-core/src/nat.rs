//! UDP NAT session table.
//!
//! One entry per source address, created on the first inbound datagram and
//! published to the accept channel so an upper layer can attach an outbound
//! session. The table mutex guards only map operations; per-entry queues
//! are bounded and drop the oldest datagram on overflow.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct NatConfig {
    /// Idle expiry; refreshed on every packet.
    pub timeout: Duration,
    /// Total entry cap; over-cap insertion evicts the least recently used.
    pub capacity: usize,
    /// Per-entry inbound queue depth.
    pub queue_depth: usize,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            capacity: 1024,
            queue_depth: 16,
        }
    }
}

/// One transparent-UDP flow: datagrams from `source`, first seen heading to
/// `destination`.
pub struct NatEntry {
    source: SocketAddr,
    destination: SocketAddr,
    expires_at: Mutex<Instant>,
    queue: Mutex<VecDeque<(SocketAddr, Vec<u8>)>>,
    notify: Notify,
    closed: AtomicBool,
    timeout: Duration,
}

impl NatEntry {
    fn new(source: SocketAddr, destination: SocketAddr, cfg: &NatConfig) -> Self {
        Self {
            source,
            destination,
            expires_at: Mutex::new(Instant::now() + cfg.timeout),
            queue: Mutex::new(VecDeque::with_capacity(cfg.queue_depth)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            timeout: cfg.timeout,
        }
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    fn refresh(&self) {
        *self.expires_at.lock().expect("nat entry lock") = Instant::now() + self.timeout;
    }

    fn expires_at(&self) -> Instant {
        *self.expires_at.lock().expect("nat entry lock")
    }

    fn push(&self, dst: SocketAddr, payload: Vec<u8>, depth: usize) {
        {
            let mut queue = self.queue.lock().expect("nat entry lock");
            if queue.len() >= depth {
                queue.pop_front();
                tracing::warn!(source = %self.source, "nat queue full, dropping oldest datagram");
            }
            queue.push_back((dst, payload));
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Next queued datagram, in arrival order. Returns `None` once the
    /// entry is closed and the queue is drained.
    pub async fn recv(&self) -> Option<(SocketAddr, Vec<u8>)> {
        loop {
            if let Some(item) = self.queue.lock().expect("nat entry lock").pop_front() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

pub struct UdpNatTable {
    entries: Mutex<HashMap<SocketAddr, Arc<NatEntry>>>,
    accept_tx: mpsc::Sender<Arc<NatEntry>>,
    cfg: NatConfig,
}

impl UdpNatTable {
    pub fn new(cfg: NatConfig) -> (Arc<Self>, mpsc::Receiver<Arc<NatEntry>>) {
        let (accept_tx, accept_rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                entries: Mutex::new(HashMap::new()),
                accept_tx,
                cfg,
            }),
            accept_rx,
        )
    }

    /// Routes one inbound datagram. Known source: queue and refresh. New
    /// source: create the entry, queue the first payload, and publish it on
    /// the accept channel. IPv4-mapped sources are canonicalized so one
    /// peer never occupies two entries.
    pub fn on_inbound(&self, src: SocketAddr, dst: SocketAddr, payload: Vec<u8>) {
        let src = canonical(src);
        let entry = {
            let mut entries = self.entries.lock().expect("nat table lock");
            if let Some(entry) = entries.get(&src) {
                entry.refresh();
                entry.push(dst, payload, self.cfg.queue_depth);
                return;
            }
            if entries.len() >= self.cfg.capacity {
                evict_lru(&mut entries);
            }
            let entry = Arc::new(NatEntry::new(src, dst, &self.cfg));
            entry.push(dst, payload, self.cfg.queue_depth);
            entries.insert(src, Arc::clone(&entry));
            entry
        };
        if self.accept_tx.try_send(Arc::clone(&entry)).is_err() {
            tracing::warn!(source = %src, "nat accept queue full, dropping session");
            entry.close();
            self.entries.lock().expect("nat table lock").remove(&src);
        }
    }

    pub fn remove(&self, src: &SocketAddr) {
        if let Some(entry) = self.entries.lock().expect("nat table lock").remove(src) {
            entry.close();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("nat table lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry whose deadline has passed. Called by the reaper
    /// and directly from tests.
    pub fn reap_now(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("nat table lock");
        let before = entries.len();
        entries.retain(|_, entry| {
            let keep = entry.expires_at() > now;
            if !keep {
                entry.close();
            }
            keep
        });
        before - entries.len()
    }

    /// Ticks once a second until cancelled, closing idle flows.
    pub async fn run_reaper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = self.reap_now();
                    if reaped > 0 {
                        tracing::debug!(count = reaped, "nat entries expired");
                    }
                }
            }
        }
        // shutdown closes whatever is left
        let mut entries = self.entries.lock().expect("nat table lock");
        for entry in entries.values() {
            entry.close();
        }
        entries.clear();
    }
}

fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(v4.into(), v6.port()),
            None => addr,
        },
        v4 => v4,
    }
}

fn evict_lru(entries: &mut HashMap<SocketAddr, Arc<NatEntry>>) {
    let lru = entries
        .iter()
        .min_by_key(|(_, entry)| entry.expires_at())
        .map(|(src, _)| *src);
    if let Some(src) = lru {
        if let Some(entry) = entries.remove(&src) {
            entry.close();
            tracing::debug!(source = %src, "nat table full, evicted least recently used");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, last)), port)
    }

    fn config(timeout_ms: u64, capacity: usize, queue: usize) -> NatConfig {
        NatConfig {
            timeout: Duration::from_millis(timeout_ms),
            capacity,
            queue_depth: queue,
        }
    }

    #[tokio::test]
    async fn one_entry_per_source() {
        let (table, mut accept) = UdpNatTable::new(config(5000, 16, 16));
        table.on_inbound(addr(1, 1000), addr(9, 53), b"a".to_vec());
        table.on_inbound(addr(1, 1000), addr(9, 53), b"b".to_vec());
        assert_eq!(table.len(), 1);

        let entry = accept.recv().await.unwrap();
        assert_eq!(entry.recv().await.unwrap().1, b"a");
        assert_eq!(entry.recv().await.unwrap().1, b"b");
        assert!(accept.try_recv().is_err(), "second packet creates no session");
    }

    #[tokio::test]
    async fn mapped_ipv6_source_shares_the_ipv4_entry() {
        let (table, _accept) = UdpNatTable::new(config(5000, 16, 16));
        let v4 = addr(1, 1000);
        let v6 = SocketAddr::new(
            IpAddr::V6(Ipv4Addr::new(192, 0, 2, 1).to_ipv6_mapped()),
            1000,
        );
        table.on_inbound(v4, addr(9, 53), b"a".to_vec());
        table.on_inbound(v6, addr(9, 53), b"b".to_vec());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entry_is_reaped() {
        let (table, _accept) = UdpNatTable::new(config(50, 16, 16));
        table.on_inbound(addr(1, 1000), addr(9, 53), b"a".to_vec());
        assert_eq!(table.reap_now(), 0);
        tokio::time::advance(Duration::from_millis(80)).await;
        assert_eq!(table.reap_now(), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn over_cap_insertion_evicts_lru() {
        let (table, _accept) = UdpNatTable::new(config(5000, 2, 16));
        table.on_inbound(addr(1, 1000), addr(9, 53), b"a".to_vec());
        table.on_inbound(addr(2, 1000), addr(9, 53), b"b".to_vec());
        // refresh entry 1 so entry 2 is the LRU
        table.on_inbound(addr(1, 1000), addr(9, 53), b"a2".to_vec());
        table.on_inbound(addr(3, 1000), addr(9, 53), b"c".to_vec());
        assert_eq!(table.len(), 2);
        // the evicted source creates a fresh session on its next packet
        table.on_inbound(addr(2, 1000), addr(9, 53), b"b2".to_vec());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn queue_overflow_drops_oldest() {
        let (table, mut accept) = UdpNatTable::new(config(5000, 16, 2));
        let src = addr(1, 1000);
        table.on_inbound(src, addr(9, 53), b"one".to_vec());
        table.on_inbound(src, addr(9, 53), b"two".to_vec());
        table.on_inbound(src, addr(9, 53), b"three".to_vec());

        let entry = accept.recv().await.unwrap();
        assert_eq!(entry.recv().await.unwrap().1, b"two");
        assert_eq!(entry.recv().await.unwrap().1, b"three");
    }

    #[tokio::test]
    async fn closed_entry_drains_then_ends() {
        let (table, mut accept) = UdpNatTable::new(config(5000, 16, 16));
        let src = addr(1, 1000);
        table.on_inbound(src, addr(9, 53), b"last".to_vec());
        let entry = accept.recv().await.unwrap();
        table.remove(&src);
        assert_eq!(entry.recv().await.unwrap().1, b"last");
        assert!(entry.recv().await.is_none());
    }
}
