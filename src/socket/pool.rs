//! Bounded connection pool.
//!
//! Connections are grouped by endpoint. A group never holds more than
//! `max_per_group` open connections (checked out plus idle) and the pool never
//! more than `max_total`. Callers over the limit wait in FIFO order until a
//! connection is checked in or a slot is freed.
//!
//! A checkout hands out a [`PoolSlot`] that owns one unit of capacity. The slot
//! is released when it is dropped, so a caller that is cancelled mid-connect
//! or drops a half-read response never leaks capacity.

use crate::base::neterror::NetError;
use crate::config::{Endpoint, Scheme};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// A connection the pool can hold while idle.
pub trait Poolable: Send + Sync + 'static {
    /// False once the peer closed the connection or it broke.
    fn is_open(&self) -> bool;
}

/// Identifies a connection group (scheme, host, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupId {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl From<&Endpoint> for GroupId {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            scheme: endpoint.scheme(),
            host: endpoint.host().to_ascii_lowercase(),
            port: endpoint.port(),
        }
    }
}

/// What a waiter receives.
type Handoff<T> = Result<Checkout<T>, NetError>;

struct IdleConnection<T> {
    conn: T,
    /// When this connection was returned to the pool
    since: Instant,
}

/// Per-group state tracking.
struct Group<T: Poolable> {
    idle: VecDeque<IdleConnection<T>>,
    active: usize,
    waiters: VecDeque<oneshot::Sender<Handoff<T>>>,
}

impl<T: Poolable> Group<T> {
    fn new() -> Self {
        Self { idle: VecDeque::new(), active: 0, waiters: VecDeque::new() }
    }

    fn open(&self) -> usize {
        self.active + self.idle.len()
    }
}

/// Result of [`ClientSocketPool::checkout`].
pub enum Checkout<T: Poolable> {
    /// An idle connection; the slot is already accounted for.
    Reused(T, PoolSlot<T>),
    /// Capacity was reserved; the caller opens a new connection.
    Connect(PoolSlot<T>),
}

/// One unit of pool capacity held by a caller.
pub struct PoolSlot<T: Poolable> {
    pool: ClientSocketPool<T>,
    group: GroupId,
    armed: bool,
}

impl<T: Poolable> Checkout<T> {
    /// Take back an offer a waiter never received, without touching the
    /// pool's accounting.
    fn reclaim(self) -> Option<T> {
        match self {
            Checkout::Reused(conn, slot) => {
                slot.disarm();
                Some(conn)
            }
            Checkout::Connect(slot) => {
                slot.disarm();
                None
            }
        }
    }
}

impl<T: Poolable> PoolSlot<T> {
    /// Return `conn` to the pool for reuse. Closed connections are dropped
    /// and their capacity freed.
    pub fn checkin(mut self, conn: T) {
        self.armed = false;
        self.pool.checkin(&self.group, conn);
    }

    /// Give up the slot without returning a connection.
    pub fn discard(self) {}

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T: Poolable> Drop for PoolSlot<T> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot(&self.group);
        }
    }
}

impl<T: Poolable> std::fmt::Debug for PoolSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSlot").field("group", &self.group).finish()
    }
}

struct PoolInner<T: Poolable> {
    max_per_group: usize,
    max_total: usize,
    idle_timeout: Duration,
    groups: DashMap<GroupId, Group<T>>,
    total_open: AtomicUsize,
    closed: AtomicBool,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

/// Manages pooled connections, enforcing per-group and total limits.
pub struct ClientSocketPool<T: Poolable> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Poolable> Clone for ClientSocketPool<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Poolable> std::fmt::Debug for ClientSocketPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSocketPool")
            .field("max_per_group", &self.inner.max_per_group)
            .field("max_total", &self.inner.max_total)
            .field("total_open", &self.inner.total_open.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Poolable> ClientSocketPool<T> {
    /// A pool allowing `max_connections` per group and in total.
    pub fn new(max_connections: usize) -> Self {
        Self::with_limits(max_connections, max_connections, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_limits(max_per_group: usize, max_total: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                max_per_group: max_per_group.max(1),
                max_total: max_total.max(1),
                idle_timeout,
                groups: DashMap::new(),
                total_open: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                cleanup_task: Mutex::new(None),
            }),
        }
    }

    fn slot(&self, group: &GroupId) -> PoolSlot<T> {
        PoolSlot { pool: self.clone(), group: group.clone(), armed: true }
    }

    /// Take an idle connection or reserve capacity for a new one, waiting in
    /// line while the pool is full.
    pub async fn checkout(&self, group_id: &GroupId) -> Result<Checkout<T>, NetError> {
        let rx = {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(NetError::ConnectionAborted);
            }
            let mut group = self.inner.groups.entry(group_id.clone()).or_insert_with(Group::new);

            // 1. Check for idle connection
            while let Some(idle) = group.idle.pop_front() {
                if idle.conn.is_open() {
                    group.active += 1;
                    tracing::trace!(group = ?group_id, "reusing idle connection");
                    return Ok(Checkout::Reused(idle.conn, self.slot(group_id)));
                }
                self.inner.total_open.fetch_sub(1, Ordering::AcqRel);
            }

            // 2. Check limits
            if group.open() < self.inner.max_per_group && self.try_reserve_total() {
                group.active += 1;
                return Ok(Checkout::Connect(self.slot(group_id)));
            }

            // 3. Queue and wait
            let (tx, rx) = oneshot::channel();
            group.waiters.push_back(tx);
            tracing::debug!(group = ?group_id, waiters = group.waiters.len(), "pool full, waiting");
            rx
        };

        rx.await.unwrap_or(Err(NetError::ConnectionAborted))
    }

    fn try_reserve_total(&self) -> bool {
        self.inner
            .total_open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.inner.max_total).then_some(n + 1)
            })
            .is_ok()
    }

    fn checkin(&self, group_id: &GroupId, conn: T) {
        if !conn.is_open() || self.inner.closed.load(Ordering::Acquire) {
            self.release_slot(group_id);
            return;
        }

        let Some(mut group) = self.inner.groups.get_mut(group_id) else {
            self.inner.total_open.fetch_sub(1, Ordering::AcqRel);
            return;
        };

        if let Err(Some(conn)) = self.offer(&mut group, group_id, Some(conn)) {
            group.active = group.active.saturating_sub(1);
            group.idle.push_back(IdleConnection { conn, since: Instant::now() });
        }
    }

    /// Hand `conn`, or a bare slot when `None`, to the oldest live waiter.
    /// Gives the offer back when nobody takes it.
    fn offer(
        &self,
        group: &mut Group<T>,
        group_id: &GroupId,
        mut conn: Option<T>,
    ) -> Result<(), Option<T>> {
        while let Some(waiter) = group.waiters.pop_front() {
            let checkout = match conn {
                Some(c) => Checkout::Reused(c, self.slot(group_id)),
                None => Checkout::Connect(self.slot(group_id)),
            };
            match waiter.send(Ok(checkout)) {
                Ok(()) => return Ok(()),
                Err(returned) => conn = returned.ok().and_then(Checkout::reclaim),
            }
        }
        Err(conn)
    }

    /// Free one unit of capacity, passing it to a waiter when one is queued.
    fn release_slot(&self, group_id: &GroupId) {
        let Some(mut group) = self.inner.groups.get_mut(group_id) else {
            self.inner.total_open.fetch_sub(1, Ordering::AcqRel);
            return;
        };

        if !self.inner.closed.load(Ordering::Acquire)
            && self.offer(&mut group, group_id, None).is_ok()
        {
            return;
        }

        group.active = group.active.saturating_sub(1);
        self.inner.total_open.fetch_sub(1, Ordering::AcqRel);
    }

    /// Drop idle connections that are closed or idle past the idle timeout.
    pub fn cleanup_idle(&self) {
        let timeout = self.inner.idle_timeout;
        let now = Instant::now();
        let mut removed = 0;

        for mut entry in self.inner.groups.iter_mut() {
            let before = entry.idle.len();
            entry
                .idle
                .retain(|idle| now.duration_since(idle.since) < timeout && idle.conn.is_open());
            removed += before - entry.idle.len();
        }
        self.inner.groups.retain(|_, g| g.open() > 0 || !g.waiters.is_empty());

        if removed > 0 {
            self.inner.total_open.fetch_sub(removed, Ordering::AcqRel);
            tracing::debug!(removed, "closed idle connections");
        }
    }

    /// Start the background task that periodically calls [`cleanup_idle`](Self::cleanup_idle).
    pub fn start_cleanup_task(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!("no tokio runtime, idle connection cleanup disabled");
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                ClientSocketPool { inner }.cleanup_idle();
            }
        });
        if let Ok(mut slot) = self.inner.cleanup_task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Stop the cleanup task, close idle connections and fail every waiter.
    /// Checked-out connections are closed when their holders release them.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.inner.cleanup_task.lock() {
            Ok(mut task) => {
                if let Some(handle) = task.take() {
                    handle.abort();
                }
            }
            Err(_) => tracing::warn!("pool cleanup task handle poisoned"),
        }

        let mut closed = 0;
        let mut cancelled = 0;
        for mut entry in self.inner.groups.iter_mut() {
            closed += entry.idle.len();
            entry.idle.clear();
            for waiter in entry.waiters.drain(..) {
                let _ = waiter.send(Err(NetError::ConnectionAborted));
                cancelled += 1;
            }
        }
        self.inner.total_open.fetch_sub(closed, Ordering::AcqRel);
        tracing::debug!(closed, cancelled, "connection pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Open connections, checked out or idle.
    pub fn total_open_count(&self) -> usize {
        self.inner.total_open.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.groups.iter().map(|g| g.idle.len()).sum()
    }

    pub fn waiter_count(&self, group_id: &GroupId) -> usize {
        self.inner.groups.get(group_id).map(|g| g.waiters.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct FakeConn {
        id: usize,
        open: Arc<AtomicBool>,
    }

    impl FakeConn {
        fn new(id: usize) -> Self {
            Self { id, open: Arc::new(AtomicBool::new(true)) }
        }
    }

    impl Poolable for FakeConn {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    fn group() -> GroupId {
        GroupId::from(&Endpoint::http("db.example", 5984))
    }

    async fn connect_slot(pool: &ClientSocketPool<FakeConn>) -> PoolSlot<FakeConn> {
        match pool.checkout(&group()).await.unwrap() {
            Checkout::Connect(slot) => slot,
            Checkout::Reused(..) => panic!("expected a fresh slot"),
        }
    }

    #[tokio::test]
    async fn test_reuses_checked_in_connection() {
        let pool = ClientSocketPool::new(2);
        let slot = connect_slot(&pool).await;
        slot.checkin(FakeConn::new(7));
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.total_open_count(), 1);

        match pool.checkout(&group()).await.unwrap() {
            Checkout::Reused(conn, _slot) => assert_eq!(conn.id, 7),
            Checkout::Connect(_) => panic!("idle connection not reused"),
        }
    }

    #[tokio::test]
    async fn test_closed_connection_not_reused() {
        let pool = ClientSocketPool::new(1);
        let conn = FakeConn::new(1);
        let open = Arc::clone(&conn.open);
        connect_slot(&pool).await.checkin(conn);
        open.store(false, Ordering::SeqCst);

        assert!(matches!(pool.checkout(&group()).await.unwrap(), Checkout::Connect(_)));
        assert_eq!(pool.total_open_count(), 1);
    }

    #[tokio::test]
    async fn test_limit_queues_then_hands_off() {
        let pool = ClientSocketPool::new(1);
        let held = connect_slot(&pool).await;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                match pool.checkout(&group()).await.unwrap() {
                    Checkout::Reused(conn, _slot) => conn.id,
                    Checkout::Connect(_) => usize::MAX,
                }
            })
        };
        while pool.waiter_count(&group()) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.total_open_count(), 1);

        held.checkin(FakeConn::new(42));
        assert_eq!(waiter.await.unwrap(), 42);
        // The waiter dropped its slot without checking the connection in.
        assert_eq!(pool.total_open_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_slot_frees_capacity_for_waiter() {
        let pool = ClientSocketPool::new(1);
        let held = connect_slot(&pool).await;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { matches!(pool.checkout(&group()).await, Ok(Checkout::Connect(_))) })
        };
        while pool.waiter_count(&group()) == 0 {
            tokio::task::yield_now().await;
        }
        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_discard_releases_capacity() {
        let pool = ClientSocketPool::new(1);
        connect_slot(&pool).await.discard();
        assert_eq!(pool.total_open_count(), 0);
        connect_slot(&pool).await.discard();
    }

    #[tokio::test]
    async fn test_cleanup_drops_expired_idle() {
        let pool = ClientSocketPool::with_limits(2, 2, Duration::ZERO);
        connect_slot(&pool).await.checkin(FakeConn::new(1));
        assert_eq!(pool.idle_count(), 1);
        pool.cleanup_idle();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.total_open_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters_and_new_checkouts() {
        let pool = ClientSocketPool::new(1);
        pool.start_cleanup_task();
        let held = connect_slot(&pool).await;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout(&group()).await.err() })
        };
        while pool.waiter_count(&group()) == 0 {
            tokio::task::yield_now().await;
        }

        pool.shutdown();
        pool.shutdown();
        assert_eq!(waiter.await.unwrap(), Some(NetError::ConnectionAborted));
        assert!(pool.is_closed());
        assert!(matches!(pool.checkout(&group()).await, Err(NetError::ConnectionAborted)));

        held.checkin(FakeConn::new(1));
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.total_open_count(), 0);
    }
}
