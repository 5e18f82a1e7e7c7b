//! A FIFO-queued, capacity-bounded connection pool.
//!
//! Requests are served strictly in submission order. Idle connections are
//! reused most-recently-released first, which keeps the working set small
//! and lets long-idle connections age out server-side. All pool state is
//! serialized behind one async mutex; completions are delivered through
//! oneshot channels so no caller ever runs while the lock is held.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionFactory};
use crate::error::{Error, Result};
use crate::messages::backend::TransactionStatus;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on live (allocated + idle) connections.
    pub maximum_connections: usize,
    /// Upper bound on queued acquisition requests.
    pub maximum_pending_requests: usize,
    /// How long a queued request may wait before failing.
    pub pending_request_timeout: Duration,
    /// How long a requestor may hold a connection before the pool
    /// force-closes it.
    pub allocated_connection_timeout: Duration,
    /// Cadence of the periodic metrics report; `None` disables it.
    pub metrics_logging_interval: Option<Duration>,
    /// Whether the periodic report also starts a new metrics period.
    pub metrics_reset_when_logged: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            maximum_connections: 10,
            maximum_pending_requests: 200,
            pending_request_timeout: Duration::from_secs(10),
            allocated_connection_timeout: Duration::from_secs(30),
            metrics_logging_interval: Some(Duration::from_secs(3600)),
            metrics_reset_when_logged: true,
        }
    }
}

/// Delta counters accumulated over one metrics period.
#[derive(Debug, Default, Clone)]
struct Counters {
    successful_requests: u64,
    unsuccessful_requests_too_busy: u64,
    unsuccessful_requests_timed_out: u64,
    unsuccessful_requests_error: u64,
    minimum_pending_requests: usize,
    maximum_pending_requests: usize,
    connections_created: u64,
    allocated_connections_closed_by_requestor: u64,
    allocated_connections_timed_out: u64,
}

/// A snapshot of the pool's activity over the current metrics period.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub successful_requests: u64,
    pub unsuccessful_requests_too_busy: u64,
    pub unsuccessful_requests_timed_out: u64,
    pub unsuccessful_requests_error: u64,
    pub minimum_pending_requests: usize,
    pub maximum_pending_requests: usize,
    pub connections_at_start_of_period: usize,
    pub connections_at_end_of_period: usize,
    pub connections_created: u64,
    pub allocated_connections_closed_by_requestor: u64,
    pub allocated_connections_timed_out: u64,
}

impl std::fmt::Display for PoolMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "requests: {} ok, {} too-busy, {} timed-out, {} failed; \
             pending min/max: {}/{}; connections: {} -> {} ({} created); \
             closed by requestor: {}, allocation timeouts: {}",
            self.successful_requests,
            self.unsuccessful_requests_too_busy,
            self.unsuccessful_requests_timed_out,
            self.unsuccessful_requests_error,
            self.minimum_pending_requests,
            self.maximum_pending_requests,
            self.connections_at_start_of_period,
            self.connections_at_end_of_period,
            self.connections_created,
            self.allocated_connections_closed_by_requestor,
            self.allocated_connections_timed_out,
        )
    }
}

struct IdleEntry {
    conn: Connection,
    #[allow(dead_code, reason = "diagnostic field; ordering uses list position")]
    released_at: Instant,
}

struct AllocatedEntry {
    kill: Arc<AtomicBool>,
    timer: JoinHandle<()>,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<Connection>>,
    timer: JoinHandle<()>,
}

struct PoolState {
    config: PoolConfig,
    /// Tail holds the most recently released connection; acquisition pops
    /// the tail.
    idle: Vec<IdleEntry>,
    allocated: HashMap<String, AllocatedEntry>,
    pending: VecDeque<Waiter>,
    /// Connections being established; they count toward capacity.
    creating: usize,
    closed: bool,
    counters: Counters,
    connections_at_period_start: usize,
    next_waiter_id: u64,
}

impl PoolState {
    fn new(config: PoolConfig) -> Self {
        PoolState {
            config,
            idle: Vec::new(),
            allocated: HashMap::new(),
            pending: VecDeque::new(),
            creating: 0,
            closed: false,
            counters: Counters::default(),
            connections_at_period_start: 0,
            next_waiter_id: 0,
        }
    }

    fn note_pending(&mut self) {
        let len = self.pending.len();
        if len > self.counters.maximum_pending_requests {
            self.counters.maximum_pending_requests = len;
        }
        if len < self.counters.minimum_pending_requests {
            self.counters.minimum_pending_requests = len;
        }
    }

    fn compute_metrics(&mut self, reset: bool) -> PoolMetrics {
        let end = self.allocated.len() + self.idle.len();
        let metrics = PoolMetrics {
            successful_requests: self.counters.successful_requests,
            unsuccessful_requests_too_busy: self.counters.unsuccessful_requests_too_busy,
            unsuccessful_requests_timed_out: self.counters.unsuccessful_requests_timed_out,
            unsuccessful_requests_error: self.counters.unsuccessful_requests_error,
            minimum_pending_requests: self.counters.minimum_pending_requests,
            maximum_pending_requests: self.counters.maximum_pending_requests,
            connections_at_start_of_period: self.connections_at_period_start,
            connections_at_end_of_period: end,
            connections_created: self.counters.connections_created,
            allocated_connections_closed_by_requestor: self
                .counters
                .allocated_connections_closed_by_requestor,
            allocated_connections_timed_out: self.counters.allocated_connections_timed_out,
        };
        if reset {
            self.counters = Counters::default();
            self.counters.minimum_pending_requests = self.pending.len();
            self.counters.maximum_pending_requests = self.pending.len();
            self.connections_at_period_start = end;
        }
        metrics
    }
}

struct PoolInner {
    factory: ConnectionFactory,
    state: Mutex<PoolState>,
}

/// A pool of authenticated connections.
///
/// Between `acquire` and `release` the caller owns the connection
/// exclusively; releasing transfers it back. The pool closes released
/// connections that are unusable (already closed, force-closed, mid
/// transaction, or mid portal) rather than recycling them.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool over the given factory.
    ///
    /// When `metrics_logging_interval` is set, a background task logs (and
    /// optionally resets) the pool metrics at that cadence. Must be called
    /// within a tokio runtime.
    pub fn new(factory: ConnectionFactory, config: PoolConfig) -> Self {
        let report_metrics = config.metrics_logging_interval.is_some();
        let pool = ConnectionPool {
            inner: Arc::new(PoolInner {
                factory,
                state: Mutex::new(PoolState::new(config)),
            }),
        };
        if report_metrics {
            let inner = Arc::downgrade(&pool.inner);
            tokio::spawn(async move {
                loop {
                    let Some(strong) = inner.upgrade() else { break };
                    let interval = strong.state.lock().await.config.metrics_logging_interval;
                    drop(strong);
                    let Some(interval) = interval else { break };

                    tokio::time::sleep(interval).await;

                    let Some(strong) = inner.upgrade() else { break };
                    let mut state = strong.state.lock().await;
                    if state.closed {
                        break;
                    }
                    let reset = state.config.metrics_reset_when_logged;
                    let metrics = state.compute_metrics(reset);
                    info!(%metrics, "connection pool metrics");
                }
            });
        }
        pool
    }

    /// Acquires a connection: reuses the most recently released idle one,
    /// creates a new one while capacity allows, or queues FIFO behind
    /// earlier requests.
    pub async fn acquire(&self) -> Result<Connection> {
        self.inner.acquire().await
    }

    /// Returns a connection to the pool, waking the head of the pending
    /// queue if any.
    ///
    /// A connection that does not belong to this pool is closed with a
    /// warning. A connection that comes back closed, force-closed, inside
    /// a transaction, or owing protocol state is closed instead of reused.
    pub async fn release(&self, conn: Connection) {
        self.inner.release(conn).await;
    }

    /// Acquires a connection, runs `op` on it, and releases it regardless
    /// of the outcome.
    pub async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.acquire().await?;
        let result = op(&mut conn).await;
        self.release(conn).await;
        result
    }

    /// Snapshots the metrics of the current period; with `reset`, starts a
    /// new period.
    pub async fn compute_metrics(&self, reset: bool) -> PoolMetrics {
        self.inner.state.lock().await.compute_metrics(reset)
    }

    /// The current pool configuration.
    pub async fn config(&self) -> PoolConfig {
        self.inner.state.lock().await.config.clone()
    }

    /// Replaces the pool configuration. Timers already armed keep the
    /// values they were armed with.
    pub async fn set_config(&self, config: PoolConfig) {
        self.inner.state.lock().await.config = config;
    }

    /// Shuts the pool down. Idempotent.
    ///
    /// Pending requests fail with `ConnectionPoolClosed` and idle
    /// connections are closed. With `force`, allocated connections are
    /// force-closed as well; without it they are closed as they come back.
    pub async fn close(&self, force: bool) {
        let (idle, waiters) = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            info!(force, "closing connection pool");

            let idle: Vec<Connection> = state.idle.drain(..).map(|e| e.conn).collect();
            let waiters: Vec<Waiter> = state.pending.drain(..).collect();
            if force {
                for entry in state.allocated.values() {
                    entry.kill.store(true, Ordering::Release);
                }
            }
            (idle, waiters)
        };

        for waiter in waiters {
            waiter.timer.abort();
            let _ = waiter.tx.send(Err(Error::ConnectionPoolClosed));
        }
        for mut conn in idle {
            conn.close().await;
        }
    }
}

impl PoolInner {
    async fn acquire(self: &Arc<Self>) -> Result<Connection> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(Error::ConnectionPoolClosed);
            }

            // Reuse the most recently released idle connection, but never
            // ahead of already-queued requests.
            if state.pending.is_empty() && !state.idle.is_empty() {
                let entry = state.idle.pop().expect("idle list is not empty");
                let conn = entry.conn;
                let id = conn.id().to_string();
                let kill = conn.kill_handle();
                let timer = self.spawn_allocated_timer(
                    id.clone(),
                    state.config.allocated_connection_timeout,
                );
                state.allocated.insert(id, AllocatedEntry { kill, timer });
                state.counters.successful_requests += 1;
                debug!(id = conn.id(), "reusing idle connection");
                return Ok(conn);
            }

            let occupied = state.allocated.len() + state.creating + state.pending.len();
            if occupied < state.config.maximum_connections {
                state.creating += 1;
                drop(state);
                return self.create_for_caller().await;
            }

            if state.pending.len() < state.config.maximum_pending_requests {
                let (tx, rx) = oneshot::channel();
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                let timer = self.spawn_pending_timer(id, state.config.pending_request_timeout);
                state.pending.push_back(Waiter { id, tx, timer });
                state.note_pending();
                debug!(pending = state.pending.len(), "request queued");
                rx
            } else {
                state.counters.unsuccessful_requests_too_busy += 1;
                return Err(Error::TooManyRequestsForConnections);
            }
        };

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionPoolClosed),
        }
    }

    /// Creates a connection for a caller that reserved capacity via
    /// `creating`.
    async fn create_for_caller(self: &Arc<Self>) -> Result<Connection> {
        let result = self.factory.connect().await;
        let mut state = self.state.lock().await;
        state.creating -= 1;

        match result {
            Ok(mut conn) => {
                state.counters.connections_created += 1;
                if state.closed {
                    drop(state);
                    conn.close().await;
                    return Err(Error::ConnectionPoolClosed);
                }
                let id = conn.id().to_string();
                let kill = conn.kill_handle();
                let timer = self.spawn_allocated_timer(
                    id.clone(),
                    state.config.allocated_connection_timeout,
                );
                state.allocated.insert(id, AllocatedEntry { kill, timer });
                state.counters.successful_requests += 1;
                debug!(id = conn.id(), "created connection");
                Ok(conn)
            }
            Err(err) => {
                state.counters.unsuccessful_requests_error += 1;
                warn!(%err, "connection creation failed");
                Err(err)
            }
        }
    }

    async fn release(self: &Arc<Self>, mut conn: Connection) {
        let mut state = self.state.lock().await;

        let Some(entry) = state.allocated.remove(conn.id()) else {
            warn!(
                id = conn.id(),
                "released connection does not belong to this pool; closing"
            );
            drop(state);
            conn.close().await;
            return;
        };
        entry.timer.abort();

        if entry.kill.load(Ordering::Acquire) {
            // Already force-closed and counted by the allocation timer.
            debug!(id = conn.id(), "releasing force-closed connection");
            conn.close_abruptly();
            self.maybe_fill_pending(&mut state);
            return;
        }

        if conn.is_closed() {
            state.counters.allocated_connections_closed_by_requestor += 1;
            debug!(id = conn.id(), "requestor closed connection before release");
            self.maybe_fill_pending(&mut state);
            return;
        }

        if conn.transaction_status() != TransactionStatus::Idle {
            warn!(
                id = conn.id(),
                status = %conn.transaction_status(),
                "connection released with an open transaction; closing"
            );
            drop(state);
            conn.close().await;
            let mut state = self.state.lock().await;
            self.maybe_fill_pending(&mut state);
            return;
        }

        if state.closed {
            drop(state);
            conn.close().await;
            return;
        }

        if conn.has_pending_sync() {
            warn!(
                id = conn.id(),
                "connection released with an unfinished portal; closing"
            );
            drop(state);
            conn.close().await;
            let mut state = self.state.lock().await;
            self.maybe_fill_pending(&mut state);
            return;
        }

        if let Some(conn) = self.dispatch_connection(&mut state, conn) {
            // Pool closed while we were dispatching.
            drop(state);
            let mut conn = conn;
            conn.close().await;
        }
    }

    /// Hands a live connection to the FIFO head, or parks it idle at the
    /// tail. Returns the connection when the pool is closed and the caller
    /// must dispose of it.
    fn dispatch_connection(
        self: &Arc<Self>,
        state: &mut PoolState,
        mut conn: Connection,
    ) -> Option<Connection> {
        if state.closed {
            return Some(conn);
        }

        loop {
            let Some(waiter) = state.pending.pop_front() else {
                debug!(id = conn.id(), "connection returned to idle list");
                state.idle.push(IdleEntry {
                    conn,
                    released_at: Instant::now(),
                });
                return None;
            };
            waiter.timer.abort();
            state.note_pending();

            let id = conn.id().to_string();
            let kill = conn.kill_handle();
            let timer =
                self.spawn_allocated_timer(id.clone(), state.config.allocated_connection_timeout);
            state.allocated.insert(id.clone(), AllocatedEntry { kill, timer });

            match waiter.tx.send(Ok(conn)) {
                Ok(()) => {
                    state.counters.successful_requests += 1;
                    return None;
                }
                Err(payload) => {
                    // The requestor gave up; take the connection back and
                    // try the next waiter.
                    let entry = state.allocated.remove(&id).expect("entry was just inserted");
                    entry.timer.abort();
                    conn = payload.expect("payload was constructed as Ok");
                }
            }
        }
    }

    /// After capacity was freed by a discarded connection, starts an
    /// asynchronous creation for the pending head if room allows.
    fn maybe_fill_pending(self: &Arc<Self>, state: &mut PoolState) {
        if state.closed || state.pending.is_empty() {
            return;
        }
        let live = state.allocated.len() + state.creating + state.idle.len();
        if live >= state.config.maximum_connections {
            return;
        }
        state.creating += 1;

        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(inner) = inner.upgrade() else { return };
            let result = inner.factory.connect().await;
            let mut state = inner.state.lock().await;
            state.creating -= 1;

            match result {
                Ok(mut conn) => {
                    state.counters.connections_created += 1;
                    if let Some(returned) = inner.dispatch_connection(&mut state, conn) {
                        conn = returned;
                        drop(state);
                        conn.close().await;
                    }
                }
                Err(err) => {
                    // Deliver the failure to the head of the queue, the
                    // request this creation was started for.
                    state.counters.unsuccessful_requests_error += 1;
                    warn!(%err, "connection creation for pending request failed");
                    if let Some(waiter) = state.pending.pop_front() {
                        waiter.timer.abort();
                        state.note_pending();
                        let _ = waiter.tx.send(Err(err));
                    }
                }
            }
        });
    }

    fn spawn_allocated_timer(
        self: &Arc<Self>,
        conn_id: String,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = inner.upgrade() else { return };
            let mut state = inner.state.lock().await;
            if let Some(entry) = state.allocated.get(&conn_id) {
                warn!(id = %conn_id, "allocated connection timed out; force-closing");
                entry.kill.store(true, Ordering::Release);
                state.counters.allocated_connections_timed_out += 1;
            }
        })
    }

    fn spawn_pending_timer(self: &Arc<Self>, waiter_id: u64, timeout: Duration) -> JoinHandle<()> {
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = inner.upgrade() else { return };
            let mut state = inner.state.lock().await;
            if let Some(position) = state.pending.iter().position(|w| w.id == waiter_id) {
                let waiter = state.pending.remove(position).expect("position is valid");
                state.counters.unsuccessful_requests_timed_out += 1;
                state.note_pending();
                warn!("pending connection request timed out");
                let _ = waiter.tx.send(Err(Error::TimedOutAcquiringConnection));
            }
        })
    }
}
