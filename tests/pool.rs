//! Connection pool behavior against the in-process backend.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::trust_factory;
use futures::future::BoxFuture;
use pg_client::{Connection, ConnectionPool, Error, PoolConfig};
use tokio::time::{sleep, timeout};

fn pool_config(max_connections: usize) -> PoolConfig {
    PoolConfig {
        maximum_connections: max_connections,
        metrics_logging_interval: None,
        ..PoolConfig::default()
    }
}

fn mock_pool(config: PoolConfig) -> ConnectionPool {
    ConnectionPool::new(trust_factory(), config)
}

async fn acquire_all(pool: &ConnectionPool, n: usize) -> Vec<Connection> {
    let mut conns = Vec::with_capacity(n);
    for _ in 0..n {
        conns.push(pool.acquire().await.unwrap());
    }
    conns
}

#[tokio::test]
async fn acquire_creates_then_reuses_connections() {
    let pool = mock_pool(pool_config(5));

    let conn = pool.acquire().await.unwrap();
    let first_id = conn.id().to_string();
    pool.release(conn).await;

    let conn = pool.acquire().await.unwrap();
    assert_eq!(first_id, conn.id());
    pool.release(conn).await;

    let metrics = pool.compute_metrics(false).await;
    assert_eq!(2, metrics.successful_requests);
    assert_eq!(1, metrics.connections_created);
    assert_eq!(1, metrics.connections_at_end_of_period);

    pool.close(false).await;
}

#[tokio::test]
async fn idle_connections_are_reused_most_recently_released_first() {
    let pool = mock_pool(pool_config(5));

    let conns = acquire_all(&pool, 5).await;
    let ids: Vec<String> = conns.iter().map(|c| c.id().to_string()).collect();

    // Release in reverse order: c5 first, c1 last.
    for conn in conns.into_iter().rev() {
        pool.release(conn).await;
    }

    // Acquisition pops the most recently released: c1, c2, c3, c4, c5.
    let reacquired = acquire_all(&pool, 5).await;
    let reacquired_ids: Vec<String> = reacquired.iter().map(|c| c.id().to_string()).collect();
    assert_eq!(ids, reacquired_ids);

    for conn in reacquired {
        pool.release(conn).await;
    }
    pool.close(false).await;
}

#[tokio::test]
async fn pending_requests_complete_in_fifo_order() {
    let pool = mock_pool(pool_config(5));
    let mut held = acquire_all(&pool, 5).await;

    let order = Arc::new(Mutex::new(Vec::new()));

    let task_a = tokio::spawn({
        let pool = pool.clone();
        let order = order.clone();
        async move {
            let conn = pool.acquire().await.unwrap();
            order.lock().unwrap().push('A');
            pool.release(conn).await;
        }
    });
    sleep(Duration::from_millis(50)).await;

    let task_b = tokio::spawn({
        let pool = pool.clone();
        let order = order.clone();
        async move {
            let conn = pool.acquire().await.unwrap();
            order.lock().unwrap().push('B');
            pool.release(conn).await;
        }
    });
    sleep(Duration::from_millis(50)).await;

    // One release feeds A; A's own release feeds B.
    pool.release(held.pop().unwrap()).await;
    timeout(Duration::from_secs(5), task_a).await.unwrap().unwrap();
    timeout(Duration::from_secs(5), task_b).await.unwrap().unwrap();

    assert_eq!(vec!['A', 'B'], *order.lock().unwrap());

    for conn in held {
        pool.release(conn).await;
    }
    pool.close(false).await;
}

#[tokio::test]
async fn pending_request_times_out() {
    let config = PoolConfig {
        maximum_connections: 1,
        pending_request_timeout: Duration::from_millis(150),
        metrics_logging_interval: None,
        ..PoolConfig::default()
    };
    let pool = mock_pool(config);

    let held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::TimedOutAcquiringConnection));

    let metrics = pool.compute_metrics(false).await;
    assert_eq!(1, metrics.unsuccessful_requests_timed_out);

    pool.release(held).await;
    pool.close(false).await;
}

#[tokio::test]
async fn full_pending_queue_rejects_requests() {
    let config = PoolConfig {
        maximum_connections: 1,
        maximum_pending_requests: 1,
        pending_request_timeout: Duration::from_secs(10),
        metrics_logging_interval: None,
        ..PoolConfig::default()
    };
    let pool = mock_pool(config);

    let held = pool.acquire().await.unwrap();
    let queued = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    sleep(Duration::from_millis(50)).await;

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::TooManyRequestsForConnections));
    let metrics = pool.compute_metrics(false).await;
    assert_eq!(1, metrics.unsuccessful_requests_too_busy);
    assert_eq!(1, metrics.maximum_pending_requests);

    pool.release(held).await;
    let conn = timeout(Duration::from_secs(5), queued)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    pool.release(conn).await;
    pool.close(false).await;
}

#[tokio::test]
async fn allocated_connection_times_out_and_is_force_closed() {
    let config = PoolConfig {
        maximum_connections: 2,
        allocated_connection_timeout: Duration::from_millis(100),
        metrics_logging_interval: None,
        ..PoolConfig::default()
    };
    let pool = mock_pool(config);

    let mut conn = pool.acquire().await.unwrap();
    sleep(Duration::from_millis(250)).await;

    assert!(conn.is_closed());
    let err = conn.prepare("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));

    let metrics = pool.compute_metrics(false).await;
    assert_eq!(1, metrics.allocated_connections_timed_out);

    // Releasing the force-closed connection is a harmless no-op.
    pool.release(conn).await;
    let metrics = pool.compute_metrics(false).await;
    assert_eq!(1, metrics.allocated_connections_timed_out);
    assert_eq!(0, metrics.allocated_connections_closed_by_requestor);
    assert_eq!(0, metrics.connections_at_end_of_period);

    pool.close(false).await;
}

#[tokio::test]
async fn connection_released_in_transaction_is_closed() {
    let pool = mock_pool(pool_config(2));

    let mut conn = pool.acquire().await.unwrap();
    conn.begin_transaction().await.unwrap();
    pool.release(conn).await;

    // The pool refused to park it: nothing idle remains.
    let metrics = pool.compute_metrics(false).await;
    assert_eq!(0, metrics.connections_at_end_of_period);

    pool.close(false).await;
}

#[tokio::test]
async fn connection_released_in_failed_transaction_is_closed() {
    let pool = mock_pool(pool_config(2));

    let mut conn = pool.acquire().await.unwrap();
    conn.begin_transaction().await.unwrap();
    let stmt = conn.prepare("SELECT broken('now')").await.unwrap();
    let mut cursor = conn.query(&stmt, &[]).await.unwrap();
    assert!(matches!(
        cursor.next().await.unwrap(),
        Err(Error::Sql(_))
    ));
    assert!(cursor.next().await.is_none());
    drop(cursor);
    pool.release(conn).await;

    let metrics = pool.compute_metrics(false).await;
    assert_eq!(0, metrics.connections_at_end_of_period);

    pool.close(false).await;
}

#[tokio::test]
async fn requestor_closed_connection_is_counted_and_discarded() {
    let pool = mock_pool(pool_config(2));

    let mut conn = pool.acquire().await.unwrap();
    conn.close().await;
    pool.release(conn).await;

    let metrics = pool.compute_metrics(false).await;
    assert_eq!(1, metrics.allocated_connections_closed_by_requestor);
    assert_eq!(0, metrics.connections_at_end_of_period);

    pool.close(false).await;
}

#[tokio::test]
async fn foreign_connection_release_warns_and_closes() {
    let pool = mock_pool(pool_config(2));

    let foreign = trust_factory().connect().await.unwrap();
    pool.release(foreign).await;

    let metrics = pool.compute_metrics(false).await;
    assert_eq!(0, metrics.connections_at_end_of_period);
    assert_eq!(0, metrics.allocated_connections_closed_by_requestor);

    pool.close(false).await;
}

#[tokio::test]
async fn graceful_close_rejects_new_requests_and_closes_on_release() {
    let pool = mock_pool(pool_config(2));

    let conn = pool.acquire().await.unwrap();
    pool.close(false).await;
    pool.close(false).await; // idempotent

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionPoolClosed));

    // The allocated connection is closed as it comes back.
    pool.release(conn).await;
    let metrics = pool.compute_metrics(false).await;
    assert_eq!(0, metrics.connections_at_end_of_period);
}

#[tokio::test]
async fn forced_close_kills_allocated_connections() {
    let pool = mock_pool(pool_config(2));

    let mut held = pool.acquire().await.unwrap();
    let idle = pool.acquire().await.unwrap();
    pool.release(idle).await;

    pool.close(true).await;

    assert!(held.is_closed());
    let err = held.prepare("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionPoolClosed));
}

#[tokio::test]
async fn close_fails_pending_requests() {
    let config = PoolConfig {
        maximum_connections: 1,
        pending_request_timeout: Duration::from_secs(10),
        metrics_logging_interval: None,
        ..PoolConfig::default()
    };
    let pool = mock_pool(config);

    let held = pool.acquire().await.unwrap();
    let queued = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    sleep(Duration::from_millis(50)).await;

    pool.close(false).await;
    let result = timeout(Duration::from_secs(5), queued).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::ConnectionPoolClosed)));

    pool.release(held).await;
}

#[tokio::test]
async fn discarded_release_still_feeds_the_pending_queue() {
    let config = PoolConfig {
        maximum_connections: 1,
        pending_request_timeout: Duration::from_secs(10),
        metrics_logging_interval: None,
        ..PoolConfig::default()
    };
    let pool = mock_pool(config);

    let mut held = pool.acquire().await.unwrap();
    let queued = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    sleep(Duration::from_millis(50)).await;

    // The released connection is unusable (open transaction), but its slot
    // must still serve the queued request with a fresh connection.
    held.begin_transaction().await.unwrap();
    pool.release(held).await;

    let conn = timeout(Duration::from_secs(5), queued)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    pool.release(conn).await;
    pool.close(false).await;
}

fn run_transaction(conn: &mut Connection) -> BoxFuture<'_, pg_client::Result<u64>> {
    Box::pin(async move {
        conn.begin_transaction().await?;
        let stmt = conn.prepare("SELECT $1").await?;
        let rows = conn.execute(&stmt, &[&42_i64]).await?;
        conn.commit_transaction().await?;
        Ok(rows)
    })
}

fn fail_fast(conn: &mut Connection) -> BoxFuture<'_, pg_client::Result<u64>> {
    Box::pin(async move {
        conn.prepare("SELECT syntax error").await?;
        Ok(0)
    })
}

#[tokio::test]
async fn with_connection_releases_on_success_and_failure() {
    let pool = mock_pool(pool_config(1));

    let rows = pool.with_connection(run_transaction).await.unwrap();
    assert_eq!(1, rows);

    let err = pool.with_connection(fail_fast).await.unwrap_err();
    assert!(matches!(err, Error::Sql(_)));

    // Both runs used (and returned) the single pooled connection.
    let metrics = pool.compute_metrics(false).await;
    assert_eq!(2, metrics.successful_requests);
    assert_eq!(1, metrics.connections_created);
    assert_eq!(1, metrics.connections_at_end_of_period);

    pool.close(false).await;
}

#[tokio::test]
async fn live_connections_never_exceed_the_maximum() {
    let pool = mock_pool(pool_config(2));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        tasks.push(tokio::spawn({
            let pool = pool.clone();
            async move { pool.with_connection(run_transaction).await }
        }));
    }
    for task in tasks {
        timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    let metrics = pool.compute_metrics(false).await;
    assert!(metrics.connections_at_end_of_period <= 2);
    assert_eq!(8, metrics.successful_requests);

    pool.close(false).await;
}

#[tokio::test]
async fn metrics_reset_starts_a_new_period() {
    let pool = mock_pool(pool_config(2));

    let conn = pool.acquire().await.unwrap();
    pool.release(conn).await;

    let metrics = pool.compute_metrics(true).await;
    assert_eq!(1, metrics.successful_requests);
    assert_eq!(1, metrics.connections_at_end_of_period);

    let metrics = pool.compute_metrics(false).await;
    assert_eq!(0, metrics.successful_requests);
    assert_eq!(0, metrics.connections_created);
    // The new period starts where the previous one ended.
    assert_eq!(1, metrics.connections_at_start_of_period);
    assert_eq!(1, metrics.connections_at_end_of_period);

    pool.close(false).await;
}
