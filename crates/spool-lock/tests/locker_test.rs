//! Locker behavior under contention and session failures.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use spool_lock::{
    CoordinatedLocker, CoordinationClient, GlobalLocker, LocalLocker, LockError,
    MemoryCoordinator, MemorySession,
};

const LONG: Duration = Duration::from_secs(5);

/// Runs `tasks` contenders that each hold the lock briefly and records the
/// highest number of simultaneous holders.
async fn max_concurrent_holders<L>(lockers: Vec<L>) -> Result<usize>
where
    L: GlobalLocker + 'static,
{
    let holders = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks = lockers.into_iter().map(|locker| {
        let holders = holders.clone();
        let peak = peak.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                let lock = locker.lock("orders", "cust-1", LONG).await?.context("lock timed out")?;
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
                lock.release().await?;
            }
            anyhow::Ok(())
        })
    });

    for result in futures::future::join_all(tasks).await {
        result??;
    }
    Ok(peak.load(Ordering::SeqCst))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_locker_excludes_concurrent_holders() -> Result<()> {
    let locker = LocalLocker::new();
    let peak = max_concurrent_holders(vec![locker.clone(); 8]).await?;

    assert_eq!(peak, 1);
    assert!(locker.is_free("orders", "cust-1").await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn coordinated_locker_excludes_across_sessions() -> Result<()> {
    let service = MemoryCoordinator::new();
    let lockers: Vec<_> = (0..6).map(|_| CoordinatedLocker::new(service.session())).collect();

    let peak = max_concurrent_holders(lockers).await?;

    assert_eq!(peak, 1);
    assert_eq!(service.node_count(), 0);
    Ok(())
}

#[tokio::test]
async fn waiters_acquire_in_arrival_order() -> Result<()> {
    let service = MemoryCoordinator::new();
    let holder = CoordinatedLocker::new(service.session());
    let first = holder.lock("svc", "k", LONG).await?.context("first lock")?;

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for i in 0..3 {
        let locker = CoordinatedLocker::new(service.session());
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            let lock = locker.lock("svc", "k", LONG).await?.context("waiter timed out")?;
            order.lock().unwrap().push(i);
            lock.release().await?;
            anyhow::Ok(())
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    first.release().await?;
    for waiter in waiters {
        waiter.await??;
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn timed_out_waiter_removes_its_node() -> Result<()> {
    let service = MemoryCoordinator::new();
    let holder = CoordinatedLocker::new(service.session());
    let waiter = CoordinatedLocker::new(service.session());

    let lock = holder.lock("svc", "k", LONG).await?.context("holder lock")?;
    assert!(waiter.lock("svc", "k", Duration::from_millis(30)).await?.is_none());

    assert_eq!(service.node_count(), 1);
    lock.release().await?;
    assert!(waiter.is_free("svc", "k").await?);
    Ok(())
}

#[tokio::test]
async fn disconnected_waiter_keeps_its_place() -> Result<()> {
    let service = MemoryCoordinator::new();
    let holder = CoordinatedLocker::new(service.session());
    let session = service.session();
    let waiter = CoordinatedLocker::new(session.clone());

    let lock = holder.lock("svc", "k", LONG).await?.context("holder lock")?;
    let pending = tokio::spawn(async move { waiter.lock("svc", "k", LONG).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    session.disconnect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(service.node_count(), 2);
    session.reconnect();
    lock.release().await?;

    let acquired = pending.await??.context("waiter should acquire after reconnect")?;
    acquired.release().await?;
    assert_eq!(service.node_count(), 0);
    Ok(())
}

#[tokio::test]
async fn expired_waiter_recreates_its_node() -> Result<()> {
    let service = MemoryCoordinator::new();
    let holder = CoordinatedLocker::new(service.session());
    let session = service.session();
    let waiter = CoordinatedLocker::new(session.clone());

    let lock = holder.lock("svc", "k", LONG).await?.context("holder lock")?;
    let pending = tokio::spawn(async move { waiter.lock("svc", "k", LONG).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    session.expire();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let children = session.children("/svc/k").await?;
    assert_eq!(children.len(), 2, "waiter should rejoin the queue: {children:?}");

    lock.release().await?;
    let acquired = pending.await??.context("waiter should acquire after expiry")?;
    acquired.release().await?;
    Ok(())
}

#[tokio::test]
async fn expiry_while_holding_surfaces_on_release() -> Result<()> {
    let service = MemoryCoordinator::new();
    let session = service.session();
    let locker = CoordinatedLocker::new(session.clone());

    let lock = locker.lock("svc", "k", LONG).await?.context("lock")?;
    session.expire();

    let err = lock.release().await.unwrap_err();
    assert!(matches!(err, LockError::SessionExpired { .. }));
    Ok(())
}

#[tokio::test]
async fn invalid_paths_are_rejected() {
    let locker: CoordinatedLocker<MemorySession> =
        CoordinatedLocker::new(MemoryCoordinator::new().session());

    let err = locker.lock("svc", "a/b", LONG).await.unwrap_err();
    assert!(matches!(err, LockError::InvalidPath(_)));
}
