//! TransferExecutor
//!
//! Wraps the movers with a connection lifetime policy: a backend
//! connection is kept for `connection_uptime` seconds after its last use
//! and reused by the following transfers to the same endpoint. Transfers
//! to one endpoint are serialized on that endpoint's handle; different
//! endpoints proceed in parallel. A failed transfer closes its connection
//! and is retried on the configured backup targets.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::ConnectionParams;
use crate::error::{MoveError, Result};
use crate::logging::{debug, log_with_tag};
use crate::movers::{Connection, MoverRegistry};
use crate::uri::Destination;

const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// One pooled backend connection
struct ConnectionHandle {
    connection: Option<Box<dyn Connection>>,
    opened_at: Instant,
    last_used: Instant,
    uptime: Duration,
}

impl ConnectionHandle {
    fn empty() -> Self {
        let now = Instant::now();
        ConnectionHandle {
            connection: None,
            opened_at: now,
            last_used: now,
            uptime: Duration::ZERO,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_used) >= self.uptime
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

type Pool = Mutex<HashMap<String, Arc<Mutex<ConnectionHandle>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct TransferExecutor {
    registry: MoverRegistry,
    pool: Arc<Pool>,
    opened: AtomicUsize,
    tag: String,
    stop: Arc<AtomicBool>,
    reaper: Option<JoinHandle<()>>,
}

impl TransferExecutor {
    pub fn new(registry: MoverRegistry, tag: &str) -> Self {
        let pool: Arc<Pool> = Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let reaper_pool = pool.clone();
        let reaper_stop = stop.clone();
        let reaper = thread::Builder::new()
            .name(format!("{}:reaper", tag))
            .spawn(move || {
                while !reaper_stop.load(Ordering::SeqCst) {
                    thread::sleep(REAP_INTERVAL);
                    reap(&reaper_pool, Instant::now());
                }
            })
            .ok();

        TransferExecutor {
            registry,
            pool,
            opened: AtomicUsize::new(0),
            tag: tag.to_string(),
            stop,
            reaper,
        }
    }

    /// Number of backend connections opened so far
    pub fn connections_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of endpoints holding an open connection
    pub fn open_connections(&self) -> usize {
        let pool = lock(&self.pool);
        pool.values()
            .filter(|handle| match handle.try_lock() {
                Ok(h) => h.connection.is_some(),
                Err(_) => true,
            })
            .count()
    }

    /// Uploads `source` to `dest`, falling back to the backup targets
    pub fn transfer(&self, source: &Path, dest: &Destination, params: &ConnectionParams) -> Result<()> {
        let first = match self.transfer_once(source, dest, params) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if let MoveError::UnsupportedScheme(_) = first {
            return Err(first);
        }

        let _ = log_with_tag(&format!("{}", first), Some(&self.tag));
        let mut last = first;
        for backup in &params.backup_targets {
            let alternate = dest.with_host(backup);
            let _ = log_with_tag(
                &format!("Trying backup target {}", alternate.clean()),
                Some(&self.tag),
            );
            match self.transfer_once(source, &alternate, params) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let _ = log_with_tag(&format!("{}", e), Some(&self.tag));
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// The pooled handle of `endpoint`, created on first use.
    /// `reap` leaves it in the pool while the returned clone lives.
    fn claim(&self, endpoint: String) -> Arc<Mutex<ConnectionHandle>> {
        let mut pool = lock(&self.pool);
        pool.entry(endpoint)
            .or_insert_with(|| Arc::new(Mutex::new(ConnectionHandle::empty())))
            .clone()
    }

    fn transfer_once(&self, source: &Path, dest: &Destination, params: &ConnectionParams) -> Result<()> {
        let mover = self.registry.get(&dest.scheme)?;
        let handle = self.claim(dest.endpoint());

        // Holding the handle serializes transfers to this endpoint
        let mut handle = lock(&handle);
        let now = Instant::now();
        if handle.connection.is_some() && handle.expired(now) {
            handle.close();
        }
        if let Some(connection) = handle.connection.as_mut() {
            if !connection.is_alive() {
                debug(&format!("Stale connection to {}", dest.clean()), Some(&self.tag));
                handle.close();
            }
        }
        if handle.connection.is_none() {
            let connection = mover.open(dest, params)?;
            self.opened.fetch_add(1, Ordering::SeqCst);
            handle.connection = Some(connection);
            handle.opened_at = now;
        }
        handle.uptime = params.uptime();

        let result = match handle.connection.as_mut() {
            Some(connection) => connection.put(source, dest),
            None => Err(MoveError::transfer(dest.clean(), "no connection")),
        };
        match result {
            Ok(()) => {
                handle.last_used = Instant::now();
                debug(
                    &format!(
                        "Sent {} to {} (connection open for {:?})",
                        source.display(),
                        dest.clean(),
                        handle.opened_at.elapsed()
                    ),
                    Some(&self.tag),
                );
                if handle.uptime.is_zero() {
                    handle.close();
                }
                Ok(())
            }
            Err(e) => {
                handle.close();
                Err(e)
            }
        }
    }

    /// Closes every pooled connection
    pub fn close_all(&self) {
        let handles: Vec<_> = lock(&self.pool).drain().map(|(_, h)| h).collect();
        for handle in handles {
            lock(&handle).close();
        }
    }
}

/// Closes the connections idle past their uptime
fn reap(pool: &Pool, now: Instant) {
    let mut pool = lock(pool);
    pool.retain(|_, handle| {
        // claimed by a transfer that has not locked it yet
        if Arc::strong_count(handle) > 1 {
            return true;
        }
        match handle.try_lock() {
            Ok(mut h) => {
                if h.connection.is_some() && h.expired(now) {
                    h.close();
                }
                h.connection.is_some()
            }
            // in use by a transfer
            Err(_) => true,
        }
    });
}

impl Drop for TransferExecutor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.join();
        }
        self.close_all();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::movers::Mover;
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    /// Mover that records what it was asked to do
    #[derive(Default)]
    pub(crate) struct CountingMover {
        pub opened: AtomicUsize,
        pub closed: Arc<AtomicUsize>,
        pub puts: Arc<Mutex<Vec<String>>>,
        pub failing_hosts: Vec<String>,
        pub fail_puts: Arc<AtomicBool>,
    }

    struct CountingConnection {
        closed: Arc<AtomicUsize>,
        puts: Arc<Mutex<Vec<String>>>,
        fail_puts: Arc<AtomicBool>,
    }

    impl Connection for CountingConnection {
        fn put(&mut self, _source: &Path, dest: &Destination) -> Result<()> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(MoveError::transfer(dest.clean(), "refused"));
            }
            self.puts.lock().unwrap().push(dest.clean());
            Ok(())
        }

        fn is_alive(&mut self) -> bool {
            true
        }

        fn close(self: Box<Self>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Mover for CountingMover {
        fn open(&self, dest: &Destination, _params: &ConnectionParams) -> Result<Box<dyn Connection>> {
            if self.failing_hosts.contains(&dest.host) {
                return Err(MoveError::transfer(dest.clean(), "connection refused"));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingConnection {
                closed: self.closed.clone(),
                puts: self.puts.clone(),
                fail_puts: self.fail_puts.clone(),
            }))
        }
    }

    fn executor_with(mover: Arc<CountingMover>) -> TransferExecutor {
        let mut registry = MoverRegistry::empty();
        registry.register("fake", mover);
        TransferExecutor::new(registry, "test")
    }

    fn params(uptime: f64) -> ConnectionParams {
        ConnectionParams {
            connection_uptime: uptime,
            ..Default::default()
        }
    }

    #[test]
    fn test_connection_reused_within_uptime() {
        let mover = Arc::new(CountingMover::default());
        let executor = executor_with(mover.clone());
        let dir = tempdir().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, b"x").unwrap();

        let dest = Destination::parse("fake://host/data/a.txt").unwrap();
        executor.transfer(&source, &dest, &params(30.0)).unwrap();
        executor
            .transfer(&source, &dest.with_path("/data/b.txt"), &params(30.0))
            .unwrap();

        assert_eq!(executor.connections_opened(), 1);
        assert_eq!(mover.opened.load(Ordering::SeqCst), 1);
        assert_eq!(mover.puts.lock().unwrap().len(), 2);
        assert_eq!(executor.open_connections(), 1);
    }

    #[test]
    fn test_new_connection_after_uptime() {
        let mover = Arc::new(CountingMover::default());
        let executor = executor_with(mover.clone());
        let dir = tempdir().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, b"x").unwrap();
        let dest = Destination::parse("fake://host/data/a.txt").unwrap();

        executor.transfer(&source, &dest, &params(0.05)).unwrap();
        thread::sleep(Duration::from_millis(100));
        executor.transfer(&source, &dest, &params(0.05)).unwrap();

        assert_eq!(executor.connections_opened(), 2);
        assert!(mover.closed.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_reaper_closes_idle_connections() {
        let mover = Arc::new(CountingMover::default());
        let executor = executor_with(mover.clone());
        let dir = tempdir().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, b"x").unwrap();
        let dest = Destination::parse("fake://host/a.txt").unwrap();

        executor.transfer(&source, &dest, &params(0.01)).unwrap();
        reap(&executor.pool, Instant::now() + Duration::from_secs(1));
        assert_eq!(executor.open_connections(), 0);
        assert_eq!(mover.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reap_keeps_claimed_handles() {
        let executor = executor_with(Arc::new(CountingMover::default()));
        let endpoint = Destination::parse("fake://host/a.txt").unwrap().endpoint();
        let later = Instant::now() + Duration::from_secs(1);

        // claimed but not locked yet: an evicted handle would let a second
        // connection to the same endpoint open next to it
        let claimed = executor.claim(endpoint.clone());
        reap(&executor.pool, later);
        assert!(lock(&executor.pool).contains_key(&endpoint));
        assert!(Arc::ptr_eq(&claimed, &executor.claim(endpoint.clone())));

        drop(claimed);
        reap(&executor.pool, later);
        assert!(lock(&executor.pool).is_empty());
    }

    #[test]
    fn test_failed_put_closes_connection() {
        let mover = Arc::new(CountingMover::default());
        let executor = executor_with(mover.clone());
        let dir = tempdir().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, b"x").unwrap();
        let dest = Destination::parse("fake://host/a.txt").unwrap();

        mover.fail_puts.store(true, Ordering::SeqCst);
        let err = executor.transfer(&source, &dest, &params(30.0)).unwrap_err();
        assert!(matches!(err, MoveError::TransferFailure { .. }));
        assert_eq!(mover.closed.load(Ordering::SeqCst), 1);

        mover.fail_puts.store(false, Ordering::SeqCst);
        executor.transfer(&source, &dest, &params(30.0)).unwrap();
        assert_eq!(executor.connections_opened(), 2);
    }

    #[test]
    fn test_backup_target_used_when_primary_fails() {
        let mover = Arc::new(CountingMover {
            failing_hosts: vec!["primary".into()],
            ..Default::default()
        });
        let executor = executor_with(mover.clone());
        let dir = tempdir().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, b"x").unwrap();
        let dest = Destination::parse("fake://primary/data/a.txt").unwrap();

        let mut p = params(30.0);
        p.backup_targets = vec!["backup1".into()];
        executor.transfer(&source, &dest, &p).unwrap();
        assert_eq!(
            mover.puts.lock().unwrap().as_slice(),
            ["fake://backup1/data/a.txt".to_string()]
        );

        p.backup_targets.clear();
        assert!(executor.transfer(&source, &dest, &p).is_err());
    }

    #[test]
    fn test_unsupported_scheme() {
        let executor = TransferExecutor::new(MoverRegistry::empty(), "test");
        let dest = Destination::parse("s3://bucket/key").unwrap();
        let err = executor
            .transfer(Path::new("/nonexistent"), &dest, &ConnectionParams::default())
            .unwrap_err();
        assert!(matches!(err, MoveError::UnsupportedScheme(_)));
    }
}
