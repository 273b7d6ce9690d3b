//! End-to-end pool behavior against a scratch LMDB environment and a
//! recording mock charger.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use heed::{Env, EnvOpenOptions};
use keypool::{BoxError, Charger, Pool, PoolConfig, PoolError};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Mock charger
// ---------------------------------------------------------------------------

/// Records every charge batch and drain probe; drain verdicts and
/// charge failures are programmable.
#[derive(Default)]
struct MockCharger {
    charges: Mutex<Vec<Vec<u64>>>,
    drained: Mutex<HashMap<u64, bool>>,
    drain_queries: Mutex<Vec<u64>>,
    fail_next_charge: Mutex<bool>,
}

impl MockCharger {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set_drained(&self, key: u64, drained: bool) {
        self.drained.lock().unwrap().insert(key, drained);
    }

    fn fail_next_charge(&self) {
        *self.fail_next_charge.lock().unwrap() = true;
    }

    fn charges(&self) -> Vec<Vec<u64>> {
        self.charges.lock().unwrap().clone()
    }

    fn drain_queries(&self) -> Vec<u64> {
        self.drain_queries.lock().unwrap().clone()
    }
}

impl Charger for MockCharger {
    fn charge_keys(&self, keys: &[u64]) -> impl Future<Output = Result<(), BoxError>> + Send {
        let res = {
            let mut fail = self.fail_next_charge.lock().unwrap();
            if *fail {
                *fail = false;
                Err(BoxError::from("injected charge failure"))
            } else {
                self.charges.lock().unwrap().push(keys.to_vec());
                Ok(())
            }
        };
        async move { res }
    }

    fn is_drained(&self, key: u64) -> impl Future<Output = Result<bool, BoxError>> + Send {
        self.drain_queries.lock().unwrap().push(key);
        let drained = self.drained.lock().unwrap().get(&key).copied().unwrap_or(false);
        async move { Ok(drained) }
    }

    fn hash(&self, key: u64) -> String {
        format!("acct1mock{key}")
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_env() -> (tempfile::TempDir, Env) {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(32 * 1024 * 1024)
            .max_dbs(12)
            .open(dir.path())
            .expect("open env")
    };
    (dir, env)
}

fn config(bucket: &str) -> PoolConfig {
    PoolConfig {
        bucket: bucket.to_owned(),
        buffer_length: 10,
        buffer_threshold: 0,
        timeout: None,
    }
}

async fn get(pool: &Pool) -> u64 {
    pool.get(&CancellationToken::new()).await.expect("get")
}

async fn lease_for(pool: &Pool, dur: Duration) -> u64 {
    pool.lease(&CancellationToken::new(), SystemTime::now() + dur)
        .await
        .expect("lease")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gets_refill_in_batches_and_recycled_lease_comes_last() {
    let (_dir, env) = open_env();
    let charger = MockCharger::new();
    let pool = Pool::new(&env, config("test"), Arc::clone(&charger)).expect("pool");

    // First fill mints 1..10, second 11..20; handout is FIFO.
    for expected in 1..=20u64 {
        assert_eq!(get(&pool).await, expected);
    }
    assert_eq!(
        charger.charges(),
        vec![(1..=10).collect::<Vec<u64>>(), (11..=20).collect::<Vec<u64>>()]
    );

    // Leasing triggers the third fill and reserves index 21.
    let id = lease_for(&pool, Duration::from_millis(500)).await;
    assert_eq!(id, 21);
    assert_eq!(charger.charges().len(), 3);
    assert_eq!(charger.charges()[2], (21..=30).collect::<Vec<u64>>());

    // Past the deadline the worker polls the account once and, finding
    // it still funded, recycles it to the back of the queue.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(charger.drain_queries(), vec![21]);

    let mut handed = Vec::new();
    for _ in 0..10 {
        handed.push(get(&pool).await);
    }
    let mut expected: Vec<u64> = (22..=30).collect();
    expected.push(21);
    assert_eq!(handed, expected);

    pool.stop().await;
}

#[tokio::test]
async fn drained_leases_are_retired() {
    let (_dir, env) = open_env();
    let charger = MockCharger::new();
    let pool = Pool::new(&env, config("test"), Arc::clone(&charger)).expect("pool");

    for expected in 1..=20u64 {
        assert_eq!(get(&pool).await, expected);
    }

    let id = lease_for(&pool, Duration::from_millis(500)).await;
    assert_eq!(id, 21);
    charger.set_drained(21, true);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(charger.drain_queries(), vec![21]);

    // 21 never reappears; draining the queue forces a fourth fill.
    let mut handed = Vec::new();
    for _ in 0..10 {
        handed.push(get(&pool).await);
    }
    let mut expected: Vec<u64> = (22..=30).collect();
    expected.push(31);
    assert_eq!(handed, expected);
    assert_eq!(charger.charges()[3], (31..=40).collect::<Vec<u64>>());

    pool.stop().await;
}

#[tokio::test]
async fn cancelled_token_aborts_before_any_refill() {
    let (_dir, env) = open_env();
    let charger = MockCharger::new();
    let pool = Pool::new(&env, config("test"), Arc::clone(&charger)).expect("pool");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = pool.get(&cancel).await.expect_err("cancelled");
    assert!(matches!(err, PoolError::Cancelled), "{err}");
    assert!(charger.charges().is_empty());

    pool.stop().await;
}

#[tokio::test]
async fn pools_share_an_env_without_sharing_indices() {
    let (_dir, env) = open_env();
    let charger_a = MockCharger::new();
    let charger_b = MockCharger::new();
    let pool_a = Pool::new(&env, config("alpha"), Arc::clone(&charger_a)).expect("pool");
    let pool_b = Pool::new(&env, config("beta"), Arc::clone(&charger_b)).expect("pool");

    // Interleaved gets: both sequences start at 1 and never cross.
    assert_eq!(get(&pool_a).await, 1);
    assert_eq!(get(&pool_b).await, 1);
    assert_eq!(get(&pool_a).await, 2);
    assert_eq!(get(&pool_b).await, 2);

    assert_eq!(pool_a.count().expect("count"), 8);
    assert_eq!(pool_b.count().expect("count"), 8);

    pool_a.stop().await;
    pool_b.stop().await;
}

#[tokio::test]
async fn leases_survive_restart_and_rearm_the_timer() {
    let (_dir, env) = open_env();

    let charger = MockCharger::new();
    let pool = Pool::new(&env, config("test"), Arc::clone(&charger)).expect("pool");
    let id = lease_for(&pool, Duration::from_millis(600)).await;
    assert_eq!(id, 1);
    pool.stop().await;
    drop(pool);

    // Reopen: the surviving lease must re-arm the timer, and the drain
    // poll must happen exactly once.
    let charger = MockCharger::new();
    let pool = Pool::new(&env, config("test"), Arc::clone(&charger)).expect("pool");
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(charger.drain_queries(), vec![1]);

    // Index 1 was recycled to the back of the queue.
    assert_eq!(pool.count().expect("count"), 10);

    pool.stop().await;
}

#[tokio::test]
async fn charge_failure_fails_the_request_but_not_the_pool() {
    let (_dir, env) = open_env();
    let charger = MockCharger::new();
    let pool = Pool::new(&env, config("test"), Arc::clone(&charger)).expect("pool");

    charger.fail_next_charge();
    let err = get_err(&pool).await;
    assert!(matches!(err, PoolError::Charger(_)), "{err}");

    // The failed fill burned sequence numbers 1..10 but nothing was
    // enqueued or funded; the next request fills and serves normally.
    assert_eq!(get(&pool).await, 11);
    assert_eq!(charger.charges(), vec![(11..=20).collect::<Vec<u64>>()]);

    pool.stop().await;
}

#[tokio::test]
async fn stopped_pool_rejects_requests() {
    let (_dir, env) = open_env();
    let charger = MockCharger::new();
    let pool = Pool::new(&env, config("test"), Arc::clone(&charger)).expect("pool");

    pool.stop().await;
    let err = get_err(&pool).await;
    assert!(matches!(err, PoolError::Stopped), "{err}");
}

async fn get_err(pool: &Pool) -> PoolError {
    pool.get(&CancellationToken::new())
        .await
        .expect_err("expected failure")
}
