//! Pool state machine: worker loop, refill, leases, expiry.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use heed::{Env, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::db::{Bucket, Buckets, StoreError};

/// Boxed error used at the charger seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Delay before retrying an expiry sweep that failed on a chain error.
const SWEEP_RETRY_DELAY: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Charger trait
// ---------------------------------------------------------------------------

/// On-chain funding operations the pool depends on.
///
/// Implementors speak to the chain; the pool only decides *which*
/// indices to fund or probe and *when*.
pub trait Charger: Send + Sync + 'static {
    /// Funds every index in `keys` from the network's master account.
    /// Returns once the funding operations are injected (not
    /// confirmed). Earlier batches may have been injected even when an
    /// error is returned.
    fn charge_keys(&self, keys: &[u64]) -> impl Future<Output = Result<(), BoxError>> + Send;

    /// Whether the account at `key` has been spent below the
    /// configured minimum balance.
    fn is_drained(&self, key: u64) -> impl Future<Output = Result<bool, BoxError>> + Send;

    /// The account address at `key`, for logging. Returns an empty
    /// string when derivation fails.
    fn hash(&self, key: u64) -> String;
}

impl<T: Charger> Charger for Arc<T> {
    fn charge_keys(&self, keys: &[u64]) -> impl Future<Output = Result<(), BoxError>> + Send {
        (**self).charge_keys(keys)
    }

    fn is_drained(&self, key: u64) -> impl Future<Output = Result<bool, BoxError>> + Send {
        (**self).is_drained(key)
    }

    fn hash(&self, key: u64) -> String {
        (**self).hash(key)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Pool parameters for one network.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Bucket (network) name; prefixes the LMDB database names.
    pub bucket: String,
    /// Free-queue length a refill tops the queue up to.
    pub buffer_length: u64,
    /// Refill triggers when the free queue is at or below this length.
    pub buffer_threshold: u64,
    /// Per-call timeout around charger operations; `None` disables it.
    pub timeout: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned by pool operations.
#[derive(Debug)]
pub enum PoolError {
    /// The pool has been stopped; the request was not serviced.
    Stopped,
    /// The caller's cancellation token fired before a reply arrived.
    Cancelled,
    /// The key-value store failed; the transaction was rolled back.
    Store(StoreError),
    /// The charger failed; no indices were enqueued or handed out.
    Charger(BoxError),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "pool is stopped"),
            Self::Cancelled => write!(f, "request cancelled"),
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Charger(e) => write!(f, "charger error: {e}"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<StoreError> for PoolError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Lease record
// ---------------------------------------------------------------------------

const LEASE_RECORD_VERSION: u8 = 1;

/// Persisted lease: which index is reserved and until when.
///
/// Deadlines are wall-clock unix milliseconds so leases survive a
/// process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    version: u8,
    key_index: u64,
    deadline_unix_ms: u64,
}

impl LeaseRecord {
    fn deadline(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.deadline_unix_ms)
    }
}

fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

struct GetRequest {
    reply: oneshot::Sender<Result<u64, PoolError>>,
}

struct LeaseRequest {
    deadline: SystemTime,
    reply: oneshot::Sender<Result<u64, PoolError>>,
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Handle to one network's key pool.
///
/// Cheap to share behind an `Arc`; all mutating work happens on the
/// worker task spawned by [`Pool::new`].
pub struct Pool {
    env: Env,
    keys: Bucket,
    get_tx: mpsc::Sender<GetRequest>,
    lease_tx: mpsc::Sender<LeaseRequest>,
    stop: CancellationToken,
    done: CancellationToken,
}

impl Pool {
    /// Opens (or creates) the network's buckets, restores the expiry
    /// timer from any surviving leases, and spawns the worker task.
    ///
    /// Must be called from within a tokio runtime. Refill is lazy: no
    /// index is minted or funded until the first `get`/`lease`.
    pub fn new<C: Charger>(env: &Env, config: PoolConfig, charger: C) -> Result<Self, PoolError> {
        let mut wtxn = env.write_txn().map_err(StoreError::from)?;
        let buckets = Buckets::open(env, &mut wtxn, &config.bucket)?;
        let next_deadline = earliest_deadline(&buckets, &wtxn)?;
        wtxn.commit().map_err(StoreError::from)?;

        let (get_tx, get_rx) = mpsc::channel(1);
        let (lease_tx, lease_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let done = CancellationToken::new();

        let worker = Worker {
            env: env.clone(),
            buckets,
            config,
            charger,
            get_rx,
            lease_rx,
            stop: stop.clone(),
            done: done.clone(),
            next_deadline,
        };
        tokio::spawn(worker.run());

        Ok(Self {
            env: env.clone(),
            keys: buckets.keys,
            get_tx,
            lease_tx,
            stop,
            done,
        })
    }

    /// Takes the next free index out of the pool for good. The index is
    /// funded and no longer tracked; the caller owns it.
    ///
    /// `cancel` aborts waiting for the worker; side effects that
    /// already happened on the worker are kept.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<u64, PoolError> {
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        let (reply, rx) = oneshot::channel();
        tokio::select! {
            res = self.get_tx.send(GetRequest { reply }) => {
                res.map_err(|_| PoolError::Stopped)?;
            }
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
        }
        tokio::select! {
            res = rx => res.unwrap_or(Err(PoolError::Stopped)),
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
        }
    }

    /// Reserves the next free index until `deadline`. After the
    /// deadline the worker polls the account and either recycles the
    /// index into the free queue (still funded) or retires it
    /// (drained).
    pub async fn lease(
        &self,
        cancel: &CancellationToken,
        deadline: SystemTime,
    ) -> Result<u64, PoolError> {
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        let (reply, rx) = oneshot::channel();
        tokio::select! {
            res = self.lease_tx.send(LeaseRequest { deadline, reply }) => {
                res.map_err(|_| PoolError::Stopped)?;
            }
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
        }
        tokio::select! {
            res = rx => res.unwrap_or(Err(PoolError::Stopped)),
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
        }
    }

    /// Current free-queue length. Read-only; does not go through the
    /// worker.
    pub fn count(&self) -> Result<u64, PoolError> {
        let rtxn = self.env.read_txn().map_err(StoreError::from)?;
        Ok(self.keys.len(&rtxn)?)
    }

    /// Graceful shutdown: the worker finishes its in-flight event,
    /// fails all queued requests with [`PoolError::Stopped`] and exits.
    pub async fn stop(&self) {
        self.stop.cancel();
        self.done.cancelled().await;
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker<C> {
    env: Env,
    buckets: Buckets,
    config: PoolConfig,
    charger: C,
    get_rx: mpsc::Receiver<GetRequest>,
    lease_rx: mpsc::Receiver<LeaseRequest>,
    stop: CancellationToken,
    done: CancellationToken,
    next_deadline: Option<SystemTime>,
}

impl<C: Charger> Worker<C> {
    async fn run(mut self) {
        loop {
            let timer_at = self.next_deadline.map(instant_for);
            tokio::select! {
                biased;
                req = self.get_rx.recv() => match req {
                    Some(req) => {
                        let res = self.handle_get().await;
                        reply(req.reply, res);
                    }
                    None => break,
                },
                req = self.lease_rx.recv() => match req {
                    Some(req) => {
                        let res = self.handle_lease(req.deadline).await;
                        reply(req.reply, res);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(
                    timer_at.unwrap_or_else(|| instant_for(SystemTime::now()))
                ), if timer_at.is_some() => {
                    self.handle_expiry().await;
                }
                _ = self.stop.cancelled() => break,
            }
        }
        self.shutdown();
    }

    /// Fails everything still queued, then signals `done`.
    fn shutdown(&mut self) {
        self.get_rx.close();
        self.lease_rx.close();
        while let Ok(req) = self.get_rx.try_recv() {
            let _ = req.reply.send(Err(PoolError::Stopped));
        }
        while let Ok(req) = self.lease_rx.try_recv() {
            let _ = req.reply.send(Err(PoolError::Stopped));
        }
        self.done.cancel();
    }

    async fn handle_get(&mut self) -> Result<u64, PoolError> {
        let fresh = self.refill_batch().await?;
        let mut wtxn = self.env.write_txn().map_err(StoreError::from)?;
        for &key in &fresh {
            self.buckets.keys.put(&mut wtxn, key, &key)?;
        }
        let index = self.pop_first(&mut wtxn)?;
        wtxn.commit().map_err(StoreError::from)?;
        Ok(index)
    }

    async fn handle_lease(&mut self, deadline: SystemTime) -> Result<u64, PoolError> {
        let fresh = self.refill_batch().await?;
        let mut wtxn = self.env.write_txn().map_err(StoreError::from)?;
        for &key in &fresh {
            self.buckets.keys.put(&mut wtxn, key, &key)?;
        }
        let index = self.pop_first(&mut wtxn)?;
        let seq = self.buckets.lease.next_sequence(&mut wtxn)?;
        let record = LeaseRecord {
            version: LEASE_RECORD_VERSION,
            key_index: index,
            deadline_unix_ms: unix_ms(deadline),
        };
        self.buckets.lease.put(&mut wtxn, seq, &record)?;
        let next = earliest_deadline(&self.buckets, &wtxn)?;
        wtxn.commit().map_err(StoreError::from)?;
        self.next_deadline = next;
        Ok(index)
    }

    /// Tops the free queue up to `buffer_length` when it is at or below
    /// `buffer_threshold`, returning the freshly funded indices for the
    /// caller to enqueue.
    ///
    /// The sequence bump commits before the charge call so a crash can
    /// never reassign an index that may already hold funds; the charge
    /// itself runs with no transaction held. A charge failure therefore
    /// only skips sequence numbers. The converse failure (funds
    /// injected, enqueue commit lost) orphans coins on chain but never
    /// misleads a caller.
    async fn refill_batch(&self) -> Result<Vec<u64>, PoolError> {
        let n = {
            let rtxn = self.env.read_txn().map_err(StoreError::from)?;
            self.buckets.keys.len(&rtxn)?
        };
        if n > self.config.buffer_threshold {
            return Ok(Vec::new());
        }
        let want = self.config.buffer_length.saturating_sub(n);
        if want == 0 {
            return Ok(Vec::new());
        }

        let mut fresh = Vec::with_capacity(want as usize);
        let mut wtxn = self.env.write_txn().map_err(StoreError::from)?;
        for _ in 0..want {
            fresh.push(self.buckets.keys.next_sequence(&mut wtxn)?);
        }
        wtxn.commit().map_err(StoreError::from)?;

        self.charge(&fresh).await?;
        Ok(fresh)
    }

    /// Removes and returns the head of the free queue.
    ///
    /// An empty queue here means refill just succeeded without leaving
    /// anything to hand out, which is an unrecoverable bug.
    fn pop_first(&self, wtxn: &mut RwTxn<'_>) -> Result<u64, PoolError> {
        let (key, index) = self
            .buckets
            .keys
            .first::<u64>(wtxn)?
            .expect("free queue empty immediately after refill");
        self.buckets.keys.delete(wtxn, key)?;
        Ok(index)
    }

    async fn handle_expiry(&mut self) {
        let now = SystemTime::now();
        if let Err(err) = self.sweep(now).await {
            error!(error = %err, "lease expiry sweep failed");
            self.next_deadline = Some(now + SWEEP_RETRY_DELAY);
        }
    }

    /// Processes every lease whose deadline has passed: still-funded
    /// indices go back into the free queue under a fresh sequence
    /// number, drained ones are retired, and the lease entry is removed
    /// either way.
    async fn sweep(&mut self, now: SystemTime) -> Result<(), PoolError> {
        let expired: Vec<(u64, LeaseRecord)> = {
            let rtxn = self.env.read_txn().map_err(StoreError::from)?;
            self.buckets
                .lease
                .entries::<LeaseRecord>(&rtxn)?
                .into_iter()
                .filter(|(_, rec)| rec.deadline() <= now)
                .collect()
        };

        // Poll drain state with no transaction held. Any failure aborts
        // the whole sweep so no lease is removed on partial information;
        // the timer retries after a delay.
        let mut verdicts = Vec::with_capacity(expired.len());
        for (seq, rec) in expired {
            let drained = self.probe_drained(rec.key_index).await?;
            verdicts.push((seq, rec, drained));
        }

        let mut wtxn = self.env.write_txn().map_err(StoreError::from)?;
        for (seq, rec, drained) in verdicts {
            if !drained {
                let key = self.buckets.keys.next_sequence(&mut wtxn)?;
                info!(pkh = %self.charger.hash(rec.key_index), "recycling leased account");
                self.buckets.keys.put(&mut wtxn, key, &rec.key_index)?;
            }
            self.buckets.lease.delete(&mut wtxn, seq)?;
        }
        let next = earliest_deadline(&self.buckets, &wtxn)?;
        wtxn.commit().map_err(StoreError::from)?;
        self.next_deadline = next;
        Ok(())
    }

    async fn charge(&self, keys: &[u64]) -> Result<(), PoolError> {
        if keys.is_empty() {
            return Ok(());
        }
        match self.config.timeout {
            Some(limit) => match timeout(limit, self.charger.charge_keys(keys)).await {
                Ok(res) => res.map_err(PoolError::Charger),
                Err(elapsed) => Err(PoolError::Charger(Box::new(elapsed))),
            },
            None => self
                .charger
                .charge_keys(keys)
                .await
                .map_err(PoolError::Charger),
        }
    }

    async fn probe_drained(&self, key: u64) -> Result<bool, PoolError> {
        match self.config.timeout {
            Some(limit) => match timeout(limit, self.charger.is_drained(key)).await {
                Ok(res) => res.map_err(PoolError::Charger),
                Err(elapsed) => Err(PoolError::Charger(Box::new(elapsed))),
            },
            None => self
                .charger
                .is_drained(key)
                .await
                .map_err(PoolError::Charger),
        }
    }
}

fn reply(tx: oneshot::Sender<Result<u64, PoolError>>, res: Result<u64, PoolError>) {
    if let Err(Ok(index)) = tx.send(res) {
        // Known wart: the caller cancelled between pop and reply; the
        // popped index is gone for good.
        debug!(index, "caller went away after pop; index dropped");
    }
}

fn earliest_deadline(
    buckets: &Buckets,
    rtxn: &RoTxn<'_>,
) -> Result<Option<SystemTime>, StoreError> {
    let mut next: Option<SystemTime> = None;
    for (_, rec) in buckets.lease.entries::<LeaseRecord>(rtxn)? {
        let deadline = rec.deadline();
        if next.map_or(true, |cur| deadline < cur) {
            next = Some(deadline);
        }
    }
    Ok(next)
}

fn instant_for(deadline: SystemTime) -> tokio::time::Instant {
    let remaining = deadline
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO);
    tokio::time::Instant::now() + remaining
}
