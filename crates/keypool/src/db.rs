//! Typed bucket access over the shared LMDB environment.
//!
//! A network owns three named databases: `{net}.keys` (free queue),
//! `{net}.lease` (lease table) and `{net}.meta` (per-bucket sequence
//! counters). Keys are 8-byte big-endian integers so lexicographic
//! order equals numeric order; values are JSON so records can grow
//! fields without a migration.

use std::fmt;

use heed::types::Bytes;
use heed::{Database, Env, RoTxn, RwTxn};
use serde::Serialize;
use serde::de::DeserializeOwned;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from the key-value layer.
#[derive(Debug)]
pub enum StoreError {
    /// The underlying LMDB operation failed.
    Database(heed::Error),
    /// A stored value could not be encoded or decoded.
    Codec(serde_json::Error),
    /// A stored key is not an 8-byte big-endian integer.
    CorruptKey,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database(e) => write!(f, "database error: {e}"),
            Self::Codec(e) => write!(f, "value codec error: {e}"),
            Self::CorruptKey => write!(f, "stored key is not an 8-byte big-endian integer"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<heed::Error> for StoreError {
    fn from(e: heed::Error) -> Self {
        Self::Database(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e)
    }
}

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

/// The persistent state of one network.
#[derive(Clone, Copy)]
pub(crate) struct Buckets {
    /// Free queue of indices awaiting handout.
    pub keys: Bucket,
    /// Active leases keyed by lease sequence number.
    pub lease: Bucket,
}

impl Buckets {
    /// Opens (or creates) the network's databases inside `wtxn`.
    pub fn open(env: &Env, wtxn: &mut RwTxn<'_>, network: &str) -> Result<Self, StoreError> {
        let meta = env.create_database::<Bytes, Bytes>(wtxn, Some(&format!("{network}.meta")))?;
        let keys = env.create_database::<Bytes, Bytes>(wtxn, Some(&format!("{network}.keys")))?;
        let lease = env.create_database::<Bytes, Bytes>(wtxn, Some(&format!("{network}.lease")))?;
        Ok(Self {
            keys: Bucket {
                db: keys,
                meta,
                seq_key: b"keys",
            },
            lease: Bucket {
                db: lease,
                meta,
                seq_key: b"lease",
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

/// One ordered, sequence-bearing table with u64 keys and JSON values.
#[derive(Clone, Copy)]
pub(crate) struct Bucket {
    db: Database<Bytes, Bytes>,
    meta: Database<Bytes, Bytes>,
    seq_key: &'static [u8],
}

impl Bucket {
    /// Reads the value at `key`, if present.
    pub fn get<T: DeserializeOwned>(
        &self,
        rtxn: &RoTxn<'_>,
        key: u64,
    ) -> Result<Option<T>, StoreError> {
        match self.db.get(rtxn, &key.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes `value` at `key`, replacing any previous value.
    pub fn put<T: Serialize>(
        &self,
        wtxn: &mut RwTxn<'_>,
        key: u64,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.db.put(wtxn, &key.to_be_bytes(), &bytes)?;
        Ok(())
    }

    /// Deletes the entry at `key`; returns whether it existed.
    pub fn delete(&self, wtxn: &mut RwTxn<'_>, key: u64) -> Result<bool, StoreError> {
        Ok(self.db.delete(wtxn, &key.to_be_bytes())?)
    }

    /// The entry with the lowest key, or `None` when the bucket is
    /// empty.
    pub fn first<T: DeserializeOwned>(
        &self,
        rtxn: &RoTxn<'_>,
    ) -> Result<Option<(u64, T)>, StoreError> {
        match self.db.first(rtxn)? {
            Some((key, value)) => Ok(Some((decode_key(key)?, serde_json::from_slice(value)?))),
            None => Ok(None),
        }
    }

    /// All entries in ascending key order.
    pub fn entries<T: DeserializeOwned>(
        &self,
        rtxn: &RoTxn<'_>,
    ) -> Result<Vec<(u64, T)>, StoreError> {
        let mut out = Vec::new();
        for item in self.db.iter(rtxn)? {
            let (key, value) = item?;
            out.push((decode_key(key)?, serde_json::from_slice(value)?));
        }
        Ok(out)
    }

    /// Number of entries.
    pub fn len(&self, rtxn: &RoTxn<'_>) -> Result<u64, StoreError> {
        Ok(self.db.len(rtxn)?)
    }

    /// Returns the next value of this bucket's monotonic sequence and
    /// persists the advance in `wtxn`. The first value is 1; values are
    /// never reused, including across restarts, as long as the
    /// consuming transaction commits.
    pub fn next_sequence(&self, wtxn: &mut RwTxn<'_>) -> Result<u64, StoreError> {
        let last = match self.meta.get(wtxn, self.seq_key)? {
            Some(bytes) => decode_key(bytes)?,
            None => 0,
        };
        let next = last + 1;
        self.meta.put(wtxn, self.seq_key, &next.to_be_bytes())?;
        Ok(next)
    }
}

fn decode_key(bytes: &[u8]) -> Result<u64, StoreError> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| StoreError::CorruptKey)?;
    Ok(u64::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use heed::EnvOpenOptions;

    use super::*;

    fn open_env() -> (tempfile::TempDir, Env) {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(16 * 1024 * 1024)
                .max_dbs(6)
                .open(dir.path())
                .expect("open env")
        };
        (dir, env)
    }

    #[test]
    fn sequences_are_monotonic_and_per_bucket() {
        let (_dir, env) = open_env();
        let mut wtxn = env.write_txn().expect("txn");
        let buckets = Buckets::open(&env, &mut wtxn, "test").expect("open");

        assert_eq!(buckets.keys.next_sequence(&mut wtxn).expect("seq"), 1);
        assert_eq!(buckets.keys.next_sequence(&mut wtxn).expect("seq"), 2);
        // The lease bucket has its own counter.
        assert_eq!(buckets.lease.next_sequence(&mut wtxn).expect("seq"), 1);
        wtxn.commit().expect("commit");

        // Survives the transaction boundary.
        let mut wtxn = env.write_txn().expect("txn");
        assert_eq!(buckets.keys.next_sequence(&mut wtxn).expect("seq"), 3);
        wtxn.commit().expect("commit");
    }

    #[test]
    fn first_follows_numeric_key_order() {
        let (_dir, env) = open_env();
        let mut wtxn = env.write_txn().expect("txn");
        let buckets = Buckets::open(&env, &mut wtxn, "test").expect("open");

        // 256 encodes with a non-zero second byte; numeric order must
        // still win because keys are big-endian.
        buckets.keys.put(&mut wtxn, 256, &256u64).expect("put");
        buckets.keys.put(&mut wtxn, 9, &9u64).expect("put");
        buckets.keys.put(&mut wtxn, 40, &40u64).expect("put");

        let (key, value): (u64, u64) = buckets.keys.first(&wtxn).expect("first").expect("entry");
        assert_eq!((key, value), (9, 9));

        let entries: Vec<(u64, u64)> = buckets.keys.entries(&wtxn).expect("entries");
        assert_eq!(entries, vec![(9, 9), (40, 40), (256, 256)]);
        wtxn.commit().expect("commit");
    }

    #[test]
    fn delete_and_len() {
        let (_dir, env) = open_env();
        let mut wtxn = env.write_txn().expect("txn");
        let buckets = Buckets::open(&env, &mut wtxn, "test").expect("open");

        buckets.keys.put(&mut wtxn, 1, &1u64).expect("put");
        buckets.keys.put(&mut wtxn, 2, &2u64).expect("put");
        assert_eq!(buckets.keys.len(&wtxn).expect("len"), 2);

        assert!(buckets.keys.delete(&mut wtxn, 1).expect("delete"));
        assert!(!buckets.keys.delete(&mut wtxn, 1).expect("delete"));
        assert_eq!(buckets.keys.len(&wtxn).expect("len"), 1);

        let gone: Option<u64> = buckets.keys.get(&wtxn, 1).expect("get");
        assert_eq!(gone, None);
        wtxn.commit().expect("commit");
    }

    #[test]
    fn networks_do_not_share_buckets() {
        let (_dir, env) = open_env();
        let mut wtxn = env.write_txn().expect("txn");
        let a = Buckets::open(&env, &mut wtxn, "a").expect("open");
        let b = Buckets::open(&env, &mut wtxn, "b").expect("open");

        a.keys.put(&mut wtxn, 1, &1u64).expect("put");
        assert_eq!(b.keys.len(&wtxn).expect("len"), 0);
        assert_eq!(b.keys.next_sequence(&mut wtxn).expect("seq"), 1);
        wtxn.commit().expect("commit");
    }
}
