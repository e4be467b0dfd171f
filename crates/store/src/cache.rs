//! Write-through transaction/method cache: rocksdb on disk, maps in memory.
//!
//! Keys are `<1-byte namespace><raw id>`. Transactions are keyed by their
//! native hash; the Ethereum-style hash is a secondary index row pointing at
//! the native hash, written in the same batch as the record itself.

use crate::codec;
use alloy_primitives::{Selector, B256};
use hmyload_core::{LoadError, LoadResult, Method, Transaction};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

const TX_PREFIX: u8 = 0x01;
const METHOD_PREFIX: u8 = 0x02;
const TX_ALIAS_PREFIX: u8 = 0x03;

/// Bulk preload progress. Lives behind the cache's own lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmState {
    Cold,
    Loading,
    Ready,
}

/// Counts reported by [`Cache::warm`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmStats {
    pub transactions: usize,
    pub methods: usize,
}

/// In-memory transaction mirror: one canonical map plus the alias index.
#[derive(Default)]
struct TxMirror {
    by_hash: HashMap<B256, Arc<Transaction>>,
    alias: HashMap<B256, B256>,
}

impl TxMirror {
    fn get(&self, hash: &B256) -> Option<&Arc<Transaction>> {
        self.by_hash
            .get(hash)
            .or_else(|| self.alias.get(hash).and_then(|c| self.by_hash.get(c)))
    }

    fn insert(&mut self, tx: Arc<Transaction>) {
        if tx.eth_hash != tx.hash {
            self.alias.insert(tx.eth_hash, tx.hash);
        }
        self.by_hash.insert(tx.hash, tx);
    }
}

/// Disk-backed cache shared by every loader pointed at the same directory.
///
/// Holds a reference count; the rocksdb handle and the in-memory mirror are
/// dropped only when the last holder calls [`Cache::release`]. Caches handed
/// out by a [`CacheRegistry`](crate::CacheRegistry) are released through it.
/// Once closed, every read and write fails with [`LoadError::Closed`].
pub struct Cache {
    path: PathBuf,
    db: RwLock<Option<DB>>,
    transactions: RwLock<TxMirror>,
    methods: RwLock<HashMap<Selector, Arc<Method>>>,
    warm_state: Mutex<WarmState>,
    refs: Mutex<usize>,
}

impl Cache {
    /// Opens (creating if needed) the store at `path` with one reference.
    pub fn open(path: &Path) -> LoadResult<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            LoadError::Cache(format!("Failed to create cache dir {}: {e}", path.display()))
        })?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(|e| {
            LoadError::Cache(format!("Failed to open cache at {}: {e}", path.display()))
        })?;

        tracing::info!(path = %path.display(), "cache opened");

        Ok(Self {
            path: path.to_path_buf(),
            db: RwLock::new(Some(db)),
            transactions: RwLock::new(TxMirror::default()),
            methods: RwLock::new(HashMap::new()),
            warm_state: Mutex::new(WarmState::Cold),
            refs: Mutex::new(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.db.read().is_some()
    }

    pub fn ref_count(&self) -> usize {
        *self.refs.lock()
    }

    pub fn warm_state(&self) -> WarmState {
        *self.warm_state.lock()
    }

    // -----------------------------------------------------------------------
    // Reference counting
    // -----------------------------------------------------------------------

    /// Adds a holder. Fails once the store has been closed.
    pub fn retain(&self) -> LoadResult<()> {
        let mut refs = self.refs.lock();
        if *refs == 0 {
            return Err(self.closed());
        }
        *refs += 1;
        Ok(())
    }

    /// Drops a holder. Returns `true` when this call closed the store.
    pub fn release(&self) -> LoadResult<bool> {
        let mut refs = self.refs.lock();
        match *refs {
            0 => Err(self.closed()),
            1 => {
                *refs = 0;
                // Dropping the handle while `refs` is held keeps a concurrent
                // reopen of the same path from racing the rocksdb lock file.
                let mut db = self.db.write();
                drop(db.take());
                let mut txs = self.transactions.write();
                let evicted = txs.by_hash.len();
                *txs = TxMirror::default();
                drop(txs);
                *self.methods.write() = HashMap::new();
                *self.warm_state.lock() = WarmState::Cold;
                drop(db);
                tracing::info!(path = %self.path.display(), evicted, "cache closed");
                Ok(true)
            }
            n => {
                *refs = n - 1;
                tracing::debug!(path = %self.path.display(), refs = n - 1, "cache released");
                Ok(false)
            }
        }
    }

    fn closed(&self) -> LoadError {
        LoadError::Closed(self.path.display().to_string())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Looks a transaction up by either hash form.
    pub fn get_transaction(&self, hash: &B256) -> LoadResult<Option<Transaction>> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| self.closed())?;

        if let Some(tx) = self.transactions.read().get(hash) {
            return Ok(Some(Transaction::clone(tx)));
        }

        let raw = match get_raw(db, &tx_key(hash))? {
            Some(raw) => raw,
            None => {
                let Some(canonical) = get_raw(db, &alias_key(hash))? else {
                    return Ok(None);
                };
                if canonical.len() != 32 {
                    return Err(LoadError::Cache(format!(
                        "alias row for {hash} holds {} bytes",
                        canonical.len()
                    )));
                }
                let canonical = B256::from_slice(&canonical);
                match get_raw(db, &tx_key(&canonical))? {
                    Some(raw) => raw,
                    None => return Ok(None),
                }
            }
        };

        let tx = Arc::new(
            codec::decode_transaction(&raw)
                .map_err(|e| LoadError::Decode(format!("cached transaction {hash}: {e}")))?,
        );
        self.transactions.write().insert(tx.clone());
        drop(guard);
        Ok(Some(Transaction::clone(&tx)))
    }

    /// Memory first, then disk. Rewriting an identical record is a no-op in effect.
    pub fn set_transaction(&self, tx: &Transaction) -> LoadResult<()> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| self.closed())?;

        self.transactions.write().insert(Arc::new(tx.clone()));

        let mut batch = WriteBatch::default();
        batch.put(tx_key(&tx.hash), codec::encode_transaction(tx));
        if tx.eth_hash != tx.hash {
            batch.put(alias_key(&tx.eth_hash), tx.hash.as_slice());
        }
        db.write(batch)
            .map_err(|e| LoadError::Cache(format!("Failed to persist transaction {}: {e}", tx.hash)))
    }

    // -----------------------------------------------------------------------
    // Methods
    // -----------------------------------------------------------------------

    pub fn get_method(&self, signature: &Selector) -> LoadResult<Option<Method>> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| self.closed())?;

        if let Some(m) = self.methods.read().get(signature) {
            return Ok(Some(Method::clone(m)));
        }
        let Some(raw) = get_raw(db, &method_key(signature))? else {
            return Ok(None);
        };

        let method = codec::decode_method(&raw)
            .map_err(|e| LoadError::Decode(format!("cached method {signature}: {e}")))?;
        self.methods
            .write()
            .insert(method.signature, Arc::new(method.clone()));
        Ok(Some(method))
    }

    pub fn set_method(&self, method: &Method) -> LoadResult<()> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| self.closed())?;

        self.methods
            .write()
            .insert(method.signature, Arc::new(method.clone()));
        db.put(method_key(&method.signature), codec::encode_method(method))
            .map_err(|e| {
                LoadError::Cache(format!("Failed to persist method {}: {e}", method.signature))
            })
    }

    /// Every cached method matching `filter`, straight from disk.
    pub fn list_methods<F>(&self, filter: F) -> LoadResult<Vec<Method>>
    where
        F: Fn(&Method) -> bool,
    {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| self.closed())?;
        let raw = scan(db, METHOD_PREFIX)?;
        drop(guard);
        let mut methods = Vec::with_capacity(raw.len());
        for value in raw {
            let m = codec::decode_method(&value)?;
            if filter(&m) {
                methods.push(m);
            }
        }
        Ok(methods)
    }

    // -----------------------------------------------------------------------
    // Preload
    // -----------------------------------------------------------------------

    /// Loads both partitions into memory. Runs at most once per cache; later
    /// calls, or calls racing an in-flight load, return zero counts.
    pub fn warm(&self) -> LoadResult<WarmStats> {
        {
            let mut state = self.warm_state.lock();
            if *state != WarmState::Cold {
                return Ok(WarmStats::default());
            }
            *state = WarmState::Loading;
        }

        let t0 = Instant::now();
        let result = self.load_partitions();
        let mut state = self.warm_state.lock();
        match &result {
            Ok(stats) => {
                *state = WarmState::Ready;
                tracing::info!(
                    transactions = stats.transactions,
                    methods = stats.methods,
                    elapsed_ms = t0.elapsed().as_millis(),
                    "cache warmed"
                );
            }
            Err(e) => {
                *state = WarmState::Cold;
                tracing::warn!(error = %e, "cache warm failed");
            }
        }
        result
    }

    /// Holds the handle throughout so a concurrent close cannot be refilled.
    fn load_partitions(&self) -> LoadResult<WarmStats> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| self.closed())?;

        let raw_txs = scan(db, TX_PREFIX)?;
        let txs = raw_txs
            .par_iter()
            .map(|raw| codec::decode_transaction(raw).map(Arc::new))
            .collect::<LoadResult<Vec<_>>>()?;

        let raw_methods = scan(db, METHOD_PREFIX)?;
        let methods = raw_methods
            .par_iter()
            .map(|raw| codec::decode_method(raw))
            .collect::<LoadResult<Vec<_>>>()?;

        let stats = WarmStats {
            transactions: txs.len(),
            methods: methods.len(),
        };

        {
            let mut mirror = self.transactions.write();
            mirror.by_hash.reserve(txs.len());
            for tx in txs {
                mirror.insert(tx);
            }
        }
        {
            let mut mirror = self.methods.write();
            for m in methods {
                mirror.insert(m.signature, Arc::new(m));
            }
        }
        Ok(stats)
    }

}

/// Raw values of every key under `prefix`.
fn scan(db: &DB, prefix: u8) -> LoadResult<Vec<Box<[u8]>>> {
    let mut values = Vec::new();
    for item in db.iterator(IteratorMode::From(&[prefix], Direction::Forward)) {
        let (key, value) =
            item.map_err(|e| LoadError::Cache(format!("Failed to scan cache: {e}")))?;
        if key.first() != Some(&prefix) {
            break;
        }
        values.push(value);
    }
    Ok(values)
}

fn get_raw(db: &DB, key: &[u8]) -> LoadResult<Option<Vec<u8>>> {
    db.get(key)
        .map_err(|e| LoadError::Cache(format!("Failed to read cache: {e}")))
}

fn tx_key(hash: &B256) -> Vec<u8> {
    prefixed(TX_PREFIX, hash.as_slice())
}

fn alias_key(hash: &B256) -> Vec<u8> {
    prefixed(TX_ALIAS_PREFIX, hash.as_slice())
}

fn method_key(signature: &Selector) -> Vec<u8> {
    prefixed(METHOD_PREFIX, signature.as_slice())
}

#[inline]
fn prefixed(prefix: u8, id: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + id.len());
    key.push(prefix);
    key.extend_from_slice(id);
    key
}
