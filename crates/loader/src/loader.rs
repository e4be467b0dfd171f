//! The loader: ties the connection pool, the cache and the signature
//! directory together.

use crate::abi;
use crate::decode::{parse_quantity, HistoryPage, Receipt, TxInfo};
use crate::opts::LoaderOpts;
use crate::plan::plan_pages;
use crate::workers::WorkerGroup;
use alloy_primitives::{Bytes, Selector, B256};
use hmyload_core::{Address, LoadError, LoadResult, Method, Token, Transaction};
use hmyload_provider::{Body, Connector, FourByteDirectory, Pool, Reply, SignatureDirectory, WsConnector};
use hmyload_store::Cache;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

pub const TX_COUNT: &str = "hmyv2_getTransactionsCount";
pub const TX_HISTORY: &str = "hmyv2_getTransactionsHistory";
pub const TX_BY_HASH: &str = "hmyv2_getTransactionByHash";
pub const TX_RECEIPT: &str = "hmyv2_getTransactionReceipt";
pub const CALL: &str = "hmyv2_call";
pub const BLOCK_NUMBER: &str = "hmyv2_blockNumber";

const NAME_CALL: &str = "0x06fdde03";
const SYMBOL_CALL: &str = "0x95d89b41";
const DECIMALS_CALL: &str = "0x313ce567";

/// Max concurrent signature directory lookups.
const DIRECTORY_CONCURRENCY: usize = 4;

/// Outcome of [`Loader::methods`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodReport {
    /// Distinct selectors seen across the transactions.
    pub selectors: usize,
    pub cached: usize,
    /// Newly resolved through the directory and persisted.
    pub resolved: usize,
    /// No directory match, or the lookup failed.
    pub unresolved: Vec<Selector>,
}

/// Loads Harmony transactions, tokens and method signatures, serving
/// repeats from the on-disk cache.
///
/// ```ignore
/// let loader = Loader::connect("wss://ws.s0.t.hmny.io", LoaderOpts::default()).await?;
/// let txs = loader.transactions_by_wallet(&"one1...".parse()?).await?;
/// loader.close().await?;
/// ```
pub struct Loader {
    pool: Pool,
    cache: Arc<Cache>,
    directory: Arc<dyn SignatureDirectory>,
    opts: LoaderOpts,
}

impl Loader {
    /// Opens a WebSocket pool to `rpc_url`.
    pub async fn connect(rpc_url: &str, opts: LoaderOpts) -> LoadResult<Self> {
        let connector = WsConnector::new(rpc_url, opts.rpc_timeout)?;
        Self::with_connector(Arc::new(connector), opts).await
    }

    /// Opens the pool through any [`Connector`].
    pub async fn with_connector(connector: Arc<dyn Connector>, opts: LoaderOpts) -> LoadResult<Self> {
        opts.validate()?;
        let directory: Arc<dyn SignatureDirectory> = match &opts.directory {
            Some(directory) => directory.clone(),
            None => Arc::new(FourByteDirectory::new(opts.rpc_timeout)?),
        };

        let cache_dir = opts.resolve_cache_dir()?;
        let cache = opts.registry.open(&cache_dir)?;

        if opts.preload_cache {
            if let Err(e) = warm(&cache).await {
                release_quietly(&opts, &cache);
                return Err(e);
            }
        }

        let pool = match Pool::open(connector, opts.pool_size(), opts.connection_opts()).await {
            Ok(pool) => pool,
            Err(e) => {
                release_quietly(&opts, &cache);
                return Err(e);
            }
        };

        tracing::info!(
            cache = %cache_dir.display(),
            connections = pool.len(),
            peers = pool.unique_len(),
            "loader ready"
        );

        Ok(Self {
            pool,
            cache,
            directory,
            opts,
        })
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Every transaction of `address`, resolved in full.
    pub async fn transactions_by_wallet(&self, address: &Address) -> LoadResult<Vec<Transaction>> {
        let start = Instant::now();
        let one = address.to_one();

        let count = {
            let mut conn = self.pool.default_connection().lock().await;
            conn.call(TX_COUNT, vec![json!(one), json!("ALL")]).await?
        };
        let count = quantity_u64(TX_COUNT, &count)?;

        let pages = plan_pages(count, self.opts.page_size, self.opts.page_overlap);
        tracing::info!(address = %one, count, pages = pages.len(), "scanning history");

        let mut seen = HashSet::new();
        let mut hashes = Vec::new();
        for page in &pages {
            let params = json!({
                "address": one,
                "pageIndex": page.index,
                "pageSize": page.size,
                "fullTx": false,
                "txType": "ALL",
                "order": "ASC",
            });
            let result = {
                let mut conn = self.pool.default_connection().lock().await;
                conn.call(TX_HISTORY, vec![params]).await?
            };
            if result.is_null() {
                return Err(LoadError::Decode(format!(
                    "{TX_HISTORY} returned no result for page {}",
                    page.index
                )));
            }
            let listed: HistoryPage = serde_json::from_value(result)
                .map_err(|e| LoadError::Decode(format!("Bad {TX_HISTORY} page {}: {e}", page.index)))?;
            tracing::debug!(page = page.index, listed = listed.transactions.len(), "history page");
            hashes.extend(listed.transactions.into_iter().filter(|h| seen.insert(*h)));
        }

        let mut txs = Vec::with_capacity(hashes.len());
        for chunk in hashes.chunks(self.opts.chunk_size) {
            txs.extend(self.full_transactions(chunk).await?);
        }

        tracing::info!(
            address = %one,
            txs = txs.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "wallet loaded"
        );
        Ok(txs)
    }

    /// Transaction info and receipt for each hash, in input order.
    ///
    /// Either hash form is accepted. Cached transactions are served without a
    /// request; the rest are fetched across the unique peers and written back
    /// before returning. Any failed batch fails the whole call.
    pub async fn full_transactions(&self, hashes: &[B256]) -> LoadResult<Vec<Transaction>> {
        let start = Instant::now();

        let requested = hashes.to_vec();
        let (hits, misses) = blocking(&self.cache, "Cache read", move |cache| {
            let mut hits: HashMap<B256, Transaction> = HashMap::new();
            let mut misses = Vec::new();
            let mut queued = HashSet::new();
            for hash in requested {
                if hits.contains_key(&hash) || queued.contains(&hash) {
                    continue;
                }
                match cache.get_transaction(&hash)? {
                    Some(tx) => {
                        hits.insert(hash, tx);
                    }
                    None => {
                        queued.insert(hash);
                        misses.push(hash);
                    }
                }
            }
            Ok((hits, misses))
        })
        .await?;

        let fetched = self.fetch_transactions(&misses).await?;
        let fetched = persist(&self.cache, fetched).await?;

        let mut index: HashMap<B256, &Transaction> = HashMap::with_capacity(fetched.len() * 2);
        for tx in &fetched {
            index.insert(tx.hash, tx);
            index.insert(tx.eth_hash, tx);
        }

        let out = hashes
            .iter()
            .map(|hash| {
                hits.get(hash)
                    .or_else(|| index.get(hash).copied())
                    .cloned()
                    .ok_or_else(|| LoadError::Decode(format!("Node returned no transaction for {hash}")))
            })
            .collect::<LoadResult<Vec<_>>>()?;

        tracing::info!(
            requested = hashes.len(),
            hits = hits.len(),
            fetched = fetched.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "full transactions"
        );
        Ok(out)
    }

    async fn fetch_transactions(&self, misses: &[B256]) -> LoadResult<Vec<Transaction>> {
        if misses.is_empty() {
            return Ok(Vec::new());
        }
        let mut group = WorkerGroup::new(misses.len());
        for (conn, hashes) in self.pool.distribute(misses.iter().copied()) {
            group.spawn(move |out| async move {
                let mut conn = conn.lock().await;
                let mut bodies = Vec::with_capacity(hashes.len() * 2);
                for hash in &hashes {
                    bodies.push(conn.new_body(TX_BY_HASH, vec![json!(hash)]));
                    bodies.push(conn.new_body(TX_RECEIPT, vec![json!(hash)]));
                }
                let replies = conn.batch_call_raw(&bodies).await?;
                drop(conn);

                for (pair, hash) in replies.chunks(2).zip(&hashes) {
                    let info: TxInfo = required(TX_BY_HASH, hash, &pair[0])?;
                    let receipt: Receipt = required(TX_RECEIPT, hash, &pair[1])?;
                    out.push(info.into_transaction(receipt)?).await?;
                }
                Ok(())
            });
        }
        tracing::debug!(misses = misses.len(), workers = group.len(), "fetching transactions");
        group.collect().await
    }

    /// Resolves and back-fills the method of every transaction with a
    /// selector. Unresolved selectors are reported, not raised.
    pub async fn methods(&self, txs: &mut [Transaction]) -> LoadResult<MethodReport> {
        let selectors: BTreeSet<Selector> = txs.iter().filter_map(Transaction::selector).collect();
        let mut report = MethodReport {
            selectors: selectors.len(),
            ..MethodReport::default()
        };

        let (mut known, unknown) = blocking(&self.cache, "Cache read", move |cache| {
            let mut known: HashMap<Selector, Method> = HashMap::with_capacity(selectors.len());
            let mut unknown = Vec::new();
            for selector in selectors {
                match cache.get_method(&selector)? {
                    Some(method) => {
                        known.insert(selector, method);
                    }
                    None => unknown.push(selector),
                }
            }
            Ok((known, unknown))
        })
        .await?;
        report.cached = known.len();

        let semaphore = Arc::new(tokio::sync::Semaphore::new(DIRECTORY_CONCURRENCY));
        let mut lookups = tokio::task::JoinSet::new();
        for selector in unknown {
            let directory = self.directory.clone();
            let semaphore = semaphore.clone();
            lookups.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (selector, directory.lookup(selector).await)
            });
        }

        let mut resolved = Vec::new();
        while let Some(joined) = lookups.join_next().await {
            let (selector, outcome) =
                joined.map_err(|e| LoadError::Internal(format!("Lookup task failed: {e}")))?;
            match outcome {
                Ok(Some(method)) => {
                    known.insert(selector, method.clone());
                    resolved.push(method);
                }
                Ok(None) => {
                    tracing::warn!(%selector, "no signature match");
                    report.unresolved.push(selector);
                }
                Err(e) => {
                    tracing::warn!(%selector, error = %e, "signature lookup failed");
                    report.unresolved.push(selector);
                }
            }
        }
        report.unresolved.sort_unstable();
        report.resolved = resolved.len();
        if !resolved.is_empty() {
            blocking(&self.cache, "Cache write", move |cache| {
                resolved.iter().try_for_each(|m| cache.set_method(m))
            })
            .await?;
        }

        for tx in txs.iter_mut() {
            if let Some(selector) = tx.selector() {
                tx.method = known.get(&selector).cloned();
            }
        }

        tracing::info!(
            selectors = report.selectors,
            cached = report.cached,
            resolved = report.resolved,
            unresolved = report.unresolved.len(),
            "methods resolved"
        );
        Ok(report)
    }

    /// Single-selector lookup. `Ok(None)` when the directory has no match;
    /// lookup failures are returned as errors.
    pub async fn method(&self, selector: Selector) -> LoadResult<Option<Method>> {
        let cached = blocking(&self.cache, "Cache read", move |cache| cache.get_method(&selector)).await?;
        if cached.is_some() {
            return Ok(cached);
        }
        let Some(method) = self.directory.lookup(selector).await? else {
            return Ok(None);
        };
        let stored = method.clone();
        blocking(&self.cache, "Cache write", move |cache| cache.set_method(&stored)).await?;
        Ok(Some(method))
    }

    /// ERC-20 metadata for each address, in input order. Addresses whose
    /// `decimals()` probe fails are returned as [`Token::not_a_token`].
    pub async fn tokens(&self, addresses: &[Address]) -> LoadResult<Vec<Token>> {
        let start = Instant::now();
        let mut seen = HashSet::new();
        let distinct: Vec<Address> = addresses.iter().copied().filter(|a| seen.insert(*a)).collect();
        if distinct.is_empty() {
            return Ok(Vec::new());
        }

        let mut group = WorkerGroup::new(distinct.len());
        for (conn, addrs) in self.pool.distribute(distinct.iter().copied()) {
            group.spawn(move |out| async move {
                let mut conn = conn.lock().await;
                let mut bodies = Vec::with_capacity(addrs.len() * 3);
                for addr in &addrs {
                    for data in [NAME_CALL, SYMBOL_CALL, DECIMALS_CALL] {
                        bodies.push(call_body(&mut conn, addr, data));
                    }
                }
                let replies = conn.batch_call_raw(&bodies).await?;
                drop(conn);

                for (probe, addr) in replies.chunks(3).zip(&addrs) {
                    out.push(token_from_probes(*addr, &probe[0], &probe[1], &probe[2])).await?;
                }
                Ok(())
            });
        }
        let by_address: HashMap<Address, Token> =
            group.collect().await?.into_iter().map(|t| (t.address, t)).collect();

        let tokens = addresses
            .iter()
            .map(|a| {
                by_address
                    .get(a)
                    .cloned()
                    .ok_or_else(|| LoadError::Internal(format!("No token result for {a}")))
            })
            .collect::<LoadResult<Vec<_>>>()?;

        tracing::info!(
            tokens = tokens.len(),
            non_tokens = tokens.iter().filter(|t| !t.is_token()).count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "tokens loaded"
        );
        Ok(tokens)
    }

    /// Latest block number seen by the default connection's node.
    pub async fn block_number(&self) -> LoadResult<u64> {
        let value = {
            let mut conn = self.pool.default_connection().lock().await;
            conn.call(BLOCK_NUMBER, vec![]).await?
        };
        quantity_u64(BLOCK_NUMBER, &value)
    }

    /// Closes every pool connection and releases this loader's cache
    /// reference. The store itself closes when its last loader closes.
    ///
    /// Both steps always run. If both fail, the pool error is returned and
    /// the cache error is logged.
    pub async fn close(self) -> LoadResult<()> {
        let pool_result = self.pool.close().await;
        let cache_result = self.opts.registry.release(&self.cache);
        match (pool_result, cache_result) {
            (Ok(()), Ok(cache_closed)) => {
                tracing::info!(cache_closed, "loader closed");
                Ok(())
            }
            (Err(e), Ok(_)) | (Ok(()), Err(e)) => Err(e),
            (Err(pool_err), Err(cache_err)) => {
                tracing::warn!(error = %cache_err, "cache release failed");
                Err(pool_err)
            }
        }
    }
}

fn call_body(conn: &mut hmyload_provider::Connection, to: &Address, data: &str) -> Body {
    conn.new_body(CALL, vec![json!({ "to": to.to_hex(), "data": data }), json!("latest")])
}

fn required<T: serde::de::DeserializeOwned>(method: &str, hash: &B256, reply: &Reply) -> LoadResult<T> {
    reply
        .decode(method)?
        .ok_or_else(|| LoadError::Decode(format!("{method} returned no result for {hash}")))
}

/// Return data of one `hmyv2_call` probe. Faults, nulls and empty `0x` all
/// count as no data.
fn probe_data(reply: &Reply) -> Option<Bytes> {
    match reply.decode::<Bytes>(CALL) {
        Ok(Some(data)) if !data.is_empty() => Some(data),
        _ => None,
    }
}

fn token_from_probes(address: Address, name: &Reply, symbol: &Reply, decimals: &Reply) -> Token {
    let decimals = probe_data(decimals)
        .and_then(|data| abi::decode_uint(&data, 0).ok())
        .and_then(|d| u8::try_from(d).ok());
    let Some(decimals) = decimals else {
        tracing::debug!(%address, "no decimals, not a token");
        return Token::not_a_token(address);
    };

    let text = |reply: &Reply| {
        probe_data(reply)
            .and_then(|data| abi::decode_string(&data, 0).ok())
            .unwrap_or_default()
    };
    Token {
        address,
        name: text(name),
        symbol: text(symbol),
        decimals: Some(decimals),
    }
}

fn quantity_u64(method: &str, value: &Value) -> LoadResult<u64> {
    if value.is_null() {
        return Err(LoadError::Decode(format!("{method} returned no result")));
    }
    let n = parse_quantity(&value.to_string())?;
    u64::try_from(n).map_err(|_| LoadError::Decode(format!("{method} result {n} does not fit in u64")))
}

/// Runs `op` against the cache on the blocking pool; rocksdb calls block.
async fn blocking<T, F>(cache: &Arc<Cache>, task: &str, op: F) -> LoadResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Cache) -> LoadResult<T> + Send + 'static,
{
    let cache = cache.clone();
    tokio::task::spawn_blocking(move || op(&cache))
        .await
        .map_err(|e| LoadError::Internal(format!("{task} task failed: {e}")))?
}

async fn warm(cache: &Arc<Cache>) -> LoadResult<()> {
    let stats = blocking(cache, "Cache warm", Cache::warm).await?;
    tracing::info!(transactions = stats.transactions, methods = stats.methods, "cache preloaded");
    Ok(())
}

async fn persist(cache: &Arc<Cache>, fetched: Vec<Transaction>) -> LoadResult<Vec<Transaction>> {
    if fetched.is_empty() {
        return Ok(fetched);
    }
    blocking(cache, "Cache write", move |cache| {
        for tx in &fetched {
            cache.set_transaction(tx)?;
        }
        Ok(fetched)
    })
    .await
}

fn release_quietly(opts: &LoaderOpts, cache: &Arc<Cache>) {
    if let Err(e) = opts.registry.release(cache) {
        tracing::warn!(error = %e, "cache release failed");
    }
}
