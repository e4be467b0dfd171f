//! Connection pool with peer-identity dedup.

use crate::connection::{Connection, ConnectionOpts};
use crate::Connector;
use hmyload_core::{LoadError, LoadResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

pub type SharedConnection = Arc<Mutex<Connection>>;

/// N connections to one endpoint, grouped by the peer each one landed on.
///
/// Batches are distributed over [`Pool::unique`], one connection per physical
/// peer, since node rate limits apply per peer rather than per socket.
pub struct Pool {
    connections: Vec<SharedConnection>,
    peers: BTreeMap<String, Vec<usize>>,
    unique: Vec<SharedConnection>,
}

impl Pool {
    /// Dials `size` connections concurrently. Fails if any dial or metadata
    /// probe fails, closing the connections that did open.
    pub async fn open(connector: Arc<dyn Connector>, size: usize, opts: ConnectionOpts) -> LoadResult<Self> {
        if size == 0 {
            return Err(LoadError::InvalidInput("Pool size must be at least 1".into()));
        }
        let start = Instant::now();
        let endpoint = connector.endpoint().to_string();

        let mut tasks = tokio::task::JoinSet::new();
        for slot in 0..size {
            let connector = connector.clone();
            tasks.spawn(async move {
                let transport = connector.connect().await?;
                let conn = Connection::establish(transport, opts).await?;
                Ok::<_, LoadError>((slot, conn))
            });
        }

        let mut opened: Vec<Option<Connection>> = (0..size).map(|_| None).collect();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((slot, conn))) => opened[slot] = Some(conn),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(LoadError::Internal(format!("Dial task failed: {e}")));
                }
            }
        }

        if let Some(e) = failure {
            for conn in opened.iter_mut().flatten() {
                if let Err(close_err) = conn.close().await {
                    tracing::debug!(error = %close_err, "close after failed pool open");
                }
            }
            return Err(e);
        }

        let connections: Vec<Connection> = opened.into_iter().flatten().collect();
        let pool = Self::from_connections(connections)?;
        tracing::info!(
            rpc_url = %endpoint,
            connections = pool.len(),
            peers = pool.unique_len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "pool open"
        );
        Ok(pool)
    }

    /// Groups already-established connections. The first one per peer, in
    /// slot order, becomes that peer's distribution target.
    pub fn from_connections(connections: Vec<Connection>) -> LoadResult<Self> {
        if connections.is_empty() {
            return Err(LoadError::InvalidInput("Pool needs at least one connection".into()));
        }
        let mut peers: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (slot, conn) in connections.iter().enumerate() {
            peers.entry(conn.peer_id().to_string()).or_default().push(slot);
        }
        let connections: Vec<SharedConnection> = connections
            .into_iter()
            .map(|c| Arc::new(Mutex::new(c)))
            .collect();

        let mut firsts: Vec<usize> = peers.values().filter_map(|slots| slots.first().copied()).collect();
        firsts.sort_unstable();
        let unique = firsts.into_iter().map(|slot| connections[slot].clone()).collect();

        Ok(Self {
            connections,
            peers,
            unique,
        })
    }

    /// Connection used for single calls.
    pub fn default_connection(&self) -> &SharedConnection {
        &self.connections[0]
    }

    pub fn connections(&self) -> &[SharedConnection] {
        &self.connections
    }

    /// One connection per distinct peer.
    pub fn unique(&self) -> &[SharedConnection] {
        &self.unique
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn unique_len(&self) -> usize {
        self.unique.len()
    }

    /// Peer id to pool slots.
    pub fn peers(&self) -> &BTreeMap<String, Vec<usize>> {
        &self.peers
    }

    /// Splits `items` round-robin over the unique connections. Slots with no
    /// work are omitted.
    pub fn distribute<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<(SharedConnection, Vec<T>)> {
        let mut buckets: Vec<Vec<T>> = (0..self.unique.len()).map(|_| Vec::new()).collect();
        for (i, item) in items.into_iter().enumerate() {
            buckets[i % self.unique.len()].push(item);
        }
        self.unique
            .iter()
            .cloned()
            .zip(buckets)
            .filter(|(_, work)| !work.is_empty())
            .collect()
    }

    /// Closes every connection, including duplicates of a peer. Returns the
    /// first close error after attempting all of them.
    pub async fn close(&self) -> LoadResult<()> {
        let mut first_err = None;
        for conn in &self.connections {
            if let Err(e) = conn.lock().await.close().await {
                tracing::warn!(error = %e, "connection close failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNode;
    use serde_json::json;

    #[tokio::test]
    async fn dedups_by_peer_identity() {
        let node = FakeNode::echo().with_peers(["peer-0", "peer-1", "peer-0", "peer-2", "peer-1"]);
        let pool = Pool::open(Arc::new(node.clone()), 5, ConnectionOpts::default())
            .await
            .unwrap();

        assert_eq!(pool.len(), 5);
        assert_eq!(pool.unique_len(), 3);
        assert_eq!(node.dials(), 5);
        assert_eq!(pool.peers().values().map(Vec::len).sum::<usize>(), 5);
    }

    #[tokio::test]
    async fn distribute_round_robins_over_unique_peers() {
        let node = FakeNode::echo().with_peers(["a", "b"]);
        let pool = Pool::open(Arc::new(node), 4, ConnectionOpts::default()).await.unwrap();

        let slices = pool.distribute(0..5);
        assert_eq!(slices.len(), 2);
        let sizes: Vec<usize> = slices.iter().map(|(_, w)| w.len()).collect();
        assert_eq!(sizes, vec![3, 2]);

        let slices = pool.distribute([7]);
        assert_eq!(slices.len(), 1);
    }

    #[tokio::test]
    async fn default_connection_serves_single_calls() {
        let node = FakeNode::echo();
        let pool = Pool::open(Arc::new(node.clone()), 2, ConnectionOpts::default())
            .await
            .unwrap();
        let value = pool
            .default_connection()
            .lock()
            .await
            .call("echo", vec![json!(1)])
            .await
            .unwrap();
        assert_eq!(value, json!([1]));
        assert_eq!(node.requests(), 1);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_empty_pool() {
        let node = FakeNode::echo();
        assert!(matches!(
            Pool::open(Arc::new(node), 0, ConnectionOpts::default()).await,
            Err(LoadError::InvalidInput(_))
        ));
        assert!(matches!(
            Pool::from_connections(Vec::new()),
            Err(LoadError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn from_connections_groups_by_peer() {
        let node = FakeNode::echo().with_peers(["x", "y", "x"]);
        let mut conns = Vec::new();
        for _ in 0..3 {
            conns.push(Connection::establish(node.transport(), ConnectionOpts::default()).await.unwrap());
        }
        let pool = Pool::from_connections(conns).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.unique_len(), 2);
        assert_eq!(pool.peers()["x"], vec![0, 2]);
        assert_eq!(pool.distribute([1, 2, 3]).len(), 2);
    }
}
