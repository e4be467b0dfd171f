//! In-memory node for tests. Enabled with the `testing` feature.
//!
//! Requests are answered by a handler closure; node metadata is answered by
//! the transport itself using the peer id assigned at dial time.

use crate::connection::NODE_METADATA;
use crate::{Connector, Transport};
use async_trait::async_trait;
use hmyload_core::{LoadError, LoadResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// What the node sends back for one request.
#[derive(Debug, Clone)]
pub enum Answer {
    Result(Value),
    Null,
    Fault(i64, String),
    /// No reply at all; the reader waits until its deadline.
    Silent,
    /// Verbatim frame, id and all.
    Raw(String),
}

type Handler = dyn Fn(&str, &[Value]) -> Answer + Send + Sync;

/// Order in which queued replies are handed back.
#[derive(Debug, Clone, Copy)]
enum ReplyOrder {
    InOrder,
    Reversed,
    Shuffled(u64),
}

#[derive(Clone)]
pub struct FakeNode {
    handler: Arc<Handler>,
    peers: Arc<Vec<String>>,
    dials: Arc<AtomicUsize>,
    calls: Arc<Mutex<HashMap<String, usize>>>,
    batches: Arc<Mutex<Vec<Vec<String>>>>,
    order: ReplyOrder,
}

impl FakeNode {
    pub fn new(handler: impl Fn(&str, &[Value]) -> Answer + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            peers: Arc::new(vec!["peer-0".to_string()]),
            dials: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(Mutex::new(HashMap::new())),
            batches: Arc::new(Mutex::new(Vec::new())),
            order: ReplyOrder::InOrder,
        }
    }

    /// Echoes params back as the result.
    pub fn echo() -> Self {
        Self::new(|_, params| Answer::Result(Value::Array(params.to_vec())))
    }

    /// Successive dials are assigned these peer ids, cycling.
    pub fn with_peers<S: Into<String>>(mut self, peers: impl IntoIterator<Item = S>) -> Self {
        self.peers = Arc::new(peers.into_iter().map(Into::into).collect());
        self
    }

    /// Reply to each batch in reverse order.
    pub fn reversed(mut self) -> Self {
        self.order = ReplyOrder::Reversed;
        self
    }

    /// Reply in a random order, reproducible from `seed`.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.order = ReplyOrder::Shuffled(seed);
        self
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        let dial = self.dials.fetch_add(1, Ordering::SeqCst);
        let peer = self.peers[dial % self.peers.len().max(1)].clone();
        let seed = match self.order {
            ReplyOrder::Shuffled(seed) => seed.wrapping_add(dial as u64),
            _ => 0,
        };
        Box::new(FakeTransport {
            node: self.clone(),
            peer,
            queue: VecDeque::new(),
            batch: None,
            rng: StdRng::seed_from_u64(seed),
            closed: false,
        })
    }

    /// Requests seen, excluding node metadata probes.
    pub fn requests(&self) -> usize {
        self.lock_calls()
            .iter()
            .filter(|(m, _)| m.as_str() != NODE_METADATA)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn calls(&self, method: &str) -> usize {
        self.lock_calls().get(method).copied().unwrap_or(0)
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// How many `method` requests each exchange carried, in arrival order.
    /// An exchange is every frame sent on one transport before its next read.
    /// Exchanges without `method` are left out.
    pub fn batch_sizes(&self, method: &str) -> Vec<usize> {
        self.lock_batches()
            .iter()
            .map(|batch| batch.iter().filter(|m| m.as_str() == method).count())
            .filter(|&n| n > 0)
            .collect()
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_batches(&self) -> std::sync::MutexGuard<'_, Vec<Vec<String>>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Connector for FakeNode {
    async fn connect(&self) -> LoadResult<Box<dyn Transport>> {
        Ok(self.transport())
    }

    fn endpoint(&self) -> &str {
        "fake://node"
    }
}

struct FakeTransport {
    node: FakeNode,
    peer: String,
    queue: VecDeque<String>,
    /// Slot in `FakeNode::batches` of the exchange being sent.
    batch: Option<usize>,
    rng: StdRng,
    closed: bool,
}

impl FakeTransport {
    fn record(&mut self, method: &str) {
        let mut batches = self.node.lock_batches();
        let slot = *self.batch.get_or_insert_with(|| {
            batches.push(Vec::new());
            batches.len() - 1
        });
        batches[slot].push(method.to_string());
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, frame: String) -> LoadResult<()> {
        if self.closed {
            return Err(LoadError::Transport("send on closed transport".into()));
        }
        let request: Value = serde_json::from_str(&frame).map_err(LoadError::transport)?;
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request["params"].as_array().cloned().unwrap_or_default();

        *self.node.lock_calls().entry(method.clone()).or_default() += 1;
        self.record(&method);

        let answer = if method == NODE_METADATA {
            Answer::Result(json!({ "peerid": self.peer }))
        } else {
            (self.node.handler)(&method, &params)
        };
        let reply = match answer {
            Answer::Result(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Answer::Null => json!({ "jsonrpc": "2.0", "id": id, "result": null }),
            Answer::Fault(code, message) => {
                json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
            }
            Answer::Silent => return Ok(()),
            Answer::Raw(frame) => {
                self.queue.push_back(frame);
                return Ok(());
            }
        };
        self.queue.push_back(reply.to_string());
        Ok(())
    }

    async fn recv(&mut self) -> LoadResult<String> {
        self.batch = None;
        let next = match self.node.order {
            ReplyOrder::InOrder => self.queue.pop_front(),
            ReplyOrder::Reversed => self.queue.pop_back(),
            ReplyOrder::Shuffled(_) if self.queue.is_empty() => None,
            ReplyOrder::Shuffled(_) => {
                let i = self.rng.gen_range(0..self.queue.len());
                self.queue.remove(i)
            }
        };
        match next {
            Some(frame) => Ok(frame),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> LoadResult<()> {
        self.closed = true;
        Ok(())
    }
}
