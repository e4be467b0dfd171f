//! A single JSON-RPC connection: id counter, read deadline, peer identity.

use crate::body::{fault_error, parse_reply, Body, Reply};
use crate::Transport;
use hmyload_core::{LoadError, LoadResult};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const NODE_METADATA: &str = "hmyv2_getNodeMetadata";

/// Backoff for single calls that come back with an empty result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before `attempt` (1-based): `base * 2^(attempt-1)` plus up to half
    /// of `base` in jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1));
        let jitter_ms = self.base_delay.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return exp;
        }
        exp + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Per-connection settings shared by every connection of a pool.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOpts {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ConnectionOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Deserialize)]
struct NodeMetadata {
    peerid: String,
}

/// One live connection to a node.
///
/// Not shareable between tasks on its own; the pool wraps each connection in
/// an async mutex held by whichever worker is using it.
pub struct Connection {
    transport: Box<dyn Transport>,
    next_id: u64,
    opts: ConnectionOpts,
    peer_id: String,
}

impl Connection {
    /// Wraps `transport` and discovers the peer identity.
    pub async fn establish(transport: Box<dyn Transport>, opts: ConnectionOpts) -> LoadResult<Self> {
        let mut conn = Self {
            transport,
            next_id: 1,
            opts,
            peer_id: String::new(),
        };
        let metadata: NodeMetadata = conn
            .call_raw(NODE_METADATA, vec![])
            .await?
            .decode(NODE_METADATA)?
            .ok_or_else(|| LoadError::Transport(format!("{NODE_METADATA} returned no result")))?;
        conn.peer_id = metadata.peerid;
        tracing::debug!(peer_id = %conn.peer_id, "connection established");
        Ok(conn)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn timeout(&self) -> Duration {
        self.opts.timeout
    }

    /// Builds a body carrying the next id from this connection's counter.
    pub fn new_body(&mut self, method: &str, params: Vec<Value>) -> Body {
        let id = self.next_id;
        self.next_id += 1;
        Body::new(id, method, params)
    }

    /// Single call decoded to a generic value. Empty results are retried per
    /// the retry policy and come back as `Value::Null` once retries run out.
    pub async fn call(&mut self, method: &str, params: Vec<Value>) -> LoadResult<Value> {
        let retry = self.opts.retry;
        for attempt in 0..=retry.max_retries {
            if attempt > 0 {
                let delay = retry.delay(attempt);
                tracing::warn!(method, attempt, delay_ms = delay.as_millis() as u64, "empty result, retrying");
                tokio::time::sleep(delay).await;
            }
            let reply = self.call_raw(method, params.clone()).await?;
            if !reply.is_null() {
                return reply.into_value(method);
            }
        }
        Ok(Value::Null)
    }

    /// Single call, one attempt, result left undecoded.
    pub async fn call_raw(&mut self, method: &str, params: Vec<Value>) -> LoadResult<Reply> {
        let body = self.new_body(method, params);
        let mut replies = self.exchange(std::slice::from_ref(&body)).await?;
        replies
            .pop()
            .ok_or_else(|| LoadError::Internal(format!("No reply slot for {method}")))
    }

    /// Batch decoded to generic values. Any fault fails the batch.
    pub async fn batch_call(&mut self, bodies: &[Body]) -> LoadResult<Vec<Value>> {
        let replies = self.batch_call_raw(bodies).await?;
        bodies
            .iter()
            .zip(replies)
            .map(|(body, reply)| reply.into_value(&body.method))
            .collect()
    }

    /// Batch with one [`Reply`] per body, in body order. Faults are returned
    /// per item; socket errors, timeouts and malformed replies fail the batch.
    pub async fn batch_call_raw(&mut self, bodies: &[Body]) -> LoadResult<Vec<Reply>> {
        if bodies.is_empty() {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let replies = self.exchange(bodies).await?;
        tracing::debug!(
            peer_id = %self.peer_id,
            bodies = bodies.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "batch done"
        );
        Ok(replies)
    }

    pub async fn close(&mut self) -> LoadResult<()> {
        self.transport.close().await
    }

    /// Writes every body, then reads exactly `bodies.len()` replies and places
    /// each by id. Replies with ids below this exchange's range belong to an
    /// abandoned earlier exchange and are skipped.
    async fn exchange(&mut self, bodies: &[Body]) -> LoadResult<Vec<Reply>> {
        let mut slots: HashMap<u64, usize> = HashMap::with_capacity(bodies.len());
        for (i, body) in bodies.iter().enumerate() {
            if slots.insert(body.id, i).is_some() {
                return Err(LoadError::InvalidInput(format!("Duplicate request id {}", body.id)));
            }
        }
        let floor = bodies.iter().map(|b| b.id).min().unwrap_or(0);

        for body in bodies {
            let frame = serde_json::to_string(body)
                .map_err(|e| LoadError::Internal(format!("Failed to encode {}: {e}", body.method)))?;
            self.transport.send(frame).await?;
        }

        let mut replies: Vec<Option<Reply>> = vec![None; bodies.len()];
        let mut remaining = bodies.len();
        while remaining > 0 {
            let frame = tokio::time::timeout(self.opts.timeout, self.transport.recv())
                .await
                .map_err(|_| LoadError::Timeout {
                    method: bodies[0].method.clone(),
                    after: self.opts.timeout,
                })??;
            let (id, reply) = parse_reply(&frame)?;

            let Some(&slot) = slots.get(&id) else {
                if id < floor {
                    tracing::debug!(id, floor, "skipping stale reply");
                    continue;
                }
                return Err(LoadError::Transport(format!("Reply with unknown id {id}")));
            };
            if replies[slot].is_some() {
                return Err(LoadError::Transport(format!("Duplicate reply for id {id}")));
            }
            replies[slot] = Some(reply);
            remaining -= 1;
        }

        replies
            .into_iter()
            .zip(bodies)
            .map(|(reply, body)| {
                reply.ok_or_else(|| LoadError::Internal(format!("Missing reply for id {}", body.id)))
            })
            .collect()
    }
}

/// Shorthand for callers that require a result: faults and nulls both error.
pub fn require(method: &str, reply: Reply) -> LoadResult<Value> {
    match reply {
        Reply::Fault(fault) => Err(fault_error(method, &fault)),
        Reply::Null => Err(LoadError::Decode(format!("{method} returned no result"))),
        other => other.into_value(method),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Answer, FakeNode};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn quick() -> ConnectionOpts {
        ConnectionOpts {
            timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
            },
        }
    }

    #[tokio::test]
    async fn establish_reads_peer_id() {
        let node = FakeNode::echo().with_peers(["peer-a"]);
        let conn = Connection::establish(node.transport(), quick()).await.unwrap();
        assert_eq!(conn.peer_id(), "peer-a");
    }

    #[tokio::test]
    async fn ids_increase_monotonically() {
        let node = FakeNode::echo();
        let mut conn = Connection::establish(node.transport(), quick()).await.unwrap();
        let a = conn.new_body("echo", vec![]);
        let b = conn.new_body("echo", vec![]);
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn batch_reassembles_reversed_replies() {
        let node = FakeNode::echo().reversed();
        let mut conn = Connection::establish(node.transport(), quick()).await.unwrap();

        let bodies: Vec<Body> = (0..5)
            .map(|i| conn.new_body("echo", vec![json!(i)]))
            .collect();
        let values = conn.batch_call(&bodies).await.unwrap();
        assert_eq!(values, (0..5).map(|i| json!([i])).collect::<Vec<_>>());
        assert_eq!(node.calls("echo"), 5);
    }

    #[tokio::test]
    async fn batch_reassembles_shuffled_replies() {
        for seed in 0..8 {
            let node = FakeNode::echo().shuffled(seed);
            let mut conn = Connection::establish(node.transport(), quick()).await.unwrap();

            let bodies: Vec<Body> = (0..32)
                .map(|i| conn.new_body("echo", vec![json!(i)]))
                .collect();
            let values = conn.batch_call(&bodies).await.unwrap();
            assert_eq!(values, (0..32).map(|i| json!([i])).collect::<Vec<_>>(), "seed {seed}");
            assert_eq!(node.batch_sizes("echo"), vec![32]);
        }
    }

    #[tokio::test]
    async fn faults_are_returned_per_item() {
        let node = FakeNode::new(|method, params| match method {
            "boom" => Answer::Fault(-32000, "execution reverted".into()),
            _ => Answer::Result(Value::Array(params.to_vec())),
        });
        let mut conn = Connection::establish(node.transport(), quick()).await.unwrap();

        let bodies = vec![
            conn.new_body("echo", vec![json!(1)]),
            conn.new_body("boom", vec![]),
        ];
        let replies = conn.batch_call_raw(&bodies).await.unwrap();
        assert!(matches!(replies[0], Reply::Value(_)));
        assert_eq!(replies[1].fault().unwrap().code, -32000);

        let bodies = vec![conn.new_body("boom", vec![])];
        assert!(matches!(conn.batch_call(&bodies).await, Err(LoadError::Rpc { .. })));
    }

    #[tokio::test]
    async fn unknown_reply_id_fails_batch() {
        let node = FakeNode::new(|method, _| match method {
            "misrouted" => Answer::Raw(r#"{"jsonrpc":"2.0","id":9999,"result":1}"#.into()),
            _ => Answer::Result(json!(1)),
        });
        let mut conn = Connection::establish(node.transport(), quick()).await.unwrap();
        let bodies = vec![conn.new_body("ok", vec![]), conn.new_body("misrouted", vec![])];
        let err = conn.batch_call_raw(&bodies).await.unwrap_err();
        assert!(matches!(err, LoadError::Transport(_)));
    }

    #[tokio::test]
    async fn stale_replies_are_skipped() {
        let node = FakeNode::new(|method, _| match method {
            "late" => Answer::Raw(r#"{"jsonrpc":"2.0","id":0,"result":"old"}"#.into()),
            _ => Answer::Result(json!("fresh")),
        });
        let mut conn = Connection::establish(node.transport(), quick()).await.unwrap();
        let bodies = vec![conn.new_body("late", vec![]), conn.new_body("ok", vec![])];
        // Only one matching reply arrives for two bodies, so the exchange
        // consumes the stale frame, then waits and times out.
        let err = conn.batch_call_raw(&bodies).await.unwrap_err();
        assert!(matches!(err, LoadError::Timeout { .. }));
    }

    #[tokio::test]
    async fn call_retries_empty_results() {
        let empties = Arc::new(AtomicUsize::new(2));
        let left = empties.clone();
        let node = FakeNode::new(move |_, params| {
            if left.load(Ordering::SeqCst) > 0 {
                left.fetch_sub(1, Ordering::SeqCst);
                Answer::Null
            } else {
                Answer::Result(Value::Array(params.to_vec()))
            }
        });
        let mut conn = Connection::establish(node.transport(), quick()).await.unwrap();

        let value = conn.call("echo", vec![json!("x")]).await.unwrap();
        assert_eq!(value, json!(["x"]));
        assert_eq!(node.calls("echo"), 3);
    }

    #[tokio::test]
    async fn call_gives_up_with_null() {
        let node = FakeNode::new(|_, _| Answer::Null);
        let mut conn = Connection::establish(node.transport(), quick()).await.unwrap();

        assert_eq!(conn.call("echo", vec![]).await.unwrap(), Value::Null);
        assert_eq!(node.calls("echo"), 4);
    }

    #[tokio::test]
    async fn transport_errors_are_not_retried() {
        let node = FakeNode::new(|_, _| Answer::Raw("garbage".into()));
        let mut conn = Connection::establish(node.transport(), quick()).await.unwrap();

        assert!(conn.call("echo", vec![]).await.is_err());
        assert_eq!(node.calls("echo"), 1);
    }

    #[tokio::test]
    async fn silent_node_times_out() {
        let node = FakeNode::new(|_, _| Answer::Silent);
        let mut conn = Connection::establish(node.transport(), quick()).await.unwrap();
        let err = conn.call_raw("stall", vec![]).await.unwrap_err();
        assert!(matches!(err, LoadError::Timeout { .. }));
    }

    #[tokio::test]
    async fn require_rejects_null() {
        assert!(matches!(require("m", Reply::Null), Err(LoadError::Decode(_))));
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        };
        for attempt in 1..=3u32 {
            let d = policy.delay(attempt);
            let floor = Duration::from_millis(200 * 2u64.pow(attempt - 1));
            assert!(d >= floor && d <= floor + Duration::from_millis(100));
        }
        assert_eq!(RetryPolicy::none().delay(1), Duration::ZERO);
    }
}
