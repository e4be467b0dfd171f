//! JSON-RPC plumbing for hmyload: transports, connections, the connection
//! pool, and the method signature directory.

pub mod body;
pub mod connection;
pub mod directory;
pub mod pool;
pub mod ws;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use async_trait::async_trait;
use hmyload_core::LoadResult;

pub use body::{Body, Reply, RpcFault};
pub use connection::{Connection, ConnectionOpts, RetryPolicy};
pub use directory::{FourByteDirectory, SignatureDirectory};
pub use pool::{Pool, SharedConnection};
pub use ws::WsConnector;

/// A duplex, text-framed channel to a node.
///
/// Frames are whole JSON documents. `recv` blocks until the next frame; the
/// caller bounds it with a deadline.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: String) -> LoadResult<()>;
    async fn recv(&mut self) -> LoadResult<String>;
    async fn close(&mut self) -> LoadResult<()>;
}

/// Opens new transports to one endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> LoadResult<Box<dyn Transport>>;
    fn endpoint(&self) -> &str;
}
