//! Harmony data loader: wallet histories, full transactions, token metadata
//! and method signatures, cached on disk and fetched over a pooled
//! JSON-RPC connection set.

pub mod abi;
pub mod decode;
pub mod loader;
pub mod opts;
pub mod plan;
pub mod workers;

pub use hmyload_core::{Address, LoadError, LoadResult, Method, Token, Transaction, TransactionLog, TxStatus};
pub use hmyload_provider::{RetryPolicy, SignatureDirectory};
pub use hmyload_store::{Cache, CacheRegistry};
pub use loader::{Loader, MethodReport};
pub use opts::LoaderOpts;
