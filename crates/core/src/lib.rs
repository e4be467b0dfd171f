//! Domain models, shared types, and error definitions.
//!
//! Foundation crate -- no async or I/O dependencies.

pub mod address;
pub mod error;
pub mod types;

pub use address::Address;
pub use error::{LoadError, LoadResult};
pub use types::{Method, Token, Transaction, TransactionLog, TxStatus};

pub use alloy_primitives::{Bytes, Selector, B256, U256};
