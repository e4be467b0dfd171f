//! Domain types for hmyload.

use crate::address::Address;
use alloy_primitives::{Bytes, Selector, B256, U256};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

/// A smart contract method resolved from its 4-byte selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Method {
    pub signature: Selector,
    pub name: String,
    /// Solidity parameter types in declaration order, e.g. `["address", "uint256"]`.
    pub parameters: Vec<String>,
}

impl Method {
    /// Splits a text signature such as `transfer(address,uint256)`.
    pub fn from_text_signature(signature: Selector, text: &str) -> Option<Self> {
        let open = text.find('(')?;
        let name = text[..open].trim();
        if name.is_empty() {
            return None;
        }
        let params = text[open..].trim_start_matches('(').trim_end_matches(')');
        let parameters = if params.is_empty() {
            Vec::new()
        } else {
            params.split(',').map(|p| p.trim().to_string()).collect()
        };
        Some(Self {
            signature,
            name: name.to_string(),
            parameters,
        })
    }

    /// `name(type,type)` form.
    pub fn text_signature(&self) -> String {
        format!("{}({})", self.name, self.parameters.join(","))
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// HRC-20 token metadata.
///
/// `decimals` is `None` when the contract did not answer `decimals()`, which
/// marks the address as "not a token"; name and symbol are empty then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub address: Address,
    pub name: String,
    pub symbol: String,
    pub decimals: Option<u8>,
}

impl Token {
    pub fn not_a_token(address: Address) -> Self {
        Self {
            address,
            name: String::new(),
            symbol: String::new(),
            decimals: None,
        }
    }

    pub fn is_token(&self) -> bool {
        self.decimals.is_some()
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Receipt status. Harmony reports `1` for success and `0` for failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TxStatus {
    #[default]
    Failed = 0,
    Success = 1,
}

impl TxStatus {
    pub fn from_code(code: u64) -> Self {
        if code == 1 {
            Self::Success
        } else {
            Self::Failed
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One event emitted during a transaction.
///
/// Most logs carry at most four topics, so they stay inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLog {
    pub tx_hash: B256,
    pub log_index: u32,
    pub address: Address,
    pub topics: SmallVec<[B256; 4]>,
    pub data: Bytes,
}

/// A fully resolved transaction: info plus receipt.
///
/// `hash` is the native Harmony hash and the canonical cache key;
/// `eth_hash` is the Ethereum-compatible hash of the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: B256,
    pub eth_hash: B256,
    pub sender: Address,
    /// `None` for contract creation.
    pub receiver: Option<Address>,
    pub block_number: u64,
    pub timestamp: u64,
    pub value: U256,
    /// Filled in by method resolution; `None` until then or when unknown.
    pub method: Option<Method>,
    pub input: Bytes,
    pub logs: Vec<TransactionLog>,
    pub status: TxStatus,
    pub gas_amount: u64,
    pub gas_price: U256,
    pub shard_id: u32,
    pub to_shard_id: u32,
}

impl Transaction {
    /// The 4-byte method selector, if the input is long enough to carry one.
    pub fn selector(&self) -> Option<Selector> {
        if self.input.len() < 4 {
            return None;
        }
        Some(Selector::from_slice(&self.input[..4]))
    }

    pub fn is_success(&self) -> bool {
        self.status == TxStatus::Success
    }

    /// Whether `hash` names this transaction in either form.
    pub fn matches(&self, hash: &B256) -> bool {
        &self.hash == hash || &self.eth_hash == hash
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (block {})", self.hash, self.block_number)
    }
}
