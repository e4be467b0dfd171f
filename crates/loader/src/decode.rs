//! Node reply shapes and their conversion into domain types.

use alloy_primitives::{Bytes, B256, U256};
use hmyload_core::{Address, LoadError, LoadResult, Transaction, TransactionLog, TxStatus};
use serde::{Deserialize, Deserializer};
use serde_json::value::RawValue;

/// `hmyv2_getTransactionByHash` result.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInfo {
    pub hash: B256,
    #[serde(default)]
    pub eth_hash: Option<B256>,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(deserialize_with = "u64_quantity")]
    pub block_number: u64,
    #[serde(deserialize_with = "u64_quantity")]
    pub timestamp: u64,
    #[serde(deserialize_with = "u64_quantity")]
    pub gas: u64,
    #[serde(deserialize_with = "u256_quantity")]
    pub gas_price: U256,
    #[serde(deserialize_with = "u256_quantity")]
    pub value: U256,
    #[serde(default)]
    pub input: Bytes,
    #[serde(rename = "shardID", default)]
    pub shard_id: u32,
    #[serde(rename = "toShardID", default)]
    pub to_shard_id: u32,
}

/// `hmyv2_getTransactionReceipt` result.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: B256,
    #[serde(deserialize_with = "u64_quantity")]
    pub status: u64,
    #[serde(default)]
    pub logs: Vec<ReceiptLog>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Bytes,
    #[serde(deserialize_with = "u64_quantity")]
    pub log_index: u64,
}

/// `hmyv2_getTransactionsHistory` result with `fullTx = false`.
#[derive(Debug, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub transactions: Vec<B256>,
}

impl TxInfo {
    /// Merges this info with its receipt. The method is left unresolved.
    pub fn into_transaction(self, receipt: Receipt) -> LoadResult<Transaction> {
        if receipt.transaction_hash != self.hash
            && Some(receipt.transaction_hash) != self.eth_hash
        {
            return Err(LoadError::Decode(format!(
                "Receipt {} does not belong to {}",
                receipt.transaction_hash, self.hash
            )));
        }

        let sender = Address::parse(&self.from)?;
        let receiver = match self.to.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(to) => Some(Address::parse(to)?),
        };

        let logs = receipt
            .logs
            .into_iter()
            .map(|log| {
                let log_index = u32::try_from(log.log_index)
                    .map_err(|_| LoadError::Decode(format!("log index {} out of range", log.log_index)))?;
                Ok(TransactionLog {
                    tx_hash: self.hash,
                    log_index,
                    address: Address::parse(&log.address)?,
                    topics: log.topics.into_iter().collect(),
                    data: log.data,
                })
            })
            .collect::<LoadResult<Vec<_>>>()?;

        Ok(Transaction {
            hash: self.hash,
            eth_hash: self.eth_hash.unwrap_or(self.hash),
            sender,
            receiver,
            block_number: self.block_number,
            timestamp: self.timestamp,
            value: self.value,
            method: None,
            input: self.input,
            logs,
            status: TxStatus::from_code(receipt.status),
            gas_amount: self.gas,
            gas_price: self.gas_price,
            shard_id: self.shard_id,
            to_shard_id: self.to_shard_id,
        })
    }
}

/// Parses a quantity given either as a bare JSON number of any size, a
/// decimal string, or a `0x` hex string.
pub fn parse_quantity(text: &str) -> LoadResult<U256> {
    let text = text.trim().trim_matches('"');
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some("") => Ok(U256::ZERO),
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(text, 10),
    };
    parsed.map_err(|e| LoadError::Decode(format!("Bad quantity {text:?}: {e}")))
}

// Numbers above u64 would be rounded through f64 by serde_json, so the raw
// token text is parsed instead.
fn u256_quantity<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
    let raw = Box::<RawValue>::deserialize(d)?;
    parse_quantity(raw.get()).map_err(serde::de::Error::custom)
}

fn u64_quantity<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let value = u256_quantity(d)?;
    u64::try_from(value).map_err(|_| serde::de::Error::custom(format!("{value} does not fit in u64")))
}
