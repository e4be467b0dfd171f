//! Compact binary layout for cached [`Transaction`] and [`Method`] records.
//!
//! Hashes, addresses and payloads are stored as raw bytes, big integers as
//! minimal big-endian byte strings, and all topics of a log as one packed
//! buffer. Every record starts with [`FORMAT_VERSION`].
//!
//! Transaction layout (v1):
//!
//! ```text
//! u8 version | hash[32] | eth_hash[32] | sender[20] | u8 has_receiver [receiver[20]]
//! u64 block | u64 timestamp | uint value | bytes input
//! u8 has_method [selector[4] str name varint n (str param)*n]
//! varint n_logs (varint index | log_hash | address[20] | bytes topics | bytes data)*n_logs
//! u8 status | u64 gas | uint gas_price | varint shard | varint to_shard
//! ```
//!
//! `u64` is little-endian, `varint` is LEB128, `bytes`/`str` are
//! varint-length-prefixed, `uint` is a one-byte length (0..=32) followed by
//! big-endian bytes. `log_hash` is a tag byte: 0 for the native hash, 1 for
//! the eth hash, 2 followed by the 32 raw bytes of any other hash.

use alloy_primitives::{Bytes, Selector, B256, U256};
use byteorder::{LittleEndian, ReadBytesExt};
use hmyload_core::{Address, LoadError, LoadResult, Method, Transaction, TransactionLog, TxStatus};
use smallvec::SmallVec;
use std::io::{Cursor, Read};

pub const FORMAT_VERSION: u8 = 1;

const TOPIC_LEN: usize = 32;

const LOG_HASH_NATIVE: u8 = 0;
const LOG_HASH_ETH: u8 = 1;
const LOG_HASH_EXPLICIT: u8 = 2;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn encode_transaction(tx: &Transaction) -> Vec<u8> {
    let mut w = Encoder::with_capacity(160 + tx.input.len() + tx.logs.len() * 128);
    w.put_u8(FORMAT_VERSION);
    w.put_raw(tx.hash.as_slice());
    w.put_raw(tx.eth_hash.as_slice());
    w.put_raw(tx.sender.as_slice());
    match &tx.receiver {
        Some(receiver) => {
            w.put_u8(1);
            w.put_raw(receiver.as_slice());
        }
        None => w.put_u8(0),
    }
    w.put_u64(tx.block_number);
    w.put_u64(tx.timestamp);
    w.put_u256(&tx.value);
    w.put_bytes(&tx.input);
    match &tx.method {
        Some(method) => {
            w.put_u8(1);
            w.put_method_body(method);
        }
        None => w.put_u8(0),
    }
    w.put_varint(tx.logs.len() as u64);
    for log in &tx.logs {
        w.put_varint(u64::from(log.log_index));
        if log.tx_hash == tx.hash {
            w.put_u8(LOG_HASH_NATIVE);
        } else if log.tx_hash == tx.eth_hash {
            w.put_u8(LOG_HASH_ETH);
        } else {
            w.put_u8(LOG_HASH_EXPLICIT);
            w.put_raw(log.tx_hash.as_slice());
        }
        w.put_raw(log.address.as_slice());
        w.put_varint((log.topics.len() * TOPIC_LEN) as u64);
        for topic in &log.topics {
            w.put_raw(topic.as_slice());
        }
        w.put_bytes(&log.data);
    }
    w.put_u8(tx.status.code());
    w.put_u64(tx.gas_amount);
    w.put_u256(&tx.gas_price);
    w.put_varint(u64::from(tx.shard_id));
    w.put_varint(u64::from(tx.to_shard_id));
    w.finish()
}

pub fn decode_transaction(data: &[u8]) -> LoadResult<Transaction> {
    let mut r = Cursor::new(data);
    r.read_version()?;

    let hash = r.read_b256()?;
    let eth_hash = r.read_b256()?;
    let sender = r.read_address()?;
    let receiver = if r.read_flag("receiver")? {
        Some(r.read_address()?)
    } else {
        None
    };
    let block_number = r.read_u64_le()?;
    let timestamp = r.read_u64_le()?;
    let value = r.read_u256()?;
    let input = Bytes::from(r.read_bytes()?);
    let method = if r.read_flag("method")? {
        Some(r.read_method_body()?)
    } else {
        None
    };

    let log_count = r.read_len()?;
    let mut logs = Vec::with_capacity(log_count.min(r.remaining()));
    for _ in 0..log_count {
        let log_index = u32::try_from(r.read_varint()?)
            .map_err(|_| LoadError::decode("log index exceeds u32"))?;
        let tx_hash = match r.read_u8_checked()? {
            LOG_HASH_NATIVE => hash,
            LOG_HASH_ETH => eth_hash,
            LOG_HASH_EXPLICIT => r.read_b256()?,
            other => return Err(LoadError::Decode(format!("invalid log hash tag {other}"))),
        };
        let address = r.read_address()?;
        let topics = split_topics(&r.read_bytes()?)?;
        let data = Bytes::from(r.read_bytes()?);
        logs.push(TransactionLog {
            tx_hash,
            log_index,
            address,
            topics,
            data,
        });
    }

    let status = match r.read_u8_checked()? {
        0 => TxStatus::Failed,
        1 => TxStatus::Success,
        other => return Err(LoadError::Decode(format!("invalid status byte {other}"))),
    };
    let gas_amount = r.read_u64_le()?;
    let gas_price = r.read_u256()?;
    let shard_id = r.read_u32_varint()?;
    let to_shard_id = r.read_u32_varint()?;
    r.expect_end()?;

    Ok(Transaction {
        hash,
        eth_hash,
        sender,
        receiver,
        block_number,
        timestamp,
        value,
        method,
        input,
        logs,
        status,
        gas_amount,
        gas_price,
        shard_id,
        to_shard_id,
    })
}

pub fn encode_method(method: &Method) -> Vec<u8> {
    let mut w = Encoder::with_capacity(16 + method.name.len() + method.parameters.len() * 8);
    w.put_u8(FORMAT_VERSION);
    w.put_method_body(method);
    w.finish()
}

pub fn decode_method(data: &[u8]) -> LoadResult<Method> {
    let mut r = Cursor::new(data);
    r.read_version()?;
    let method = r.read_method_body()?;
    r.expect_end()?;
    Ok(method)
}

/// Re-splits a packed topics buffer on 32-byte boundaries.
pub fn split_topics(packed: &[u8]) -> LoadResult<SmallVec<[B256; 4]>> {
    if packed.len() % TOPIC_LEN != 0 {
        return Err(LoadError::Decode(format!(
            "topics buffer of {} bytes is not a multiple of {TOPIC_LEN}",
            packed.len()
        )));
    }
    Ok(packed.chunks_exact(TOPIC_LEN).map(B256::from_slice).collect())
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    #[inline]
    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn put_varint(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_varint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Minimal big-endian form; zero is the empty string.
    fn put_u256(&mut self, v: &U256) {
        let bytes = v.to_be_bytes_trimmed_vec();
        self.buf.push(bytes.len() as u8);
        self.buf.extend_from_slice(&bytes);
    }

    fn put_method_body(&mut self, method: &Method) {
        self.put_raw(method.signature.as_slice());
        self.put_bytes(method.name.as_bytes());
        self.put_varint(method.parameters.len() as u64);
        for param in &method.parameters {
            self.put_bytes(param.as_bytes());
        }
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

fn eof(e: std::io::Error) -> LoadError {
    LoadError::Decode(format!("truncated record: {e}"))
}

trait RecordRead: Read {
    fn remaining(&self) -> usize;

    #[inline]
    fn read_u8_checked(&mut self) -> LoadResult<u8> {
        ReadBytesExt::read_u8(self).map_err(eof)
    }

    #[inline]
    fn read_u64_le(&mut self) -> LoadResult<u64> {
        ReadBytesExt::read_u64::<LittleEndian>(self).map_err(eof)
    }

    fn read_version(&mut self) -> LoadResult<()> {
        match self.read_u8_checked()? {
            FORMAT_VERSION => Ok(()),
            v => Err(LoadError::Decode(format!("unknown record version {v}"))),
        }
    }

    fn read_flag(&mut self, field: &str) -> LoadResult<bool> {
        match self.read_u8_checked()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(LoadError::Decode(format!("invalid {field} flag {v}"))),
        }
    }

    fn read_varint(&mut self) -> LoadResult<u64> {
        let mut n = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8_checked()?;
            if shift == 63 && byte > 1 {
                return Err(LoadError::decode("varint overflows u64"));
            }
            n |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(n);
            }
            shift += 7;
            if shift > 63 {
                return Err(LoadError::decode("varint overflows u64"));
            }
        }
    }

    fn read_u32_varint(&mut self) -> LoadResult<u32> {
        u32::try_from(self.read_varint()?).map_err(|_| LoadError::decode("varint exceeds u32"))
    }

    /// A length prefix, bounded by what is left in the record.
    fn read_len(&mut self) -> LoadResult<usize> {
        let len = self.read_varint()?;
        if len > self.remaining() as u64 {
            return Err(LoadError::Decode(format!(
                "length {len} exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        Ok(len as usize)
    }

    fn read_exact_vec(&mut self, len: usize) -> LoadResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).map_err(eof)?;
        Ok(buf)
    }

    fn read_bytes(&mut self) -> LoadResult<Vec<u8>> {
        let len = self.read_len()?;
        self.read_exact_vec(len)
    }

    fn read_string(&mut self) -> LoadResult<String> {
        String::from_utf8(self.read_bytes()?)
            .map_err(|e| LoadError::Decode(format!("invalid utf-8 string: {e}")))
    }

    #[inline]
    fn read_b256(&mut self) -> LoadResult<B256> {
        let mut arr = [0u8; 32];
        self.read_exact(&mut arr).map_err(eof)?;
        Ok(B256::from(arr))
    }

    #[inline]
    fn read_address(&mut self) -> LoadResult<Address> {
        let mut arr = [0u8; 20];
        self.read_exact(&mut arr).map_err(eof)?;
        Ok(Address::new(arr))
    }

    fn read_u256(&mut self) -> LoadResult<U256> {
        let len = self.read_u8_checked()? as usize;
        if len > 32 {
            return Err(LoadError::Decode(format!(
                "integer of {len} bytes exceeds 256 bits"
            )));
        }
        let bytes = self.read_exact_vec(len)?;
        U256::try_from_be_slice(&bytes)
            .ok_or_else(|| LoadError::decode("integer exceeds 256 bits"))
    }

    fn read_method_body(&mut self) -> LoadResult<Method> {
        let mut sig = [0u8; 4];
        self.read_exact(&mut sig).map_err(eof)?;
        let name = self.read_string()?;
        let count = self.read_len()?;
        let mut parameters = Vec::with_capacity(count);
        for _ in 0..count {
            parameters.push(self.read_string()?);
        }
        Ok(Method {
            signature: Selector::from(sig),
            name,
            parameters,
        })
    }

    fn expect_end(&self) -> LoadResult<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(LoadError::Decode(format!("{n} trailing bytes after record"))),
        }
    }
}

impl RecordRead for Cursor<&[u8]> {
    #[inline]
    fn remaining(&self) -> usize {
        self.get_ref().len().saturating_sub(self.position() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_tx() -> Transaction {
        let hash = B256::repeat_byte(0x11);
        Transaction {
            hash,
            eth_hash: B256::repeat_byte(0x22),
            sender: Address::new([0x33; 20]),
            receiver: Some(Address::new([0x44; 20])),
            block_number: 24_658_150,
            timestamp: 1_650_000_000,
            value: U256::from(10u64).pow(U256::from(18u64)),
            method: None,
            input: Bytes::from_static(&[0xa9, 0x05, 0x9c, 0xbb, 0x00, 0x01]),
            logs: vec![TransactionLog {
                tx_hash: hash,
                log_index: 3,
                address: Address::new([0x55; 20]),
                topics: smallvec::smallvec![B256::repeat_byte(0xdd), B256::repeat_byte(0xee)],
                data: Bytes::from_static(&[1, 2, 3]),
            }],
            status: TxStatus::Success,
            gas_amount: 21_000,
            gas_price: U256::from(100_000_000_000u64),
            shard_id: 0,
            to_shard_id: 0,
        }
    }

    #[test]
    fn transaction_round_trip() {
        let tx = sample_tx();
        assert_eq!(decode_transaction(&encode_transaction(&tx)).unwrap(), tx);
    }

    #[test]
    fn edge_values_round_trip() {
        let mut tx = sample_tx();
        tx.value = U256::ZERO;
        tx.gas_price = U256::MAX;
        tx.receiver = None;
        tx.logs.clear();
        tx.input = Bytes::new();
        assert_eq!(decode_transaction(&encode_transaction(&tx)).unwrap(), tx);

        // Single log carrying only the event signature topic.
        let mut tx = sample_tx();
        tx.logs[0].topics.truncate(1);
        tx.logs[0].data = Bytes::new();
        assert_eq!(decode_transaction(&encode_transaction(&tx)).unwrap(), tx);
    }

    #[test]
    fn log_hash_survives_in_every_form() {
        let tx = sample_tx();
        let foreign = B256::repeat_byte(0x77);
        for log_hash in [tx.hash, tx.eth_hash, foreign] {
            let mut tx = tx.clone();
            tx.logs[0].tx_hash = log_hash;
            let decoded = decode_transaction(&encode_transaction(&tx)).unwrap();
            assert_eq!(decoded.logs[0].tx_hash, log_hash);
            assert_eq!(decoded, tx);
        }

        // Only a hash outside the record costs extra bytes.
        let mut eth = tx.clone();
        eth.logs[0].tx_hash = tx.eth_hash;
        let mut other = tx.clone();
        other.logs[0].tx_hash = foreign;
        assert_eq!(encode_transaction(&eth).len(), encode_transaction(&tx).len());
        assert_eq!(encode_transaction(&other).len(), encode_transaction(&tx).len() + 32);
    }

    #[test]
    fn rejects_unknown_log_hash_tag() {
        let tx = sample_tx();
        let mut bytes = encode_transaction(&tx);
        // version, hashes, sender, receiver flag + receiver, block, timestamp.
        let mut at = 1 + 32 + 32 + 20 + 1 + 20 + 8 + 8;
        at += 1 + tx.value.to_be_bytes_trimmed_vec().len();
        at += 1 + tx.input.len();
        at += 1; // no method
        at += 1; // log count
        at += 1; // log index
        assert_eq!(bytes[at], LOG_HASH_NATIVE);
        bytes[at] = 9;
        let err = decode_transaction(&bytes).unwrap_err();
        assert!(matches!(err, LoadError::Decode(m) if m.contains("log hash tag")));
    }

    #[test]
    fn zero_value_is_stored_empty() {
        let mut w = Encoder::with_capacity(1);
        w.put_u256(&U256::ZERO);
        assert_eq!(w.finish(), vec![0u8]);
    }

    #[test]
    fn method_with_resolved_name_round_trips_inside_transaction() {
        let mut tx = sample_tx();
        tx.method = Some(Method {
            signature: Selector::from([0xa9, 0x05, 0x9c, 0xbb]),
            name: "transfer".into(),
            parameters: vec!["address".into(), "uint256".into()],
        });
        assert_eq!(decode_transaction(&encode_transaction(&tx)).unwrap(), tx);
    }

    #[test]
    fn rejects_unaligned_topics() {
        assert!(split_topics(&[0u8; 64]).is_ok());
        let err = split_topics(&[0u8; 33]).unwrap_err();
        assert!(matches!(err, LoadError::Decode(_)));
    }

    #[test]
    fn rejects_oversized_integer() {
        let mut data = vec![FORMAT_VERSION, 0xaa, 0xbb, 0xcc, 0xdd];
        data.extend_from_slice(&[0]); // empty name
        data.extend_from_slice(&[0]); // no params
        assert!(decode_method(&data).is_ok());

        let mut r = Cursor::new(&[33u8, 0, 0][..]);
        assert!(r.read_u256().is_err());
    }

    #[test]
    fn rejects_truncated_and_trailing_bytes() {
        let bytes = encode_transaction(&sample_tx());
        assert!(decode_transaction(&bytes[..bytes.len() - 1]).is_err());

        let mut extended = bytes.clone();
        extended.push(0);
        assert!(decode_transaction(&extended).is_err());
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = encode_transaction(&sample_tx());
        bytes[0] = 9;
        assert!(decode_transaction(&bytes).is_err());
        assert!(decode_transaction(&[]).is_err());
    }

    #[test]
    fn varint_boundaries() {
        for v in [0u64, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut w = Encoder::with_capacity(10);
            w.put_varint(v);
            let buf = w.finish();
            let mut r = Cursor::new(buf.as_slice());
            assert_eq!(r.read_varint().unwrap(), v);
            assert_eq!(r.remaining(), 0);
        }
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    fn arb_u256() -> impl Strategy<Value = U256> {
        prop_oneof![
            Just(U256::ZERO),
            Just(U256::MAX),
            any::<u64>().prop_map(U256::from),
            any::<[u8; 32]>().prop_map(U256::from_be_bytes),
        ]
    }

    fn arb_address() -> impl Strategy<Value = Address> {
        any::<[u8; 20]>().prop_map(Address::new)
    }

    fn arb_method() -> impl Strategy<Value = Method> {
        (
            any::<[u8; 4]>(),
            "[a-zA-Z_][a-zA-Z0-9_]{0,24}",
            prop::collection::vec("(address|uint256|bytes32|bool|string)", 0..5),
        )
            .prop_map(|(sig, name, parameters)| Method {
                signature: Selector::from(sig),
                name,
                parameters,
            })
    }

    /// Which hash a log points at: 0 native, 1 eth, otherwise the given one.
    fn arb_log_hash() -> impl Strategy<Value = (u8, [u8; 32])> {
        (0u8..3, any::<[u8; 32]>())
    }

    #[allow(clippy::type_complexity)]
    fn arb_log() -> impl Strategy<Value = ((u8, [u8; 32]), u32, Address, Vec<[u8; 32]>, Vec<u8>)> {
        (
            arb_log_hash(),
            any::<u32>(),
            arb_address(),
            prop::collection::vec(any::<[u8; 32]>(), 0..5),
            prop::collection::vec(any::<u8>(), 0..96),
        )
    }

    fn arb_transaction() -> impl Strategy<Value = Transaction> {
        let header = (
            any::<[u8; 32]>(),
            any::<[u8; 32]>(),
            arb_address(),
            prop::option::of(arb_address()),
            any::<u64>(),
            any::<u64>(),
        );
        let body = (
            arb_u256(),
            prop::option::of(arb_method()),
            prop::collection::vec(any::<u8>(), 0..128),
            prop::collection::vec(arb_log(), 0..4),
        );
        let tail = (
            any::<bool>(),
            any::<u64>(),
            arb_u256(),
            any::<u32>(),
            any::<u32>(),
        );
        (header, body, tail).prop_map(
            |(
                (hash, eth_hash, sender, receiver, block_number, timestamp),
                (value, method, input, logs),
                (success, gas_amount, gas_price, shard_id, to_shard_id),
            )| {
                let hash = B256::from(hash);
                let eth_hash = B256::from(eth_hash);
                Transaction {
                    hash,
                    eth_hash,
                    sender,
                    receiver,
                    block_number,
                    timestamp,
                    value,
                    method,
                    input: Bytes::from(input),
                    logs: logs
                        .into_iter()
                        .map(|((which, other), log_index, address, topics, data)| TransactionLog {
                            tx_hash: match which {
                                0 => hash,
                                1 => eth_hash,
                                _ => B256::from(other),
                            },
                            log_index,
                            address,
                            topics: topics.into_iter().map(B256::from).collect(),
                            data: Bytes::from(data),
                        })
                        .collect(),
                    status: if success {
                        TxStatus::Success
                    } else {
                        TxStatus::Failed
                    },
                    gas_amount,
                    gas_price,
                    shard_id,
                    to_shard_id,
                }
            },
        )
    }

    proptest! {
        #[test]
        fn any_transaction_round_trips(tx in arb_transaction()) {
            prop_assert_eq!(decode_transaction(&encode_transaction(&tx)).unwrap(), tx);
        }

        #[test]
        fn any_method_round_trips(method in arb_method()) {
            prop_assert_eq!(decode_method(&encode_method(&method)).unwrap(), method);
        }

        #[test]
        fn truncation_never_panics(tx in arb_transaction(), cut in 0usize..64) {
            let bytes = encode_transaction(&tx);
            let end = bytes.len().saturating_sub(cut + 1);
            prop_assert!(decode_transaction(&bytes[..end]).is_err());
        }
    }
}
