use alloy_primitives::{Bytes, B256, U256};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hmyload_core::{Address, Transaction, TransactionLog, TxStatus};
use hmyload_store::codec;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_tx(i: u64, n_logs: usize) -> Transaction {
    let hash = B256::from(U256::from(i));
    Transaction {
        hash,
        eth_hash: B256::from(U256::from(i + 1_000_000)),
        sender: Address::new([(i % 251) as u8; 20]),
        receiver: Some(Address::new([0xcf; 20])),
        block_number: 24_000_000 + i,
        timestamp: 1_650_000_000 + i,
        value: U256::from(i) * U256::from(10u64).pow(U256::from(18u64)),
        method: None,
        input: Bytes::from(vec![0x38; 4 + 32 * 5]),
        logs: (0..n_logs)
            .map(|j| TransactionLog {
                tx_hash: hash,
                log_index: j as u32,
                address: Address::new([j as u8; 20]),
                topics: smallvec::smallvec![
                    B256::repeat_byte(0xdd),
                    B256::from(U256::from(i)),
                    B256::from(U256::from(j)),
                ],
                data: Bytes::from(vec![0u8; 64]),
            })
            .collect(),
        status: TxStatus::Success,
        gas_amount: 250_000,
        gas_price: U256::from(100_000_000_000u64),
        shard_id: 0,
        to_shard_id: 0,
    }
}

// ---------------------------------------------------------------------------
// Benchmark: encode, custom layout vs reflective baselines
// ---------------------------------------------------------------------------

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for n_logs in [0, 6, 24] {
        let txs: Vec<Transaction> = (0..1_000).map(|i| make_tx(i, n_logs)).collect();

        group.bench_with_input(BenchmarkId::new("codec", n_logs), &txs, |b, txs| {
            b.iter(|| {
                for tx in txs {
                    black_box(codec::encode_transaction(tx));
                }
            });
        });
        group.bench_with_input(BenchmarkId::new("bincode", n_logs), &txs, |b, txs| {
            b.iter(|| {
                for tx in txs {
                    black_box(bincode::serialize(tx).unwrap());
                }
            });
        });
        group.bench_with_input(BenchmarkId::new("serde_json", n_logs), &txs, |b, txs| {
            b.iter(|| {
                for tx in txs {
                    black_box(serde_json::to_vec(tx).unwrap());
                }
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: decode
// ---------------------------------------------------------------------------

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for n_logs in [0, 6, 24] {
        let txs: Vec<Transaction> = (0..1_000).map(|i| make_tx(i, n_logs)).collect();
        let ours: Vec<Vec<u8>> = txs.iter().map(codec::encode_transaction).collect();
        let bin: Vec<Vec<u8>> = txs.iter().map(|t| bincode::serialize(t).unwrap()).collect();
        let json: Vec<Vec<u8>> = txs.iter().map(|t| serde_json::to_vec(t).unwrap()).collect();

        group.bench_with_input(BenchmarkId::new("codec", n_logs), &ours, |b, blobs| {
            b.iter(|| {
                for blob in blobs {
                    black_box(codec::decode_transaction(blob).unwrap());
                }
            });
        });
        group.bench_with_input(BenchmarkId::new("bincode", n_logs), &bin, |b, blobs| {
            b.iter(|| {
                for blob in blobs {
                    black_box(bincode::deserialize::<Transaction>(blob).unwrap());
                }
            });
        });
        group.bench_with_input(BenchmarkId::new("serde_json", n_logs), &json, |b, blobs| {
            b.iter(|| {
                for blob in blobs {
                    black_box(serde_json::from_slice::<Transaction>(blob).unwrap());
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
