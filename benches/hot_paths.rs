use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use httpscope::config::{HttpConfig, ReplaceRule};
use httpscope::http::parse::{encode_batch, parse_batch};
use httpscope::http::statkeeper::StatKeeper;
use httpscope::http::telemetry::Telemetry;
use httpscope::http::types::{ConnTuple, HttpBatch, HttpTransaction, Method, HTTP_BATCH_SIZE};

fn transaction(i: u32) -> HttpTransaction {
    let mut tx = HttpTransaction {
        tup: ConnTuple {
            saddr_l: u64::from(u32::from_le_bytes([10, 0, 0, (i % 8) as u8 + 1])),
            daddr_l: u64::from(u32::from_le_bytes([10, 0, 1, 1])),
            sport: 40_000 + (i % 64) as u16,
            dport: 8080,
            metadata: 1,
            ..Default::default()
        },
        request_started: 1_000_000,
        request_method: Method::Get as u8,
        response_status_code: if i % 11 == 0 { 503 } else { 200 },
        response_last_seen: 1_000_000 + u64::from(i % 97) * 10_000,
        tcp_seq: i,
        ..Default::default()
    };
    let fragment = format!("GET /api/v1/orders/{} HTTP/1.1\r\nHost: shop\r\n", i % 500);
    tx.request_fragment[..fragment.len()].copy_from_slice(fragment.as_bytes());
    tx
}

fn full_batch() -> HttpBatch {
    HttpBatch {
        idx: 42,
        pos: HTTP_BATCH_SIZE as u8,
        txs: (0..HTTP_BATCH_SIZE as u32).map(transaction).collect(),
    }
}

fn bench_parse_batch(c: &mut Criterion) {
    let batch = full_batch();
    let raw = encode_batch(&batch);

    c.bench_function("parse_batch/full", |b| {
        b.iter(|| parse_batch(black_box(&raw)).expect("parse batch"))
    });

    c.bench_function("encode_batch/full", |b| {
        b.iter(|| black_box(encode_batch(black_box(&batch))).len())
    });
}

fn bench_statkeeper(c: &mut Criterion) {
    let cfg = HttpConfig {
        replace_rules: vec![ReplaceRule {
            pattern: "/orders/[0-9]+".to_string(),
            repl: "/orders/:id".to_string(),
        }],
        ..Default::default()
    };
    let records: Vec<HttpTransaction> = (0..1_024).map(transaction).collect();

    c.bench_function("statkeeper/process_1024", |b| {
        b.iter_batched(
            || {
                (
                    StatKeeper::new(&cfg).expect("statkeeper"),
                    Telemetry::new(),
                    records.clone(),
                )
            },
            |(mut keeper, mut telemetry, records)| {
                keeper.process(records, &mut telemetry);
                black_box(keeper.len())
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_batch(c);
    bench_statkeeper(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
