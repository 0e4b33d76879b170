// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]

use criterion::{criterion_group, criterion_main, Criterion};
use di_dispatch::async_svc::spawn as dispatch_spawn;
use di_dispatch::{DispatchConfig, Handler};
use di_types::{u64_to_hash32, Invoice, InvoiceResult, PaymentHash};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

static CTR: AtomicU64 = AtomicU64::new(0);

const PREIMAGE_COUNT: u64 = 1024;

fn bench_config() -> Criterion {
    Criterion::default()
        .sample_size(30)
        .measurement_time(Duration::from_secs(20))
}

fn map_handler(preimages: &[[u8; 32]]) -> Handler {
    let mut by_hash: HashMap<PaymentHash, Invoice> = HashMap::new();
    for preimage in preimages {
        let r_hash = PaymentHash::from_preimage(preimage);
        by_hash.insert(
            r_hash,
            Invoice {
                r_hash: r_hash.0,
                r_preimage: preimage.to_vec(),
                memo: String::new(),
            },
        );
    }
    let (req_tx, mut req_rx) = mpsc::channel::<PaymentHash>(16);
    let (rez_tx, rez_rx) = mpsc::channel::<InvoiceResult>(16);
    tokio::spawn(async move {
        while let Some(r_hash) = req_rx.recv().await {
            let rez = InvoiceResult {
                r_hash,
                invoice: by_hash.get(&r_hash).cloned(),
            };
            if rez_tx.send(rez).await.is_err() {
                break;
            }
        }
    });
    Handler {
        request_sink: Some(req_tx),
        result_source: Some(rez_rx),
    }
}

fn silent_handler() -> Handler {
    let (req_tx, req_rx) = mpsc::channel::<PaymentHash>(1);
    let (rez_tx, rez_rx) = mpsc::channel::<InvoiceResult>(1);
    tokio::spawn(async move {
        let _keep_open = (req_rx, rez_tx);
        std::future::pending::<()>().await;
    });
    Handler {
        request_sink: Some(req_tx),
        result_source: Some(rez_rx),
    }
}

fn bench_lookup_under_silent_backlog(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("dispatch_lookup_with_silent_handler_backlog", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let (svc, handle) = dispatch_spawn(DispatchConfig::default());
            let preimages: Vec<[u8; 32]> = (0..PREIMAGE_COUNT).map(u64_to_hash32).collect();
            svc.register_handler(map_handler(&preimages)).await.unwrap();
            // Der stumme Handler liest nie; sein Elastic Buffer sammelt
            // den kompletten Rückstand ein.
            svc.register_handler(silent_handler()).await.unwrap();

            let mut elapsed_total = Duration::ZERO;
            for _ in 0..iters {
                // Rückstand beim stummen Handler aufbauen
                for _ in 0..256 {
                    let ctr = CTR.fetch_add(1, Ordering::Relaxed);
                    let r_hash =
                        PaymentHash::from_preimage(&u64_to_hash32(ctr % PREIMAGE_COUNT));
                    let _ = svc.get_invoice(r_hash, Duration::from_secs(2)).await;
                }

                let ctr = CTR.fetch_add(1, Ordering::Relaxed);
                let r_hash = PaymentHash::from_preimage(&u64_to_hash32(ctr % PREIMAGE_COUNT));
                let start_i = Instant::now();
                let got = svc.get_invoice(r_hash, Duration::from_secs(2)).await;
                assert!(got.is_ok(), "expected invoice under backlog");
                elapsed_total += start_i.elapsed();
            }

            svc.stop();
            let _ = handle.await;

            elapsed_total
        })
    });
}

criterion_group!(
    name = benches;
    config = bench_config();
    targets = bench_lookup_under_silent_backlog
);
criterion_main!(benches);
