// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use di_dispatch::async_svc::spawn as dispatch_spawn;
use di_dispatch::{DispatchConfig, DispatchError, Handler};
use di_types::{u64_to_hash32, Invoice, InvoiceResult, PaymentHash};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Parser, Debug)]
#[command(name = "di-node", about = "dynamic invoice dispatcher utilities")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Dispatcher mit synthetischen Handlern unter Last fahren
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Anzahl responsiver Handler
    #[arg(long, default_value_t = 2)]
    handlers: u64,
    /// Zusätzliche stumme Handler (lesen nie, antworten nie)
    #[arg(long, default_value_t = 1)]
    silent: u64,
    /// Preimages je responsivem Handler
    #[arg(long, default_value_t = 16)]
    invoices_per_handler: u64,
    /// Anzahl Lookups (bekannte und unbekannte Hashes gemischt)
    #[arg(long, default_value_t = 100)]
    queries: u64,
    /// Timeout je Lookup in Millisekunden
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
}

/// Synthetischer Handler: beantwortet Hashes aus seinem Preimage-Bestand,
/// alles andere negativ.
fn stock_handler(preimage_seeds: std::ops::Range<u64>, label: u64) -> Handler {
    let mut stock: HashMap<PaymentHash, Invoice> = HashMap::new();
    for seed in preimage_seeds {
        let preimage = u64_to_hash32(seed);
        let r_hash = PaymentHash::from_preimage(&preimage);
        stock.insert(
            r_hash,
            Invoice {
                r_hash: r_hash.0,
                r_preimage: preimage.to_vec(),
                memo: format!("sim handler {label} seed {seed}"),
            },
        );
    }
    let (req_tx, mut req_rx) = mpsc::channel::<PaymentHash>(16);
    let (rez_tx, rez_rx) = mpsc::channel::<InvoiceResult>(16);
    tokio::spawn(async move {
        while let Some(r_hash) = req_rx.recv().await {
            let rez = InvoiceResult {
                r_hash,
                invoice: stock.get(&r_hash).cloned(),
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

fn mute_handler() -> Handler {
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

async fn simulate(args: SimulateArgs) -> Result<()> {
    let (svc, handle) = dispatch_spawn(DispatchConfig::default());

    let mut known: Vec<PaymentHash> = Vec::new();
    for h in 0..args.handlers {
        let base = h * args.invoices_per_handler;
        let seeds = base..base + args.invoices_per_handler;
        known.extend(seeds.clone().map(|s| PaymentHash::from_preimage(&u64_to_hash32(s))));
        let id = svc.register_handler(stock_handler(seeds, h)).await?;
        info!(
            handler_id = id.0,
            invoices = args.invoices_per_handler,
            "registered responsive handler"
        );
    }
    for _ in 0..args.silent {
        let id = svc.register_handler(mute_handler()).await?;
        info!(handler_id = id.0, "registered silent handler");
    }

    // bekannte Hashes plus ein Viertel unbekannte, zyklisch abgefragt
    let unknown = (known.len() as u64 / 4).max(1);
    let span = known.len() as u64 + unknown;
    let timeout = Duration::from_millis(args.timeout_ms);

    let mut found = 0u64;
    let mut not_found = 0u64;
    let mut timed_out = 0u64;
    let mut failed = 0u64;
    for i in 0..args.queries {
        let seed = i % span;
        let r_hash = known
            .get(seed as usize)
            .copied()
            .unwrap_or_else(|| PaymentHash::from_preimage(&u64_to_hash32(1_000_000 + seed)));
        match svc.get_invoice(r_hash, timeout).await {
            Ok(invoice) => {
                found += 1;
                debug!(hash = %hex::encode(r_hash.0), memo = %invoice.memo, "lookup hit");
            }
            Err(DispatchError::NotFound) => not_found += 1,
            Err(DispatchError::Timeout) => {
                timed_out += 1;
                debug!(hash = %hex::encode(r_hash.0), "lookup timed out");
            }
            Err(err) => {
                failed += 1;
                warn!(%err, "lookup failed");
            }
        }
    }

    svc.stop();
    let _ = handle.await;

    println!(
        "simulate: {} lookups, {} found, {} not-found, {} timeout, {} failed",
        args.queries, found, not_found, timed_out, failed
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Simulate(args) => simulate(args).await,
    }
}
