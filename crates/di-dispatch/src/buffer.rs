// SPDX-License-Identifier: AGPL-3.0-only

//! Elastic Buffer: unbegrenzter FIFO-Adapter vor einem begrenzten
//! Downstream-Sink. Der Producer blockiert nie auf Downstream-Readiness,
//! nur auf die Ein-Schritt-Übergabe an den Worker. Bevorzugt sparsam
//! einsetzen; hier nötig, damit ein hängender Handler weder den
//! Dispatcher noch seine Geschwister blockiert.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use di_types::PaymentHash;
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// Handle auf einen laufenden Buffer-Worker.
///
/// Schließ-Verhalten (genau ein Close des Downstream-Sinks):
/// 1. Werden alle Input-Sender gedroppt, sendet der Worker den Rückstand
///    zu Ende und schließt dann den Downstream-Sink.
/// 2. `force_close` schließt den Downstream-Sink sofort und verwirft den
///    Rückstand; nur der erste Aufruf wirkt.
pub struct ElasticBuffer {
    backlog_len: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
}

impl ElasticBuffer {
    /// Startet den Worker um `downstream` und liefert das Handle plus den
    /// Input-Sender (Kapazität 1: reine Übergabe, kein Puffer).
    pub fn new(downstream: mpsc::Sender<PaymentHash>) -> (Self, mpsc::Sender<PaymentHash>) {
        let (input_tx, input_rx) = mpsc::channel(1);
        let backlog_len = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let close_notify = Arc::new(Notify::new());
        tokio::spawn(run_buffer_loop(
            input_rx,
            downstream,
            backlog_len.clone(),
            close_notify.clone(),
        ));
        (
            Self {
                backlog_len,
                closed,
                close_notify,
            },
            input_tx,
        )
    }

    /// Aktueller Rückstand. Eventual consistent: Enqueues werden erst
    /// sichtbar, wenn der Worker sie übernommen hat. Nach Terminierung 0.
    pub fn len(&self) -> usize {
        self.backlog_len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Downstream sofort schließen, Rückstand verwerfen. Idempotent.
    pub fn force_close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_notify.notify_one();
        }
    }
}

async fn run_buffer_loop(
    mut input: mpsc::Receiver<PaymentHash>,
    out: mpsc::Sender<PaymentHash>,
    backlog_len: Arc<AtomicUsize>,
    close_notify: Arc<Notify>,
) {
    let mut backlog: VecDeque<PaymentHash> = VecDeque::new();
    let mut input_closed = false;
    loop {
        // Vier Situationen nach zwei Kriterien:
        // 1. Input geschlossen? Dann kann nur noch der Rückstand gesendet
        //    werden; ist er leer, terminieren.
        // 2. Rückstand leer? Dann gibt es nichts für den Downstream-Zweig.
        if input_closed && backlog.is_empty() {
            break;
        }
        tokio::select! {
            maybe = input.recv(), if !input_closed => {
                match maybe {
                    Some(r_hash) => {
                        backlog.push_back(r_hash);
                        backlog_len.store(backlog.len(), Ordering::Relaxed);
                    }
                    None => input_closed = true,
                }
            }
            permit = out.reserve(), if !backlog.is_empty() => {
                match permit {
                    Ok(permit) => {
                        if let Some(r_hash) = backlog.pop_front() {
                            permit.send(r_hash);
                        }
                        backlog_len.store(backlog.len(), Ordering::Relaxed);
                    }
                    // Empfängerseite weg; es gibt niemanden mehr zum Zustellen
                    Err(_) => break,
                }
            }
            _ = close_notify.notified() => {
                backlog.clear();
                break;
            }
        }
    }
    backlog_len.store(0, Ordering::Relaxed);
    // Drop von `out` schließt den Downstream-Sink genau einmal
}
