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

//! Dynamic Invoice Resolution Dispatcher: nimmt Payment-Hash-Anfragen an,
//! fächert sie an eine dynamische Menge registrierter Handler auf,
//! korreliert deren asynchrone Antworten und beantwortet jeden wartenden
//! Aufruf genau einmal (Treffer, not-found, Timeout oder Shutdown).
//! Kernstücke: die Single-Owner-Schleife in `async_svc` und der
//! Elastic Buffer in `buffer`.

use di_types::{InvoiceResult, PaymentHash};
use tokio::sync::mpsc;

pub mod buffer;
mod pending;

/// Id eines registrierten Handlers; streng monoton ab 0, nie wiederverwendet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct HandlerId(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchError {
    NoHandlers,
    NotFound,
    Timeout,
    Shutdown,
    InvalidRegistration,
    UnknownHandler(HandlerId),
}

impl core::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoHandlers => f.write_str("no handlers available"),
            Self::NotFound => f.write_str("all handlers do not have the invoice"),
            Self::Timeout => f.write_str("timeout while waiting for result"),
            Self::Shutdown => f.write_str("dispatcher was stopped"),
            Self::InvalidRegistration => f.write_str("handler streams must both be present"),
            Self::UnknownHandler(id) => write!(f, "handler with id={} does not exist", id.0),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Verbindung zu einem externen Invoice-Provider. Der Provider liest
/// Payment-Hashes aus der Request-Seite und schreibt für jeden gelesenen
/// Hash genau ein `InvoiceResult` in die Result-Seite. Eine fehlende
/// Hälfte wird bei der Registrierung mit `InvalidRegistration` abgelehnt.
pub struct Handler {
    pub request_sink: Option<mpsc::Sender<PaymentHash>>,
    pub result_source: Option<mpsc::Receiver<InvoiceResult>>,
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub cmd_capacity: usize,
    pub result_capacity: usize,
    pub timeout_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cmd_capacity: 1024,
            result_capacity: 1024,
            timeout_capacity: 1024,
        }
    }
}

pub mod async_svc {
    use super::{DispatchConfig, DispatchError, Handler, HandlerId};
    use crate::buffer::ElasticBuffer;
    use crate::pending::{PendingRequests, ReplySlot, Waiter};
    use di_types::{Invoice, InvoiceResult, PaymentHash};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::{mpsc, oneshot, watch};
    use tokio::time::{sleep, Duration};
    use tracing::{info, warn};

    enum DispatchCmd {
        Request {
            r_hash: PaymentHash,
            timeout: Duration,
            reply: ReplySlot,
        },
        Register {
            request_sink: mpsc::Sender<PaymentHash>,
            result_source: mpsc::Receiver<InvoiceResult>,
            reply: oneshot::Sender<HandlerId>,
        },
        Unregister {
            handler_id: HandlerId,
            reply: oneshot::Sender<Result<(), DispatchError>>,
        },
    }

    /// Validiertes Handler-Resultat, um die Absender-Id ergänzt.
    struct ResultFromHandler {
        rez: InvoiceResult,
        handler_id: HandlerId,
    }

    struct TimeoutFired {
        r_hash: PaymentHash,
        waiter_id: u64,
    }

    /// Laufzeitzustand einer Handler-Session. Gehört exklusiv der Schleife.
    struct HandlerSession {
        req_buffer: ElasticBuffer,
        req_tx: mpsc::Sender<PaymentHash>,
        /// Drop schließt das Stop-Signal des Receiver-Tasks dieser Session.
        _stop: oneshot::Sender<()>,
    }

    /// Klonbares Handle auf die Dispatcher-Schleife.
    #[derive(Clone)]
    pub struct DispatchService {
        cmd_tx: mpsc::Sender<DispatchCmd>,
        stop_tx: Arc<watch::Sender<bool>>,
    }

    impl DispatchService {
        /// Löst einen Payment-Hash über alle aktuell registrierten Handler
        /// auf. Kehrt spätestens nach `timeout` zurück.
        pub async fn get_invoice(
            &self,
            r_hash: PaymentHash,
            timeout: Duration,
        ) -> Result<Invoice, DispatchError> {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.cmd_tx
                .send(DispatchCmd::Request {
                    r_hash,
                    timeout,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| DispatchError::Shutdown)?;
            reply_rx.await.map_err(|_| DispatchError::Shutdown)?
        }

        /// Registriert einen Handler und liefert seine Id.
        pub async fn register_handler(
            &self,
            handler: Handler,
        ) -> Result<HandlerId, DispatchError> {
            let (request_sink, result_source) = match (handler.request_sink, handler.result_source)
            {
                (Some(request_sink), Some(result_source)) => (request_sink, result_source),
                _ => return Err(DispatchError::InvalidRegistration),
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            self.cmd_tx
                .send(DispatchCmd::Register {
                    request_sink,
                    result_source,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| DispatchError::Shutdown)?;
            reply_rx.await.map_err(|_| DispatchError::Shutdown)
        }

        /// Entfernt einen Handler. Blockiert nicht auf in-flight Sends an
        /// den Handler; dessen vorgemerkte Hashes werden verworfen.
        pub async fn unregister_handler(&self, handler_id: HandlerId) -> Result<(), DispatchError> {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.cmd_tx
                .send(DispatchCmd::Unregister {
                    handler_id,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| DispatchError::Shutdown)?;
            reply_rx.await.map_err(|_| DispatchError::Shutdown)?
        }

        /// Stoppt den Dispatcher: alle offenen Waiter enden mit `Shutdown`,
        /// alle Sessions werden geschlossen. Idempotent.
        pub fn stop(&self) {
            let _ = self.stop_tx.send(true);
        }
    }

    struct LoopState {
        handlers: HashMap<HandlerId, HandlerSession>,
        next_handler_id: u64,
        next_waiter_id: u64,
        pending: HashMap<PaymentHash, PendingRequests>,
        result_tx: mpsc::Sender<ResultFromHandler>,
        timeout_tx: mpsc::Sender<TimeoutFired>,
        stop_rx: watch::Receiver<bool>,
    }

    impl LoopState {
        async fn handle_request(&mut self, r_hash: PaymentHash, timeout: Duration, reply: ReplySlot) {
            if self.handlers.is_empty() {
                let _ = reply.send(Err(DispatchError::NoHandlers));
                return;
            }
            let (done_tx, done_rx) = oneshot::channel();
            let waiter_id = self.next_waiter_id;
            self.next_waiter_id += 1;
            let waiter = Waiter {
                id: waiter_id,
                reply,
                _done: done_tx,
            };
            self.spawn_timeout(r_hash, waiter_id, timeout, done_rx);

            if let Some(entry) = self.pending.get_mut(&r_hash) {
                // Koaleszierung: für diesen Hash läuft bereits ein Fan-out,
                // der neue Aufruf hängt sich nur an.
                entry.add_waiter(waiter);
                return;
            }
            let mut entry = PendingRequests::new();
            entry.add_waiter(waiter);
            for (handler_id, session) in &self.handlers {
                // Übergabe an den Elastic Buffer, nie direkt an den Handler:
                // ein hängender Handler blockiert die Schleife nicht.
                let _ = session.req_tx.send(r_hash).await;
                entry.mark_queried(*handler_id);
            }
            self.pending.insert(r_hash, entry);
        }

        fn handle_register(
            &mut self,
            request_sink: mpsc::Sender<PaymentHash>,
            result_source: mpsc::Receiver<InvoiceResult>,
            reply: oneshot::Sender<HandlerId>,
        ) {
            let handler_id = HandlerId(self.next_handler_id);
            self.next_handler_id += 1;
            let (stop_tx, stop_rx) = oneshot::channel();
            let (req_buffer, req_tx) = ElasticBuffer::new(request_sink);
            self.spawn_receiver(result_source, handler_id, stop_rx);
            self.handlers.insert(
                handler_id,
                HandlerSession {
                    req_buffer,
                    req_tx,
                    _stop: stop_tx,
                },
            );
            info!(
                handler_id = handler_id.0,
                total = self.handlers.len(),
                "handler registered"
            );
            let _ = reply.send(handler_id);
        }

        fn handle_unregister(
            &mut self,
            handler_id: HandlerId,
            reply: oneshot::Sender<Result<(), DispatchError>>,
        ) {
            let session = match self.handlers.remove(&handler_id) {
                Some(session) => session,
                None => {
                    let _ = reply.send(Err(DispatchError::UnknownHandler(handler_id)));
                    return;
                }
            };
            info!(
                handler_id = handler_id.0,
                dropped_backlog = session.req_buffer.len(),
                total = self.handlers.len(),
                "handler unregistered"
            );
            session.req_buffer.force_close();
            drop(session);
            let _ = reply.send(Ok(()));
            // Einträge, deren letzter offener Handler gerade verschwunden
            // ist, lösen jetzt als not-found auf statt bis zum Timeout zu
            // hängen.
            self.resolve_exhausted_after_removal(handler_id);
        }

        fn resolve_exhausted_after_removal(&mut self, handler_id: HandlerId) {
            let exhausted: Vec<PaymentHash> = self
                .pending
                .iter()
                .filter(|(_, entry)| {
                    entry.was_queried(handler_id) && entry.is_exhausted(&self.handlers)
                })
                .map(|(r_hash, _)| *r_hash)
                .collect();
            for r_hash in exhausted {
                if let Some(mut entry) = self.pending.remove(&r_hash) {
                    entry.resolve_error(DispatchError::NotFound);
                }
            }
        }

        fn handle_result(&mut self, rez_ext: ResultFromHandler) {
            let r_hash = rez_ext.rez.r_hash;
            let entry = match self.pending.get_mut(&r_hash) {
                Some(entry) => entry,
                // Eintrag bereits aufgelöst: Spätantwort ist ein Drop
                None => return,
            };
            match rez_ext.rez.invoice {
                Some(invoice) => {
                    entry.resolve_positive(&invoice);
                    self.pending.remove(&r_hash);
                }
                None => {
                    entry.mark_answered(rez_ext.handler_id);
                    if entry.is_exhausted(&self.handlers) {
                        entry.resolve_error(DispatchError::NotFound);
                        self.pending.remove(&r_hash);
                    }
                }
            }
        }

        fn handle_timeout(&mut self, fired: TimeoutFired) {
            let entry = match self.pending.get_mut(&fired.r_hash) {
                Some(entry) => entry,
                None => return,
            };
            entry.timeout_one(fired.waiter_id);
            if entry.is_empty() {
                // keine Waiter mehr: ausstehende Handler-Antworten werden Drops
                self.pending.remove(&fired.r_hash);
            }
        }

        fn handle_stop(&mut self) {
            for entry in self.pending.values_mut() {
                entry.resolve_error(DispatchError::Shutdown);
            }
            self.pending.clear();
            for session in self.handlers.values() {
                session.req_buffer.force_close();
            }
            self.handlers.clear();
        }

        /// Kurzlebiger Timer-Task je Waiter; feuert in die Schleife zurück
        /// und endet auf das Erste von {Ablauf, Waiter fertig, Stop}.
        fn spawn_timeout(
            &self,
            r_hash: PaymentHash,
            waiter_id: u64,
            timeout: Duration,
            done_rx: oneshot::Receiver<()>,
        ) {
            let timeout_tx = self.timeout_tx.clone();
            let mut stop_rx = self.stop_rx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sleep(timeout) => {
                        let _ = timeout_tx.send(TimeoutFired { r_hash, waiter_id }).await;
                    }
                    _ = done_rx => {}
                    _ = stop_rx.changed() => {}
                }
            });
        }

        /// Receiver-Task je Session: validiert Handler-Resultate und reicht
        /// sie in die Schleife weiter. Ungültige Resultate werden geloggt
        /// und verworfen, nie an Caller gemeldet.
        fn spawn_receiver(
            &self,
            mut result_source: mpsc::Receiver<InvoiceResult>,
            handler_id: HandlerId,
            mut session_stop: oneshot::Receiver<()>,
        ) {
            let result_tx = self.result_tx.clone();
            let mut stop_rx = self.stop_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        maybe = result_source.recv() => {
                            let rez = match maybe {
                                Some(rez) => rez,
                                // Handler hat seinen Result-Stream geschlossen
                                None => break,
                            };
                            if !rez.is_valid() {
                                warn!(handler_id = handler_id.0, "invalid invoice result dropped");
                                continue;
                            }
                            if result_tx.send(ResultFromHandler { rez, handler_id }).await.is_err() {
                                break;
                            }
                        }
                        _ = &mut session_stop => break,
                        _ = stop_rx.changed() => break,
                    }
                }
            });
        }
    }

    async fn run_dispatch_loop(
        mut cmd_rx: mpsc::Receiver<DispatchCmd>,
        mut result_rx: mpsc::Receiver<ResultFromHandler>,
        result_tx: mpsc::Sender<ResultFromHandler>,
        mut timeout_rx: mpsc::Receiver<TimeoutFired>,
        timeout_tx: mpsc::Sender<TimeoutFired>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Result<(), DispatchError> {
        let mut st = LoopState {
            handlers: HashMap::new(),
            next_handler_id: 0,
            next_waiter_id: 0,
            pending: HashMap::new(),
            result_tx,
            timeout_tx,
            stop_rx: stop_rx.clone(),
        };
        info!("dispatch loop started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(DispatchCmd::Request { r_hash, timeout, reply }) => {
                            st.handle_request(r_hash, timeout, reply).await;
                        }
                        Some(DispatchCmd::Register { request_sink, result_source, reply }) => {
                            st.handle_register(request_sink, result_source, reply);
                        }
                        Some(DispatchCmd::Unregister { handler_id, reply }) => {
                            st.handle_unregister(handler_id, reply);
                        }
                        None => {
                            warn!("dispatch command channel closed");
                            st.handle_stop();
                            break;
                        }
                    }
                }
                Some(rez_ext) = result_rx.recv() => st.handle_result(rez_ext),
                Some(fired) = timeout_rx.recv() => st.handle_timeout(fired),
                _ = stop_rx.changed() => {
                    info!("dispatch shutdown received");
                    st.handle_stop();
                    break;
                }
            }
        }
        info!("dispatch loop stopped");
        Ok(())
    }

    /// Startet die Dispatcher-Schleife genau einmal und liefert Handle und
    /// JoinHandle. Doppelte Schleifen sind per Konstruktion ausgeschlossen.
    pub fn spawn(
        cfg: DispatchConfig,
    ) -> (
        DispatchService,
        tokio::task::JoinHandle<Result<(), DispatchError>>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(cfg.cmd_capacity.max(1));
        let (result_tx, result_rx) = mpsc::channel(cfg.result_capacity.max(1));
        let (timeout_tx, timeout_rx) = mpsc::channel(cfg.timeout_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_dispatch_loop(
            cmd_rx,
            result_rx,
            result_tx,
            timeout_rx,
            timeout_tx,
            stop_rx,
        ));
        (
            DispatchService {
                cmd_tx,
                stop_tx: Arc::new(stop_tx),
            },
            handle,
        )
    }

}
