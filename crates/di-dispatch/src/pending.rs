// SPDX-License-Identifier: AGPL-3.0-only

//! Buchführung je aktivem Payment-Hash: wartende Aufrufe, gefragte Handler,
//! negativ antwortende Handler. Reine Datenstruktur, wird ausschließlich
//! von der Dispatcher-Schleife mutiert (Single-Owner, keine Locks).

use std::collections::{HashMap, HashSet};

use di_types::Invoice;
use tokio::sync::oneshot;

use crate::{DispatchError, HandlerId};

/// Antwort-Slot eines GetInvoice-Aufrufs: Kapazität 1, genau eine Schreibung.
pub(crate) type ReplySlot = oneshot::Sender<Result<Invoice, DispatchError>>;

/// Ein wartender GetInvoice-Aufruf.
pub(crate) struct Waiter {
    pub id: u64,
    pub reply: ReplySlot,
    /// Drop signalisiert dem Timer-Task dieses Waiters das Ende.
    pub _done: oneshot::Sender<()>,
}

impl Waiter {
    fn complete(self, rez: Result<Invoice, DispatchError>) {
        // Empfängerseite kann bereits weg sein (Caller gedroppt)
        let _ = self.reply.send(rez);
    }
}

pub(crate) struct PendingRequests {
    waiters: Vec<Waiter>,
    queried: HashSet<HandlerId>,
    answered: HashSet<HandlerId>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            waiters: Vec::new(),
            queried: HashSet::new(),
            answered: HashSet::new(),
        }
    }

    pub fn add_waiter(&mut self, waiter: Waiter) {
        self.waiters.push(waiter);
    }

    pub fn mark_queried(&mut self, handler_id: HandlerId) {
        self.queried.insert(handler_id);
    }

    pub fn mark_answered(&mut self, handler_id: HandlerId) {
        self.answered.insert(handler_id);
    }

    pub fn was_queried(&self, handler_id: HandlerId) -> bool {
        self.queried.contains(&handler_id)
    }

    /// Erschöpft, wenn jeder gefragte Handler entweder nicht mehr lebt oder
    /// negativ geantwortet hat. Auch nach Unregister neu auszuwerten, damit
    /// Anfragen an verschwundene stumme Handler nicht hängenbleiben.
    pub fn is_exhausted<T>(&self, live: &HashMap<HandlerId, T>) -> bool {
        self.queried
            .iter()
            .all(|id| !live.contains_key(id) || self.answered.contains(id))
    }

    /// Erster gültiger Treffer: alle aktuellen Waiter erhalten dieselbe Invoice.
    pub fn resolve_positive(&mut self, invoice: &Invoice) {
        for waiter in self.waiters.drain(..) {
            waiter.complete(Ok(invoice.clone()));
        }
    }

    pub fn resolve_error(&mut self, err: DispatchError) {
        for waiter in self.waiters.drain(..) {
            waiter.complete(Err(err.clone()));
        }
    }

    /// Beendet genau den benannten Waiter mit Timeout; Geschwister auf dem
    /// gleichen Hash bleiben unberührt.
    pub fn timeout_one(&mut self, waiter_id: u64) {
        if let Some(pos) = self.waiters.iter().position(|w| w.id == waiter_id) {
            let waiter = self.waiters.remove(pos);
            waiter.complete(Err(DispatchError::Timeout));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use di_types::u64_to_hash32;
    use tokio::sync::oneshot::error::TryRecvError;

    type ReplyRx = oneshot::Receiver<Result<Invoice, DispatchError>>;

    fn waiter(id: u64) -> (Waiter, ReplyRx) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (done_tx, _done_rx) = oneshot::channel();
        (
            Waiter {
                id,
                reply: reply_tx,
                _done: done_tx,
            },
            reply_rx,
        )
    }

    fn live_map(ids: &[u64]) -> HashMap<HandlerId, ()> {
        ids.iter().map(|id| (HandlerId(*id), ())).collect()
    }

    #[test]
    fn exhaustion_requires_all_live_answers() {
        let mut pr = PendingRequests::new();
        pr.mark_queried(HandlerId(0));
        pr.mark_queried(HandlerId(1));
        pr.mark_answered(HandlerId(0));

        assert!(!pr.is_exhausted(&live_map(&[0, 1])));
        pr.mark_answered(HandlerId(1));
        assert!(pr.is_exhausted(&live_map(&[0, 1])));
    }

    #[test]
    fn removed_handler_counts_as_answered() {
        let mut pr = PendingRequests::new();
        pr.mark_queried(HandlerId(0));
        pr.mark_queried(HandlerId(1));
        pr.mark_answered(HandlerId(0));

        // Handler 1 wurde entfernt, ohne zu antworten
        assert!(pr.is_exhausted(&live_map(&[0])));
    }

    #[test]
    fn timeout_hits_only_the_named_waiter() {
        let mut pr = PendingRequests::new();
        let (w1, mut rx1) = waiter(1);
        let (w2, mut rx2) = waiter(2);
        pr.add_waiter(w1);
        pr.add_waiter(w2);

        pr.timeout_one(1);
        assert_eq!(rx1.try_recv().ok(), Some(Err(DispatchError::Timeout)));
        assert!(matches!(rx2.try_recv(), Err(TryRecvError::Empty)));
        assert!(!pr.is_empty());

        pr.timeout_one(2);
        assert!(pr.is_empty());
    }

    #[test]
    fn positive_resolution_reaches_all_waiters() {
        let mut pr = PendingRequests::new();
        let (w1, mut rx1) = waiter(1);
        let (w2, mut rx2) = waiter(2);
        pr.add_waiter(w1);
        pr.add_waiter(w2);

        let invoice = Invoice {
            r_hash: u64_to_hash32(9),
            r_preimage: u64_to_hash32(3).to_vec(),
            memo: "x".to_string(),
        };
        pr.resolve_positive(&invoice);
        assert!(pr.is_empty());
        assert_eq!(rx1.try_recv().ok(), Some(Ok(invoice.clone())));
        assert_eq!(rx2.try_recv().ok(), Some(Ok(invoice)));
    }

    #[test]
    fn error_resolution_drains_waiters() {
        let mut pr = PendingRequests::new();
        let (w1, mut rx1) = waiter(1);
        pr.add_waiter(w1);
        pr.resolve_error(DispatchError::Shutdown);
        assert!(pr.is_empty());
        assert_eq!(rx1.try_recv().ok(), Some(Err(DispatchError::Shutdown)));
    }
}
