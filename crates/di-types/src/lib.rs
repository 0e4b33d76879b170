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

use di_crypto::{sha256_32, Hash32};

/// Korrelation-Key einer Zahlung: sha256 über das geheime Preimage.
/// Gleichheit/Hashing byteweise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct PaymentHash(pub Hash32);

impl PaymentHash {
    pub fn from_preimage(preimage: &[u8]) -> Self {
        Self(sha256_32(preimage))
    }
}

/// Deterministische 32-Byte-Darstellung eines u64 (little endian, Rest Null).
/// Für Tests und Simulation: Preimages aus Zählern ableiten.
pub fn u64_to_hash32(a: u64) -> Hash32 {
    let mut rez = [0u8; 32];
    let le = a.to_le_bytes();
    for (dst, src) in rez.iter_mut().zip(le.iter()) {
        *dst = *src;
    }
    rez
}

/// Invoice eines Handlers. `r_hash` ist der deklarierte Payment-Hash,
/// `r_preimage` das Geheimnis mit sha256(r_preimage) == r_hash.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Invoice {
    pub r_hash: Hash32,
    pub r_preimage: Vec<u8>,
    pub memo: String,
}

/// Antwort eines Handlers auf eine Hash-Anfrage.
/// `invoice == None` heißt: dieser Handler kennt den Hash nicht.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvoiceResult {
    pub r_hash: PaymentHash,
    pub invoice: Option<Invoice>,
}

impl InvoiceResult {
    /// Gültig ist ein negatives Resultat immer; ein positives nur, wenn der
    /// deklarierte Hash zum Anfrage-Hash passt und das Preimage dazu hasht.
    pub fn is_valid(&self) -> bool {
        let inv = match &self.invoice {
            Some(inv) => inv,
            None => return true,
        };
        if inv.r_hash != self.r_hash.0 {
            return false;
        }
        sha256_32(&inv.r_preimage) == self.r_hash.0
    }
}
