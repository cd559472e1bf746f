//! Clock-based certificate serial numbers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Integer;
use openssl::bn::BigNum;
use openssl::error::ErrorStack;

/// Hands out serials derived from the wall clock in milliseconds, bumped past
/// the previous value whenever two calls land in the same tick.
#[derive(Debug, Default)]
pub struct SerialCounter {
    last: AtomicU64,
}

impl SerialCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn next_asn1(&self) -> Result<Asn1Integer, ErrorStack> {
        BigNum::from_slice(&self.next().to_be_bytes())?.to_asn1_integer()
    }
}
