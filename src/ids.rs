// Session identifiers: an 8-byte big-endian monotone counter followed by the
// opaque bytes of the owning transport address.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

static COUNTER_HIGH_WATER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId {
    counter: u64,
    address: Vec<u8>,
}

impl SessionId {
    /// Generates a fresh session id for the given local transport address,
    /// using the current wall clock folded through a process-wide
    /// high-water mark so concurrent callers never collide.
    pub fn generate(now_millis: u64, address: Vec<u8>) -> Self {
        let counter = loop {
            let prev = COUNTER_HIGH_WATER.load(Ordering::SeqCst);
            let next = prev.max(now_millis).saturating_add(1);
            if COUNTER_HIGH_WATER
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break next;
            }
        };
        Self { counter, address }
    }

    pub fn address(&self) -> &[u8] {
        &self.address
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counter_b64 = URL_SAFE_NO_PAD.encode(self.counter.to_be_bytes());
        let addr_b64 = URL_SAFE_NO_PAD.encode(&self.address);
        write!(f, "{counter_b64}:{addr_b64}")
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid session id: {0}")]
pub struct SessionIdParseError(String);

impl FromStr for SessionId {
    type Err = SessionIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (counter_part, addr_part) = s
            .split_once(':')
            .ok_or_else(|| SessionIdParseError(format!("missing separator in: {s}")))?;

        let counter_bytes = URL_SAFE_NO_PAD
            .decode(counter_part)
            .map_err(|e| SessionIdParseError(e.to_string()))?;
        if counter_bytes.len() != 8 {
            return Err(SessionIdParseError(format!(
                "counter must be 8 bytes, got {}",
                counter_bytes.len()
            )));
        }
        let mut counter_arr = [0u8; 8];
        counter_arr.copy_from_slice(&counter_bytes);
        let counter = u64::from_be_bytes(counter_arr);

        let address = URL_SAFE_NO_PAD
            .decode(addr_part)
            .map_err(|e| SessionIdParseError(e.to_string()))?;

        Ok(SessionId { counter, address })
    }
}
