//! Pre-generated random payload pools.
//!
//! Byte production is the only non-cooperative compute on the hot path, so
//! every buffer is generated once at startup and shared read-only. `Bytes`
//! slices keep chunk hand-out allocation-free.

use bytes::Bytes;
use rand::RngCore;

pub const MIB: usize = 1024 * 1024;
/// Largest contiguous slice a single request may draw.
pub const MAX_BULK_BYTES: usize = 64 * MIB;
pub const WARMUP_CHUNK_BYTES: usize = MIB;

const WARMUP_SLOTS: u64 = 4;
const BULK_SIZES_MIB: [usize; 7] = [1, 2, 4, 8, 16, 32, 64];

pub struct DataPool {
    bulk: Vec<Bytes>,
    warmup: Bytes,
}

impl DataPool {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let bulk = BULK_SIZES_MIB
            .iter()
            .map(|mib| {
                let mut buffer = vec![0u8; mib.saturating_mul(MIB)];
                rng.fill_bytes(&mut buffer);
                Bytes::from(buffer)
            })
            .collect();
        let mut warmup = vec![0u8; WARMUP_CHUNK_BYTES.saturating_mul(WARMUP_SLOTS as usize)];
        rng.fill_bytes(&mut warmup);
        tracing::info!(
            pools = BULK_SIZES_MIB.len(),
            warmup_mib = WARMUP_SLOTS,
            "data pools generated"
        );
        Self {
            bulk,
            warmup: Bytes::from(warmup),
        }
    }

    /// A read-only view of exactly `len` bytes (capped at 64 MiB), drawn
    /// from the smallest pool that can satisfy the request.
    pub fn get_bulk(&self, len: usize) -> Bytes {
        let len = len.min(MAX_BULK_BYTES);
        for pool in &self.bulk {
            if pool.len() >= len {
                return pool.slice(..len);
            }
        }
        self.bulk
            .last()
            .map_or_else(Bytes::new, |pool| pool.slice(..pool.len().min(len)))
    }

    /// The 1 MiB window at offset `(index mod 4) * 1 MiB` of the warmup pool.
    pub fn get_warmup_chunk(&self, index: u64) -> Bytes {
        let slot = index.checked_rem(WARMUP_SLOTS).unwrap_or(0) as usize;
        let start = slot.saturating_mul(WARMUP_CHUNK_BYTES);
        let end = start.saturating_add(WARMUP_CHUNK_BYTES).min(self.warmup.len());
        self.warmup.slice(start..end)
    }

    /// Prefix of the warmup pool, for sub-1 MiB tails.
    pub fn warmup_prefix(&self, len: usize) -> Bytes {
        self.warmup.slice(..len.min(self.warmup.len()))
    }
}
