//! 12-byte ObjectId: 4-byte big-endian Unix timestamp followed by an
//! 8-byte monotonic-plus-random tail. Byte-lexicographic order therefore
//! tracks creation order within a process.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use blite_error::{BliteError, Result};
use rand::RngCore;

/// Random base for the tail so ids differ across processes.
static SEED: OnceLock<u64> = OnceLock::new();

/// Process-wide monotonic counter added to the seed.
static COUNTER: AtomicU64 = AtomicU64::new(0);

/// 12-byte totally ordered document identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Serialized width in bytes.
    pub const ENCODED_LEN: usize = 12;

    /// Generate a fresh id: current timestamp plus the next counter value.
    #[must_use]
    pub fn new() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs()) as u32;

        let seed = *SEED.get_or_init(|| rand::thread_rng().next_u64());
        let tail = seed.wrapping_add(COUNTER.fetch_add(1, Ordering::Relaxed));

        let mut bytes = [0_u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..].copy_from_slice(&tail.to_be_bytes());
        Self(bytes)
    }

    /// Wrap existing bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Decode from a slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 12] = bytes
            .try_into()
            .map_err(|_| BliteError::malformed("ObjectId must be exactly 12 bytes"))?;
        Ok(Self(arr))
    }

    /// The raw 12 bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Creation timestamp (seconds since the Unix epoch).
    #[must_use]
    pub fn timestamp_secs(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
