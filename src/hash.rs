//! Key hashing
//!
//! Every key is reduced to two 64-bit hashes: the primary one selects the
//! bucket through the mask, the secondary one orders elements inside the
//! bucket tree. The hasher's version string is stored in the region header so
//! a region is never attached with a different hash function.

/// Registered name of the built-in hasher
pub const DEFAULT_HASHER: &str = "crc32-pair";

const SEED_PRIMARY: u64 = 0x9E37_79B9_7F4A_7C15;
const SEED_SECONDARY_LO: u64 = 0xC2B2_AE3D_27D4_EB4F;
const SEED_SECONDARY_HI: u64 = 0x1656_67B1_9E37_79F9;

/// The two hashes of one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHash {
    /// Bucket selector (masked)
    pub primary: u64,
    /// Tree ordering key
    pub secondary: u64,
}

/// Hash function contract
pub trait KeyHasher: Send + Sync {
    /// Produce the primary and secondary hash of `key`
    fn hash(&self, key: &[u8]) -> KeyHash;

    /// Identifies the function; stored in the region header
    fn version(&self) -> &str;
}

/// Built-in hasher: CRC32 over the raw bytes and over seeded, mixed 8-byte
/// words, finalized with a 64-bit avalanche.
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32Pair;

impl Crc32Pair {
    fn crc_mixed(key: &[u8], seed: u64) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        let mut chunks = key.chunks_exact(8);
        for chunk in &mut chunks {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            hasher.update(&mix64(u64::from_le_bytes(word) ^ seed).to_le_bytes());
        }

        let mut tail = [0u8; 8];
        let rest = chunks.remainder();
        tail[..rest.len()].copy_from_slice(rest);
        let last = u64::from_le_bytes(tail) ^ seed ^ ((key.len() as u64) << 56);
        hasher.update(&mix64(last).to_le_bytes());

        hasher.finalize()
    }
}

impl KeyHasher for Crc32Pair {
    fn hash(&self, key: &[u8]) -> KeyHash {
        let plain = crc32fast::hash(key) as u64;
        let mixed = Self::crc_mixed(key, SEED_PRIMARY) as u64;
        let primary = mix64((mixed << 32) | plain);

        let lo = Self::crc_mixed(key, SEED_SECONDARY_LO) as u64;
        let hi = Self::crc_mixed(key, SEED_SECONDARY_HI) as u64;
        let secondary = mix64(((hi << 32) | lo) ^ SEED_SECONDARY_HI);

        KeyHash { primary, secondary }
    }

    fn version(&self) -> &str {
        "crc32-pair-1"
    }
}

/// splitmix64 finalizer
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
