//! Attribute Module
//!
//! Out-of-band per-key metadata and the backend contract that interprets it.
//!
//! ## Responsibilities
//! - Encode/decode the attribute record stored in a key's attribute chain
//! - Decide whether a key is live, expired, or a history record
//! - Encrypt/decrypt values when the attributes say so
//! - Carry the per-key unique id across replacements

mod standard;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use standard::StandardAttributes;

/// Registered name of the built-in backend
pub const DEFAULT_BACKEND: &str = "standard";

/// Attribute record of one key (bincode-encoded in the region)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    /// Last modification (unix micros)
    pub mtime: u64,

    /// Absolute expiry (unix micros)
    pub expires_at: Option<u64>,

    /// Value bytes are stored encrypted
    pub encrypted: bool,

    /// Key is a tombstoned history record
    pub history: bool,

    /// Stable id carried across Set replacements
    pub unique_id: u64,

    /// Opaque bytes owned by the backend
    pub plugin_data: Vec<u8>,
}

impl Attributes {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// How a reader must treat a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrState {
    Live,
    Expired,
    History,
}

/// Caller options for a Set
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Expire the key this long after the write
    pub ttl: Option<Duration>,

    /// Store the value encrypted
    pub encrypt: bool,

    /// Replace the backend's opaque data
    pub plugin_data: Option<Vec<u8>>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    pub fn plugin_data(mut self, data: Vec<u8>) -> Self {
        self.plugin_data = Some(data);
        self
    }
}

/// Symmetric cipher used by the standard backend for encrypted values
pub trait ValueCipher: Send + Sync {
    fn encrypt(&self, unique_id: u64, plain: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, unique_id: u64, cipher: &[u8]) -> Result<Vec<u8>>;
}

/// Attribute/crypto backend contract
pub trait AttributeBackend: Send + Sync {
    /// Name under which the backend is registered
    fn name(&self) -> &str;

    /// Attributes for a value about to be stored. `previous` belongs to the
    /// element being replaced, `unique_id` is the id the key keeps.
    fn build(
        &self,
        previous: Option<&Attributes>,
        options: &SetOptions,
        unique_id: u64,
        now: u64,
    ) -> Result<Attributes>;

    /// Evaluate expiry and history flags
    fn state(&self, attrs: &Attributes, now: u64) -> AttrState;

    fn encrypt(&self, attrs: &Attributes, value: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, attrs: &Attributes, value: &[u8]) -> Result<Vec<u8>>;

    /// Attributes of a key turned into a history record
    fn mark_history(&self, attrs: &Attributes, now: u64) -> Attributes {
        Attributes {
            history: true,
            mtime: now,
            ..attrs.clone()
        }
    }
}

/// Current time in unix microseconds
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
