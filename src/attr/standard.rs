//! Standard attribute backend
//!
//! Expiry by absolute timestamp, history flag, and optional encryption through
//! a caller-supplied [`ValueCipher`].

use std::sync::Arc;

use crate::error::{Result, SubKvError};

use super::{AttrState, AttributeBackend, Attributes, SetOptions, ValueCipher};

/// Built-in attribute backend
#[derive(Default, Clone)]
pub struct StandardAttributes {
    cipher: Option<Arc<dyn ValueCipher>>,
}

impl StandardAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend able to store encrypted values
    pub fn with_cipher(cipher: Arc<dyn ValueCipher>) -> Self {
        Self {
            cipher: Some(cipher),
        }
    }

    fn cipher(&self) -> Result<&Arc<dyn ValueCipher>> {
        self.cipher.as_ref().ok_or_else(|| {
            SubKvError::InvalidArgument("encrypted value but no cipher is configured".into())
        })
    }
}

impl AttributeBackend for StandardAttributes {
    fn name(&self) -> &str {
        super::DEFAULT_BACKEND
    }

    fn build(
        &self,
        previous: Option<&Attributes>,
        options: &SetOptions,
        unique_id: u64,
        now: u64,
    ) -> Result<Attributes> {
        if options.encrypt {
            self.cipher()?;
        }

        let plugin_data = match (&options.plugin_data, previous) {
            (Some(data), _) => data.clone(),
            (None, Some(prev)) => prev.plugin_data.clone(),
            (None, None) => Vec::new(),
        };

        Ok(Attributes {
            mtime: now,
            expires_at: options.ttl.map(|ttl| now.saturating_add(ttl.as_micros() as u64)),
            encrypted: options.encrypt,
            history: false,
            unique_id,
            plugin_data,
        })
    }

    fn state(&self, attrs: &Attributes, now: u64) -> AttrState {
        if attrs.history {
            return AttrState::History;
        }
        match attrs.expires_at {
            Some(deadline) if deadline <= now => AttrState::Expired,
            _ => AttrState::Live,
        }
    }

    fn encrypt(&self, attrs: &Attributes, value: &[u8]) -> Result<Vec<u8>> {
        if !attrs.encrypted {
            return Ok(value.to_vec());
        }
        self.cipher()?.encrypt(attrs.unique_id, value)
    }

    fn decrypt(&self, attrs: &Attributes, value: &[u8]) -> Result<Vec<u8>> {
        if !attrs.encrypted {
            return Ok(value.to_vec());
        }
        self.cipher()?.decrypt(attrs.unique_id, value)
    }
}
