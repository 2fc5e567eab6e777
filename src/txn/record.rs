//! Transaction records
//!
//! One record describes one committed mutation. Records are self-describing
//! and position independent, so the same bytes go to the async queue, to
//! handlers and to the log file.
//!
//! ## Record Format
//! ```text
//! ┌─────────┬──────────┬─────────┬───────────────────────────────┬──────────┐
//! │ Tag (8) │ Kind (4) │ CRC (4) │ 5 × (Offset (8), Length (8))  │ Payloads │
//! └─────────┴──────────┴─────────┴───────────────────────────────┴──────────┘
//!                                  key, value, subkeys, attrs, extra
//! ```
//!
//! Offsets are relative to the start of the record. The CRC covers every
//! payload byte.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, SubKvError};

/// Fixed part of a record
pub const RECORD_HEADER_SIZE: usize = 96;

/// Largest record accepted by the decoder (1 GiB)
pub const MAX_RECORD_SIZE: u64 = 1 << 30;

const SLOTS: usize = 5;

/// Kinds of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandType {
    SetAll = 1,
    ReplaceValue = 2,
    ReplaceSubkeys = 3,
    ReplaceAttrs = 4,
    Delete = 5,
    OverwriteAt = 6,
    Rename = 7,
    Truncate = 8,
}

impl CommandType {
    fn tag(self) -> &'static [u8; 8] {
        match self {
            CommandType::SetAll => b"SETALL\0\0",
            CommandType::ReplaceValue => b"REPVAL\0\0",
            CommandType::ReplaceSubkeys => b"REPSUB\0\0",
            CommandType::ReplaceAttrs => b"REPATTR\0",
            CommandType::Delete => b"DELETE\0\0",
            CommandType::OverwriteAt => b"OVERWR\0\0",
            CommandType::Rename => b"RENAME\0\0",
            CommandType::Truncate => b"TRUNC\0\0\0",
        }
    }

    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(CommandType::SetAll),
            2 => Some(CommandType::ReplaceValue),
            3 => Some(CommandType::ReplaceSubkeys),
            4 => Some(CommandType::ReplaceAttrs),
            5 => Some(CommandType::Delete),
            6 => Some(CommandType::OverwriteAt),
            7 => Some(CommandType::Rename),
            8 => Some(CommandType::Truncate),
            _ => None,
        }
    }
}

/// One captured mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub command: CommandType,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub subkeys: Vec<u8>,
    pub attrs: Vec<u8>,
    /// Command-specific argument (offset, new key, flag or length)
    pub extra: Vec<u8>,
}

impl TxRecord {
    fn new(command: CommandType, key: &[u8]) -> Self {
        Self {
            command,
            key: key.to_vec(),
            value: Vec::new(),
            subkeys: Vec::new(),
            attrs: Vec::new(),
            extra: Vec::new(),
        }
    }

    // =========================================================================
    // Constructors
    // =========================================================================

    pub fn set_all(key: &[u8], value: &[u8], subkeys: &[u8], attrs: &[u8]) -> Self {
        Self {
            value: value.to_vec(),
            subkeys: subkeys.to_vec(),
            attrs: attrs.to_vec(),
            ..Self::new(CommandType::SetAll, key)
        }
    }

    pub fn replace_value(key: &[u8], value: &[u8]) -> Self {
        Self {
            value: value.to_vec(),
            ..Self::new(CommandType::ReplaceValue, key)
        }
    }

    pub fn replace_subkeys(key: &[u8], subkeys: &[u8]) -> Self {
        Self {
            subkeys: subkeys.to_vec(),
            ..Self::new(CommandType::ReplaceSubkeys, key)
        }
    }

    pub fn replace_attrs(key: &[u8], attrs: &[u8]) -> Self {
        Self {
            attrs: attrs.to_vec(),
            ..Self::new(CommandType::ReplaceAttrs, key)
        }
    }

    pub fn delete(key: &[u8], with_subkeys: bool) -> Self {
        Self {
            extra: vec![with_subkeys as u8],
            ..Self::new(CommandType::Delete, key)
        }
    }

    pub fn overwrite_at(key: &[u8], offset: u64, data: &[u8]) -> Self {
        Self {
            value: data.to_vec(),
            extra: offset.to_le_bytes().to_vec(),
            ..Self::new(CommandType::OverwriteAt, key)
        }
    }

    pub fn rename(old: &[u8], new: &[u8]) -> Self {
        Self {
            extra: new.to_vec(),
            ..Self::new(CommandType::Rename, old)
        }
    }

    pub fn truncate(key: &[u8], len: u64) -> Self {
        Self {
            extra: len.to_le_bytes().to_vec(),
            ..Self::new(CommandType::Truncate, key)
        }
    }

    // =========================================================================
    // Arguments
    // =========================================================================

    /// Offset of an OverwriteAt or length of a Truncate
    pub fn extra_u64(&self) -> Result<u64> {
        let bytes: [u8; 8] = self.extra.as_slice().try_into().map_err(|_| {
            SubKvError::Transaction(format!(
                "{:?} record carries {} argument bytes, expected 8",
                self.command,
                self.extra.len()
            ))
        })?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn with_subkeys(&self) -> bool {
        self.extra.first().copied().unwrap_or(0) != 0
    }

    /// Target key of a Rename
    pub fn new_key(&self) -> &[u8] {
        &self.extra
    }

    fn payloads(&self) -> [&[u8]; SLOTS] {
        [&self.key, &self.value, &self.subkeys, &self.attrs, &self.extra]
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payloads().iter().map(|p| p.len()).sum::<usize>()
    }

    /// Encode the record
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        let payloads = self.payloads();

        let mut crc = crc32fast::Hasher::new();
        for payload in payloads {
            crc.update(payload);
        }

        buf.put_slice(self.command.tag());
        buf.put_u32_le(self.command as u32);
        buf.put_u32_le(crc.finalize());

        let mut offset = RECORD_HEADER_SIZE as u64;
        for payload in payloads {
            buf.put_u64_le(offset);
            buf.put_u64_le(payload.len() as u64);
            offset += payload.len() as u64;
        }

        for payload in payloads {
            buf.put_slice(payload);
        }
    }

    /// Total record length announced by a header
    pub fn record_len(header: &[u8]) -> Result<usize> {
        if header.len() < RECORD_HEADER_SIZE {
            return Err(SubKvError::Transaction(format!(
                "incomplete record header: expected {} bytes, got {}",
                RECORD_HEADER_SIZE,
                header.len()
            )));
        }

        let mut slots = &header[16..RECORD_HEADER_SIZE];
        let mut end = RECORD_HEADER_SIZE as u64;
        for _ in 0..SLOTS {
            let offset = slots.get_u64_le();
            let len = slots.get_u64_le();
            let slot_end = offset.checked_add(len).ok_or_else(|| {
                SubKvError::Transaction("record slot overflows".into())
            })?;
            end = end.max(slot_end);
        }

        if end > MAX_RECORD_SIZE {
            return Err(SubKvError::Transaction(format!(
                "record too large: {} bytes (max {})",
                end, MAX_RECORD_SIZE
            )));
        }
        Ok(end as usize)
    }

    /// Decode one record from the front of `bytes`
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(TxRecord, usize)> {
        let total = Self::record_len(bytes)?;
        if bytes.len() < total {
            return Err(SubKvError::Transaction(format!(
                "incomplete record: expected {} bytes, got {}",
                total,
                bytes.len()
            )));
        }

        let mut header = &bytes[8..RECORD_HEADER_SIZE];
        let kind = header.get_u32_le();
        let stored_crc = header.get_u32_le();

        let command = CommandType::from_u32(kind).ok_or_else(|| {
            SubKvError::Transaction(format!("unknown record kind {}", kind))
        })?;
        if &bytes[..8] != command.tag() {
            return Err(SubKvError::Transaction(format!(
                "record tag does not match kind {:?}",
                command
            )));
        }

        let mut crc = crc32fast::Hasher::new();
        let mut fields: [Vec<u8>; SLOTS] = Default::default();
        for field in fields.iter_mut() {
            let offset = header.get_u64_le() as usize;
            let len = header.get_u64_le() as usize;
            if offset < RECORD_HEADER_SIZE {
                return Err(SubKvError::Transaction(format!(
                    "record slot points into the header at {}",
                    offset
                )));
            }
            let slice = &bytes[offset..offset + len];
            crc.update(slice);
            *field = slice.to_vec();
        }

        let actual_crc = crc.finalize();
        if actual_crc != stored_crc {
            return Err(SubKvError::Transaction(format!(
                "record checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, actual_crc
            )));
        }

        let [key, value, subkeys, attrs, extra] = fields;
        Ok((
            TxRecord {
                command,
                key,
                value,
                subkeys,
                attrs,
                extra,
            },
            total,
        ))
    }
}

/// Encode a group of records back to back
pub fn encode_group(records: &[TxRecord]) -> Vec<u8> {
    let total = records.iter().map(TxRecord::encoded_len).sum();
    let mut buf = BytesMut::with_capacity(total);
    for record in records {
        record.encode_into(&mut buf);
    }
    buf.to_vec()
}

/// Decode a group produced by [`encode_group`]
pub fn decode_group(mut bytes: &[u8]) -> Result<Vec<TxRecord>> {
    let mut records = Vec::new();
    while !bytes.is_empty() {
        let (record, used) = TxRecord::decode(bytes)?;
        records.push(record);
        bytes = &bytes[used..];
    }
    Ok(records)
}
