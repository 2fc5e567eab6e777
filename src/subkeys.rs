//! Subkey list encoding
//!
//! A key's subkeys are stored as one page chain holding a sorted, deduplicated
//! list of names:
//!
//! ```text
//! ┌──────────┬──────────┬─────────┬──────────┬─────────┬─────┐
//! │ Count(4) │ Len1 (4) │ Name1   │ Len2 (4) │ Name2   │ ... │
//! └──────────┴──────────┴─────────┴──────────┴─────────┴─────┘
//! ```

use crate::error::{Result, SubKvError};

/// Encode a set of names (order and duplicates in the input are irrelevant)
pub fn encode<I, S>(names: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut sorted: Vec<Vec<u8>> = names.into_iter().map(|n| n.as_ref().to_vec()).collect();
    sorted.sort();
    sorted.dedup();

    let total: usize = sorted.iter().map(|n| 4 + n.len()).sum();
    let mut out = Vec::with_capacity(4 + total);
    out.extend_from_slice(&(sorted.len() as u32).to_le_bytes());
    for name in &sorted {
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name);
    }
    out
}

/// Decode a list produced by [`encode`]
pub fn decode(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    if bytes.len() < 4 {
        return Err(SubKvError::Corruption(format!(
            "subkey list truncated: {} bytes",
            bytes.len()
        )));
    }

    let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let mut names = Vec::with_capacity(count.min(bytes.len() / 4));
    let mut pos = 4;

    for i in 0..count {
        if pos + 4 > bytes.len() {
            return Err(SubKvError::Corruption(format!(
                "subkey list ends inside entry {} of {}",
                i, count
            )));
        }
        let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
            as usize;
        pos += 4;

        if pos + len > bytes.len() {
            return Err(SubKvError::Corruption(format!(
                "subkey {} claims {} bytes, only {} left",
                i,
                len,
                bytes.len() - pos
            )));
        }
        names.push(bytes[pos..pos + len].to_vec());
        pos += len;
    }

    Ok(names)
}

/// Add `name` to an encoded list, returning the new encoding
pub fn insert(bytes: &[u8], name: &[u8]) -> Result<Vec<u8>> {
    let mut names = decode(bytes)?;
    names.push(name.to_vec());
    Ok(encode(names))
}

/// Remove `name` from an encoded list; the flag tells whether it was present
pub fn remove(bytes: &[u8], name: &[u8]) -> Result<(Vec<u8>, bool)> {
    let mut names = decode(bytes)?;
    let before = names.len();
    names.retain(|n| n.as_slice() != name);
    let removed = names.len() != before;
    Ok((encode(names), removed))
}
