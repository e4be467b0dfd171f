//! Minimal ABI word decoding for token metadata probes.

use alloy_primitives::U256;
use hmyload_core::{LoadError, LoadResult};

const WORD: usize = 32;

fn word(data: &[u8], position: usize) -> LoadResult<&[u8]> {
    let start = position * WORD;
    data.get(start..start + WORD).ok_or_else(|| {
        LoadError::Decode(format!("ABI word {position} out of range ({} bytes)", data.len()))
    })
}

fn word_as_usize(data: &[u8], position: usize) -> LoadResult<usize> {
    let value = U256::from_be_slice(word(data, position)?);
    usize::try_from(value).map_err(|_| LoadError::Decode(format!("ABI offset {value} too large")))
}

/// Unsigned integer at word `position`.
pub fn decode_uint(data: &[u8], position: usize) -> LoadResult<U256> {
    Ok(U256::from_be_slice(word(data, position)?))
}

/// Dynamic `string` whose offset sits at word `position`.
///
/// Contracts predating the string convention return a bare `bytes32`; a
/// 32-byte reply is read that way, right-trimmed of NULs.
pub fn decode_string(data: &[u8], position: usize) -> LoadResult<String> {
    if data.len() == WORD {
        let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        return Ok(String::from_utf8_lossy(&data[..end]).into_owned());
    }

    let offset = word_as_usize(data, position)?;
    let tail = data
        .get(offset..)
        .ok_or_else(|| LoadError::Decode(format!("ABI string offset {offset} out of range")))?;
    let len = word_as_usize(tail, 0)?;
    let bytes = tail
        .get(WORD..WORD.saturating_add(len))
        .ok_or_else(|| LoadError::Decode(format!("ABI string of {len} bytes truncated")))?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abi_string(s: &str) -> Vec<u8> {
        let mut out = vec![0u8; 64];
        out[31] = 0x20;
        out[63] = s.len() as u8;
        let mut body = s.as_bytes().to_vec();
        body.resize(s.len().div_ceil(32) * 32, 0);
        out.extend(body);
        out
    }

    #[test]
    fn decodes_dynamic_string() {
        assert_eq!(decode_string(&abi_string("Wrapped ONE"), 0).unwrap(), "Wrapped ONE");
        assert_eq!(decode_string(&abi_string(""), 0).unwrap(), "");
    }

    #[test]
    fn decodes_bytes32_string() {
        let mut data = [0u8; 32];
        data[..3].copy_from_slice(b"MKR");
        assert_eq!(decode_string(&data, 0).unwrap(), "MKR");
    }

    #[test]
    fn decodes_uint() {
        let mut data = [0u8; 32];
        data[31] = 18;
        assert_eq!(decode_uint(&data, 0).unwrap(), U256::from(18));
    }

    #[test]
    fn rejects_short_or_bad_offsets() {
        assert!(decode_uint(&[], 0).is_err());
        assert!(decode_string(&[], 0).is_err());

        let mut data = abi_string("abc");
        data[31] = 0xff;
        assert!(decode_string(&data, 0).is_err());

        let mut data = abi_string("abc");
        data[63] = 0x7f;
        assert!(decode_string(&data, 0).is_err());
    }
}
