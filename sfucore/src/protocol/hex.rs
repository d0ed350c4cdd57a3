//! Fixed-width hex encoding of 64-bit values.

use super::ProtocolError;

/// Encodes `value` as exactly 16 lowercase hex characters.
pub fn u64_to_hex(value: u64) -> String {
    hex::encode(value.to_be_bytes())
}

/// Decodes the output of [`u64_to_hex`]. Anything but 16 hex chars is rejected.
pub fn hex_to_u64(s: &str) -> Result<u64, ProtocolError> {
    if s.len() != 16 {
        return Err(ProtocolError::InvalidHex(s.to_string()));
    }
    let mut buf = [0u8; 8];
    hex::decode_to_slice(s, &mut buf).map_err(|_| ProtocolError::InvalidHex(s.to_string()))?;
    Ok(u64::from_be_bytes(buf))
}
